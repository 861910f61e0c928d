pub mod mock_ca;
