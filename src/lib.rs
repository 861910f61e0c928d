//! Unattended certificate renewal for long-running TLS servers, using the
//! pre-RFC ACME protocol (Boulder v1) and its `tls-sni-01` / `tls-sni-02`
//! challenges.
//!
//! The hosting server implements [`Host`] and forwards its "certificate is
//! aging" signal to [`AcmeClient::on_cert_aging`]. Renewed certificates
//! and keys are written next to the live ones as `<path>.upd`, and
//! [`adopt_pending_updates`] moves a matching pair into place on the next
//! start.

mod account;
mod authorization;
mod client;
mod config;
mod csr;
mod directory;
mod error;
mod helpers;
mod identity;
mod install;
mod jws;
mod proof;
mod session;

pub use account::*;
pub use authorization::*;
pub use client::*;
pub use config::*;
pub use csr::*;
pub use directory::*;
pub use error::*;
pub use helpers::gen_rsa_private_key;
pub use helpers::Identifier;
pub use identity::*;
pub use install::*;
pub use proof::*;
pub use session::*;
