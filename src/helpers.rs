use crate::error::*;
use data_encoding::BASE64URL_NOPAD;
use data_encoding::HEXLOWER;
use openssl::pkey::PKey;
use openssl::pkey::Private;
use openssl::rsa::Rsa;
use serde::Deserialize;
use serde::Serialize;

pub(crate) const MAX_NONCE_LEN: usize = 128;
pub(crate) const MAX_TOKEN_LEN: usize = 64;
pub(crate) const MAX_URL_LEN: usize = 256;
pub(crate) const MAX_BODY_LEN: usize = 16 * 1024;
pub(crate) const MAX_CERTIFICATE_LEN: usize = 16 * 1024;

/// This is a identifier for a resource that the ACME server
/// can provision certificates for (a domain).
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Identifier {
  /// The type of identifier.
  pub r#type: String,
  /// The identifier itself.
  pub value: String,
}

impl Identifier {
  pub fn dns(value: &str) -> Self {
    Identifier {
      r#type: "dns".to_string(),
      value: value.to_string(),
    }
  }
}

pub(crate) fn b64(data: &[u8]) -> String {
  BASE64URL_NOPAD.encode(data)
}

/// Lowercase hex of a SHA-256 digest, split into its two 32 character
/// halves and joined with `suffix` as a DNS name.
pub(crate) fn split_hex_name(digest: &[u8], suffix: &str) -> String {
  let hex = HEXLOWER.encode(digest);
  let (x, y) = hex.split_at(hex.len() / 2);
  format!("{}.{}.{}", x, y, suffix)
}

/// Take ownership of a server supplied value, failing rather than
/// truncating when it exceeds `limit`.
pub(crate) fn bounded(
  field: &'static str,
  value: &str,
  limit: usize,
) -> Result<String, Error> {
  if value.len() > limit {
    return Err(Error::FieldTooLong { field, limit });
  }
  Ok(value.to_string())
}

/// A growable byte buffer with a hard ceiling, fed incrementally from
/// streamed response bodies.
#[derive(Debug)]
pub(crate) struct BoundedBuf {
  field: &'static str,
  limit: usize,
  buf: Vec<u8>,
}

impl BoundedBuf {
  pub fn new(field: &'static str, limit: usize) -> Self {
    BoundedBuf {
      field,
      limit,
      buf: Vec::new(),
    }
  }

  pub fn push(&mut self, chunk: &[u8]) -> Result<(), Error> {
    if self.buf.len() + chunk.len() > self.limit {
      return Err(Error::FieldTooLong {
        field: self.field,
        limit: self.limit,
      });
    }
    self.buf.extend_from_slice(chunk);
    Ok(())
  }

  pub fn clear(&mut self) {
    self.buf.clear();
  }

  pub fn as_slice(&self) -> &[u8] {
    &self.buf
  }

  pub fn is_empty(&self) -> bool {
    self.buf.is_empty()
  }

  pub fn take(&mut self) -> Vec<u8> {
    std::mem::take(&mut self.buf)
  }
}

/// Generate a new RSA private key using the specified size,
/// using the system random.
pub fn gen_rsa_private_key(bits: u32) -> Result<PKey<Private>, Error> {
  let rsa = Rsa::generate(bits)?;
  let key = PKey::from_rsa(rsa)?;
  Ok(key)
}
