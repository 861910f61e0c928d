use crate::error::*;
use crate::helpers::*;
use openssl::hash::MessageDigest;
use openssl::pkey::Id;
use openssl::pkey::PKey;
use openssl::pkey::Private;
use openssl::sign::Signer;
use serde::Deserialize;
use serde::Serialize;
use serde_json::json;

#[derive(Serialize, Deserialize, Clone, Default)]
struct JwsHeader {
  alg: String,
  jwk: Jwk,
  nonce: String,
  url: String,
}

/// Public half of an RSA account key. Field order is the lexicographic
/// order RFC 7638 requires for the thumbprint input.
#[derive(Serialize, Deserialize, Clone, Default, Debug, PartialEq)]
pub(crate) struct Jwk {
  e: String,
  kty: String,
  n: String,
}

impl Jwk {
  pub fn new(pkey: &PKey<Private>) -> Result<Jwk, Error> {
    let rsa = match pkey.id() {
      Id::RSA => pkey.rsa()?,
      _ => return Err(Error::Validation("account key must be RSA")),
    };
    Ok(Jwk {
      e: b64(&rsa.e().to_vec()),
      kty: "RSA".to_string(),
      n: b64(&rsa.n().to_vec()),
    })
  }

  /// The canonical serialization hashed into the key thumbprint.
  pub fn canonical(&self) -> Result<String, Error> {
    Ok(serde_json::to_string(self)?)
  }
}

/// Wrap `payload` in a flattened JWS signed with the account key,
/// consuming `nonce`.
pub(crate) fn jws(
  url: &str,
  nonce: &str,
  payload: &str,
  pkey: &PKey<Private>,
) -> Result<String, Error> {
  let payload_b64 = b64(payload.as_bytes());

  let header = JwsHeader {
    alg: "RS256".into(),
    jwk: Jwk::new(pkey)?,
    nonce: nonce.to_string(),
    url: url.to_string(),
  };

  let protected_b64 = b64(&serde_json::to_string(&header)?.into_bytes());

  let signature_b64 = {
    let mut signer = Signer::new(MessageDigest::sha256(), pkey)?;
    signer
      .update(&format!("{}.{}", protected_b64, payload_b64).into_bytes())?;
    b64(&signer.sign_to_vec()?)
  };

  Ok(serde_json::to_string(&json!({
    "protected": protected_b64,
    "payload": payload_b64,
    "signature": signature_b64
  }))?)
}
