use crate::authorization::ChallengeKind;
use crate::error::*;
use crate::helpers::*;
use openssl::sha::sha256;

/// What this server must present for a TLS-SNI challenge.
///
/// `san_a` is the SNI name the CA connects with; the certificate served
/// for it must list `san_a` and, for `tls-sni-02`, `san_b` as well.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ChallengeProof {
  pub kind: ChallengeKind,
  pub key_authorization: String,
  pub san_a: String,
  pub san_b: Option<String>,
}

impl ChallengeProof {
  /// Derive the proof for `token` from the account key `thumbprint`.
  ///
  /// `key_authorization` is `token "." base64url(thumbprint)`. `san_a` is
  /// the lowercase hex SHA-256 of the key authorization, split after 32
  /// characters, under `acme.invalid` (`tls-sni-01`) or
  /// `token.acme.invalid` (`tls-sni-02`). `tls-sni-02` adds `san_b`: the
  /// hex thumbprint split the same way under `ka.acme.invalid`.
  pub fn new(
    kind: ChallengeKind,
    token: &str,
    thumbprint: &[u8; 32],
  ) -> Result<ChallengeProof, Error> {
    if token.is_empty() {
      return Err(Error::Validation("challenge token is empty"));
    }
    let key_authorization = format!("{}.{}", token, b64(thumbprint));
    let z = sha256(key_authorization.as_bytes());

    let (san_a, san_b) = match kind {
      ChallengeKind::TlsSni01 => (split_hex_name(&z, "acme.invalid"), None),
      ChallengeKind::TlsSni02 => (
        split_hex_name(&z, "token.acme.invalid"),
        Some(split_hex_name(thumbprint, "ka.acme.invalid")),
      ),
    };

    Ok(ChallengeProof {
      kind,
      key_authorization,
      san_a,
      san_b,
    })
  }

  /// Every name the challenge certificate has to carry.
  pub fn sans(&self) -> Vec<&str> {
    let mut sans = vec![self.san_a.as_str()];
    if let Some(san_b) = &self.san_b {
      sans.push(san_b);
    }
    sans
  }
}
