use crate::error::*;
use crate::helpers::*;
use crate::jws::jws;
use crate::jws::Jwk;
use openssl::hash::hash;
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::pkey::Private;
use std::path::Path;
use tracing::debug;
use tracing::field;
use tracing::info;
use tracing::instrument;
use tracing::Level;
use tracing::Span;

/// The long-lived key identifying this server to the ACME CA.
///
/// The key is loaded once per process and only ever read afterwards: to
/// sign requests and to derive the key authorization for challenges.
#[derive(Clone)]
pub struct AccountKey {
  private_key: PKey<Private>,
  thumbprint: [u8; 32],
}

impl std::fmt::Debug for AccountKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("AccountKey")
      .field("thumbprint", &b64(&self.thumbprint))
      .finish()
  }
}

impl AccountKey {
  pub fn from_private_key(private_key: PKey<Private>) -> Result<Self, Error> {
    let jwk = Jwk::new(&private_key)?;
    let digest = hash(MessageDigest::sha256(), jwk.canonical()?.as_bytes())?;
    let mut thumbprint = [0u8; 32];
    thumbprint.copy_from_slice(&digest);
    Ok(AccountKey {
      private_key,
      thumbprint,
    })
  }

  /// Generate a fresh RSA account key of `bits` bits.
  pub fn generate(bits: u32) -> Result<Self, Error> {
    Self::from_private_key(gen_rsa_private_key(bits)?)
  }

  /// Load the account key stored at `path`, or generate one and persist
  /// it there before first use. Call this while the process still has the
  /// privileges needed to read the key.
  #[instrument(level = Level::INFO, name = "acme_sni::AccountKey::load_or_generate", err, skip(path), fields(key_path = %path.as_ref().display(), generated = field::Empty))]
  pub async fn load_or_generate(
    path: impl AsRef<Path>,
    bits: u32,
  ) -> Result<Self, Error> {
    let path = path.as_ref();
    match tokio::fs::read(path).await {
      Ok(pem) => {
        Span::current().record("generated", &false);
        let key = Self::from_private_key(PKey::private_key_from_pem(&pem)?)?;
        debug!(thumbprint = %b64(&key.thumbprint), "Loaded account key");
        Ok(key)
      }
      Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
        Span::current().record("generated", &true);
        let key = Self::generate(bits)?;
        write_private(path, &key.private_key.private_key_to_pem_pkcs8()?)
          .await?;
        info!(thumbprint = %b64(&key.thumbprint), "Generated new account key");
        Ok(key)
      }
      Err(err) => Err(err.into()),
    }
  }

  /// SHA-256 JWK thumbprint (RFC 7638) of the public key.
  pub fn thumbprint(&self) -> &[u8; 32] {
    &self.thumbprint
  }

  pub(crate) fn sign(
    &self,
    url: &str,
    nonce: &str,
    payload: &str,
  ) -> Result<String, Error> {
    jws(url, nonce, payload, &self.private_key)
  }
}

async fn write_private(path: &Path, contents: &[u8]) -> Result<(), Error> {
  use tokio::io::AsyncWriteExt;

  let mut options = tokio::fs::OpenOptions::new();
  options.write(true).create_new(true);
  #[cfg(unix)]
  options.mode(0o600);
  let mut file = options.open(path).await?;
  file.write_all(contents).await?;
  file.flush().await?;
  file.sync_all().await?;
  Ok(())
}
