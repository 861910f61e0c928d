use crate::csr::IssuedCertificate;
use crate::error::*;
use crate::identity::CertificateUpdate;
use crate::identity::Host;
use data_encoding::Encoding;
use data_encoding::BASE64;
use openssl::asn1::Asn1Time;
use openssl::pkey::PKey;
use openssl::x509::X509Ref;
use openssl::x509::X509;
use std::io::SeekFrom;
use std::path::Path;
use std::path::PathBuf;
use tokio::fs::File;
use tokio::fs::OpenOptions;
use tokio::io::AsyncSeekExt;
use tokio::io::AsyncWriteExt;
use tracing::info;
use tracing::instrument;
use tracing::warn;
use tracing::Level;

const UPDATE_SUFFIX: &str = "upd";
const MAX_BACKUPS: u32 = 50;

/// `<path>.upd`, where renewals are written for the host to adopt.
pub fn update_path(path: &Path) -> PathBuf {
  let mut name = path.as_os_str().to_owned();
  name.push(".");
  name.push(UPDATE_SUFFIX);
  PathBuf::from(name)
}

fn pem_base64() -> Result<Encoding, Error> {
  let mut spec = BASE64.specification();
  spec.wrap.width = 64;
  spec.wrap.separator.push_str("\n");
  spec
    .encoding()
    .map_err(|_| Error::Validation("unusable PEM base64 specification"))
}

/// PEM armour for a DER certificate, wrapped at 64 columns.
pub fn pem_certificate(der: &[u8]) -> Result<String, Error> {
  // wrapped output always ends with the separator
  let body = pem_base64()?.encode(der);
  Ok(format!(
    "-----BEGIN CERTIFICATE-----\n{}-----END CERTIFICATE-----\n",
    body
  ))
}

/// Writes issued certificates to the update files and tells the host.
///
/// The update files are opened once, while the process still has the
/// privileges to create them, and are rewound and reused for every later
/// renewal.
#[derive(Debug)]
pub struct CertInstaller {
  cert_path: PathBuf,
  key_path: PathBuf,
  cert_file: File,
  key_file: File,
}

async fn open_update_file(path: &Path) -> Result<File, Error> {
  let mut options = OpenOptions::new();
  options.write(true).create(true).truncate(true);
  #[cfg(unix)]
  options.mode(0o600);
  Ok(options.open(update_path(path)).await?)
}

async fn replace_contents(file: &mut File, contents: &[u8]) -> Result<(), Error> {
  file.seek(SeekFrom::Start(0)).await?;
  file.set_len(0).await?;
  file.write_all(contents).await?;
  file.flush().await?;
  file.sync_all().await?;
  file.seek(SeekFrom::Start(0)).await?;
  Ok(())
}

impl CertInstaller {
  /// Open (creating or truncating) `<cert_path>.upd` and `<key_path>.upd`.
  pub async fn open(
    cert_path: impl Into<PathBuf>,
    key_path: impl Into<PathBuf>,
  ) -> Result<Self, Error> {
    let cert_path = cert_path.into();
    let key_path = key_path.into();
    let cert_file = open_update_file(&cert_path).await?;
    let key_file = open_update_file(&key_path).await?;
    Ok(CertInstaller {
      cert_path,
      key_path,
      cert_file,
      key_file,
    })
  }

  /// Persist `issued` and hand it to the host. Both files are complete
  /// and synced before the host hears about either.
  #[instrument(level = Level::INFO, name = "acme_sni::CertInstaller::install", err, skip(self, issued, host), fields(cert_path = %self.cert_path.display(), key_path = %self.key_path.display()))]
  pub async fn install(
    &mut self,
    issued: &IssuedCertificate,
    host: &dyn Host,
  ) -> Result<(), Error> {
    let cert_pem = pem_certificate(&issued.certificate)?;

    replace_contents(&mut self.cert_file, cert_pem.as_bytes()).await?;
    replace_contents(&mut self.key_file, &issued.private_key_pem).await?;
    info!(
      cert_len = issued.certificate.len(),
      "Updated certificate and key written"
    );

    host.certificate_updated(CertificateUpdate {
      cert_path: &self.cert_path,
      key_path: &self.key_path,
      certificate: &issued.certificate,
      private_key: &issued.private_key_pem,
    })
  }
}

/// Outcome of [`adopt_pending_updates`].
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Extant {
  /// The live certificate or key is missing.
  Missing,
  /// Both live files are readable (possibly a just adopted update).
  Present,
  /// A valid update exists but could not be moved into place; the caller
  /// should fall back to in-memory copies.
  Alternative,
}

async fn readable(path: &Path) -> bool {
  match tokio::fs::metadata(path).await {
    Ok(meta) => meta.is_file() && meta.len() > 0,
    Err(_) => false,
  }
}

/// Parse both update files and require the key to match the certificate.
async fn check_pair(cert_path: &Path, key_path: &Path) -> Result<(), Error> {
  let cert = X509::from_pem(&tokio::fs::read(cert_path).await?)?;
  let key = PKey::private_key_from_pem(&tokio::fs::read(key_path).await?)?;
  if !cert.public_key()?.public_eq(&key) {
    return Err(Error::Validation("certificate does not match its key"));
  }
  Ok(())
}

async fn free_backup(path: &Path) -> Option<PathBuf> {
  for n in 0..MAX_BACKUPS {
    let mut backup = path.as_os_str().to_owned();
    backup.push(format!(".old.{}", n));
    let backup = PathBuf::from(backup);
    if tokio::fs::symlink_metadata(&backup).await.is_err() {
      return Some(backup);
    }
  }
  None
}

/// Completed renames, undone in reverse if a later one fails.
#[derive(Default)]
struct Moves(Vec<(PathBuf, PathBuf)>);

impl Moves {
  async fn rename(&mut self, from: &Path, to: &Path) -> Result<(), Error> {
    tokio::fs::rename(from, to).await?;
    self.0.push((from.to_path_buf(), to.to_path_buf()));
    Ok(())
  }

  async fn rotate_in(&mut self, paths: &[&Path]) -> Result<(), Error> {
    for path in paths {
      if tokio::fs::symlink_metadata(path).await.is_ok() {
        let backup = free_backup(path)
          .await
          .ok_or(Error::Validation("no free backup name"))?;
        self.rename(path, &backup).await?;
      }
    }
    for path in paths {
      self.rename(&update_path(path), path).await?;
    }
    Ok(())
  }

  async fn roll_back(self) {
    for (from, to) in self.0.into_iter().rev() {
      if let Err(err) = tokio::fs::rename(&to, &from).await {
        warn!(path = %from.display(), %err, "Unable to restore file");
      }
    }
  }
}

/// Move a completed `<cert_path>.upd` / `<key_path>.upd` pair into place
/// at startup.
///
/// The pair is adopted only if both files parse and the key matches the
/// certificate; then each live file is renamed to the first free
/// `<path>.old.N` and both updates are moved in. Either both files are
/// replaced or neither is. Run this before [`CertInstaller::open`], which
/// truncates the update files.
#[instrument(level = Level::INFO, name = "acme_sni::adopt_pending_updates", skip_all, fields(cert_path = %cert_path.display(), key_path = %key_path.display()))]
pub async fn adopt_pending_updates(cert_path: &Path, key_path: &Path) -> Extant {
  let cert_update = update_path(cert_path);
  let key_update = update_path(key_path);

  match (readable(&cert_update).await, readable(&key_update).await) {
    (true, true) => {
      if let Err(err) = check_pair(&cert_update, &key_update).await {
        warn!(%err, "Ignoring unusable certificate update");
      } else {
        let mut moves = Moves::default();
        let rotated = moves.rotate_in(&[cert_path, key_path]).await;
        if let Err(err) = rotated {
          warn!(%err, "Unable to adopt certificate update");
          moves.roll_back().await;
          return Extant::Alternative;
        }
        info!("Adopted renewed certificate and key");
      }
    }
    (false, false) => {}
    _ => warn!("Ignoring a certificate update without its pair"),
  }

  if readable(cert_path).await && readable(key_path).await {
    Extant::Present
  } else {
    Extant::Missing
  }
}

/// Whole days until `cert` expires; negative once it has.
pub fn days_until_expiry(cert: &X509Ref) -> Result<i64, Error> {
  let now = Asn1Time::days_from_now(0)?;
  Ok(now.diff(cert.not_after())?.days as i64)
}
