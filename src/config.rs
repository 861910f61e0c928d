use crate::error::*;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

fn default_account_key_bits() -> u32 {
  4096
}

fn default_cert_key_bits() -> u32 {
  2048
}

fn default_renew_within_days() -> u32 {
  14
}

fn default_poll_interval_ms() -> u64 {
  3000
}

/// Per-site settings for unattended certificate renewal.
///
/// Deserializes from the host configuration with kebab-case keys
/// (`common-name`, `directory-url`, ...), or can be put together with an
/// [`AcmeConfigBuilder`].
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct AcmeConfig {
  /// Subject country (C) for the certificate request.
  pub country: Option<String>,
  /// Subject state or province (ST).
  pub state: Option<String>,
  /// Subject locality (L).
  pub locality: Option<String>,
  /// Subject organization (O).
  pub organization: Option<String>,
  /// Subject common name (CN).
  pub common_name: String,
  /// Contact address registered with the CA, without `mailto:`.
  pub email: String,
  /// The CA's discovery document.
  pub directory_url: String,
  /// Where the account key lives.
  pub auth_path: PathBuf,
  /// Live certificate path. Renewals are written next to it with a
  /// `.upd` suffix.
  pub cert_path: PathBuf,
  /// Live private key path, updated the same way.
  pub key_path: PathBuf,

  #[serde(default = "default_account_key_bits")]
  pub account_key_bits: u32,
  #[serde(default = "default_cert_key_bits")]
  pub cert_key_bits: u32,
  /// Renew once the live certificate has this many days or fewer left.
  #[serde(default = "default_renew_within_days")]
  pub renew_within_days: u32,
  #[serde(default = "default_poll_interval_ms")]
  pub poll_interval_ms: u64,
}

impl AcmeConfig {
  pub fn validate(&self) -> Result<(), Error> {
    if self.common_name.is_empty() {
      return Err(Error::Validation("common-name is required"));
    }
    if self.email.is_empty() {
      return Err(Error::Validation("email is required"));
    }
    if self.directory_url.is_empty() {
      return Err(Error::Validation("directory-url is required"));
    }
    if self.auth_path.as_os_str().is_empty() {
      return Err(Error::Validation("auth-path is required"));
    }
    if self.cert_path.as_os_str().is_empty() {
      return Err(Error::Validation("cert-path is required"));
    }
    if self.key_path.as_os_str().is_empty() {
      return Err(Error::Validation("key-path is required"));
    }
    if self.cert_key_bits < 2048 || self.account_key_bits < 2048 {
      return Err(Error::Validation("RSA keys must be at least 2048 bits"));
    }
    Ok(())
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_millis(self.poll_interval_ms)
  }
}

/// A builder for [`AcmeConfig`].
#[derive(Debug)]
pub struct AcmeConfigBuilder {
  config: AcmeConfig,
}

impl AcmeConfigBuilder {
  pub fn new(directory_url: String, common_name: String) -> Self {
    AcmeConfigBuilder {
      config: AcmeConfig {
        country: None,
        state: None,
        locality: None,
        organization: None,
        common_name,
        email: String::new(),
        directory_url,
        auth_path: PathBuf::new(),
        cert_path: PathBuf::new(),
        key_path: PathBuf::new(),
        account_key_bits: default_account_key_bits(),
        cert_key_bits: default_cert_key_bits(),
        renew_within_days: default_renew_within_days(),
        poll_interval_ms: default_poll_interval_ms(),
      },
    }
  }

  pub fn email(&mut self, email: String) -> &mut Self {
    self.config.email = email;
    self
  }

  pub fn subject(
    &mut self,
    country: Option<String>,
    state: Option<String>,
    locality: Option<String>,
    organization: Option<String>,
  ) -> &mut Self {
    self.config.country = country;
    self.config.state = state;
    self.config.locality = locality;
    self.config.organization = organization;
    self
  }

  pub fn auth_path(&mut self, path: impl Into<PathBuf>) -> &mut Self {
    self.config.auth_path = path.into();
    self
  }

  pub fn cert_path(&mut self, path: impl Into<PathBuf>) -> &mut Self {
    self.config.cert_path = path.into();
    self
  }

  pub fn key_path(&mut self, path: impl Into<PathBuf>) -> &mut Self {
    self.config.key_path = path.into();
    self
  }

  pub fn account_key_bits(&mut self, bits: u32) -> &mut Self {
    self.config.account_key_bits = bits;
    self
  }

  pub fn cert_key_bits(&mut self, bits: u32) -> &mut Self {
    self.config.cert_key_bits = bits;
    self
  }

  pub fn renew_within_days(&mut self, days: u32) -> &mut Self {
    self.config.renew_within_days = days;
    self
  }

  pub fn poll_interval(&mut self, interval: Duration) -> &mut Self {
    self.config.poll_interval_ms = interval.as_millis() as u64;
    self
  }

  pub fn build(&self) -> Result<AcmeConfig, Error> {
    self.config.validate()?;
    Ok(self.config.clone())
  }
}
