use crate::error::*;
use crate::helpers::*;
use serde::Deserialize;

/// The six endpoints a CA publishes in its discovery document.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DirectoryField {
  KeyChange,
  TermsOfService,
  NewAuthz,
  NewCert,
  NewReg,
  RevokeCert,
}

impl DirectoryField {
  pub const ALL: [DirectoryField; 6] = [
    DirectoryField::KeyChange,
    DirectoryField::TermsOfService,
    DirectoryField::NewAuthz,
    DirectoryField::NewCert,
    DirectoryField::NewReg,
    DirectoryField::RevokeCert,
  ];

  /// Dotted path of the field within the discovery document.
  pub fn path(self) -> &'static str {
    match self {
      DirectoryField::KeyChange => "key-change",
      DirectoryField::TermsOfService => "meta.terms-of-service",
      DirectoryField::NewAuthz => "new-authz",
      DirectoryField::NewCert => "new-cert",
      DirectoryField::NewReg => "new-reg",
      DirectoryField::RevokeCert => "revoke-cert",
    }
  }
}

#[derive(Deserialize, Debug, Default)]
struct RawMeta {
  #[serde(rename = "terms-of-service")]
  terms_of_service: Option<String>,
}

#[derive(Deserialize, Debug)]
struct RawDirectory {
  #[serde(rename = "key-change")]
  key_change: Option<String>,
  #[serde(default)]
  meta: Option<RawMeta>,
  #[serde(rename = "new-authz")]
  new_authz: Option<String>,
  #[serde(rename = "new-cert")]
  new_cert: Option<String>,
  #[serde(rename = "new-reg")]
  new_reg: Option<String>,
  #[serde(rename = "revoke-cert")]
  revoke_cert: Option<String>,
}

/// The CA's map of operation name to endpoint URL.
///
/// Resolved once and reused for every later renewal against the same CA.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Directory {
  pub(crate) key_change_url: Option<String>,
  pub(crate) terms_of_service_url: Option<String>,
  pub(crate) new_authz_url: String,
  pub(crate) new_cert_url: String,
  pub(crate) new_reg_url: String,
  pub(crate) revoke_cert_url: Option<String>,
}

fn url(
  field: DirectoryField,
  value: Option<String>,
) -> Result<Option<String>, Error> {
  match value {
    Some(value) => Ok(Some(bounded(field.path(), &value, MAX_URL_LEN)?)),
    None => Ok(None),
  }
}

fn required(
  field: DirectoryField,
  value: Option<String>,
) -> Result<String, Error> {
  url(field, value)?.ok_or(Error::Validation(
    "directory lacks one of new-reg, new-authz or new-cert",
  ))
}

impl Directory {
  pub fn from_json(body: &[u8]) -> Result<Directory, Error> {
    let raw: RawDirectory = serde_json::from_slice(body)?;
    let meta = raw.meta.unwrap_or_default();

    Ok(Directory {
      key_change_url: url(DirectoryField::KeyChange, raw.key_change)?,
      terms_of_service_url: url(
        DirectoryField::TermsOfService,
        meta.terms_of_service,
      )?,
      new_authz_url: required(DirectoryField::NewAuthz, raw.new_authz)?,
      new_cert_url: required(DirectoryField::NewCert, raw.new_cert)?,
      new_reg_url: required(DirectoryField::NewReg, raw.new_reg)?,
      revoke_cert_url: url(DirectoryField::RevokeCert, raw.revoke_cert)?,
    })
  }

  pub fn get(&self, field: DirectoryField) -> Option<&str> {
    match field {
      DirectoryField::KeyChange => self.key_change_url.as_deref(),
      DirectoryField::TermsOfService => self.terms_of_service_url.as_deref(),
      DirectoryField::NewAuthz => Some(&self.new_authz_url),
      DirectoryField::NewCert => Some(&self.new_cert_url),
      DirectoryField::NewReg => Some(&self.new_reg_url),
      DirectoryField::RevokeCert => self.revoke_cert_url.as_deref(),
    }
  }
}

/// Accumulates a streamed discovery document and resolves it once the
/// response completes.
#[derive(Debug)]
pub(crate) struct DirectoryResolver {
  body: BoundedBuf,
}

impl DirectoryResolver {
  pub fn new() -> Self {
    DirectoryResolver {
      body: BoundedBuf::new("directory document", MAX_BODY_LEN),
    }
  }

  pub fn feed(&mut self, chunk: &[u8]) -> Result<(), Error> {
    self.body.push(chunk)
  }

  pub fn finish(self) -> Result<Directory, Error> {
    Directory::from_json(self.body.as_slice())
  }
}
