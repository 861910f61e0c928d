use crate::error::*;
use crate::helpers::*;
use serde::Deserialize;
use tracing::debug;

/// The TLS-SNI challenge family. `TlsSni02` takes priority when a CA
/// offers both.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ChallengeKind {
  TlsSni01,
  TlsSni02,
}

impl ChallengeKind {
  pub fn from_type(typ: &str) -> Option<Self> {
    match typ {
      "tls-sni-01" => Some(ChallengeKind::TlsSni01),
      "tls-sni-02" => Some(ChallengeKind::TlsSni02),
      _ => None,
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      ChallengeKind::TlsSni01 => "tls-sni-01",
      ChallengeKind::TlsSni02 => "tls-sni-02",
    }
  }
}

#[derive(Deserialize, Debug, Eq, PartialEq, Clone, Copy)]
#[serde(rename_all = "camelCase")]
/// The status of a challenge. Possible values are "pending",
/// "processing", "valid", and "invalid".
pub enum ChallengeStatus {
  Pending,
  Processing,
  Valid,
  Invalid,
  #[serde(other)]
  Unknown,
}

impl Default for ChallengeStatus {
  fn default() -> Self {
    ChallengeStatus::Unknown
  }
}

#[derive(Deserialize, Debug)]
struct RawChallenge {
  #[serde(rename = "type")]
  typ: String,
  #[serde(default)]
  status: ChallengeStatus,
  uri: Option<String>,
  token: Option<String>,
}

#[derive(Deserialize, Debug)]
struct RawAuthorization {
  identifier: Option<Identifier>,
  #[serde(default)]
  status: ChallengeStatus,
  #[serde(default)]
  challenges: Vec<RawChallenge>,
}

/// The challenge picked out of an authorization, valid for one issuance
/// attempt.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SelectedChallenge {
  pub kind: ChallengeKind,
  pub status: ChallengeStatus,
  /// Status of the enclosing authorization.
  pub authorization_status: ChallengeStatus,
  pub uri: String,
  pub token: String,
}

impl SelectedChallenge {
  /// The CA already holds a valid authorization for the identifier, so
  /// there is nothing to prove.
  pub fn is_authorized(&self) -> bool {
    self.status == ChallengeStatus::Valid
      || self.authorization_status == ChallengeStatus::Valid
  }
}

/// Picks the challenge to answer from an authorization's challenge list.
///
/// The first `tls-sni-02` wins outright. Failing that the first
/// `tls-sni-01` is used. Anything else is ignored.
pub fn select_challenge(body: &[u8]) -> Result<SelectedChallenge, Error> {
  let authz: RawAuthorization = serde_json::from_slice(body)?;
  if let Some(identifier) = &authz.identifier {
    debug!(identifier = %identifier.value, "Authorization received");
  }

  let mut selected: Option<(ChallengeKind, &RawChallenge)> = None;
  for challenge in &authz.challenges {
    let kind = match ChallengeKind::from_type(&challenge.typ) {
      Some(kind) => kind,
      None => continue,
    };
    match selected.map(|(current, _)| current) {
      Some(ChallengeKind::TlsSni02) => break,
      Some(ChallengeKind::TlsSni01) if kind == ChallengeKind::TlsSni01 => {
        continue
      }
      _ => selected = Some((kind, challenge)),
    }
  }

  let (kind, challenge) = selected.ok_or(Error::NoSupportedChallenge)?;
  let uri = challenge
    .uri
    .as_deref()
    .ok_or(Error::Validation("selected challenge has no uri"))?;
  let token = challenge
    .token
    .as_deref()
    .ok_or(Error::Validation("selected challenge has no token"))?;

  Ok(SelectedChallenge {
    kind,
    status: challenge.status,
    authorization_status: authz.status,
    uri: bounded("challenge uri", uri, MAX_URL_LEN)?,
    token: bounded("challenge token", token, MAX_TOKEN_LEN)?,
  })
}

/// Accumulates a streamed authorization resource.
#[derive(Debug)]
pub(crate) struct AuthorizationNegotiator {
  body: BoundedBuf,
}

impl AuthorizationNegotiator {
  pub fn new() -> Self {
    AuthorizationNegotiator {
      body: BoundedBuf::new("authorization", MAX_BODY_LEN),
    }
  }

  pub fn feed(&mut self, chunk: &[u8]) -> Result<(), Error> {
    self.body.push(chunk)
  }

  pub fn finish(self) -> Result<SelectedChallenge, Error> {
    select_challenge(self.body.as_slice())
  }
}

/// A single challenge resource, as returned when accepting or polling it.
#[derive(Deserialize, Debug)]
pub struct ChallengeResource {
  #[serde(rename = "type")]
  pub typ: Option<String>,
  #[serde(default)]
  pub status: ChallengeStatus,
  pub uri: Option<String>,
  pub token: Option<String>,
  /// Error that occurred while the server was validating the
  /// challenge, if any.
  pub error: Option<ServerError>,
}

impl ChallengeResource {
  pub fn from_json(body: &[u8]) -> Result<ChallengeResource, Error> {
    Ok(serde_json::from_slice(body)?)
  }
}
