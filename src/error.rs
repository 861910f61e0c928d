use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("the maximum poll attempts have been exceeded")]
  MaxAttemptsExceeded,

  #[error("validation error: {0}")]
  Validation(&'static str),

  #[error("{field} is longer than {limit} bytes")]
  FieldTooLong { field: &'static str, limit: usize },

  #[error("{step} replied with unexpected status {status}{}", problem_suffix(.problem))]
  UnexpectedStatus {
    step: &'static str,
    status: u16,
    problem: Option<ServerError>,
  },

  #[error("the server found the challenge invalid")]
  ChallengeInvalid,

  #[error("the authorization offers no supported challenge")]
  NoSupportedChallenge,

  #[error("no replay nonce is available to sign the next request")]
  MissingNonce,

  #[error("malformed response: {0}")]
  Malformed(serde_json::Error),

  #[error(transparent)]
  Transport(Box<dyn std::error::Error + Send + Sync>),

  #[error(transparent)]
  Io(#[from] std::io::Error),

  #[error(transparent)]
  Crypto(#[from] openssl::error::ErrorStack),
}

impl Error {
  /// Failures of the local environment (files, key material) rather than
  /// of the CA or the network.
  pub fn is_operational(&self) -> bool {
    matches!(self, Error::Io(_) | Error::Crypto(_))
  }
}

fn problem_suffix(problem: &Option<ServerError>) -> String {
  match problem {
    Some(problem) => format!(" ({})", problem),
    None => String::new(),
  }
}

#[derive(Debug, thiserror::Error)]
#[error("transport error: {0}")]
pub struct TransportError(&'static str);

pub fn transport_err(msg: &'static str) -> Error {
  Error::Transport(Box::new(TransportError(msg)))
}

impl From<reqwest::Error> for Error {
  fn from(err: reqwest::Error) -> Self {
    Self::Transport(Box::new(err))
  }
}

impl From<serde_json::Error> for Error {
  fn from(err: serde_json::Error) -> Self {
    Self::Malformed(err)
  }
}

/// A problem document (`urn:acme:error:*`) returned by the CA. Boulder v1
/// sends `type`, `detail` and `status`; `title` is rarely present.
#[derive(Deserialize, Debug, Clone, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("{}: {}", r#type.as_deref().unwrap_or("urn:acme:error"), detail.as_deref().or(title.as_deref()).unwrap_or("no detail"))]
pub struct ServerError {
  /// The type of this error.
  pub r#type: Option<String>,
  /// The human readable title of this error.
  pub title: Option<String>,
  /// The status code of this error.
  pub status: Option<u16>,
  /// The human readable extra description for this error.
  pub detail: Option<String>,
}

impl ServerError {
  /// Best-effort parse of a problem document out of a failed response body.
  pub(crate) fn from_body(body: &[u8]) -> Option<ServerError> {
    serde_json::from_slice(body).ok()
  }
}
