use crate::account::AccountKey;
use crate::config::AcmeConfig;
use crate::directory::Directory;
use crate::error::*;
use crate::identity::CertAging;
use crate::identity::Host;
use crate::identity::HostIdentity;
use crate::install::CertInstaller;
use crate::session::*;
use std::sync::Arc;
use tracing::debug;
use tracing::field;
use tracing::info;
use tracing::info_span;
use tracing::instrument;
use tracing::Level;
use tracing::Span;
use tracing_futures::Instrument;

pub struct AcmeClientBuilder {
  config: AcmeConfig,
  host: Arc<dyn Host>,
  http_client: Option<reqwest::Client>,
  account_key: Option<AccountKey>,
}

impl AcmeClientBuilder {
  pub fn new(config: AcmeConfig, host: Arc<dyn Host>) -> Self {
    AcmeClientBuilder {
      config,
      host,
      http_client: None,
      account_key: None,
    }
  }

  pub fn http_client(&mut self, http_client: reqwest::Client) -> &mut Self {
    self.http_client = Some(http_client);
    self
  }

  /// Use `account_key` instead of the key stored at the configured
  /// `auth_path`.
  pub fn account_key(&mut self, account_key: AccountKey) -> &mut Self {
    self.account_key = Some(account_key);
    self
  }

  /// Validate the configuration, load (or create) the account key and open
  /// the update files. Call this while the process can still create them.
  #[instrument(level = Level::INFO, name = "acme_sni::AcmeClientBuilder::build", err, skip(self), fields(common_name = %self.config.common_name, directory_url = %self.config.directory_url))]
  pub async fn build(&mut self) -> Result<AcmeClient, Error> {
    self.config.validate()?;

    let account_key = match self.account_key.take() {
      Some(account_key) => account_key,
      None => {
        AccountKey::load_or_generate(
          &self.config.auth_path,
          self.config.account_key_bits,
        )
        .await?
      }
    };
    let installer =
      CertInstaller::open(&self.config.cert_path, &self.config.key_path)
        .await?;
    let http = self
      .http_client
      .clone()
      .unwrap_or_else(reqwest::Client::new);

    Ok(AcmeClient {
      http,
      ctx: Arc::new(SessionContext {
        config: self.config.clone(),
        account_key,
        host: self.host.clone(),
      }),
      installer,
      directory: None,
    })
  }
}

/// Drives renewals for one site against one CA.
///
/// At most one renewal runs at a time; [`AcmeClient::renew`] takes
/// `&mut self`.
pub struct AcmeClient {
  http: reqwest::Client,
  ctx: Arc<SessionContext>,
  installer: CertInstaller,
  directory: Option<Arc<Directory>>,
}

impl AcmeClient {
  pub fn config(&self) -> &AcmeConfig {
    &self.ctx.config
  }

  pub fn account_key(&self) -> &AccountKey {
    &self.ctx.account_key
  }

  /// The directory resolved by an earlier renewal, reused by later ones.
  pub fn directory(&self) -> Option<&Arc<Directory>> {
    self.directory.as_ref()
  }

  /// React to the host reporting that a certificate is close to expiry.
  /// Returns whether a renewal was carried out.
  pub async fn on_cert_aging(&mut self, aging: &CertAging) -> Result<bool, Error> {
    if aging.identity.name != self.ctx.config.common_name {
      debug!(identity = %aging.identity.name, "Aging certificate belongs to another site");
      return Ok(false);
    }
    if aging.days_left > i64::from(self.ctx.config.renew_within_days) {
      debug!(days_left = aging.days_left, "Certificate not due for renewal");
      return Ok(false);
    }

    info!(identity = %aging.identity.name, days_left = aging.days_left, "Renewing certificate");
    self.renew(&aging.identity).await?;
    Ok(true)
  }

  /// Run one issuance for `identity` to completion, installing the result.
  #[instrument(level = Level::INFO, name = "acme_sni::AcmeClient::renew", err, skip(self, identity), fields(identity = %identity.name, final_state = field::Empty))]
  pub async fn renew(&mut self, identity: &HostIdentity) -> Result<(), Error> {
    let mut session =
      Session::new(self.ctx.clone(), identity.clone(), self.directory.clone());
    let mut effect = session.start();

    let result = loop {
      effect = match effect {
        Effect::Send(exchange) => {
          if exchange.poll {
            tokio::time::sleep(self.ctx.config.poll_interval()).await;
          }
          let span = info_span!("acme_sni::exchange", method = %exchange.method, url = %exchange.url, state = %session.state());
          let next = perform(&self.http, &mut session, exchange)
            .instrument(span)
            .await;
          if self.directory.is_none() {
            self.directory = session.directory().cloned();
          }
          next
        }
        Effect::Install(issued) => {
          break self.installer.install(&issued, self.ctx.host.as_ref()).await
        }
        Effect::Failed(err) => break Err(err),
        Effect::Idle => {
          break Err(Error::Validation("session stalled without a request"))
        }
      };
    };

    Span::current().record("final_state", &session.state().as_str());
    result
  }
}

fn header(response: &reqwest::Response, name: &str) -> Option<String> {
  response
    .headers()
    .get(name)
    .and_then(|value| value.to_str().ok())
    .map(|value| value.to_string())
}

/// Carry out `exchange`, feeding every response callback to `session`
/// until it asks for something other than more of this response.
async fn perform(
  http: &reqwest::Client,
  session: &mut Session,
  exchange: Exchange,
) -> Effect {
  let mut request = http.request(exchange.method, &exchange.url);
  if let Some(body) = exchange.body {
    request = request
      .header(reqwest::header::CONTENT_TYPE, "application/jose+json")
      .body(body);
  }

  let mut response = match request.send().await {
    Ok(response) => response,
    Err(err) => return session.handle(Event::TransportFailed(err.into())),
  };

  let head = ResponseHead {
    status: response.status().as_u16(),
    replay_nonce: header(&response, "replay-nonce"),
    location: header(&response, reqwest::header::LOCATION.as_str()),
  };
  debug!(status = head.status, "Response received");
  match session.handle(Event::Headers(head)) {
    Effect::Idle => {}
    effect => return effect,
  }

  loop {
    match response.chunk().await {
      Ok(Some(chunk)) => match session.handle(Event::Body(&chunk)) {
        Effect::Idle => {}
        effect => return effect,
      },
      Ok(None) => return session.handle(Event::Complete),
      Err(err) => return session.handle(Event::TransportFailed(err.into())),
    }
  }
}
