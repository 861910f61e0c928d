//! The issuance state machine.
//!
//! A [`Session`] never touches the network. The driver feeds it the
//! callbacks of each HTTP exchange ([`Event`]) and carries out whatever it
//! asks for next ([`Effect`]): another exchange, installing the issued
//! certificate, or giving up.

use crate::account::AccountKey;
use crate::authorization::*;
use crate::config::AcmeConfig;
use crate::csr::CsrIssuer;
use crate::csr::IssuedCertificate;
use crate::directory::Directory;
use crate::directory::DirectoryResolver;
use crate::error::*;
use crate::helpers::*;
use crate::identity::identity_request;
use crate::identity::Host;
use crate::identity::HostIdentity;
use crate::identity::TemporaryIdentity;
use crate::proof::ChallengeProof;
use reqwest::Method;
use serde_json::json;
use std::sync::Arc;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

/// Polls tolerated per polling phase before the session gives up.
pub const MAX_POLL_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum State {
  Directory,
  NewReg,
  NewAuth,
  AcceptChallenge,
  Polling,
  PollingCsr,
  Finished,
  Failed,
}

impl State {
  pub fn as_str(self) -> &'static str {
    match self {
      State::Directory => "directory",
      State::NewReg => "new-reg",
      State::NewAuth => "new-authz",
      State::AcceptChallenge => "accept-challenge",
      State::Polling => "polling",
      State::PollingCsr => "polling-csr",
      State::Finished => "finished",
      State::Failed => "failed",
    }
  }

  pub fn is_terminal(self) -> bool {
    matches!(self, State::Finished | State::Failed)
  }
}

impl std::fmt::Display for State {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// One outbound HTTP request.
#[derive(Debug, Clone)]
pub struct Exchange {
  pub method: Method,
  pub url: String,
  /// Signed JWS body, for POSTs.
  pub body: Option<String>,
  /// Whether this request polls the CA and should be paced.
  pub poll: bool,
}

impl Exchange {
  fn get(url: String) -> Self {
    Exchange {
      method: Method::GET,
      url,
      body: None,
      poll: false,
    }
  }

  fn poll(url: String) -> Self {
    Exchange {
      poll: true,
      ..Exchange::get(url)
    }
  }

  fn head(url: String) -> Self {
    Exchange {
      method: Method::HEAD,
      ..Exchange::get(url)
    }
  }

  fn post(url: String, body: String) -> Self {
    Exchange {
      method: Method::POST,
      url,
      body: Some(body),
      poll: false,
    }
  }
}

/// The parts of a response header the session acts on.
#[derive(Debug, Clone, Default)]
pub struct ResponseHead {
  pub status: u16,
  pub replay_nonce: Option<String>,
  pub location: Option<String>,
}

/// Transport callbacks for the exchange in flight, in the order they
/// occur: headers, zero or more body chunks, completion.
#[derive(Debug)]
pub enum Event<'a> {
  Headers(ResponseHead),
  Body(&'a [u8]),
  Complete,
  TransportFailed(Error),
}

/// What the driver must do next.
#[derive(Debug)]
pub enum Effect {
  /// Keep delivering events for the current exchange.
  Idle,
  Send(Exchange),
  /// Issuance succeeded; persist and hand over the result.
  Install(IssuedCertificate),
  Failed(Error),
}

/// Process-wide state shared by every session of a site.
pub struct SessionContext {
  pub config: AcmeConfig,
  pub account_key: AccountKey,
  pub host: Arc<dyn Host>,
}

enum Reader {
  None,
  Directory(DirectoryResolver),
  Authorization(AuthorizationNegotiator),
  Certificate,
  Body(BoundedBuf),
}

impl Reader {
  fn body() -> Self {
    Reader::Body(BoundedBuf::new("response body", MAX_BODY_LEN))
  }

  fn problem(&self) -> Option<ServerError> {
    match self {
      Reader::Body(buf) => ServerError::from_body(buf.as_slice()),
      _ => None,
    }
  }
}

fn is_success(status: u16) -> bool {
  (200..300).contains(&status)
}

fn unexpected(step: &'static str, status: u16, reader: &Reader) -> Error {
  Error::UnexpectedStatus {
    step,
    status,
    problem: reader.problem(),
  }
}

/// One issuance attempt for one identity.
pub struct Session {
  ctx: Arc<SessionContext>,
  target: HostIdentity,
  state: State,
  directory: Option<Arc<Directory>>,
  replay_nonce: Option<String>,
  challenge: Option<SelectedChallenge>,
  proof: Option<ChallengeProof>,
  response_status: u16,
  retry_count: u32,
  primed: bool,
  priming: bool,
  fetching_cert: bool,
  cert_uri: Option<String>,
  csr: Option<CsrIssuer>,
  identity: Option<Box<dyn TemporaryIdentity>>,
  reader: Reader,
}

impl Session {
  /// A session for `target`. With a `directory` from an earlier run the
  /// discovery round trip is skipped.
  pub fn new(
    ctx: Arc<SessionContext>,
    target: HostIdentity,
    directory: Option<Arc<Directory>>,
  ) -> Self {
    let state = if directory.is_some() {
      State::NewReg
    } else {
      State::Directory
    };
    Session {
      ctx,
      target,
      state,
      directory,
      replay_nonce: None,
      challenge: None,
      proof: None,
      response_status: 0,
      retry_count: 0,
      primed: false,
      priming: false,
      fetching_cert: false,
      cert_uri: None,
      csr: None,
      identity: None,
      reader: Reader::None,
    }
  }

  pub fn state(&self) -> State {
    self.state
  }

  pub fn retry_count(&self) -> u32 {
    self.retry_count
  }

  pub fn response_status(&self) -> u16 {
    self.response_status
  }

  pub fn directory(&self) -> Option<&Arc<Directory>> {
    self.directory.as_ref()
  }

  pub fn challenge(&self) -> Option<&SelectedChallenge> {
    self.challenge.as_ref()
  }

  pub fn proof(&self) -> Option<&ChallengeProof> {
    self.proof.as_ref()
  }

  pub fn has_temporary_identity(&self) -> bool {
    self.identity.is_some()
  }

  /// The first exchange of the session.
  pub fn start(&mut self) -> Effect {
    let result = match self.state {
      State::Directory => Ok(Effect::Send(Exchange::get(
        self.ctx.config.directory_url.clone(),
      ))),
      State::NewReg => self.registration(),
      _ => Ok(Effect::Idle),
    };
    self.settle(result)
  }

  /// Advance on one transport callback.
  pub fn handle(&mut self, event: Event<'_>) -> Effect {
    if self.state.is_terminal() {
      return Effect::Idle;
    }
    let result = match event {
      Event::Headers(head) => self.on_headers(head).map(|_| Effect::Idle),
      Event::Body(chunk) => self.on_body(chunk).map(|_| Effect::Idle),
      Event::Complete => self.on_complete(),
      Event::TransportFailed(err) => Err(err),
    };
    self.settle(result)
  }

  fn settle(&mut self, result: Result<Effect, Error>) -> Effect {
    match result {
      Ok(effect) => effect,
      Err(err) => self.fail(err),
    }
  }

  fn enter(&mut self, next: State) {
    debug!(from = %self.state, to = %next, "ACME state transition");
    self.state = next;
  }

  fn fail(&mut self, err: Error) -> Effect {
    if err.is_operational() {
      error!(state = %self.state, identity = %self.target.name, %err, "ACME session failed on a local resource");
    } else {
      warn!(state = %self.state, identity = %self.target.name, %err, "ACME session failed");
    }
    self.release_identity();
    self.csr = None;
    self.reader = Reader::None;
    self.enter(State::Failed);
    Effect::Failed(err)
  }

  fn release_identity(&mut self) {
    if let Some(identity) = self.identity.take() {
      debug!(name = identity.name(), "Destroying temporary identity");
    }
  }

  fn directory_ref(&self) -> Result<&Directory, Error> {
    self
      .directory
      .as_deref()
      .ok_or(Error::Validation("directory not resolved"))
  }

  /// Sign `payload` for `url` with the nonce from the latest response.
  fn signed(
    &mut self,
    url: String,
    payload: serde_json::Value,
  ) -> Result<Effect, Error> {
    let nonce = self.replay_nonce.take().ok_or(Error::MissingNonce)?;
    let body = self
      .ctx
      .account_key
      .sign(&url, &nonce, &payload.to_string())?;
    Ok(Effect::Send(Exchange::post(url, body)))
  }

  fn registration(&mut self) -> Result<Effect, Error> {
    let url = self.directory_ref()?.new_reg_url.clone();
    if self.replay_nonce.is_none() && !self.primed {
      // nothing to sign with yet, any reply from new-reg carries a nonce
      self.primed = true;
      self.priming = true;
      return Ok(Effect::Send(Exchange::head(url)));
    }
    let mut payload = json!({
      "resource": "new-reg",
      "contact": [format!("mailto:{}", self.ctx.config.email)],
    });
    if let Some(tos) = &self.directory_ref()?.terms_of_service_url {
      payload["agreement"] = json!(tos);
    }
    self.signed(url, payload)
  }

  fn on_headers(&mut self, head: ResponseHead) -> Result<(), Error> {
    self.response_status = head.status;
    if let Some(nonce) = &head.replay_nonce {
      self.replay_nonce = Some(bounded("replay nonce", nonce, MAX_NONCE_LEN)?);
    }

    let ok = is_success(head.status);
    self.reader = match self.state {
      State::Directory if ok => Reader::Directory(DirectoryResolver::new()),
      State::NewAuth if ok => {
        Reader::Authorization(AuthorizationNegotiator::new())
      }
      State::PollingCsr => {
        if head.status == 201 && !self.fetching_cert {
          let location = head
            .location
            .as_deref()
            .ok_or(Error::Validation("new-cert reply lacks a location"))?;
          self.cert_uri =
            Some(bounded("certificate location", location, MAX_URL_LEN)?);
        }
        match (&mut self.csr, head.status) {
          (Some(csr), 200) => {
            csr.reset_certificate();
            Reader::Certificate
          }
          _ => Reader::body(),
        }
      }
      _ => Reader::body(),
    };
    Ok(())
  }

  fn on_body(&mut self, chunk: &[u8]) -> Result<(), Error> {
    match &mut self.reader {
      Reader::None => Ok(()),
      Reader::Directory(resolver) => resolver.feed(chunk),
      Reader::Authorization(negotiator) => negotiator.feed(chunk),
      Reader::Certificate => match &mut self.csr {
        Some(csr) => csr.push_certificate(chunk),
        None => Err(Error::Validation("certificate body without a request")),
      },
      Reader::Body(buf) => buf.push(chunk),
    }
  }

  fn on_complete(&mut self) -> Result<Effect, Error> {
    let status = self.response_status;
    let reader = std::mem::replace(&mut self.reader, Reader::None);
    match self.state {
      State::Directory => self.directory_complete(status, reader),
      State::NewReg => self.new_reg_complete(status, reader),
      State::NewAuth => self.new_auth_complete(status, reader),
      State::AcceptChallenge => self.accept_complete(status, reader),
      State::Polling => self.polling_complete(status, reader),
      State::PollingCsr => self.polling_csr_complete(status, reader),
      State::Finished | State::Failed => Ok(Effect::Idle),
    }
  }

  fn directory_complete(
    &mut self,
    status: u16,
    reader: Reader,
  ) -> Result<Effect, Error> {
    let resolver = match reader {
      Reader::Directory(resolver) => resolver,
      reader => return Err(unexpected("directory", status, &reader)),
    };
    let directory = resolver.finish()?;
    info!(new_reg = %directory.new_reg_url, "Resolved ACME directory");
    self.directory = Some(Arc::new(directory));
    self.enter(State::NewReg);
    self.registration()
  }

  fn new_reg_complete(
    &mut self,
    status: u16,
    reader: Reader,
  ) -> Result<Effect, Error> {
    if self.priming {
      // reply to the HEAD, only its nonce matters
      self.priming = false;
      return self.registration();
    }
    match status {
      s if is_success(s) => info!("Registered account key"),
      409 => info!("Account key already registered"),
      _ => return Err(unexpected("new-reg", status, &reader)),
    }

    self.enter(State::NewAuth);
    let url = self.directory_ref()?.new_authz_url.clone();
    let payload = json!({
      "resource": "new-authz",
      "identifier": Identifier::dns(&self.target.name),
    });
    self.signed(url, payload)
  }

  fn new_auth_complete(
    &mut self,
    status: u16,
    reader: Reader,
  ) -> Result<Effect, Error> {
    let negotiator = match reader {
      Reader::Authorization(negotiator) => negotiator,
      reader => return Err(unexpected("new-authz", status, &reader)),
    };
    let challenge = negotiator.finish()?;
    if challenge.is_authorized() {
      info!(uri = %challenge.uri, "Authorization already valid, skipping challenge");
      self.challenge = Some(challenge);
      return self.request_certificate();
    }
    info!(kind = challenge.kind.as_str(), uri = %challenge.uri, "Selected challenge");

    let proof = ChallengeProof::new(
      challenge.kind,
      &challenge.token,
      self.ctx.account_key.thumbprint(),
    )?;
    debug!(san_a = %proof.san_a, san_b = ?proof.san_b, "Computed challenge names");

    let request = identity_request(&self.target, &proof)?;
    self.identity = Some(self.ctx.host.create_temporary_identity(request)?);

    self.enter(State::AcceptChallenge);
    self.retry_count = 0;
    let payload = json!({
      "resource": "challenge",
      "type": challenge.kind.as_str(),
      "keyAuthorization": proof.key_authorization,
    });
    let uri = challenge.uri.clone();
    self.challenge = Some(challenge);
    self.proof = Some(proof);
    self.signed(uri, payload)
  }

  fn challenge_uri(&self) -> Result<String, Error> {
    self
      .challenge
      .as_ref()
      .map(|c| c.uri.clone())
      .ok_or(Error::Validation("no challenge selected"))
  }

  fn accept_complete(
    &mut self,
    status: u16,
    reader: Reader,
  ) -> Result<Effect, Error> {
    if !is_success(status) {
      warn!(status, problem = ?reader.problem(), "Challenge acceptance not acknowledged");
    } else if let Reader::Body(body) = &reader {
      if let Ok(resource) = ChallengeResource::from_json(body.as_slice()) {
        debug!(status = ?resource.status, "Challenge accepted");
      }
    }

    self.enter(State::Polling);
    self.retry_count = 0;
    Ok(Effect::Send(Exchange::poll(self.challenge_uri()?)))
  }

  fn polling_complete(
    &mut self,
    status: u16,
    reader: Reader,
  ) -> Result<Effect, Error> {
    let body = match reader {
      Reader::Body(body) if is_success(status) => body,
      reader => return Err(unexpected("challenge poll", status, &reader)),
    };
    let resource = ChallengeResource::from_json(body.as_slice())?;

    match resource.status {
      ChallengeStatus::Valid => {
        info!(polls = self.retry_count, "Authorization accepted");
        self.release_identity();
        self.request_certificate()
      }
      ChallengeStatus::Invalid => {
        if let Some(err) = &resource.error {
          warn!(%err, "CA rejected the challenge");
        }
        Err(Error::ChallengeInvalid)
      }
      other => {
        self.retry_count += 1;
        if self.retry_count > MAX_POLL_ATTEMPTS {
          return Err(Error::MaxAttemptsExceeded);
        }
        debug!(status = ?other, attempt = self.retry_count, "Challenge not done, polling again");
        Ok(Effect::Send(Exchange::poll(self.challenge_uri()?)))
      }
    }
  }

  /// Enter `PollingCsr` with a fresh key and request, and post it.
  fn request_certificate(&mut self) -> Result<Effect, Error> {
    self.enter(State::PollingCsr);
    self.fetching_cert = false;

    let csr = CsrIssuer::new(&self.ctx.config, &self.target.name)?;
    let payload = json!({
      "resource": "new-cert",
      "csr": csr.encoded(),
    });
    self.csr = Some(csr);
    let url = self.directory_ref()?.new_cert_url.clone();
    self.signed(url, payload)
  }

  fn polling_csr_complete(
    &mut self,
    status: u16,
    reader: Reader,
  ) -> Result<Effect, Error> {
    if !self.fetching_cert {
      return match status {
        200 => self.finish_issuance(),
        201 => {
          self.fetching_cert = true;
          self.retry_count = 0;
          let uri = self
            .cert_uri
            .clone()
            .ok_or(Error::Validation("no certificate location"))?;
          info!(%uri, "Certificate resource created");
          Ok(Effect::Send(Exchange::get(uri)))
        }
        _ => Err(unexpected("new-cert", status, &reader)),
      };
    }

    match status {
      200 => self.finish_issuance(),
      201 | 202 => {
        self.retry_count += 1;
        if self.retry_count > MAX_POLL_ATTEMPTS {
          return Err(Error::MaxAttemptsExceeded);
        }
        debug!(attempt = self.retry_count, "Certificate still being issued");
        let uri = self
          .cert_uri
          .clone()
          .ok_or(Error::Validation("no certificate location"))?;
        Ok(Effect::Send(Exchange::poll(uri)))
      }
      _ => Err(unexpected("certificate fetch", status, &reader)),
    }
  }

  fn finish_issuance(&mut self) -> Result<Effect, Error> {
    let csr = self
      .csr
      .take()
      .ok_or(Error::Validation("no certificate request pending"))?;
    let issued = csr.into_issued()?;
    info!(identity = %self.target.name, cert_len = issued.certificate.len(), "Certificate issued");
    self.enter(State::Finished);
    Ok(Effect::Install(issued))
  }
}
