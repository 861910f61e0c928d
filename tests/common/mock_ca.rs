use acme_sni_client::decode_csr;
use acme_sni_client::gen_rsa_private_key;
use anyhow::anyhow;
use anyhow::Result;
use data_encoding::BASE64URL_NOPAD;
use http_body_util::BodyExt;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper::Response;
use hyper_util::rt::TokioIo;
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::pkey::Private;
use openssl::x509::X509NameBuilder;
use openssl::x509::X509;
use serde_json::json;
use serde_json::Value;
use std::sync::Arc;
use std::sync::Mutex;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub const TOKEN: &str = "j2Vs-vLI_dsza4A35SFHIU03aIe2PzFRijbqCYdIVeE";

/// What the mock CA has seen and how it should behave.
pub struct CaState {
  pub pending_polls: usize,
  pub final_status: &'static str,
  /// The last certificate issued, DER.
  pub certificate: Vec<u8>,
  pub requests: Vec<(String, String)>,
  pub payloads: Vec<Value>,
  ca_key: PKey<Private>,
  serial: u32,
  registered: bool,
  authorized: bool,
  challenge_polls: usize,
  nonces: usize,
  last_nonce: Option<String>,
}

struct Reply {
  status: u16,
  headers: Vec<(&'static str, String)>,
  body: Vec<u8>,
}

impl Reply {
  fn new(status: u16) -> Self {
    Reply {
      status,
      headers: Vec::new(),
      body: Vec::new(),
    }
  }

  fn json(status: u16, value: Value) -> Self {
    let mut reply = Reply::new(status);
    reply
      .headers
      .push(("Content-Type", "application/json".to_string()));
    reply.body = value.to_string().into_bytes();
    reply
  }

  fn problem(status: u16, kind: &str, detail: &str) -> Self {
    Reply::json(
      status,
      json!({
        "type": format!("urn:acme:error:{}", kind),
        "detail": detail,
        "status": status
      }),
    )
  }
}

/// A scripted pre-RFC (v1) ACME CA served by hyper on localhost. It checks
/// every nonce it hands out and signs real certificates for the CSRs it
/// receives.
pub struct MockCa {
  pub base_url: String,
  pub state: Arc<Mutex<CaState>>,
  task: JoinHandle<()>,
}

impl MockCa {
  pub async fn start(pending_polls: usize) -> Result<Self> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let base_url = format!("http://{}", listener.local_addr()?);

    let state = Arc::new(Mutex::new(CaState {
      pending_polls,
      final_status: "valid",
      certificate: Vec::new(),
      requests: Vec::new(),
      payloads: Vec::new(),
      ca_key: gen_rsa_private_key(2048)?,
      serial: 0,
      registered: false,
      authorized: false,
      challenge_polls: 0,
      nonces: 0,
      last_nonce: None,
    }));

    let task = {
      let state = state.clone();
      let base_url = base_url.clone();
      tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
          let state = state.clone();
          let base_url = base_url.clone();
          tokio::spawn(async move {
            let service = service_fn(move |req| {
              handle(req, state.clone(), base_url.clone())
            });
            if let Err(err) = http1::Builder::new()
              .serve_connection(TokioIo::new(stream), service)
              .await
            {
              println!("mock CA connection failed: {:?}", err);
            }
          });
        }
      })
    };

    Ok(MockCa {
      base_url,
      state,
      task,
    })
  }

  pub fn url(&self, path: &str) -> String {
    format!("{}{}", self.base_url, path)
  }

  pub fn requests(&self) -> Vec<String> {
    let state = self.state.lock().unwrap();
    state
      .requests
      .iter()
      .map(|(method, path)| format!("{} {}", method, path))
      .collect()
  }

  pub fn certificate(&self) -> Vec<u8> {
    self.state.lock().unwrap().certificate.clone()
  }

  pub fn payloads(&self) -> Vec<Value> {
    self.state.lock().unwrap().payloads.clone()
  }
}

impl Drop for MockCa {
  fn drop(&mut self) {
    self.task.abort();
  }
}

async fn handle(
  req: Request<Incoming>,
  state: Arc<Mutex<CaState>>,
  base_url: String,
) -> Result<Response<Full<Bytes>>> {
  let method = req.method().as_str().to_string();
  let path = req.uri().path().to_string();
  let body = req.into_body().collect().await?.to_bytes();

  let (reply, nonce) = {
    let mut state = state.lock().unwrap();
    let reply = route(&mut state, &method, &path, &body, &base_url)?;
    state.nonces += 1;
    let nonce = format!("mock-nonce-{}", state.nonces);
    state.last_nonce = Some(nonce.clone());
    (reply, nonce)
  };

  let mut response = Response::builder()
    .status(reply.status)
    .header("Replay-Nonce", nonce);
  for (name, value) in reply.headers {
    response = response.header(name, value);
  }
  Ok(response.body(Full::new(Bytes::from(reply.body)))?)
}

fn decode_segment(envelope: &Value, field: &str) -> Result<Value> {
  let segment = envelope[field]
    .as_str()
    .ok_or_else(|| anyhow!("JWS lacks {}", field))?;
  let raw = BASE64URL_NOPAD.decode(segment.as_bytes())?;
  Ok(serde_json::from_slice(&raw)?)
}

fn challenge(base_url: &str, typ: &str, n: u32, status: &str) -> Value {
  json!({
    "type": typ,
    "status": status,
    "uri": format!("{}/acme/challenge/{}", base_url, n),
    "token": TOKEN,
  })
}

/// Sign a 90 day certificate for the subject and key of `csr`.
fn issue(state: &mut CaState, csr: &str) -> Result<Vec<u8>> {
  let req = decode_csr(csr)?;
  state.serial += 1;

  let mut issuer = X509NameBuilder::new()?;
  issuer.append_entry_by_text("CN", "mock CA")?;
  let issuer = issuer.build();

  let mut builder = X509::builder()?;
  builder.set_version(2)?;
  let serial = BigNum::from_u32(state.serial)?.to_asn1_integer()?;
  builder.set_serial_number(&serial)?;
  builder.set_subject_name(req.subject_name())?;
  builder.set_issuer_name(&issuer)?;
  let pubkey = req.public_key()?;
  builder.set_pubkey(&pubkey)?;
  let not_before = Asn1Time::days_from_now(0)?;
  builder.set_not_before(&not_before)?;
  let not_after = Asn1Time::days_from_now(90)?;
  builder.set_not_after(&not_after)?;
  builder.sign(&state.ca_key, MessageDigest::sha256())?;
  Ok(builder.build().to_der()?)
}

fn route(
  state: &mut CaState,
  method: &str,
  path: &str,
  body: &[u8],
  base_url: &str,
) -> Result<Reply> {
  state.requests.push((method.to_string(), path.to_string()));

  if method == "POST" {
    let envelope: Value = serde_json::from_slice(body)?;
    let protected = decode_segment(&envelope, "protected")?;
    if protected["nonce"].as_str() != state.last_nonce.as_deref() {
      return Ok(Reply::problem(
        400,
        "badNonce",
        "JWS has an invalid anti-replay nonce",
      ));
    }
    state.payloads.push(decode_segment(&envelope, "payload")?);
  }

  let reply = match (method, path) {
    ("GET", "/directory") => Reply::json(
      200,
      json!({
        "new-reg": format!("{}/acme/new-reg", base_url),
        "new-authz": format!("{}/acme/new-authz", base_url),
        "new-cert": format!("{}/acme/new-cert", base_url),
        "revoke-cert": format!("{}/acme/revoke-cert", base_url),
        "meta": { "terms-of-service": format!("{}/terms", base_url) }
      }),
    ),
    ("HEAD", "/acme/new-reg") => Reply::new(405),
    ("POST", "/acme/new-reg") if state.registered => {
      Reply::problem(409, "malformed", "Registration key is already in use")
    }
    ("POST", "/acme/new-reg") => {
      state.registered = true;
      let mut reply = Reply::json(201, json!({}));
      reply
        .headers
        .push(("Location", format!("{}/acme/reg/1", base_url)));
      reply
    }
    ("POST", "/acme/new-authz") => {
      state.challenge_polls = 0;
      // a validated identifier stays authorized for later requests
      let status = if state.authorized { "valid" } else { "pending" };
      Reply::json(
        201,
        json!({
          "identifier": { "type": "dns", "value": "example.com" },
          "status": status,
          "challenges": [
            challenge(base_url, "http-01", 1, status),
            challenge(base_url, "tls-sni-01", 2, status),
            challenge(base_url, "tls-sni-02", 3, status),
          ]
        }),
      )
    }
    ("POST", "/acme/challenge/3") => {
      Reply::json(202, challenge(base_url, "tls-sni-02", 3, "pending"))
    }
    ("GET", "/acme/challenge/3") => {
      state.challenge_polls += 1;
      let status = if state.challenge_polls <= state.pending_polls {
        "pending"
      } else {
        state.final_status
      };
      if status == "valid" {
        state.authorized = true;
      }
      Reply::json(202, challenge(base_url, "tls-sni-02", 3, status))
    }
    ("POST", "/acme/new-cert") => {
      let csr = state
        .payloads
        .last()
        .and_then(|payload| payload["csr"].as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("new-cert without a csr"))?;
      match issue(state, &csr) {
        Ok(certificate) => {
          state.certificate = certificate;
          let mut reply = Reply::new(201);
          reply
            .headers
            .push(("Location", format!("{}/acme/cert/1", base_url)));
          reply
        }
        Err(err) => Reply::problem(400, "malformed", &err.to_string()),
      }
    }
    ("GET", "/acme/cert/1") => {
      let mut reply = Reply::new(200);
      reply
        .headers
        .push(("Content-Type", "application/pkix-cert".to_string()));
      reply.body = state.certificate.clone();
      reply
    }
    _ => Reply::new(404),
  };
  Ok(reply)
}
