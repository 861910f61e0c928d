use crate::config::AcmeConfig;
use crate::error::*;
use crate::helpers::*;
use data_encoding::BASE64URL_NOPAD;
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::pkey::Private;
use openssl::stack::Stack;
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::X509Name;
use openssl::x509::X509Req;

/// The certificate and key produced by a successful issuance.
pub struct IssuedCertificate {
  /// DER encoded certificate as delivered by the CA.
  pub certificate: Vec<u8>,
  /// PEM encoded (PKCS#8) private key matching the certificate.
  pub private_key_pem: Vec<u8>,
}

impl std::fmt::Debug for IssuedCertificate {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("IssuedCertificate")
      .field("certificate_len", &self.certificate.len())
      .finish()
  }
}

fn gen_csr(
  pkey: &PKey<Private>,
  config: &AcmeConfig,
  domains: &[&str],
) -> Result<X509Req, Error> {
  if domains.is_empty() {
    return Err(Error::Validation(
      "You need to supply at least one domain name",
    ));
  }

  let mut builder = X509Req::builder()?;
  let name = {
    let mut name = X509Name::builder()?;
    let fields = [
      ("C", &config.country),
      ("ST", &config.state),
      ("L", &config.locality),
      ("O", &config.organization),
    ];
    for (key, value) in fields.iter() {
      if let Some(value) = value {
        name.append_entry_by_text(key, value)?;
      }
    }
    name.append_entry_by_text("CN", &config.common_name)?;
    name.build()
  };
  builder.set_subject_name(&name)?;

  let san_extension = {
    let mut san = SubjectAlternativeName::new();
    for domain in domains.iter() {
      san.dns(domain);
    }
    san.build(&builder.x509v3_context(None))?
  };
  let mut stack = Stack::new()?;
  stack.push(san_extension)?;
  builder.add_extensions(&stack)?;

  builder.set_pubkey(pkey)?;
  builder.sign(pkey, MessageDigest::sha256())?;

  Ok(builder.build())
}

/// Holds the key pair and signing request for the certificate being
/// issued, and collects the DER certificate as it streams back.
pub struct CsrIssuer {
  request_der: Vec<u8>,
  encoded: String,
  private_key_pem: Vec<u8>,
  certificate: BoundedBuf,
}

impl CsrIssuer {
  /// Generate a fresh key pair and a request for `hostname` carrying the
  /// configured subject.
  pub fn new(config: &AcmeConfig, hostname: &str) -> Result<Self, Error> {
    let pkey = gen_rsa_private_key(config.cert_key_bits)?;

    let mut domains = vec![hostname];
    if config.common_name != hostname {
      domains.push(&config.common_name);
    }
    let request_der = gen_csr(&pkey, config, &domains)?.to_der()?;

    Ok(CsrIssuer {
      encoded: b64(&request_der),
      request_der,
      private_key_pem: pkey.private_key_to_pem_pkcs8()?,
      certificate: BoundedBuf::new("certificate", MAX_CERTIFICATE_LEN),
    })
  }

  /// The base64url DER request, as carried in the new-cert payload.
  pub fn encoded(&self) -> &str {
    &self.encoded
  }

  pub fn request_der(&self) -> &[u8] {
    &self.request_der
  }

  pub(crate) fn push_certificate(&mut self, chunk: &[u8]) -> Result<(), Error> {
    self.certificate.push(chunk)
  }

  pub(crate) fn reset_certificate(&mut self) {
    self.certificate.clear();
  }

  /// Certificate bytes received so far.
  pub fn certificate(&self) -> &[u8] {
    self.certificate.as_slice()
  }

  pub(crate) fn into_issued(mut self) -> Result<IssuedCertificate, Error> {
    if self.certificate.is_empty() {
      return Err(Error::Validation("the CA returned an empty certificate"));
    }
    Ok(IssuedCertificate {
      certificate: self.certificate.take(),
      private_key_pem: std::mem::take(&mut self.private_key_pem),
    })
  }
}

/// Decode a base64url request back into its PKCS#10 form.
pub fn decode_csr(encoded: &str) -> Result<X509Req, Error> {
  let der = BASE64URL_NOPAD
    .decode(encoded.as_bytes())
    .map_err(|_| Error::Validation("csr is not valid base64url"))?;
  Ok(X509Req::from_der(&der)?)
}
