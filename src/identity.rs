use crate::error::*;
use crate::helpers::*;
use crate::proof::ChallengeProof;
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::bn::MsbOption;
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::pkey::Private;
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::X509Name;
use openssl::x509::X509;
use std::path::Path;

/// A live TLS identity (virtual host) served by the host process.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct HostIdentity {
  /// The hostname the identity serves, and the name certificates are
  /// issued for.
  pub name: String,
  /// Interface the identity listens on, if bound to one.
  pub iface: Option<String>,
  pub port: u16,
}

/// The host's "certificate is aging" signal.
#[derive(Debug, Clone)]
pub struct CertAging {
  pub identity: HostIdentity,
  pub days_left: i64,
}

/// Everything the host needs to stand up the temporary identity that
/// answers the CA's verification handshake.
///
/// The identity shares `iface`/`port` with the real one and is selected
/// by SNI `name`.
#[derive(Debug)]
pub struct IdentityRequest {
  pub name: String,
  pub iface: Option<String>,
  pub port: u16,
  pub sans: Vec<String>,
  pub certificate: X509,
  pub private_key: PKey<Private>,
}

/// Handle to a temporary identity. Dropping it must tear the identity
/// down.
pub trait TemporaryIdentity: Send {
  fn name(&self) -> &str;
}

/// A freshly issued certificate and key, handed to the host for adoption.
#[derive(Debug)]
pub struct CertificateUpdate<'a> {
  pub cert_path: &'a Path,
  pub key_path: &'a Path,
  /// DER encoded certificate.
  pub certificate: &'a [u8],
  /// PEM encoded private key.
  pub private_key: &'a [u8],
}

/// Capabilities the hosting server provides.
pub trait Host: Send + Sync {
  fn create_temporary_identity(
    &self,
    request: IdentityRequest,
  ) -> Result<Box<dyn TemporaryIdentity>, Error>;

  /// Called once the update files are complete, so the new pair can be
  /// swapped into the live identity.
  fn certificate_updated(
    &self,
    update: CertificateUpdate<'_>,
  ) -> Result<(), Error>;
}

/// Build the request for the temporary identity answering `proof`, with a
/// throwaway self-signed certificate covering its SANs.
pub(crate) fn identity_request(
  real: &HostIdentity,
  proof: &ChallengeProof,
) -> Result<IdentityRequest, Error> {
  let private_key = gen_rsa_private_key(2048)?;
  let certificate = sni_certificate(&private_key, &proof.sans())?;
  Ok(IdentityRequest {
    name: proof.san_a.clone(),
    iface: real.iface.clone(),
    port: real.port,
    sans: proof.sans().iter().map(|s| s.to_string()).collect(),
    certificate,
    private_key,
  })
}

/// Self-signed certificate for the given SNI names, valid for a day.
pub fn sni_certificate(
  pkey: &PKey<Private>,
  sans: &[&str],
) -> Result<X509, Error> {
  if sans.is_empty() {
    return Err(Error::Validation("challenge certificate needs a name"));
  }

  let mut builder = X509::builder()?;
  builder.set_version(2)?;
  let serial = {
    let mut serial = BigNum::new()?;
    serial.rand(127, MsbOption::MAYBE_ZERO, false)?;
    serial.to_asn1_integer()?
  };
  builder.set_serial_number(&serial)?;

  let name = {
    let mut name = X509Name::builder()?;
    // SNI names run past the 64 byte CN limit, they only go in the SAN.
    name.append_entry_by_text("CN", "acme.invalid")?;
    name.build()
  };
  builder.set_subject_name(&name)?;
  builder.set_issuer_name(&name)?;
  let not_before = Asn1Time::days_from_now(0)?;
  let not_after = Asn1Time::days_from_now(1)?;
  builder.set_not_before(&not_before)?;
  builder.set_not_after(&not_after)?;
  builder.set_pubkey(pkey)?;

  let san_extension = {
    let mut san = SubjectAlternativeName::new();
    for name in sans {
      san.dns(name);
    }
    san.build(&builder.x509v3_context(None, None))?
  };
  builder.append_extension(san_extension)?;

  builder.sign(pkey, MessageDigest::sha256())?;
  Ok(builder.build())
}
