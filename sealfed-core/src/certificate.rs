//! X.509 certificates: parsing, issuer checks and signature verification.

use base64::{Engine, engine::general_purpose::STANDARD};
use ring::signature::{self, UnparsedPublicKey};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use ::time::OffsetDateTime;
use x509_parser::prelude::*;

use crate::errors::{Error, Result};

const OID_RSA_ENCRYPTION: &str = "1.2.840.113549.1.1.1";
const OID_EC_PUBLIC_KEY: &str = "1.2.840.10045.2.1";
const OID_CURVE_P256: &str = "1.2.840.10045.3.1.7";

/// Public key algorithms the client signs and verifies with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyAlgorithm {
    /// RSA PKCS#1 v1.5 with SHA-256.
    Rsa,
    /// ECDSA over P-256 with SHA-256.
    EcdsaP256,
}

impl KeyAlgorithm {
    /// XML-DSig `SignatureMethod` algorithm identifier.
    pub fn signature_uri(self) -> &'static str {
        match self {
            KeyAlgorithm::Rsa => "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256",
            KeyAlgorithm::EcdsaP256 => "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha256",
        }
    }

    pub fn from_signature_uri(uri: &str) -> Option<Self> {
        [KeyAlgorithm::Rsa, KeyAlgorithm::EcdsaP256]
            .into_iter()
            .find(|alg| alg.signature_uri() == uri)
    }

    fn verification(self) -> &'static dyn signature::VerificationAlgorithm {
        match self {
            KeyAlgorithm::Rsa => &signature::RSA_PKCS1_2048_8192_SHA256,
            KeyAlgorithm::EcdsaP256 => &signature::ECDSA_P256_SHA256_ASN1,
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Certificate {
    der: Vec<u8>,
    subject: String,
    subject_cn: Option<String>,
    issuer: String,
    serial: String,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
    algorithm: KeyAlgorithm,
    public_key: Vec<u8>,
}

impl Certificate {
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, parsed) = X509Certificate::from_der(der)
            .map_err(|err| Error::Crypto(format!("invalid certificate: {err}")))?;

        let spki = parsed.public_key();
        let algorithm = match spki.algorithm.algorithm.to_id_string().as_str() {
            OID_RSA_ENCRYPTION => KeyAlgorithm::Rsa,
            OID_EC_PUBLIC_KEY => {
                let curve = spki
                    .algorithm
                    .parameters
                    .as_ref()
                    .and_then(|params| params.as_oid().ok())
                    .map(|oid| oid.to_id_string());
                match curve.as_deref() {
                    Some(OID_CURVE_P256) => KeyAlgorithm::EcdsaP256,
                    Some(other) => {
                        return Err(Error::Crypto(format!(
                            "unsupported curve {other} (only P-256 is supported)"
                        )));
                    }
                    None => {
                        return Err(Error::Crypto(
                            "unsupported curve: EC key without a named curve".into(),
                        ));
                    }
                }
            }
            other => {
                return Err(Error::Crypto(format!(
                    "unsupported certificate key algorithm {other}"
                )));
            }
        };

        let subject_cn = parsed
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string);

        Ok(Self {
            der: der.to_vec(),
            subject: parsed.subject().to_string(),
            subject_cn,
            issuer: parsed.issuer().to_string(),
            serial: parsed.raw_serial_as_string(),
            not_before: asn1_to_datetime(parsed.validity().not_before)?,
            not_after: asn1_to_datetime(parsed.validity().not_after)?,
            algorithm,
            public_key: spki.subject_public_key.data.to_vec(),
        })
    }

    /// Parses the first `CERTIFICATE` block of a PEM document.
    pub fn from_pem(text: &str) -> Result<Self> {
        let blocks = ::pem::parse_many(text)
            .map_err(|err| Error::Crypto(format!("invalid PEM: {err}")))?;
        let block = blocks
            .iter()
            .find(|block| block.tag() == "CERTIFICATE")
            .ok_or_else(|| Error::Crypto("PEM contains no CERTIFICATE block".into()))?;
        Self::from_der(block.contents())
    }

    /// Every `CERTIFICATE` block in the PEM files at `paths`.
    pub fn load_pem_files<P: AsRef<Path>>(paths: &[P]) -> Result<Vec<Self>> {
        let mut out = Vec::new();
        for path in paths {
            let path = path.as_ref();
            let text = std::fs::read_to_string(path).map_err(|err| {
                Error::Crypto(format!("failed to read {}: {err}", path.display()))
            })?;
            let blocks = ::pem::parse_many(&text)
                .map_err(|err| Error::Crypto(format!("invalid PEM in {}: {err}", path.display())))?;
            for block in blocks.iter().filter(|block| block.tag() == "CERTIFICATE") {
                out.push(Self::from_der(block.contents())?);
            }
        }
        Ok(out)
    }

    pub fn der(&self) -> &[u8] {
        &self.der
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.der)
    }

    pub fn from_base64(value: &str) -> Result<Self> {
        let compact: String = value.split_whitespace().collect();
        let der = STANDARD
            .decode(compact)
            .map_err(|err| Error::Crypto(format!("invalid certificate encoding: {err}")))?;
        Self::from_der(&der)
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn common_name(&self) -> Option<&str> {
        self.subject_cn.as_deref()
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn not_before(&self) -> OffsetDateTime {
        self.not_before
    }

    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    pub fn is_valid_at(&self, now: OffsetDateTime) -> bool {
        self.not_before <= now && now <= self.not_after
    }

    /// Base64 SHA-256 of the DER encoding.
    pub fn fingerprint(&self) -> String {
        STANDARD.encode(Sha256::digest(&self.der))
    }

    /// Verifies `signature` over `message` with this certificate's public key.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        UnparsedPublicKey::new(self.algorithm.verification(), &self.public_key)
            .verify(message, signature)
            .map_err(|_| Error::Untrusted(format!("signature does not match {}", self.subject)))
    }

    /// Checks that `issuer` issued and signed this certificate.
    pub fn verify_issued_by(&self, issuer: &Certificate) -> Result<()> {
        if self.issuer != issuer.subject {
            return Err(Error::Untrusted(format!(
                "{} was not issued by {}",
                self.subject, issuer.subject
            )));
        }
        let (_, child) = X509Certificate::from_der(&self.der)
            .map_err(|err| Error::Crypto(format!("invalid certificate: {err}")))?;
        let (_, parent) = X509Certificate::from_der(&issuer.der)
            .map_err(|err| Error::Crypto(format!("invalid certificate: {err}")))?;
        child
            .verify_signature(Some(parent.public_key()))
            .map_err(|err| {
                Error::Untrusted(format!(
                    "certificate signature of {} rejected: {err}",
                    self.subject
                ))
            })
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("subject", &self.subject)
            .field("issuer", &self.issuer)
            .field("serial", &self.serial)
            .field("not_after", &self.not_after)
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

fn asn1_to_datetime(value: ASN1Time) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(value.timestamp())
        .map_err(|err| Error::Crypto(format!("certificate time out of range: {err}")))
}
