//! Federation context: trust roots for the selected federation, document signing
//! and signature verification.

use std::fmt;
use std::sync::{Arc, Once};
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::certificate::Certificate;
use crate::dsig;
use crate::errors::{Error, Result};
use crate::keystore::CredentialPair;
use crate::xml::Element;

const MAX_CHAIN_DEPTH: usize = 8;

static CRYPTO_PROVIDER: Once = Once::new();

/// Registers the process-wide rustls crypto provider. Safe to call repeatedly.
pub fn install_crypto_provider() {
    CRYPTO_PROVIDER.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            debug!("rustls crypto provider was already installed");
        }
    });
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FederationMode {
    Production,
    Test,
}

impl FederationMode {
    pub fn from_production_flag(production: bool) -> Self {
        if production {
            FederationMode::Production
        } else {
            FederationMode::Test
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FederationMode::Production => "production",
            FederationMode::Test => "test",
        }
    }
}

impl fmt::Display for FederationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Root certificates per federation.
#[derive(Clone, Debug, Default)]
pub struct TrustRoots {
    pub production: Vec<Certificate>,
    pub test: Vec<Certificate>,
}

impl TrustRoots {
    pub fn for_mode(&self, mode: FederationMode) -> &[Certificate] {
        match mode {
            FederationMode::Production => &self.production,
            FederationMode::Test => &self.test,
        }
    }
}

/// Signer of a verified document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifiedSigner {
    pub certificate: Certificate,
    pub chain: Vec<Certificate>,
}

impl VerifiedSigner {
    pub fn subject(&self) -> &str {
        self.certificate.subject()
    }
}

#[derive(Clone)]
pub struct FederationContext {
    inner: Arc<Inner>,
}

struct Inner {
    mode: FederationMode,
    roots: Vec<Certificate>,
    sts_subject: Option<String>,
}

impl FederationContext {
    /// Builds a context trusting the roots of `mode`. Fails when that set is empty.
    pub fn initialize(mode: FederationMode, roots: &TrustRoots) -> Result<Self> {
        install_crypto_provider();
        let selected = roots.for_mode(mode);
        if selected.is_empty() {
            return Err(Error::CredentialLoad(format!(
                "no trust roots configured for the {mode} federation"
            )));
        }
        debug!(%mode, roots = selected.len(), "federation context initialized");
        Ok(Self {
            inner: Arc::new(Inner {
                mode,
                roots: selected.to_vec(),
                sts_subject: None,
            }),
        })
    }

    /// Additionally requires the signer common name to equal `subject`.
    pub fn with_sts_subject(self, subject: impl Into<String>) -> Self {
        let inner = Inner {
            mode: self.inner.mode,
            roots: self.inner.roots.clone(),
            sts_subject: Some(subject.into()),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn mode(&self) -> FederationMode {
        self.inner.mode
    }

    pub fn roots(&self) -> &[Certificate] {
        &self.inner.roots
    }

    /// Signs every identified element of `document` with `credentials`.
    ///
    /// The signature goes into `Header/Security` when the document has one and is
    /// otherwise appended as the last child of the root.
    pub fn sign(&self, mut document: Element, credentials: &CredentialPair) -> Result<Element> {
        let in_header = document.path(&["Header", "Security"]).is_some();
        let signature_id = if in_header { None } else { Some("OCESSignature") };
        let signature = dsig::create_signature(&document, credentials, signature_id)?;

        let security = document
            .child_mut("Header")
            .and_then(|header| header.child_mut("Security"));
        match security {
            Some(security) => security.push(signature),
            None => document.push(signature),
        }
        Ok(document)
    }

    /// True when `document` carries a valid signature chaining to this context's roots.
    pub fn verify(&self, document: &Element) -> bool {
        match self.verify_signature(document) {
            Ok(_) => true,
            Err(err) => {
                warn!(error = %err, "signature verification failed");
                false
            }
        }
    }

    /// Verifies and returns the signer, or the reason the document is not trusted.
    pub fn verify_signature(&self, document: &Element) -> Result<VerifiedSigner> {
        let signature = locate_signature(document)
            .ok_or_else(|| Error::Untrusted("document is not signed".into()))?;
        let parts = dsig::parse_signature(signature)?;

        let required = document
            .id()
            .or_else(|| document.child("Body").and_then(Element::id))
            .ok_or_else(|| Error::Untrusted("document has no identified root or body".into()))?;
        if !parts.references.iter().any(|(id, _)| id == required) {
            return Err(Error::Untrusted(format!(
                "signature does not cover #{required}"
            )));
        }

        dsig::check_references(document, &parts)?;
        let signer = dsig::check_signature_value(&parts)?.clone();
        let chain = self.check_chain(&parts.chain, OffsetDateTime::now_utc())?;

        if let Some(expected) = &self.inner.sts_subject {
            if signer.common_name() != Some(expected.as_str()) {
                return Err(Error::Untrusted(format!(
                    "signer {} is not the expected {expected}",
                    signer.subject()
                )));
            }
        }

        Ok(VerifiedSigner {
            certificate: signer,
            chain,
        })
    }

    /// Walks from the leaf through the supplied intermediates to a trusted root.
    fn check_chain(&self, supplied: &[Certificate], now: OffsetDateTime) -> Result<Vec<Certificate>> {
        let mut current = supplied
            .first()
            .ok_or_else(|| Error::Untrusted("empty certificate chain".into()))?;
        let mut path = vec![current.clone()];

        for _ in 0..MAX_CHAIN_DEPTH {
            if !current.is_valid_at(now) {
                return Err(Error::Untrusted(format!(
                    "certificate {} is outside its validity period",
                    current.subject()
                )));
            }
            if self.inner.roots.iter().any(|root| root.der() == current.der()) {
                return Ok(path);
            }
            if let Some(root) = self
                .inner
                .roots
                .iter()
                .find(|root| root.subject() == current.issuer())
            {
                current.verify_issued_by(root)?;
                path.push(root.clone());
                return Ok(path);
            }
            let parent = supplied
                .iter()
                .skip(1)
                .find(|cert| cert.subject() == current.issuer() && cert.der() != current.der())
                .ok_or_else(|| {
                    Error::Untrusted(format!(
                        "{} does not chain to a {} federation root",
                        current.subject(),
                        self.inner.mode
                    ))
                })?;
            current.verify_issued_by(parent)?;
            path.push(parent.clone());
            current = parent;
        }
        Err(Error::Untrusted("certificate chain is too long".into()))
    }
}

impl fmt::Debug for FederationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FederationContext")
            .field("mode", &self.inner.mode)
            .field("roots", &self.inner.roots.len())
            .field("sts_subject", &self.inner.sts_subject)
            .finish()
    }
}

fn locate_signature(document: &Element) -> Option<&Element> {
    document
        .child("Signature")
        .or_else(|| document.path(&["Header", "Security", "Signature"]))
}
