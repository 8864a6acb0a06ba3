//! Password-protected credential store holding the system certificate and key.
//!
//! On disk the store is a JSON document. The entry map is sealed with AES-256-GCM
//! under a key derived from the store password with PBKDF2-HMAC-SHA256, so a wrong
//! password shows up as a failed open.

use base64::{Engine, engine::general_purpose::STANDARD};
use ring::{
    aead, pbkdf2,
    rand::{SecureRandom, SystemRandom},
    signature::{self, EcdsaKeyPair, RsaKeyPair},
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{ErrorKind, Write};
use std::num::NonZeroU32;
use std::path::Path;
use tracing::info;

use crate::certificate::{Certificate, KeyAlgorithm};
use crate::errors::{Error, Result};

const STORE_VERSION: u32 = 1;
const KDF_ALGORITHM: &str = "pbkdf2-hmac-sha256";
const DEFAULT_ITERATIONS: u32 = 210_000;
const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;
const PROBE: &[u8] = b"sealfed keystore probe";

#[derive(Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    kdf: KdfParams,
    sealed: String,
}

#[derive(Serialize, Deserialize)]
struct KdfParams {
    algorithm: String,
    iterations: u32,
    salt: String,
}

#[derive(Serialize, Deserialize)]
struct StoredEntry {
    certificate: String,
    private_key: Option<String>,
}

/// Private key bound to the certificate it was loaded with.
pub enum SigningKey {
    Rsa(RsaKeyPair),
    Ecdsa(EcdsaKeyPair),
}

impl SigningKey {
    fn from_pkcs8(algorithm: KeyAlgorithm, pkcs8: &[u8]) -> Result<Self> {
        match algorithm {
            KeyAlgorithm::Rsa => RsaKeyPair::from_pkcs8(pkcs8)
                .map(SigningKey::Rsa)
                .map_err(|err| Error::CredentialLoad(format!("invalid RSA private key: {err}"))),
            KeyAlgorithm::EcdsaP256 => EcdsaKeyPair::from_pkcs8(
                &signature::ECDSA_P256_SHA256_ASN1_SIGNING,
                pkcs8,
                &SystemRandom::new(),
            )
            .map(SigningKey::Ecdsa)
            .map_err(|err| Error::CredentialLoad(format!("invalid EC private key: {err}"))),
        }
    }

    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let rng = SystemRandom::new();
        match self {
            SigningKey::Rsa(key) => {
                let mut out = vec![0u8; key.public().modulus_len()];
                key.sign(&signature::RSA_PKCS1_SHA256, &rng, message, &mut out)
                    .map_err(|_| Error::Crypto("RSA signing failed".into()))?;
                Ok(out)
            }
            SigningKey::Ecdsa(key) => key
                .sign(&rng, message)
                .map(|sig| sig.as_ref().to_vec())
                .map_err(|_| Error::Crypto("ECDSA signing failed".into())),
        }
    }
}

/// The calling system's certificate and private key.
pub struct CredentialPair {
    certificate: Certificate,
    key: SigningKey,
}

impl CredentialPair {
    /// Pairs a certificate with its PKCS#8 private key, checking that they match.
    pub fn new(certificate: Certificate, pkcs8: &[u8]) -> Result<Self> {
        let key = SigningKey::from_pkcs8(certificate.algorithm(), pkcs8)?;
        let probe = key.sign(PROBE)?;
        certificate.verify(PROBE, &probe).map_err(|_| {
            Error::CredentialLoad(format!(
                "private key does not match certificate {}",
                certificate.subject()
            ))
        })?;
        Ok(Self { certificate, key })
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        self.key.sign(message)
    }
}

impl fmt::Debug for CredentialPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPair")
            .field("certificate", &self.certificate)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Read access to a credential store file.
pub struct KeyStore;

impl KeyStore {
    /// Loads the certificate and private key stored under `alias`.
    pub fn load(path: impl AsRef<Path>, password: &str, alias: &str) -> Result<CredentialPair> {
        let path = path.as_ref();
        let raw = fs::read(path).map_err(|err| match err.kind() {
            ErrorKind::NotFound => {
                Error::CredentialLoad(format!("key store {} not found", path.display()))
            }
            _ => Error::CredentialLoad(format!(
                "failed to read key store {}: {err}",
                path.display()
            )),
        })?;
        let file: StoreFile = serde_json::from_slice(&raw).map_err(|err| {
            Error::CredentialLoad(format!("key store {} is malformed: {err}", path.display()))
        })?;
        let mut entries = open_entries(&file, password)?;

        let entry = entries
            .remove(alias)
            .ok_or_else(|| Error::CredentialLoad(format!("alias {alias:?} not found in key store")))?;
        let certificate = decode_b64(&entry.certificate)
            .and_then(|der| Certificate::from_der(&der))
            .map_err(|err| {
                Error::CredentialLoad(format!("certificate for alias {alias:?} is invalid: {err}"))
            })?;
        let pkcs8 = entry
            .private_key
            .as_deref()
            .map(decode_b64)
            .transpose()?
            .ok_or_else(|| {
                Error::CredentialLoad(format!("alias {alias:?} holds no private key"))
            })?;
        let pair = CredentialPair::new(certificate, &pkcs8)?;

        info!(
            keystore = %path.display(),
            alias,
            subject = %pair.certificate().subject(),
            not_after = %pair.certificate().not_after(),
            "loaded system credentials"
        );
        Ok(pair)
    }
}

/// Writes credential store files.
pub struct KeyStoreBuilder {
    iterations: u32,
    entries: BTreeMap<String, StoredEntry>,
}

impl Default for KeyStoreBuilder {
    fn default() -> Self {
        Self {
            iterations: DEFAULT_ITERATIONS,
            entries: BTreeMap::new(),
        }
    }
}

impl KeyStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// PBKDF2 iteration count written into the store.
    pub fn iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations.max(1);
        self
    }

    /// Adds a certificate with its PKCS#8 private key.
    pub fn key_pair(mut self, alias: impl Into<String>, certificate_der: &[u8], pkcs8: &[u8]) -> Self {
        self.entries.insert(
            alias.into(),
            StoredEntry {
                certificate: STANDARD.encode(certificate_der),
                private_key: Some(STANDARD.encode(pkcs8)),
            },
        );
        self
    }

    /// Adds a trusted certificate without a key.
    pub fn certificate(mut self, alias: impl Into<String>, certificate_der: &[u8]) -> Self {
        self.entries.insert(
            alias.into(),
            StoredEntry {
                certificate: STANDARD.encode(certificate_der),
                private_key: None,
            },
        );
        self
    }

    pub fn write(&self, path: impl AsRef<Path>, password: &str) -> Result<()> {
        let path = path.as_ref();
        let rng = SystemRandom::new();
        let mut salt = [0u8; SALT_LEN];
        rng.fill(&mut salt)
            .map_err(|_| Error::Crypto("random generator unavailable".into()))?;

        let key = derive_key(password, &salt, self.iterations)?;
        let plaintext = serde_json::to_vec(&self.entries)
            .map_err(|err| Error::Crypto(format!("failed to encode key store: {err}")))?;
        let file = StoreFile {
            version: STORE_VERSION,
            kdf: KdfParams {
                algorithm: KDF_ALGORITHM.into(),
                iterations: self.iterations,
                salt: STANDARD.encode(salt),
            },
            sealed: seal_aead(&key, &plaintext, &rng)?,
        };
        let data = serde_json::to_vec_pretty(&file)
            .map_err(|err| Error::Crypto(format!("failed to encode key store: {err}")))?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|err| Error::Crypto(format!("failed to create {}: {err}", parent.display())))?;
        }
        let mut out = fs::File::create(path)
            .map_err(|err| Error::Crypto(format!("failed to create {}: {err}", path.display())))?;
        out.write_all(&data)
            .and_then(|_| out.sync_all())
            .map_err(|err| Error::Crypto(format!("failed to write {}: {err}", path.display())))
    }
}

fn open_entries(file: &StoreFile, password: &str) -> Result<BTreeMap<String, StoredEntry>> {
    if file.version != STORE_VERSION {
        return Err(Error::CredentialLoad(format!(
            "unsupported key store version {}",
            file.version
        )));
    }
    if file.kdf.algorithm != KDF_ALGORITHM {
        return Err(Error::CredentialLoad(format!(
            "unsupported key derivation {}",
            file.kdf.algorithm
        )));
    }
    let salt = decode_b64(&file.kdf.salt)?;
    let key = derive_key(password, &salt, file.kdf.iterations)?;
    let plaintext = open_aead(&key, &file.sealed)?;
    serde_json::from_slice(&plaintext)
        .map_err(|err| Error::CredentialLoad(format!("key store contents are malformed: {err}")))
}

fn derive_key(password: &str, salt: &[u8], iterations: u32) -> Result<[u8; KEY_LEN]> {
    let iterations = NonZeroU32::new(iterations)
        .ok_or_else(|| Error::CredentialLoad("key store iteration count is zero".into()))?;
    let mut key = [0u8; KEY_LEN];
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        salt,
        password.as_bytes(),
        &mut key,
    );
    Ok(key)
}

fn seal_aead(key_bytes: &[u8], plaintext: &[u8], rng: &SystemRandom) -> Result<String> {
    let mut nonce = [0u8; NONCE_LEN];
    rng.fill(&mut nonce)
        .map_err(|_| Error::Crypto("random generator unavailable".into()))?;

    let key = aead::UnboundKey::new(&aead::AES_256_GCM, key_bytes)
        .map_err(|_| Error::Crypto("invalid key".into()))?;
    let key = aead::LessSafeKey::new(key);

    let mut in_out = plaintext.to_vec();
    in_out.reserve(TAG_LEN);
    key.seal_in_place_append_tag(
        aead::Nonce::assume_unique_for_key(nonce),
        aead::Aad::empty(),
        &mut in_out,
    )
    .map_err(|_| Error::Crypto("seal failed".into()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + in_out.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&in_out);
    Ok(STANDARD.encode(out))
}

fn open_aead(key_bytes: &[u8], b64: &str) -> Result<Vec<u8>> {
    let data = decode_b64(b64)?;
    if data.len() < NONCE_LEN + TAG_LEN {
        return Err(Error::CredentialLoad("key store contents are truncated".into()));
    }
    let (nonce, ct) = data.split_at(NONCE_LEN);

    let key = aead::UnboundKey::new(&aead::AES_256_GCM, key_bytes)
        .map_err(|_| Error::Crypto("invalid key".into()))?;
    let key = aead::LessSafeKey::new(key);

    let mut buffer = ct.to_vec();
    let nonce = aead::Nonce::try_assume_unique_for_key(nonce)
        .map_err(|_| Error::CredentialLoad("key store nonce is invalid".into()))?;
    let plaintext = key
        .open_in_place(nonce, aead::Aad::empty(), &mut buffer)
        .map_err(|_| {
            Error::CredentialLoad("wrong key store password or corrupted key store".into())
        })?;
    Ok(plaintext.to_vec())
}

fn decode_b64(value: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(value)
        .map_err(|err| Error::CredentialLoad(format!("invalid base64 in key store: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{Certificate as RcgenCertificate, CertificateParams, DnType};
    use tempfile::tempdir;

    fn self_signed(cn: &str) -> RcgenCertificate {
        let mut params = CertificateParams::new(vec![cn.to_string()]);
        params.distinguished_name.push(DnType::CommonName, cn);
        RcgenCertificate::from_params(params).unwrap()
    }

    #[test]
    fn load_returns_matching_pair() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("system.keystore");
        let cert = self_signed("Batch Copy System");
        KeyStoreBuilder::new()
            .iterations(1_000)
            .key_pair(
                "system",
                &cert.serialize_der().unwrap(),
                &cert.serialize_private_key_der(),
            )
            .write(&path, "Test1234")
            .unwrap();

        let pair = KeyStore::load(&path, "Test1234", "system").unwrap();
        assert_eq!(pair.certificate().common_name(), Some("Batch Copy System"));
        let sig = pair.sign(b"payload").unwrap();
        pair.certificate().verify(b"payload", &sig).unwrap();
        assert!(format!("{pair:?}").contains("<redacted>"));
    }

    #[test]
    fn wrong_password_is_a_credential_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("system.keystore");
        let cert = self_signed("sys");
        KeyStoreBuilder::new()
            .iterations(1_000)
            .key_pair(
                "system",
                &cert.serialize_der().unwrap(),
                &cert.serialize_private_key_der(),
            )
            .write(&path, "right")
            .unwrap();

        let err = KeyStore::load(&path, "wrong", "system").unwrap_err();
        assert!(matches!(err, Error::CredentialLoad(msg) if msg.contains("password")));
    }

    #[test]
    fn alias_must_resolve_to_a_key_pair() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("system.keystore");
        let cert = self_signed("root");
        KeyStoreBuilder::new()
            .iterations(1_000)
            .certificate("root", &cert.serialize_der().unwrap())
            .write(&path, "pw")
            .unwrap();

        let missing = KeyStore::load(&path, "pw", "system").unwrap_err();
        assert!(matches!(missing, Error::CredentialLoad(msg) if msg.contains("not found")));
        let keyless = KeyStore::load(&path, "pw", "root").unwrap_err();
        assert!(matches!(keyless, Error::CredentialLoad(msg) if msg.contains("no private key")));
    }

    #[test]
    fn mismatched_key_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("system.keystore");
        let cert = self_signed("one");
        let other = self_signed("two");
        KeyStoreBuilder::new()
            .iterations(1_000)
            .key_pair(
                "system",
                &cert.serialize_der().unwrap(),
                &other.serialize_private_key_der(),
            )
            .write(&path, "pw")
            .unwrap();

        let err = KeyStore::load(&path, "pw", "system").unwrap_err();
        assert!(matches!(err, Error::CredentialLoad(msg) if msg.contains("does not match")));
    }

    #[test]
    fn missing_file_is_a_credential_error() {
        let dir = tempdir().unwrap();
        let err = KeyStore::load(dir.path().join("absent"), "pw", "system").unwrap_err();
        assert!(matches!(err, Error::CredentialLoad(msg) if msg.contains("not found")));
    }
}
