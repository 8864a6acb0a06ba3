use anyhow::{Context, Result, bail};
use sealfed_core::{Certificate, CredentialPair, KeyStoreBuilder};
use std::fs;
use std::path::Path;
use tracing::info;

pub struct ImportRequest<'a> {
    pub out: &'a Path,
    pub alias: &'a str,
    pub cert: &'a Path,
    pub key: &'a Path,
    pub password: &'a str,
}

/// Writes the certificate and PKCS#8 key into a new key store. Extra certificates in
/// the certificate file are stored as trusted entries named `<alias>-chain-<n>`.
pub fn import_keystore(request: &ImportRequest<'_>) -> Result<()> {
    if request.password.is_empty() {
        bail!("key store password must not be empty");
    }

    let mut certificates = Certificate::load_pem_files(&[request.cert])
        .with_context(|| format!("invalid certificate {}", request.cert.display()))?
        .into_iter();
    let Some(certificate) = certificates.next() else {
        bail!("{} holds no certificate", request.cert.display());
    };

    let key_text = fs::read_to_string(request.key)
        .with_context(|| format!("failed to read private key {}", request.key.display()))?;
    let pkcs8 = pkcs8_from_pem(&key_text)
        .with_context(|| format!("invalid private key {}", request.key.display()))?;

    let pair = CredentialPair::new(certificate, &pkcs8).context("key does not match certificate")?;

    let mut builder = KeyStoreBuilder::new().key_pair(request.alias, pair.certificate().der(), &pkcs8);
    for (index, extra) in certificates.enumerate() {
        builder = builder.certificate(format!("{}-chain-{}", request.alias, index + 1), extra.der());
    }
    builder
        .write(request.out, request.password)
        .with_context(|| format!("failed to write key store {}", request.out.display()))?;

    info!(
        keystore = %request.out.display(),
        alias = request.alias,
        subject = %pair.certificate().subject(),
        "key store written"
    );
    Ok(())
}

fn pkcs8_from_pem(text: &str) -> Result<Vec<u8>> {
    let blocks = pem::parse_many(text)?;
    if let Some(block) = blocks.iter().find(|block| block.tag() == "PRIVATE KEY") {
        return Ok(block.contents().to_vec());
    }
    match blocks.first() {
        Some(block) => bail!(
            "expected a PKCS#8 PRIVATE KEY block, found {} (convert with `openssl pkcs8 -topk8 -nocrypt`)",
            block.tag()
        ),
        None => bail!("no PEM block found"),
    }
}
