//! Compact XML-DSig profile used for ID cards and envelopes.
//!
//! A signature lists one `Reference` per element carrying an `id` attribute, each
//! with the SHA-256 digest of that element's canonical bytes (see
//! [`Element::canonical_bytes`]). `SignatureValue` covers the canonical bytes of
//! `SignedInfo`. `KeyInfo` embeds the signer certificate followed by any
//! intermediates.

use base64::{Engine, engine::general_purpose::STANDARD};
use sha2::{Digest, Sha256};

use crate::certificate::{Certificate, KeyAlgorithm};
use crate::errors::{Error, Result};
use crate::keystore::CredentialPair;
use crate::xml::Element;

pub const DSIG_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
pub const C14N_URI: &str = "urn:sealfed:c14n:compact";
pub const DIGEST_URI: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
const SIGNATURE: &str = "Signature";

/// Decoded content of a `ds:Signature` element.
#[derive(Debug, Clone)]
pub struct SignatureParts {
    pub signed_info: Element,
    pub algorithm: KeyAlgorithm,
    pub value: Vec<u8>,
    pub chain: Vec<Certificate>,
    pub references: Vec<(String, Vec<u8>)>,
}

/// Ids of every element outside existing signatures, in document order.
pub fn signable_ids(document: &Element) -> Vec<&str> {
    let mut ids = Vec::new();
    collect_ids(document, &mut ids);
    ids
}

fn collect_ids<'a>(element: &'a Element, ids: &mut Vec<&'a str>) {
    if element.local_name() == SIGNATURE {
        return;
    }
    if let Some(id) = element.id() {
        ids.push(id);
    }
    for child in element.elements() {
        collect_ids(child, ids);
    }
}

fn digest_of(document: &Element, id: &str) -> Result<Vec<u8>> {
    let target = document
        .find_by_id(id)
        .ok_or_else(|| Error::Untrusted(format!("referenced element #{id} is missing")))?;
    Ok(Sha256::digest(target.canonical_bytes()).to_vec())
}

fn ensure_unique(ids: &[&str]) -> Result<()> {
    for (index, id) in ids.iter().enumerate() {
        if ids[..index].contains(id) {
            return Err(Error::Untrusted(format!("duplicate element id {id:?}")));
        }
    }
    Ok(())
}

/// Builds a `ds:Signature` over every identified element of `document`.
pub fn create_signature(
    document: &Element,
    credentials: &CredentialPair,
    signature_id: Option<&str>,
) -> Result<Element> {
    let ids = signable_ids(document);
    if ids.is_empty() {
        return Err(Error::Crypto("document has no identified elements to sign".into()));
    }
    ensure_unique(&ids)?;

    let algorithm = credentials.certificate().algorithm();
    let mut signed_info = Element::new("ds:SignedInfo")
        .with_child(Element::new("ds:CanonicalizationMethod").with_attr("Algorithm", C14N_URI))
        .with_child(
            Element::new("ds:SignatureMethod").with_attr("Algorithm", algorithm.signature_uri()),
        );
    for id in &ids {
        let digest = digest_of(document, id)?;
        signed_info.push(
            Element::new("ds:Reference")
                .with_attr("URI", format!("#{id}"))
                .with_child(Element::new("ds:DigestMethod").with_attr("Algorithm", DIGEST_URI))
                .with_child(Element::new("ds:DigestValue").with_text(STANDARD.encode(digest))),
        );
    }

    let value = credentials.sign(&signed_info.canonical_bytes())?;
    let key_info = Element::new("ds:KeyInfo").with_child(
        Element::new("ds:X509Data").with_child(
            Element::new("ds:X509Certificate").with_text(credentials.certificate().to_base64()),
        ),
    );

    let mut signature = Element::new("ds:Signature").with_attr("xmlns:ds", DSIG_NS);
    if let Some(id) = signature_id {
        signature.set_attr("id", id);
    }
    Ok(signature
        .with_child(signed_info)
        .with_child(Element::new("ds:SignatureValue").with_text(STANDARD.encode(value)))
        .with_child(key_info))
}

/// Decodes a `ds:Signature` element.
pub fn parse_signature(signature: &Element) -> Result<SignatureParts> {
    let signed_info = signature
        .child("SignedInfo")
        .ok_or_else(|| Error::Untrusted("signature has no SignedInfo".into()))?;
    let method = signed_info
        .child("SignatureMethod")
        .and_then(|el| el.attr("Algorithm"))
        .ok_or_else(|| Error::Untrusted("signature has no SignatureMethod".into()))?;
    let algorithm = KeyAlgorithm::from_signature_uri(method)
        .ok_or_else(|| Error::Untrusted(format!("unsupported signature method {method}")))?;
    let c14n = signed_info
        .child("CanonicalizationMethod")
        .and_then(|el| el.attr("Algorithm"));
    if c14n != Some(C14N_URI) {
        return Err(Error::Untrusted(format!(
            "unsupported canonicalization {}",
            c14n.unwrap_or("<none>")
        )));
    }

    let mut references = Vec::new();
    for reference in signed_info.children_named("Reference") {
        let id = reference
            .attr("URI")
            .and_then(|uri| uri.strip_prefix('#'))
            .ok_or_else(|| Error::Untrusted("reference without a local URI".into()))?;
        let digest_method = reference.child("DigestMethod").and_then(|el| el.attr("Algorithm"));
        if digest_method != Some(DIGEST_URI) {
            return Err(Error::Untrusted(format!("unsupported digest for #{id}")));
        }
        let digest = reference
            .child_text("DigestValue")
            .ok_or_else(|| Error::Untrusted(format!("reference #{id} has no digest")))
            .and_then(|text| decode(&text))?;
        references.push((id.to_string(), digest));
    }
    if references.is_empty() {
        return Err(Error::Untrusted("signature references nothing".into()));
    }

    let value = signature
        .child_text("SignatureValue")
        .ok_or_else(|| Error::Untrusted("signature has no SignatureValue".into()))
        .and_then(|text| decode(&text))?;

    let chain = signature
        .path(&["KeyInfo", "X509Data"])
        .map(|data| {
            data.children_named("X509Certificate")
                .map(|el| Certificate::from_base64(&el.text()))
                .collect::<Result<Vec<_>>>()
        })
        .transpose()?
        .unwrap_or_default();
    if chain.is_empty() {
        return Err(Error::Untrusted("signature carries no certificate".into()));
    }

    Ok(SignatureParts {
        signed_info: signed_info.clone(),
        algorithm,
        value,
        chain,
        references,
    })
}

/// Recomputes every reference digest in `parts` against `document`.
pub fn check_references(document: &Element, parts: &SignatureParts) -> Result<()> {
    let ids = signable_ids(document);
    ensure_unique(&ids)?;
    for (id, expected) in &parts.references {
        let actual = digest_of(document, id)?;
        if &actual != expected {
            return Err(Error::Untrusted(format!("digest mismatch for #{id}")));
        }
    }
    Ok(())
}

/// Checks `SignatureValue` with the embedded signer certificate.
pub fn check_signature_value(parts: &SignatureParts) -> Result<&Certificate> {
    let signer = &parts.chain[0];
    if signer.algorithm() != parts.algorithm {
        return Err(Error::Untrusted(
            "signature method does not match the signer key".into(),
        ));
    }
    signer.verify(&parts.signed_info.canonical_bytes(), &parts.value)?;
    Ok(signer)
}

fn decode(text: &str) -> Result<Vec<u8>> {
    let compact: String = text.split_whitespace().collect();
    STANDARD
        .decode(compact)
        .map_err(|err| Error::Untrusted(format!("invalid base64 in signature: {err}")))
}
