use crate::{LogFormat, SealfedConfig, SealfedConfigLayer};
use anyhow::{Result, bail};
use std::time::Duration;
use url::Url;

/// Exclusive upper bound for `tokens.expiry_margin_secs`.
const MAX_EXPIRY_MARGIN_SECS: u64 = 24 * 60 * 60;

#[derive(Default)]
struct Problems {
    missing: Vec<&'static str>,
    invalid: Vec<String>,
}

impl Problems {
    fn require<T>(&mut self, value: Option<T>, field: &'static str) -> Option<T> {
        if value.is_none() {
            self.missing.push(field);
        }
        value
    }

    fn require_text(&mut self, value: Option<String>, field: &'static str) -> Option<String> {
        let value = value.filter(|text| !text.trim().is_empty());
        self.require(value, field)
    }

    fn require_url(&mut self, value: Option<String>, field: &'static str) -> Option<Url> {
        let text = self.require_text(value, field)?;
        match Url::parse(&text) {
            Ok(url) => Some(url),
            Err(err) => {
                self.invalid.push(format!("{field}: {text:?} is not a valid url ({err})"));
                None
            }
        }
    }
}

/// Turns the merged layer into a [`SealfedConfig`], reporting every missing or invalid
/// field at once.
pub fn resolve(layer: SealfedConfigLayer) -> Result<SealfedConfig> {
    let mut problems = Problems::default();

    let sts = layer.sts.unwrap_or_default();
    let service = layer.service.unwrap_or_default();
    let org = layer.organisation.unwrap_or_default();
    let system = layer.system.unwrap_or_default();
    let federation = layer.federation.unwrap_or_default();
    let keystore = layer.keystore.unwrap_or_default();
    let network = layer.network.unwrap_or_default();
    let tokens = layer.tokens.unwrap_or_default();
    let logging = layer.logging.unwrap_or_default();

    let sts_url = problems.require_url(sts.url, "sts.url");
    let service_url = problems.require_url(service.url, "service.url");
    let org_cvr = problems.require_text(org.cvr, "organisation.cvr");
    let org_name = problems.require_text(org.name, "organisation.name");
    let system_name = problems.require_text(system.name, "system.name");
    let production = problems.require(federation.production, "federation.production");
    let keystore_path = problems.require(keystore.path, "keystore.path");
    let keystore_password = problems.require(
        keystore.password.filter(|secret| !secret.expose().is_empty()),
        "keystore.password",
    );
    let keystore_alias = problems.require_text(keystore.alias, "keystore.alias");

    let production_roots = federation.production_roots.unwrap_or_default();
    let test_roots = federation.test_roots.unwrap_or_default();
    match production {
        Some(true) if production_roots.is_empty() => {
            problems.missing.push("federation.production_roots")
        }
        Some(false) if test_roots.is_empty() => problems.missing.push("federation.test_roots"),
        _ => {}
    }

    let proxy = match network.proxy.filter(|text| !text.trim().is_empty()) {
        Some(text) => match Url::parse(&text) {
            Ok(url) => Some(url),
            Err(err) => {
                problems
                    .invalid
                    .push(format!("network.proxy: {text:?} is not a valid url ({err})"));
                None
            }
        },
        None => None,
    };

    let connect_timeout_ms = network.connect_timeout_ms.unwrap_or_default();
    let request_timeout_ms = network.request_timeout_ms.unwrap_or_default();
    for (field, value) in [
        ("network.connect_timeout_ms", connect_timeout_ms),
        ("network.request_timeout_ms", request_timeout_ms),
    ] {
        if value == 0 {
            problems.invalid.push(format!("{field}: 0 is not a valid timeout"));
        }
    }

    let expiry_margin_secs = tokens.expiry_margin_secs.unwrap_or_default();
    if expiry_margin_secs >= MAX_EXPIRY_MARGIN_SECS {
        problems.invalid.push(format!(
            "tokens.expiry_margin_secs: {expiry_margin_secs} must be below {MAX_EXPIRY_MARGIN_SECS}"
        ));
    }

    if !problems.missing.is_empty() || !problems.invalid.is_empty() {
        let mut parts = Vec::new();
        if !problems.missing.is_empty() {
            parts.push(format!("missing {}", problems.missing.join(", ")));
        }
        parts.extend(problems.invalid);
        bail!("incomplete configuration: {}", parts.join("; "));
    }

    // Every required value was checked above.
    let (
        Some(sts_url),
        Some(service_url),
        Some(org_cvr),
        Some(org_name),
        Some(system_name),
        Some(production_federation),
        Some(keystore_path),
        Some(keystore_password),
        Some(keystore_alias),
    ) = (
        sts_url,
        service_url,
        org_cvr,
        org_name,
        system_name,
        production,
        keystore_path,
        keystore_password,
        keystore_alias,
    )
    else {
        bail!("incomplete configuration");
    };

    Ok(SealfedConfig {
        sts_url,
        sts_subject: sts.subject.filter(|text| !text.trim().is_empty()),
        service_url,
        service_action: service.action.unwrap_or_default(),
        org_cvr,
        org_name,
        system_name,
        production_federation,
        production_roots,
        test_roots,
        keystore_path,
        keystore_password,
        keystore_alias,
        connect_timeout: Duration::from_millis(connect_timeout_ms),
        request_timeout: Duration::from_millis(request_timeout_ms),
        proxy,
        expiry_margin: Duration::from_secs(expiry_margin_secs),
        log_format: logging.format.unwrap_or(LogFormat::Text),
        log_filter: logging.filter,
    })
}
