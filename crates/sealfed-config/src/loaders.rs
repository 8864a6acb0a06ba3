use crate::{
    FederationLayer, KeystoreLayer, LogFormat, LoggingLayer, NetworkLayer, OrganisationLayer,
    SealfedConfigLayer, Secret, ServiceLayer, StsLayer, SystemLayer, TokensLayer,
};
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Reads a TOML or JSON (by extension) layer. Relative paths inside it are resolved
/// against the file's directory.
pub fn load_from_file(path: &Path) -> Result<SealfedConfigLayer> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    let mut layer = parse_config(&data, path)?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    absolutize_paths(&mut layer, base);
    Ok(layer)
}

fn parse_config(data: &str, path: &Path) -> Result<SealfedConfigLayer> {
    if path.extension().map(|ext| ext == "json").unwrap_or(false) {
        let layer: SealfedConfigLayer = serde_json::from_str(data)
            .with_context(|| format!("invalid json config {}", path.display()))?;
        Ok(layer)
    } else {
        let layer: SealfedConfigLayer = toml::from_str(data)
            .with_context(|| format!("invalid toml config {}", path.display()))?;
        Ok(layer)
    }
}

fn absolutize_paths(layer: &mut SealfedConfigLayer, base: &Path) {
    let absolutize = |path: &mut PathBuf| {
        if path.is_relative() {
            *path = base.join(&*path);
        }
    };
    if let Some(path) = layer.keystore.as_mut().and_then(|ks| ks.path.as_mut()) {
        absolutize(path);
    }
    if let Some(federation) = layer.federation.as_mut() {
        for roots in [
            federation.production_roots.as_mut(),
            federation.test_roots.as_mut(),
        ]
        .into_iter()
        .flatten()
        {
            roots.iter_mut().for_each(absolutize);
        }
    }
}

/// Layer built from the process environment.
pub fn env_layer() -> Result<SealfedConfigLayer> {
    env_layer_from(|key| std::env::var(key).ok())
}

fn parsed<T>(key: &str, value: String) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|err| anyhow::anyhow!("invalid value {value:?} for {key}: {err}"))
}

fn path_list(value: &str) -> Vec<PathBuf> {
    std::env::split_paths(value)
        .filter(|path| !path.as_os_str().is_empty())
        .collect()
}

/// Layer built from `SEALFED_*` variables looked up through `lookup`.
pub fn env_layer_from<F>(lookup: F) -> Result<SealfedConfigLayer>
where
    F: Fn(&str) -> Option<String>,
{
    let mut layer = SealfedConfigLayer::default();

    if let Some(value) = lookup("SEALFED_STS_URL") {
        layer.sts.get_or_insert_with(StsLayer::default).url = Some(value);
    }
    if let Some(value) = lookup("SEALFED_STS_SUBJECT") {
        layer.sts.get_or_insert_with(StsLayer::default).subject = Some(value);
    }

    if let Some(value) = lookup("SEALFED_SERVICE_URL") {
        layer.service.get_or_insert_with(ServiceLayer::default).url = Some(value);
    }
    if let Some(value) = lookup("SEALFED_SERVICE_ACTION") {
        layer.service.get_or_insert_with(ServiceLayer::default).action = Some(value);
    }

    if let Some(value) = lookup("SEALFED_ORG_CVR") {
        layer
            .organisation
            .get_or_insert_with(OrganisationLayer::default)
            .cvr = Some(value);
    }
    if let Some(value) = lookup("SEALFED_ORG_NAME") {
        layer
            .organisation
            .get_or_insert_with(OrganisationLayer::default)
            .name = Some(value);
    }
    if let Some(value) = lookup("SEALFED_SYSTEM_NAME") {
        layer.system.get_or_insert_with(SystemLayer::default).name = Some(value);
    }

    if let Some(value) = lookup("SEALFED_PRODUCTION_FEDERATION") {
        layer
            .federation
            .get_or_insert_with(FederationLayer::default)
            .production = Some(parsed::<bool>("SEALFED_PRODUCTION_FEDERATION", value)?);
    }
    if let Some(value) = lookup("SEALFED_FEDERATION_PRODUCTION_ROOTS") {
        layer
            .federation
            .get_or_insert_with(FederationLayer::default)
            .production_roots = Some(path_list(&value));
    }
    if let Some(value) = lookup("SEALFED_FEDERATION_TEST_ROOTS") {
        layer
            .federation
            .get_or_insert_with(FederationLayer::default)
            .test_roots = Some(path_list(&value));
    }

    if let Some(value) = lookup("SEALFED_KEYSTORE_PATH") {
        layer.keystore.get_or_insert_with(KeystoreLayer::default).path = Some(PathBuf::from(value));
    }
    if let Some(value) = lookup("SEALFED_KEYSTORE_PASSWORD") {
        layer
            .keystore
            .get_or_insert_with(KeystoreLayer::default)
            .password = Some(Secret::new(value));
    }
    if let Some(value) = lookup("SEALFED_KEYSTORE_ALIAS") {
        layer.keystore.get_or_insert_with(KeystoreLayer::default).alias = Some(value);
    }

    if let Some(value) = lookup("SEALFED_CONNECT_TIMEOUT_MS") {
        layer
            .network
            .get_or_insert_with(NetworkLayer::default)
            .connect_timeout_ms = Some(parsed("SEALFED_CONNECT_TIMEOUT_MS", value)?);
    }
    if let Some(value) = lookup("SEALFED_REQUEST_TIMEOUT_MS") {
        layer
            .network
            .get_or_insert_with(NetworkLayer::default)
            .request_timeout_ms = Some(parsed("SEALFED_REQUEST_TIMEOUT_MS", value)?);
    }
    if let Some(value) = lookup("SEALFED_PROXY") {
        layer.network.get_or_insert_with(NetworkLayer::default).proxy = Some(value);
    }

    if let Some(value) = lookup("SEALFED_EXPIRY_MARGIN_SECS") {
        layer
            .tokens
            .get_or_insert_with(TokensLayer::default)
            .expiry_margin_secs = Some(parsed("SEALFED_EXPIRY_MARGIN_SECS", value)?);
    }

    if let Some(value) = lookup("SEALFED_LOG_FORMAT") {
        layer.logging.get_or_insert_with(LoggingLayer::default).format =
            Some(parsed::<LogFormat>("SEALFED_LOG_FORMAT", value)?);
    }
    if let Some(value) = lookup("SEALFED_LOG_FILTER") {
        layer.logging.get_or_insert_with(LoggingLayer::default).filter = Some(value);
    }

    Ok(layer)
}
