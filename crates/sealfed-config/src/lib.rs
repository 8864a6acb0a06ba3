mod loaders;
mod merge;
mod validate;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

pub use loaders::{env_layer, env_layer_from, load_from_file};

pub const DEFAULT_CONFIG_FILE: &str = "sealfed.toml";
pub const CONFIG_PATH_ENV: &str = "SEALFED_CONFIG";
pub const DEFAULT_SERVICE_ACTION: &str = "replicate";
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 60_000;

/// One source of settings. Every field is optional; later layers override earlier ones.
#[derive(Default, Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SealfedConfigLayer {
    pub sts: Option<StsLayer>,
    pub service: Option<ServiceLayer>,
    pub organisation: Option<OrganisationLayer>,
    pub system: Option<SystemLayer>,
    pub federation: Option<FederationLayer>,
    pub keystore: Option<KeystoreLayer>,
    pub network: Option<NetworkLayer>,
    pub tokens: Option<TokensLayer>,
    pub logging: Option<LoggingLayer>,
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StsLayer {
    pub url: Option<String>,
    pub subject: Option<String>,
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceLayer {
    pub url: Option<String>,
    pub action: Option<String>,
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OrganisationLayer {
    pub cvr: Option<String>,
    pub name: Option<String>,
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SystemLayer {
    pub name: Option<String>,
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FederationLayer {
    pub production: Option<bool>,
    pub production_roots: Option<Vec<PathBuf>>,
    pub test_roots: Option<Vec<PathBuf>>,
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeystoreLayer {
    pub path: Option<PathBuf>,
    pub password: Option<Secret>,
    pub alias: Option<String>,
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkLayer {
    pub connect_timeout_ms: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub proxy: Option<String>,
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TokensLayer {
    pub expiry_margin_secs: Option<u64>,
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingLayer {
    pub format: Option<LogFormat>,
    pub filter: Option<String>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => anyhow::bail!("unknown log format {other:?} (expected text or json)"),
        }
    }
}

/// String whose value never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

/// Fully resolved and validated client configuration.
#[derive(Debug, Clone)]
pub struct SealfedConfig {
    pub sts_url: Url,
    pub sts_subject: Option<String>,
    pub service_url: Url,
    pub service_action: String,
    pub org_cvr: String,
    pub org_name: String,
    pub system_name: String,
    pub production_federation: bool,
    pub production_roots: Vec<PathBuf>,
    pub test_roots: Vec<PathBuf>,
    pub keystore_path: PathBuf,
    pub keystore_password: Secret,
    pub keystore_alias: String,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub proxy: Option<Url>,
    pub expiry_margin: Duration,
    pub log_format: LogFormat,
    pub log_filter: Option<String>,
}

impl SealfedConfig {
    /// Trust-root files of the selected federation.
    pub fn selected_roots(&self) -> &[PathBuf] {
        if self.production_federation {
            &self.production_roots
        } else {
            &self.test_roots
        }
    }
}

pub struct ConfigResolver {
    config_path: Option<PathBuf>,
    working_dir: PathBuf,
    env: Box<dyn Fn(&str) -> Option<String>>,
}

impl ConfigResolver {
    pub fn new() -> Self {
        Self {
            config_path: None,
            working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env: Box::new(|key| std::env::var(key).ok()),
        }
    }

    /// Explicit config file, taking precedence over `SEALFED_CONFIG`.
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Directory searched for `sealfed.toml` when no path is given.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    /// Replaces the process environment as the source of `SEALFED_*` variables.
    pub fn with_env<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + 'static,
    {
        self.env = Box::new(lookup);
        self
    }

    /// Merges defaults, the config file and the environment, then validates.
    pub fn load(&self) -> Result<SealfedConfig> {
        let layer = self.merged_layer()?;
        validate::resolve(layer)
    }

    /// Merged layers without validation.
    pub fn merged_layer(&self) -> Result<SealfedConfigLayer> {
        let mut merged = merge::defaults();

        let explicit = self
            .config_path
            .clone()
            .or_else(|| (self.env)(CONFIG_PATH_ENV).map(PathBuf::from));
        let file_layer = match explicit {
            Some(path) => Some(load_from_file(&self.working_dir.join(path))?),
            None => {
                let path = self.working_dir.join(DEFAULT_CONFIG_FILE);
                if path.exists() {
                    Some(load_from_file(&path)?)
                } else {
                    None
                }
            }
        };
        if let Some(layer) = file_layer {
            merge::apply_layer(&mut merged, layer);
        }

        merge::apply_layer(&mut merged, env_layer_from(|key| (self.env)(key))?);
        Ok(merged)
    }
}

impl Default for ConfigResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::tempdir;

    const COMPLETE: &str = r#"
[sts]
url = "https://test1.ekstern-test.nspop.dk:8443/sts/services/NewSecurityTokenService"

[service]
url = "https://service.test/stamdata-batch-copy-ws/service/StamdataReplication"

[organisation]
cvr = "12345678"
name = "Region Test"

[system]
name = "Batch Copy"

[federation]
production = false
test_roots = ["roots/test-root.pem"]

[keystore]
path = "keys/system.keystore"
password = "Test1234"
alias = "batch-copy"
"#;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + 'static {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn file_values_resolve_with_defaults() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(DEFAULT_CONFIG_FILE), COMPLETE).unwrap();
        let cfg = ConfigResolver::new()
            .with_working_dir(dir.path())
            .with_env(env(&[]))
            .load()
            .expect("config");

        assert_eq!(cfg.service_action, DEFAULT_SERVICE_ACTION);
        assert_eq!(cfg.connect_timeout, Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS));
        assert_eq!(cfg.request_timeout, Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS));
        assert_eq!(cfg.expiry_margin, Duration::ZERO);
        assert!(!cfg.production_federation);
        assert_eq!(cfg.keystore_path, dir.path().join("keys/system.keystore"));
        assert_eq!(cfg.selected_roots(), &[dir.path().join("roots/test-root.pem")]);
        assert_eq!(cfg.log_format, LogFormat::Text);
    }

    #[test]
    fn environment_overrides_file() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(DEFAULT_CONFIG_FILE), COMPLETE).unwrap();
        let cfg = ConfigResolver::new()
            .with_working_dir(dir.path())
            .with_env(env(&[
                ("SEALFED_SERVICE_ACTION", "urn:replicate"),
                ("SEALFED_KEYSTORE_ALIAS", "other"),
                ("SEALFED_REQUEST_TIMEOUT_MS", "2500"),
                ("SEALFED_LOG_FORMAT", "json"),
                ("SEALFED_EXPIRY_MARGIN_SECS", "30"),
            ]))
            .load()
            .expect("config");
        assert_eq!(cfg.service_action, "urn:replicate");
        assert_eq!(cfg.keystore_alias, "other");
        assert_eq!(cfg.request_timeout, Duration::from_millis(2500));
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert_eq!(cfg.expiry_margin, Duration::from_secs(30));
    }

    #[test]
    fn json_files_are_accepted() {
        let dir = tempdir().unwrap();
        let layer: SealfedConfigLayer = toml::from_str(COMPLETE).unwrap();
        let path = dir.path().join("custom.json");
        fs::write(&path, serde_json::to_string(&layer).unwrap()).unwrap();
        let cfg = ConfigResolver::new()
            .with_working_dir(dir.path())
            .with_config_path(&path)
            .with_env(env(&[]))
            .load()
            .expect("config");
        assert_eq!(cfg.system_name, "Batch Copy");
    }

    #[test]
    fn config_path_can_come_from_the_environment() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("elsewhere.toml");
        fs::write(&path, COMPLETE).unwrap();
        let cfg = ConfigResolver::new()
            .with_working_dir(dir.path())
            .with_env(env(&[(CONFIG_PATH_ENV, path.to_str().unwrap())]))
            .load()
            .expect("config");
        assert_eq!(cfg.org_cvr, "12345678");
    }

    #[test]
    fn all_missing_fields_are_reported_together() {
        let dir = tempdir().unwrap();
        let err = ConfigResolver::new()
            .with_working_dir(dir.path())
            .with_env(env(&[("SEALFED_ORG_CVR", "12345678")]))
            .load()
            .unwrap_err()
            .to_string();
        for field in [
            "sts.url",
            "service.url",
            "organisation.name",
            "system.name",
            "federation.production",
            "keystore.path",
            "keystore.password",
            "keystore.alias",
        ] {
            assert!(err.contains(field), "{field} missing from: {err}");
        }
        assert!(!err.contains("organisation.cvr"));
    }

    #[test]
    fn selected_federation_needs_roots() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(DEFAULT_CONFIG_FILE), COMPLETE).unwrap();
        let err = ConfigResolver::new()
            .with_working_dir(dir.path())
            .with_env(env(&[("SEALFED_PRODUCTION_FEDERATION", "true")]))
            .load()
            .unwrap_err()
            .to_string();
        assert!(err.contains("federation.production_roots"), "{err}");
    }

    #[test]
    fn invalid_urls_are_rejected() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(DEFAULT_CONFIG_FILE), COMPLETE).unwrap();
        let err = ConfigResolver::new()
            .with_working_dir(dir.path())
            .with_env(env(&[("SEALFED_STS_URL", "not a url")]))
            .load()
            .unwrap_err()
            .to_string();
        assert!(err.contains("sts.url"), "{err}");
    }

    #[test]
    fn oversized_expiry_margin_is_rejected() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(DEFAULT_CONFIG_FILE), COMPLETE).unwrap();
        let err = ConfigResolver::new()
            .with_working_dir(dir.path())
            .with_env(env(&[("SEALFED_EXPIRY_MARGIN_SECS", "1000000000000")]))
            .load()
            .unwrap_err()
            .to_string();
        assert!(err.contains("tokens.expiry_margin_secs"), "{err}");

        let cfg = ConfigResolver::new()
            .with_working_dir(dir.path())
            .with_env(env(&[("SEALFED_EXPIRY_MARGIN_SECS", "86399")]))
            .load()
            .expect("margin just below a day");
        assert_eq!(cfg.expiry_margin, Duration::from_secs(86_399));
    }

    #[test]
    fn zero_timeouts_are_rejected() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(DEFAULT_CONFIG_FILE), COMPLETE).unwrap();
        let err = ConfigResolver::new()
            .with_working_dir(dir.path())
            .with_env(env(&[
                ("SEALFED_CONNECT_TIMEOUT_MS", "0"),
                ("SEALFED_REQUEST_TIMEOUT_MS", "0"),
            ]))
            .load()
            .unwrap_err()
            .to_string();
        assert!(err.contains("network.connect_timeout_ms"), "{err}");
        assert!(err.contains("network.request_timeout_ms"), "{err}");
    }

    #[test]
    fn unknown_keys_fail_to_parse() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(DEFAULT_CONFIG_FILE),
            "[keystore]\npasword = \"typo\"\n",
        )
        .unwrap();
        let err = ConfigResolver::new()
            .with_working_dir(dir.path())
            .with_env(env(&[]))
            .load()
            .unwrap_err();
        assert!(format!("{err:#}").contains("invalid toml config"));
    }

    #[test]
    fn password_is_redacted_in_debug_output() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(DEFAULT_CONFIG_FILE), COMPLETE).unwrap();
        let cfg = ConfigResolver::new()
            .with_working_dir(dir.path())
            .with_env(env(&[]))
            .load()
            .expect("config");
        assert_eq!(cfg.keystore_password.expose(), "Test1234");
        assert!(!format!("{cfg:?}").contains("Test1234"));
    }
}
