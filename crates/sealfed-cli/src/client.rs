use anyhow::{Context, Result};
use sealfed_config::SealfedConfig;
use sealfed_core::{
    Certificate, FederationContext, FederationMode, HttpExchange, HttpSettings, KeyStore,
    SignedTransport, SystemIdentity, TokenManager, TrustRoots,
};
use std::sync::Arc;
use tracing::info;

/// Builds the signed transport described by `config`: key store, trust roots,
/// federation context, token manager and HTTP exchange.
pub fn signed_transport(config: &SealfedConfig) -> Result<SignedTransport> {
    let settings = HttpSettings {
        connect_timeout: config.connect_timeout,
        request_timeout: config.request_timeout,
        proxy: config.proxy.clone(),
    };
    let http = HttpExchange::from_settings(&settings).context("failed to build http client")?;

    let credentials = KeyStore::load(
        &config.keystore_path,
        config.keystore_password.expose(),
        &config.keystore_alias,
    )
    .context("failed to load system credentials")?;

    let roots = TrustRoots {
        production: Certificate::load_pem_files(&config.production_roots)
            .context("failed to load production trust roots")?,
        test: Certificate::load_pem_files(&config.test_roots)
            .context("failed to load test trust roots")?,
    };
    let mode = FederationMode::from_production_flag(config.production_federation);
    let mut federation = FederationContext::initialize(mode, &roots)?;
    if let Some(subject) = &config.sts_subject {
        federation = federation.with_sts_subject(subject.clone());
    }

    let identity = SystemIdentity {
        system_name: config.system_name.clone(),
        org_cvr: config.org_cvr.clone(),
        org_name: config.org_name.clone(),
    };
    let margin = time::Duration::try_from(config.expiry_margin)
        .context("tokens.expiry_margin_secs is out of range")?;

    info!(
        %mode,
        sts_url = %config.sts_url,
        service_url = %config.service_url,
        system = %config.system_name,
        "client configured"
    );

    let tokens = TokenManager::new(
        config.sts_url.as_str(),
        identity,
        Arc::new(credentials),
        federation,
        http.clone(),
    )
    .with_expiry_margin(margin);
    Ok(SignedTransport::new(Arc::new(tokens), http).with_action(config.service_action.clone()))
}
