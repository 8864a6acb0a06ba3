use crate::{
    DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_REQUEST_TIMEOUT_MS, DEFAULT_SERVICE_ACTION, LogFormat,
    LoggingLayer, NetworkLayer, SealfedConfigLayer, ServiceLayer, TokensLayer,
};

pub fn defaults() -> SealfedConfigLayer {
    SealfedConfigLayer {
        service: Some(ServiceLayer {
            url: None,
            action: Some(DEFAULT_SERVICE_ACTION.into()),
        }),
        network: Some(NetworkLayer {
            connect_timeout_ms: Some(DEFAULT_CONNECT_TIMEOUT_MS),
            request_timeout_ms: Some(DEFAULT_REQUEST_TIMEOUT_MS),
            proxy: None,
        }),
        tokens: Some(TokensLayer {
            expiry_margin_secs: Some(0),
        }),
        logging: Some(LoggingLayer {
            format: Some(LogFormat::Text),
            filter: None,
        }),
        ..Default::default()
    }
}

/// Overrides every field of `target` that `layer` sets.
pub fn apply_layer(target: &mut SealfedConfigLayer, layer: SealfedConfigLayer) {
    if let Some(sts) = layer.sts {
        let slot = target.sts.get_or_insert_with(Default::default);
        overwrite(&mut slot.url, sts.url);
        overwrite(&mut slot.subject, sts.subject);
    }
    if let Some(service) = layer.service {
        let slot = target.service.get_or_insert_with(Default::default);
        overwrite(&mut slot.url, service.url);
        overwrite(&mut slot.action, service.action);
    }
    if let Some(org) = layer.organisation {
        let slot = target.organisation.get_or_insert_with(Default::default);
        overwrite(&mut slot.cvr, org.cvr);
        overwrite(&mut slot.name, org.name);
    }
    if let Some(system) = layer.system {
        let slot = target.system.get_or_insert_with(Default::default);
        overwrite(&mut slot.name, system.name);
    }
    if let Some(federation) = layer.federation {
        let slot = target.federation.get_or_insert_with(Default::default);
        overwrite(&mut slot.production, federation.production);
        overwrite(&mut slot.production_roots, federation.production_roots);
        overwrite(&mut slot.test_roots, federation.test_roots);
    }
    if let Some(keystore) = layer.keystore {
        let slot = target.keystore.get_or_insert_with(Default::default);
        overwrite(&mut slot.path, keystore.path);
        overwrite(&mut slot.password, keystore.password);
        overwrite(&mut slot.alias, keystore.alias);
    }
    if let Some(network) = layer.network {
        let slot = target.network.get_or_insert_with(Default::default);
        overwrite(&mut slot.connect_timeout_ms, network.connect_timeout_ms);
        overwrite(&mut slot.request_timeout_ms, network.request_timeout_ms);
        overwrite(&mut slot.proxy, network.proxy);
    }
    if let Some(tokens) = layer.tokens {
        let slot = target.tokens.get_or_insert_with(Default::default);
        overwrite(&mut slot.expiry_margin_secs, tokens.expiry_margin_secs);
    }
    if let Some(logging) = layer.logging {
        let slot = target.logging.get_or_insert_with(Default::default);
        overwrite(&mut slot.format, logging.format);
        overwrite(&mut slot.filter, logging.filter);
    }
}

fn overwrite<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}
