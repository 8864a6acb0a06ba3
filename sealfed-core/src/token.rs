//! ID-card cache and token exchange against the security token service.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use time::Duration;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::errors::{Error, Result};
use crate::federation::FederationContext;
use crate::http::HttpExchange;
use crate::idcard::{IdCardTemplate, IdentityAssertion, SystemIdentity};
use crate::keystore::CredentialPair;
use crate::soap::{self, ExchangeResult};

/// Lifetime requested for the self-issued claim.
const CLAIM_LIFETIME: Duration = Duration::hours(24);
/// The token service expects an empty SOAP action label.
const STS_ACTION: &str = "";

#[derive(Default)]
struct CacheState {
    card: Option<IdentityAssertion>,
    exchanges: u64,
    last_error: Option<Error>,
}

/// Hands out a valid ID card, exchanging a freshly signed claim with the token
/// service when the cached one is absent or expired.
///
/// Refreshes are single flight: callers that arrive while an exchange runs wait for
/// it and share its outcome, including its error.
pub struct TokenManager {
    sts_url: String,
    identity: SystemIdentity,
    credentials: Arc<CredentialPair>,
    federation: FederationContext,
    http: HttpExchange,
    clock: Arc<dyn Clock>,
    expiry_margin: Duration,
    completed: AtomicU64,
    state: Mutex<CacheState>,
}

impl TokenManager {
    pub fn new(
        sts_url: impl Into<String>,
        identity: SystemIdentity,
        credentials: Arc<CredentialPair>,
        federation: FederationContext,
        http: HttpExchange,
    ) -> Self {
        Self {
            sts_url: sts_url.into(),
            identity,
            credentials,
            federation,
            http,
            clock: Arc::new(SystemClock),
            expiry_margin: Duration::ZERO,
            completed: AtomicU64::new(0),
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Treats cards as expired `margin` before their end of validity.
    pub fn with_expiry_margin(mut self, margin: Duration) -> Self {
        self.expiry_margin = margin;
        self
    }

    pub fn federation(&self) -> &FederationContext {
        &self.federation
    }

    pub fn credentials(&self) -> &Arc<CredentialPair> {
        &self.credentials
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Returns the cached card while it is valid, otherwise fetches a new one.
    pub fn assertion(&self) -> Result<IdentityAssertion> {
        let ticket = self.completed.load(Ordering::Acquire);
        let mut state = self.lock();

        let now = self.clock.now();
        match state.card.as_ref() {
            Some(card) if card.is_valid_at(now, self.expiry_margin) => {
                return Ok(card.clone());
            }
            Some(card) if card.is_expired_at(now, self.expiry_margin) => {
                debug!(card_id = card.card_id(), "cached ID card expired");
            }
            Some(card) => {
                debug!(card_id = card.card_id(), "cached ID card is not yet valid");
            }
            None => debug!("no ID card cached"),
        }

        if state.exchanges > ticket {
            if let Some(err) = &state.last_error {
                debug!(error = %err, "sharing the failure of the exchange waited on");
                return Err(err.clone());
            }
        }

        let outcome = self.exchange();
        state.exchanges += 1;
        self.completed.store(state.exchanges, Ordering::Release);
        match outcome {
            Ok(card) => {
                info!(
                    card_id = card.card_id(),
                    issuer = card.issuer(),
                    not_on_or_after = %card.not_on_or_after(),
                    "ID card issued"
                );
                state.card = Some(card.clone());
                state.last_error = None;
                Ok(card)
            }
            Err(err) => {
                state.last_error = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Drops the cached card so the next call exchanges a new one.
    pub fn invalidate(&self) {
        let mut state = self.lock();
        if let Some(card) = state.card.take() {
            debug!(card_id = card.card_id(), "ID card invalidated");
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn exchange(&self) -> Result<IdentityAssertion> {
        let now = self.clock.now();
        let claim = IdCardTemplate::system_claim(
            &self.identity,
            self.credentials.certificate(),
            now,
            CLAIM_LIFETIME,
        );
        let request = soap::token_request(claim.to_element(), &self.identity.system_name, now);
        let signed = self.federation.sign(request, &self.credentials)?;

        debug!(url = %self.sts_url, "requesting ID card");
        let reply = self
            .http
            .post(&self.sts_url, STS_ACTION, &signed.to_document(), true)?;

        let response = match soap::parse_reply(&reply.body)? {
            ExchangeResult::Fault(fault) => {
                error!(
                    fault_actor = %fault.actor,
                    fault_code = %fault.code,
                    fault_string = %fault.message,
                    "security token response is faulty"
                );
                return Err(Error::TokenExchangeFault(fault));
            }
            ExchangeResult::Body(response) => response,
        };

        let element = soap::issued_assertion(&response).ok_or_else(|| {
            Error::Protocol("missing identity assertion in token response".into())
        })?;
        let signer = self
            .federation
            .verify_signature(&element)
            .map_err(|err| match err {
                Error::Untrusted(_) => err,
                other => Error::Untrusted(other.to_string()),
            })?;
        let card = IdentityAssertion::from_element(element)?.with_signer(signer);

        let now = self.clock.now();
        if !card.is_valid_at(now, self.expiry_margin) {
            warn!(
                card_id = card.card_id(),
                not_before = %card.not_before(),
                not_on_or_after = %card.not_on_or_after(),
                "token service issued an ID card that is not valid now"
            );
            return Err(Error::Protocol(format!(
                "issued ID card {} is not valid at {now}",
                card.card_id()
            )));
        }
        Ok(card)
    }
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("sts_url", &self.sts_url)
            .field("identity", &self.identity)
            .field("federation", &self.federation)
            .field("expiry_margin", &self.expiry_margin)
            .finish()
    }
}
