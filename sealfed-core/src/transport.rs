//! Signed request/reply exchange with an ID-card protected service.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::errors::{Error, Result, TransportError};
use crate::http::HttpExchange;
use crate::soap::{self, ExchangeResult};
use crate::token::TokenManager;
use crate::xml::Element;

pub const DEFAULT_ACTION: &str = "replicate";

pub struct SignedTransport {
    tokens: Arc<TokenManager>,
    http: HttpExchange,
    action: String,
}

impl SignedTransport {
    pub fn new(tokens: Arc<TokenManager>, http: HttpExchange) -> Self {
        Self {
            tokens,
            http,
            action: DEFAULT_ACTION.to_string(),
        }
    }

    /// SOAP action label sent with every service request.
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = action.into();
        self
    }

    pub fn tokens(&self) -> &Arc<TokenManager> {
        &self.tokens
    }

    /// Sends `body` in a signed envelope carrying the current ID card and returns the
    /// first element of the reply body. Makes exactly one attempt.
    pub fn send_service_request(&self, url: &str, body: &Element) -> Result<Element> {
        let card = self.tokens.assertion()?;
        let message_id = uuid::Uuid::new_v4().to_string();
        let now = self.tokens.clock().now();

        let request = soap::service_request(card.element().clone(), body.clone(), &message_id, now);
        let signed = self
            .tokens
            .federation()
            .sign(request, self.tokens.credentials())?;

        debug!(%url, action = %self.action, message_id, card_id = card.card_id(), "sending service request");
        let reply = self
            .http
            .post(url, &self.action, &signed.to_document(), false)?;

        match soap::parse_reply(&reply.body) {
            Ok(ExchangeResult::Fault(fault)) => {
                warn!(
                    %url,
                    status = reply.status,
                    fault_actor = %fault.actor,
                    fault_code = %fault.code,
                    fault_string = %fault.message,
                    "service request rejected"
                );
                Err(Error::ServiceFault(fault))
            }
            Ok(ExchangeResult::Body(element)) if reply.is_success() => Ok(element),
            Ok(ExchangeResult::Body(_)) => Err(unexpected_status(url, reply.status)),
            Err(_) if !reply.is_success() => Err(unexpected_status(url, reply.status)),
            Err(err) => Err(err),
        }
    }

    /// Parses `body` and sends it with [`SignedTransport::send_service_request`].
    pub fn send_service_request_xml(&self, url: &str, body: &str) -> Result<Element> {
        let body = Element::parse(body)?;
        self.send_service_request(url, &body)
    }
}

fn unexpected_status(url: &str, code: u16) -> Error {
    Error::Transport(TransportError::UnexpectedStatus {
        code,
        url: url.to_string(),
    })
}
