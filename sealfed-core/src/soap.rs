//! SOAP 1.1 envelopes for the token exchange and service calls, and reply parsing.

use time::OffsetDateTime;

use crate::errors::{Error, FaultInfo, Result};
use crate::idcard::format_instant;
use crate::xml::Element;

pub const SOAP_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
pub const WSSE_NS: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd";
pub const WSU_NS: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd";
pub const WST_NS: &str = "http://schemas.xmlsoap.org/ws/2005/02/trust";
pub const WSA_NS: &str = "http://www.w3.org/2005/08/addressing";
pub const SAML_NS: &str = "urn:oasis:names:tc:SAML:2.0:assertion";
pub const MEDCOM_NS: &str = "http://www.medcom.dk/dgws/2006/04/dgws-1.0.xsd";
pub const SOSI_NS: &str = "http://www.sosi.dk/sosi/2006/04/sosi-1.0.xsd";

const TOKEN_TYPE: &str = "urn:oasis:names:tc:SAML:2.0:assertion:";
const REQUEST_TYPE_ISSUE: &str = "http://schemas.xmlsoap.org/ws/2005/02/security/trust/Issue";
const TRUST_CONTEXT: &str = "www.sosi.dk";
/// `medcom:SecurityLevel` sent with ID-card authenticated system calls.
pub const SECURITY_LEVEL: u8 = 3;

/// Parsed reply of a successful HTTP exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExchangeResult {
    /// First element child of the reply body, carrying its namespace declarations.
    Body(Element),
    Fault(FaultInfo),
}

fn envelope(security: Vec<Element>, headers: Vec<Element>, body: Element) -> Element {
    let mut security_header = Element::new("wsse:Security").with_attr("mustUnderstand", "1");
    for part in security {
        security_header.push(part);
    }
    let mut header = Element::new("soapenv:Header").with_child(security_header);
    for extra in headers {
        header.push(extra);
    }
    Element::new("soapenv:Envelope")
        .with_attr("xmlns:soapenv", SOAP_NS)
        .with_attr("xmlns:wsse", WSSE_NS)
        .with_attr("xmlns:wsu", WSU_NS)
        .with_attr("xmlns:wst", WST_NS)
        .with_attr("xmlns:wsa", WSA_NS)
        .with_attr("xmlns:saml", SAML_NS)
        .with_attr("xmlns:medcom", MEDCOM_NS)
        .with_attr("xmlns:sosi", SOSI_NS)
        .with_child(header)
        .with_child(
            Element::new("soapenv:Body")
                .with_attr("id", "body")
                .with_child(body),
        )
}

fn timestamp(now: OffsetDateTime) -> Element {
    Element::new("wsu:Timestamp")
        .with_attr("id", "ts")
        .with_child(Element::new("wsu:Created").with_text(format_instant(now)))
}

/// Unsigned WS-Trust `RequestSecurityToken` envelope carrying `claim`.
pub fn token_request(claim: Element, issuer: &str, now: OffsetDateTime) -> Element {
    let request = Element::new("wst:RequestSecurityToken")
        .with_attr("Context", TRUST_CONTEXT)
        .with_child(Element::new("wst:TokenType").with_text(TOKEN_TYPE))
        .with_child(Element::new("wst:RequestType").with_text(REQUEST_TYPE_ISSUE))
        .with_child(Element::new("wst:Claims").with_child(claim))
        .with_child(
            Element::new("wst:Issuer").with_child(Element::new("wsa:Address").with_text(issuer)),
        );
    envelope(vec![timestamp(now)], Vec::new(), request)
}

/// The claim inside a token request envelope.
pub fn requested_claim(request: &Element) -> Option<Element> {
    request.extract_path(&["Body", "RequestSecurityToken", "Claims", "Assertion"])
}

/// `wst:RequestSecurityTokenResponse` wrapping an issued assertion.
pub fn token_response(assertion: Element) -> Element {
    let response = Element::new("wst:RequestSecurityTokenResponse")
        .with_attr("Context", TRUST_CONTEXT)
        .with_child(Element::new("wst:TokenType").with_text(TOKEN_TYPE))
        .with_child(Element::new("wst:RequestedSecurityToken").with_child(assertion));
    reply_envelope(response)
}

/// The issued assertion of a token response body.
pub fn issued_assertion(response: &Element) -> Option<Element> {
    response.extract_path(&["RequestedSecurityToken", "Assertion"])
}

/// Unsigned service request carrying the ID card and the caller's body.
pub fn service_request(
    assertion: Element,
    body: Element,
    message_id: &str,
    now: OffsetDateTime,
) -> Element {
    let medcom = Element::new("medcom:Header")
        .with_attr("id", "messageHeader")
        .with_child(Element::new("medcom:SecurityLevel").with_text(SECURITY_LEVEL.to_string()))
        .with_child(
            Element::new("medcom:Linking")
                .with_child(Element::new("medcom:MessageID").with_text(message_id)),
        )
        .with_child(Element::new("medcom:RequireNonRepudiationReceipt").with_text("no"));
    envelope(vec![timestamp(now), assertion], vec![medcom], body)
}

/// The ID card embedded in a service request.
pub fn request_assertion(request: &Element) -> Option<Element> {
    request.extract_path(&["Header", "Security", "Assertion"])
}

/// Plain reply envelope around `body`.
pub fn reply_envelope(body: Element) -> Element {
    Element::new("soapenv:Envelope")
        .with_attr("xmlns:soapenv", SOAP_NS)
        .with_child(Element::new("soapenv:Header"))
        .with_child(Element::new("soapenv:Body").with_child(body))
}

/// SOAP 1.1 fault envelope.
pub fn fault_envelope(fault: &FaultInfo) -> Element {
    let body = Element::new("soapenv:Fault")
        .with_child(Element::new("faultcode").with_text(fault.code.as_str()))
        .with_child(Element::new("faultstring").with_text(fault.message.as_str()))
        .with_child(Element::new("faultactor").with_text(fault.actor.as_str()));
    reply_envelope(body)
}

/// Parses a reply document into its body content or a fault.
pub fn parse_reply(text: &str) -> Result<ExchangeResult> {
    let root = Element::parse(text)
        .map_err(|err| Error::Protocol(format!("reply is not a valid document: {err}")))?;
    if root.local_name() != "Envelope" {
        return Err(Error::Protocol(format!(
            "reply root is {} instead of a SOAP envelope",
            root.name
        )));
    }
    let body = root
        .child("Body")
        .ok_or_else(|| Error::Protocol("reply envelope has no Body".into()))?;

    if let Some(fault) = body.child("Fault") {
        return Ok(ExchangeResult::Fault(FaultInfo {
            actor: fault.child_text("faultactor").unwrap_or_default(),
            code: fault.child_text("faultcode").unwrap_or_default(),
            message: fault.child_text("faultstring").unwrap_or_default(),
        }));
    }

    let first = body
        .first_element()
        .ok_or_else(|| Error::Protocol("reply body is empty".into()))?;
    let local = first.local_name().to_string();
    root.extract_path(&["Body", &local])
        .map(ExchangeResult::Body)
        .ok_or_else(|| Error::Protocol("reply body is empty".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn fault_parts_are_kept_verbatim() {
        let fault = FaultInfo::new("urn:sts", "wsse:InvalidSecurity", "ID card  expired ");
        let text = fault_envelope(&fault).to_document();
        match parse_reply(&text).unwrap() {
            ExchangeResult::Fault(parsed) => {
                assert_eq!(parsed.actor, "urn:sts");
                assert_eq!(parsed.code, "wsse:InvalidSecurity");
                assert_eq!(parsed.message, "ID card  expired");
            }
            other => panic!("expected a fault, got {other:?}"),
        }
    }

    #[test]
    fn body_content_is_namespace_complete() {
        let text = r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" xmlns:rep="urn:rep">
            <s:Body><rep:ReplicationResponse><rep:x>1</rep:x></rep:ReplicationResponse></s:Body>
        </s:Envelope>"#;
        let ExchangeResult::Body(body) = parse_reply(text).unwrap() else {
            panic!("expected a body");
        };
        assert_eq!(body.local_name(), "ReplicationResponse");
        let standalone = Element::parse(&body.to_xml()).unwrap();
        assert_eq!(
            standalone.namespace_decls().collect::<Vec<_>>(),
            vec![("rep", "urn:rep")]
        );
    }

    #[test]
    fn malformed_replies_are_protocol_errors() {
        for text in [
            "not xml",
            "<a/>",
            r#"<s:Envelope xmlns:s="urn:s"><s:Header/></s:Envelope>"#,
            r#"<s:Envelope xmlns:s="urn:s"><s:Body/></s:Envelope>"#,
        ] {
            assert!(
                matches!(parse_reply(text), Err(Error::Protocol(_))),
                "{text}"
            );
        }
    }

    #[test]
    fn token_request_carries_the_claim() {
        let claim = Element::new("saml:Assertion").with_attr("id", "IDCard");
        let request = token_request(claim.clone(), "Batch Copy", datetime!(2024-05-01 10:00 UTC));
        assert_eq!(
            request
                .path(&["Header", "Security", "Timestamp", "Created"])
                .map(Element::text)
                .as_deref(),
            Some("2024-05-01T10:00:00Z")
        );
        let carried = requested_claim(&request).unwrap();
        assert_eq!(carried.id(), claim.id());
        assert!(carried.attributes.contains(&("xmlns:saml".to_string(), SAML_NS.to_string())));
        assert_eq!(request.child("Body").and_then(Element::id), Some("body"));
    }

    #[test]
    fn service_request_embeds_card_header_and_body() {
        let card = Element::new("saml:Assertion").with_attr("id", "IDCard");
        let body = Element::new("rep:ReplicationRequest").with_attr("xmlns:rep", "urn:rep");
        let request = service_request(card, body.clone(), "msg-1", datetime!(2024-05-01 10:00 UTC));
        assert!(request_assertion(&request).is_some());
        assert_eq!(
            request
                .path(&["Header", "Header", "Linking", "MessageID"])
                .map(Element::text)
                .as_deref(),
            Some("msg-1")
        );
        assert_eq!(request.path(&["Body", "ReplicationRequest"]), Some(&body));
    }
}
