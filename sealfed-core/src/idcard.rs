//! ID cards: the SAML assertion describing the calling system.

use std::fmt;
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};

use crate::certificate::Certificate;
use crate::errors::{Error, Result};
use crate::federation::VerifiedSigner;
use crate::soap::{MEDCOM_NS, SAML_NS, SOSI_NS};
use crate::xml::Element;

pub const ID_CARD_VERSION: &str = "1.0.1";
const CVR_NAME_FORMAT: &str = "medcom:cvrnumber";
const HOLDER_OF_KEY: &str = "urn:oasis:names:tc:SAML:2.0:cm:holder-of-key";

/// RFC 3339 rendering with whole seconds.
pub fn format_instant(instant: OffsetDateTime) -> String {
    let whole = instant - Duration::nanoseconds(i64::from(instant.nanosecond()));
    whole
        .format(&Rfc3339)
        .unwrap_or_else(|_| whole.unix_timestamp().to_string())
}

fn parse_instant(value: &str, what: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value.trim(), &Rfc3339)
        .map_err(|err| Error::Protocol(format!("invalid {what} {value:?}: {err}")))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum AuthenticationLevel {
    NoAuthentication = 1,
    UsernamePassword = 2,
    VocesTrustedSystem = 3,
    MocesTrustedUser = 4,
    MocesTrustedUserWithPassword = 5,
}

impl AuthenticationLevel {
    pub fn level(self) -> u8 {
        self as u8
    }

    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            1 => Some(Self::NoAuthentication),
            2 => Some(Self::UsernamePassword),
            3 => Some(Self::VocesTrustedSystem),
            4 => Some(Self::MocesTrustedUser),
            5 => Some(Self::MocesTrustedUserWithPassword),
            _ => None,
        }
    }
}

impl fmt::Display for AuthenticationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.level())
    }
}

/// Who the calling system claims to be.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SystemIdentity {
    pub system_name: String,
    pub org_cvr: String,
    pub org_name: String,
}

/// Content of an ID card before it is signed.
#[derive(Clone, Debug)]
pub struct IdCardTemplate {
    pub card_id: String,
    pub issuer: String,
    pub identity: SystemIdentity,
    pub level: AuthenticationLevel,
    pub cert_hash: Option<String>,
    pub not_before: OffsetDateTime,
    pub not_on_or_after: OffsetDateTime,
}

impl IdCardTemplate {
    /// The claim a system sends to the token service: level 3, self-issued, bound to
    /// `certificate`.
    pub fn system_claim(
        identity: &SystemIdentity,
        certificate: &Certificate,
        now: OffsetDateTime,
        lifetime: Duration,
    ) -> Self {
        Self {
            card_id: uuid::Uuid::new_v4().to_string(),
            issuer: identity.system_name.clone(),
            identity: identity.clone(),
            level: AuthenticationLevel::VocesTrustedSystem,
            cert_hash: Some(certificate.fingerprint()),
            not_before: now,
            not_on_or_after: now + lifetime,
        }
    }

    pub fn to_element(&self) -> Element {
        let mut card_data = Element::new("saml:AttributeStatement")
            .with_attr("id", "IDCardData")
            .with_child(attribute("sosi:IDCardID", &self.card_id))
            .with_child(attribute("sosi:IDCardVersion", ID_CARD_VERSION))
            .with_child(attribute("sosi:IDCardType", "system"))
            .with_child(attribute(
                "sosi:AuthenticationLevel",
                &self.level.level().to_string(),
            ));
        if let Some(hash) = &self.cert_hash {
            card_data.push(attribute("sosi:OCESCertHash", hash));
        }

        let system_log = Element::new("saml:AttributeStatement")
            .with_attr("id", "SystemLog")
            .with_child(attribute("medcom:ITSystemName", &self.identity.system_name))
            .with_child(
                attribute("medcom:CareProviderID", &self.identity.org_cvr)
                    .with_attr("NameFormat", CVR_NAME_FORMAT),
            )
            .with_child(attribute("medcom:CareProviderName", &self.identity.org_name));

        Element::new("saml:Assertion")
            .with_attr("xmlns:saml", SAML_NS)
            .with_attr("xmlns:sosi", SOSI_NS)
            .with_attr("xmlns:medcom", MEDCOM_NS)
            .with_attr("IssueInstant", format_instant(self.not_before))
            .with_attr("Version", "2.0")
            .with_attr("id", "IDCard")
            .with_child(Element::new("saml:Issuer").with_text(self.issuer.as_str()))
            .with_child(
                Element::new("saml:Subject")
                    .with_child(
                        Element::new("saml:NameID")
                            .with_attr("Format", "medcom:other")
                            .with_text(self.identity.system_name.as_str()),
                    )
                    .with_child(
                        Element::new("saml:SubjectConfirmation").with_child(
                            Element::new("saml:ConfirmationMethod").with_text(HOLDER_OF_KEY),
                        ),
                    ),
            )
            .with_child(
                Element::new("saml:Conditions")
                    .with_attr("NotBefore", format_instant(self.not_before))
                    .with_attr("NotOnOrAfter", format_instant(self.not_on_or_after)),
            )
            .with_child(card_data)
            .with_child(system_log)
    }
}

fn attribute(name: &str, value: &str) -> Element {
    Element::new("saml:Attribute")
        .with_attr("Name", name)
        .with_child(Element::new("saml:AttributeValue").with_text(value))
}

/// A signed, time-bound ID card issued by the token service.
#[derive(Clone, PartialEq, Eq)]
pub struct IdentityAssertion {
    card_id: String,
    issuer: String,
    system_name: String,
    org_cvr: String,
    org_name: String,
    level: AuthenticationLevel,
    not_before: OffsetDateTime,
    not_on_or_after: OffsetDateTime,
    signer_chain: Vec<Certificate>,
    element: Element,
}

impl IdentityAssertion {
    /// Reads the card fields of a `saml:Assertion`. Signature checks are separate.
    pub fn from_element(element: Element) -> Result<Self> {
        if element.local_name() != "Assertion" {
            return Err(Error::Protocol(format!(
                "expected a saml:Assertion, found {}",
                element.name
            )));
        }
        let issuer = element
            .child_text("Issuer")
            .ok_or_else(|| Error::Protocol("ID card has no issuer".into()))?;
        let conditions = element
            .child("Conditions")
            .ok_or_else(|| Error::Protocol("ID card has no validity conditions".into()))?;
        let not_before = parse_instant(
            conditions
                .attr("NotBefore")
                .ok_or_else(|| Error::Protocol("ID card has no NotBefore".into()))?,
            "NotBefore",
        )?;
        let not_on_or_after = parse_instant(
            conditions
                .attr("NotOnOrAfter")
                .ok_or_else(|| Error::Protocol("ID card has no NotOnOrAfter".into()))?,
            "NotOnOrAfter",
        )?;

        let level = attribute_value(&element, "sosi:AuthenticationLevel")?;
        let level = level
            .parse::<u8>()
            .ok()
            .and_then(AuthenticationLevel::from_level)
            .ok_or_else(|| Error::Protocol(format!("invalid authentication level {level:?}")))?;

        Ok(Self {
            card_id: attribute_value(&element, "sosi:IDCardID")?,
            system_name: attribute_value(&element, "medcom:ITSystemName")?,
            org_cvr: attribute_value(&element, "medcom:CareProviderID")?,
            org_name: attribute_value(&element, "medcom:CareProviderName")?,
            issuer,
            level,
            not_before,
            not_on_or_after,
            signer_chain: Vec::new(),
            element,
        })
    }

    pub fn with_signer(mut self, signer: VerifiedSigner) -> Self {
        self.signer_chain = signer.chain;
        self
    }

    pub fn card_id(&self) -> &str {
        &self.card_id
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn system_name(&self) -> &str {
        &self.system_name
    }

    pub fn org_cvr(&self) -> &str {
        &self.org_cvr
    }

    pub fn org_name(&self) -> &str {
        &self.org_name
    }

    pub fn authentication_level(&self) -> AuthenticationLevel {
        self.level
    }

    pub fn not_before(&self) -> OffsetDateTime {
        self.not_before
    }

    pub fn not_on_or_after(&self) -> OffsetDateTime {
        self.not_on_or_after
    }

    /// Issuer certificate followed by the path to the federation root.
    pub fn signer_chain(&self) -> &[Certificate] {
        &self.signer_chain
    }

    /// The signed element as issued, for embedding into requests.
    pub fn element(&self) -> &Element {
        &self.element
    }

    /// `not_before <= now <= not_on_or_after - margin`.
    pub fn is_valid_at(&self, now: OffsetDateTime, margin: Duration) -> bool {
        self.not_before <= now && !self.is_expired_at(now, margin)
    }

    /// A margin reaching past the representable range counts as expired.
    pub fn is_expired_at(&self, now: OffsetDateTime, margin: Duration) -> bool {
        match self.not_on_or_after.checked_sub(margin) {
            Some(end) => now > end,
            None => true,
        }
    }
}

impl fmt::Debug for IdentityAssertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityAssertion")
            .field("card_id", &self.card_id)
            .field("issuer", &self.issuer)
            .field("system_name", &self.system_name)
            .field("org_cvr", &self.org_cvr)
            .field("level", &self.level)
            .field("not_before", &self.not_before)
            .field("not_on_or_after", &self.not_on_or_after)
            .finish()
    }
}

fn attribute_value(assertion: &Element, name: &str) -> Result<String> {
    assertion
        .children_named("AttributeStatement")
        .flat_map(|statement| statement.children_named("Attribute"))
        .find(|attr| attr.attr("Name") == Some(name))
        .and_then(|attr| attr.child_text("AttributeValue"))
        .ok_or_else(|| Error::Protocol(format!("ID card has no {name} attribute")))
}
