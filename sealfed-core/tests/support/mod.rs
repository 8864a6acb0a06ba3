#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rcgen::{
    BasicConstraints, Certificate as RcgenCertificate, CertificateParams, DistinguishedName,
    DnType, IsCa,
};
use reqwest::header::HeaderMap;
use sealfed_core::soap;
use sealfed_core::{
    BodyStream, Certificate, Clock, Connection, Connector, CredentialPair, Element,
    FaultInfo, FederationContext, FederationMode, HttpExchange, IdCardTemplate,
    IdentityAssertion, KeyStore, KeyStoreBuilder, SignedTransport, SystemIdentity,
    TokenManager, TransportError, TrustRoots,
};
use time::{Duration, OffsetDateTime};
use url::Url;

pub const STS_URL: &str = "http://sts.test/sts/services/SecurityTokenService";
pub const SERVICE_URL: &str = "http://service.test/stamdata-batch-copy-ws/service/StamdataReplication";
pub const STS_NAME: &str = "TEST1-NSP-STS";
pub const KEYSTORE_PASSWORD: &str = "Test1234";
pub const KEYSTORE_ALIAS: &str = "batch-copy";

fn distinguished(name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, name);
    dn
}

fn ca(name: &str) -> RcgenCertificate {
    let mut params = CertificateParams::new(Vec::<String>::new());
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.distinguished_name = distinguished(name);
    RcgenCertificate::from_params(params).expect("ca certificate")
}

struct Issued {
    der: Vec<u8>,
    pkcs8: Vec<u8>,
}

fn issue(name: &str, issuer: &RcgenCertificate) -> Issued {
    let mut params = CertificateParams::new(Vec::<String>::new());
    params.distinguished_name = distinguished(name);
    let cert = RcgenCertificate::from_params(params).expect("leaf certificate");
    Issued {
        der: cert.serialize_der_with_signer(issuer).expect("sign leaf"),
        pkcs8: cert.serialize_private_key_der(),
    }
}

fn pair(issued: &Issued) -> CredentialPair {
    let cert = Certificate::from_der(&issued.der).expect("parse leaf");
    CredentialPair::new(cert, &issued.pkcs8).expect("credential pair")
}

/// Two federation roots, an STS certificate and a system certificate issued under
/// the test root, plus a certificate from an unrelated root.
pub struct Pki {
    pub production_root: Certificate,
    pub test_root: Certificate,
    sts: Issued,
    system: Issued,
    rogue: Issued,
}

impl Pki {
    pub fn generate() -> Self {
        let production = ca("Production Federation Root");
        let test = ca("Test Federation Root");
        let sts = issue(STS_NAME, &test);
        let system = issue("Batch Copy System", &test);
        let rogue = issue(STS_NAME, &ca("Test Federation Root"));
        Self {
            production_root: Certificate::from_der(&production.serialize_der().expect("root"))
                .expect("parse root"),
            test_root: Certificate::from_der(&test.serialize_der().expect("root"))
                .expect("parse root"),
            sts,
            system,
            rogue,
        }
    }

    pub fn roots(&self) -> TrustRoots {
        TrustRoots {
            production: vec![self.production_root.clone()],
            test: vec![self.test_root.clone()],
        }
    }

    pub fn context(&self, mode: FederationMode) -> FederationContext {
        FederationContext::initialize(mode, &self.roots()).expect("federation context")
    }

    pub fn sts_credentials(&self) -> CredentialPair {
        pair(&self.sts)
    }

    pub fn system_credentials(&self) -> CredentialPair {
        pair(&self.system)
    }

    pub fn rogue_credentials(&self) -> CredentialPair {
        pair(&self.rogue)
    }

    /// Writes the system certificate and key into a keystore under `dir`.
    pub fn write_system_keystore(&self, dir: &Path) -> PathBuf {
        let path = dir.join("system.keystore");
        KeyStoreBuilder::new()
            .iterations(1_000)
            .key_pair(KEYSTORE_ALIAS, &self.system.der, &self.system.pkcs8)
            .write(&path, KEYSTORE_PASSWORD)
            .expect("write keystore");
        path
    }
}

pub fn identity() -> SystemIdentity {
    SystemIdentity {
        system_name: "Batch Copy".into(),
        org_cvr: "12345678".into(),
        org_name: "Region Test".into(),
    }
}

/// Clock moved by hand.
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    pub fn starting_now() -> Arc<Self> {
        let now = OffsetDateTime::now_utc();
        let whole = now - Duration::nanoseconds(i64::from(now.nanosecond()));
        Arc::new(Self {
            now: Mutex::new(whole),
        })
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap() += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock().unwrap()
    }
}

pub type Handler = Arc<dyn Fn(&str, &str) -> (u16, String) + Send + Sync>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Call {
    pub url: String,
    pub action: String,
    pub content_type: String,
}

/// Scripted [`Connector`] counting opened and released connections.
#[derive(Default)]
pub struct FakeNetwork {
    routes: Mutex<Vec<(String, Handler)>>,
    calls: Mutex<Vec<Call>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
    streams: Mutex<Vec<BodyStream>>,
}

impl FakeNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Serves `url` with `handler(action, body) -> (status, body)`.
    pub fn route(&self, url: &str, handler: Handler) {
        self.routes.lock().unwrap().push((url.to_string(), handler));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, url: &str) -> usize {
        self.calls().iter().filter(|call| call.url == url).count()
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn streams(&self) -> Vec<BodyStream> {
        self.streams.lock().unwrap().clone()
    }
}

/// Connector handle sharing one [`FakeNetwork`].
#[derive(Clone)]
pub struct NetworkConnector(pub Arc<FakeNetwork>);

impl Connector for NetworkConnector {
    fn open(&self, url: &Url) -> Result<Box<dyn Connection>, TransportError> {
        let handler = self
            .0
            .routes
            .lock()
            .unwrap()
            .iter()
            .find(|(route, _)| route.as_str() == url.as_str())
            .map(|(_, handler)| handler.clone())
            .ok_or_else(|| TransportError::Connection {
                url: url.to_string(),
                message: "connection refused".into(),
            })?;
        self.0.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeConnection {
            network: self.0.clone(),
            url: url.to_string(),
            handler,
            response: None,
        }))
    }
}

struct FakeConnection {
    network: Arc<FakeNetwork>,
    url: String,
    handler: Handler,
    response: Option<String>,
}

impl Connection for FakeConnection {
    fn send(&mut self, headers: &HeaderMap, payload: Vec<u8>) -> Result<u16, TransportError> {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .unwrap_or_default()
                .to_string()
        };
        let action = header("soapaction");
        self.network.calls.lock().unwrap().push(Call {
            url: self.url.clone(),
            action: action.clone(),
            content_type: header("content-type"),
        });
        let body = String::from_utf8(payload).expect("utf-8 payload");
        let label = action.trim_matches('"').to_string();
        let (status, reply) = (self.handler)(&label, &body);
        self.response = Some(reply);
        Ok(status)
    }

    fn read_body(&mut self, stream: BodyStream) -> Result<String, TransportError> {
        self.network.streams.lock().unwrap().push(stream);
        Ok(self.response.take().unwrap_or_default())
    }
}

impl Drop for FakeConnection {
    fn drop(&mut self) {
        self.network.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Clone, Debug)]
pub enum StsBehaviour {
    Issue,
    Fault(FaultInfo),
    EmptyResponse,
    /// Issues a card whose window has already passed.
    IssueExpired,
    /// Signs the card with a certificate outside the federation.
    IssueUntrusted,
}

/// Token service verifying signed claims and issuing cards valid for `lifetime`.
pub struct FakeSts {
    federation: FederationContext,
    credentials: CredentialPair,
    rogue_credentials: CredentialPair,
    clock: Arc<ManualClock>,
    lifetime: Duration,
    delay: Mutex<std::time::Duration>,
    behaviour: Mutex<StsBehaviour>,
    issued: AtomicUsize,
}

impl FakeSts {
    pub fn new(pki: &Pki, clock: Arc<ManualClock>) -> Arc<Self> {
        Arc::new(Self {
            federation: pki.context(FederationMode::Test),
            credentials: pki.sts_credentials(),
            rogue_credentials: pki.rogue_credentials(),
            clock,
            lifetime: Duration::minutes(5),
            delay: Mutex::new(std::time::Duration::ZERO),
            behaviour: Mutex::new(StsBehaviour::Issue),
            issued: AtomicUsize::new(0),
        })
    }

    pub fn set_behaviour(&self, behaviour: StsBehaviour) {
        *self.behaviour.lock().unwrap() = behaviour;
    }

    pub fn set_delay(&self, delay: std::time::Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }

    pub fn handler(self: &Arc<Self>) -> Handler {
        let sts = self.clone();
        Arc::new(move |action: &str, body: &str| sts.handle(action, body))
    }

    fn handle(&self, action: &str, body: &str) -> (u16, String) {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        assert_eq!(action, "", "token requests carry an empty action");

        let request = Element::parse(body).expect("token request parses");
        if !self.federation.verify(&request) {
            let fault = FaultInfo::new(STS_NAME, "wsse:FailedCheck", "request signature invalid");
            return (200, soap::fault_envelope(&fault).to_document());
        }
        let claim = soap::requested_claim(&request).expect("claim present");
        let claim = IdentityAssertion::from_element(claim).expect("claim readable");

        let behaviour = self.behaviour.lock().unwrap().clone();
        let now = self.clock.now();
        let (not_before, signer) = match &behaviour {
            StsBehaviour::Fault(fault) => {
                return (200, soap::fault_envelope(fault).to_document());
            }
            StsBehaviour::EmptyResponse => {
                let response = Element::new("wst:RequestSecurityTokenResponse")
                    .with_attr("xmlns:wst", soap::WST_NS);
                return (200, soap::reply_envelope(response).to_document());
            }
            StsBehaviour::Issue => (now, &self.credentials),
            StsBehaviour::IssueExpired => (now - self.lifetime * 2, &self.credentials),
            StsBehaviour::IssueUntrusted => (now, &self.rogue_credentials),
        };

        let template = IdCardTemplate {
            card_id: uuid::Uuid::new_v4().to_string(),
            issuer: STS_NAME.into(),
            identity: SystemIdentity {
                system_name: claim.system_name().into(),
                org_cvr: claim.org_cvr().into(),
                org_name: claim.org_name().into(),
            },
            level: claim.authentication_level(),
            cert_hash: None,
            not_before,
            not_on_or_after: not_before + self.lifetime,
        };
        let card = self
            .federation
            .sign(template.to_element(), signer)
            .expect("sign card");
        self.issued.fetch_add(1, Ordering::SeqCst);
        (200, soap::token_response(card).to_document())
    }
}

#[derive(Clone, Debug)]
pub enum ServiceBehaviour {
    Echo,
    Fault(FaultInfo),
    ServerError(String),
}

/// Target service echoing the request body after checking the envelope signature and
/// the embedded card.
pub struct EchoService {
    federation: FederationContext,
    behaviour: Mutex<ServiceBehaviour>,
    seen_cards: Mutex<Vec<String>>,
}

impl EchoService {
    pub fn new(pki: &Pki) -> Arc<Self> {
        Arc::new(Self {
            federation: pki.context(FederationMode::Test),
            behaviour: Mutex::new(ServiceBehaviour::Echo),
            seen_cards: Mutex::new(Vec::new()),
        })
    }

    pub fn set_behaviour(&self, behaviour: ServiceBehaviour) {
        *self.behaviour.lock().unwrap() = behaviour;
    }

    pub fn seen_cards(&self) -> Vec<String> {
        self.seen_cards.lock().unwrap().clone()
    }

    pub fn handler(self: &Arc<Self>) -> Handler {
        let service = self.clone();
        Arc::new(move |action: &str, body: &str| service.handle(action, body))
    }

    fn handle(&self, _action: &str, body: &str) -> (u16, String) {
        let request = Element::parse(body).expect("service request parses");
        let signature_ok = self.federation.verify(&request);
        let card = soap::request_assertion(&request).expect("card embedded");
        let card_ok = self.federation.verify(&card);
        if !(signature_ok && card_ok) {
            let fault = FaultInfo::new("service", "wsse:InvalidSecurity", "security check failed");
            return (500, soap::fault_envelope(&fault).to_document());
        }
        if let Some(id) = card
            .children_named("AttributeStatement")
            .flat_map(|statement| statement.elements())
            .find(|attr| attr.attr("Name") == Some("sosi:IDCardID"))
            .and_then(|attr| attr.child_text("AttributeValue"))
        {
            self.seen_cards.lock().unwrap().push(id);
        }

        match self.behaviour.lock().unwrap().clone() {
            ServiceBehaviour::Echo => {
                let local = request
                    .path(&["Body"])
                    .and_then(Element::first_element)
                    .map(|first| first.local_name().to_string())
                    .expect("body content");
                let payload = request.extract_path(&["Body", &local]).expect("body content");
                (200, soap::reply_envelope(payload).to_document())
            }
            ServiceBehaviour::Fault(fault) => (500, soap::fault_envelope(&fault).to_document()),
            ServiceBehaviour::ServerError(text) => (500, text),
        }
    }
}

/// Token manager and transport wired to a fake STS and echo service.
pub struct Harness {
    pub pki: Pki,
    pub clock: Arc<ManualClock>,
    pub network: Arc<FakeNetwork>,
    pub sts: Arc<FakeSts>,
    pub service: Arc<EchoService>,
    pub tokens: Arc<TokenManager>,
    pub transport: SignedTransport,
    _dir: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_margin(Duration::ZERO)
    }

    pub fn with_margin(margin: Duration) -> Self {
        let pki = Pki::generate();
        let clock = ManualClock::starting_now();
        let network = FakeNetwork::new();
        let sts = FakeSts::new(&pki, clock.clone());
        let service = EchoService::new(&pki);
        network.route(STS_URL, sts.handler());
        network.route(SERVICE_URL, service.handler());

        let dir = tempfile::tempdir().expect("tempdir");
        let keystore = pki.write_system_keystore(dir.path());
        let credentials =
            KeyStore::load(&keystore, KEYSTORE_PASSWORD, KEYSTORE_ALIAS).expect("load keystore");

        let http = HttpExchange::new(Arc::new(NetworkConnector(network.clone())));
        let tokens = Arc::new(
            TokenManager::new(
                STS_URL,
                identity(),
                Arc::new(credentials),
                pki.context(FederationMode::Test),
                http.clone(),
            )
            .with_clock(clock.clone())
            .with_expiry_margin(margin),
        );
        let transport = SignedTransport::new(tokens.clone(), http);

        Self {
            pki,
            clock,
            network,
            sts,
            service,
            tokens,
            transport,
            _dir: dir,
        }
    }
}

pub fn replication_request(offset: &str) -> Element {
    Element::new("rep:ReplicationRequest")
        .with_attr("xmlns:rep", "http://nsi.dk/2011/10/21/StamdataKrs/")
        .with_child(Element::new("rep:register").with_text("doseringsforslag"))
        .with_child(Element::new("rep:datatype").with_text("dosageunit"))
        .with_child(Element::new("rep:version").with_text("1"))
        .with_child(Element::new("rep:offset").with_text(offset))
        .with_child(Element::new("rep:maxRecords").with_text("1"))
}
