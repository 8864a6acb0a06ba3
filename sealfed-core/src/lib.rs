//! ID-card lifecycle and signed SOAP exchange against a federated security token
//! service.

pub mod certificate;
pub mod clock;
pub mod dsig;
pub mod errors;
pub mod federation;
pub mod http;
pub mod idcard;
pub mod keystore;
mod rt;
pub mod soap;
pub mod token;
pub mod transport;
pub mod xml;

pub use certificate::{Certificate, KeyAlgorithm};
pub use clock::{Clock, SystemClock};
pub use errors::{Error, FaultInfo, Result, TransportError};
pub use federation::{
    FederationContext, FederationMode, TrustRoots, VerifiedSigner, install_crypto_provider,
};
pub use http::{
    BodyStream, Connection, Connector, HttpExchange, HttpReply, HttpSettings, ReqwestConnector,
};
pub use idcard::{AuthenticationLevel, IdCardTemplate, IdentityAssertion, SystemIdentity};
pub use keystore::{CredentialPair, KeyStore, KeyStoreBuilder};
pub use soap::ExchangeResult;
pub use token::TokenManager;
pub use transport::SignedTransport;
pub use xml::Element;
