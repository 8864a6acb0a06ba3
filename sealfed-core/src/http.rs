use reqwest::{
    Client, Response,
    header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue},
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::errors::TransportError;
use crate::rt;

pub const XML_CONTENT_TYPE: &str = "text/xml; encoding=utf-8";
pub const SOAP_ACTION_HEADER: &str = "SOAPAction";

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Connection options surfaced through configuration.
#[derive(Clone, Debug)]
pub struct HttpSettings {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub proxy: Option<Url>,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            proxy: None,
        }
    }
}

/// Builder for [`Http`] clients that wraps `reqwest::ClientBuilder` options we
/// commonly surface to callers.
#[derive(Clone, Debug, Default)]
pub struct HttpBuilder {
    timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
    proxy: Option<Url>,
}

impl HttpBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    pub fn connect_timeout(mut self, duration: Duration) -> Self {
        self.connect_timeout = Some(duration);
        self
    }

    pub fn proxy(mut self, url: Option<Url>) -> Self {
        self.proxy = url;
        self
    }

    pub fn build(self) -> Result<Http, TransportError> {
        let mut builder = Client::builder().use_rustls_tls();
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(timeout) = self.connect_timeout {
            builder = builder.connect_timeout(timeout);
        }
        if let Some(proxy_url) = self.proxy {
            let proxy = reqwest::Proxy::all(proxy_url.as_str()).map_err(|err| {
                TransportError::Connection {
                    url: proxy_url.to_string(),
                    message: format!("invalid proxy url: {err}"),
                }
            })?;
            builder = builder.proxy(proxy);
        }
        Http::from_builder(builder)
    }
}

/// Thin synchronous facade over the async reqwest client.
#[derive(Clone)]
pub struct Http {
    client: Client,
}

impl Http {
    /// Builds a client from the configured timeouts and proxy.
    pub fn new(settings: &HttpSettings) -> Result<Self, TransportError> {
        Self::builder()
            .timeout(settings.request_timeout)
            .connect_timeout(settings.connect_timeout)
            .proxy(settings.proxy.clone())
            .build()
    }

    /// Builds a client from a custom reqwest builder.
    pub fn from_builder(builder: reqwest::ClientBuilder) -> Result<Self, TransportError> {
        let client = builder.build().map_err(|err| TransportError::Connection {
            url: String::new(),
            message: format!("failed to build HTTP client: {err}"),
        })?;
        Ok(Self { client })
    }

    pub fn builder() -> HttpBuilder {
        HttpBuilder::new()
    }

    pub fn post(&self, url: &Url) -> HttpRequest {
        HttpRequest {
            builder: self.client.post(url.clone()),
        }
    }
}

pub struct HttpRequest {
    builder: reqwest::RequestBuilder,
}

impl HttpRequest {
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.builder = self.builder.headers(headers);
        self
    }

    pub fn body(mut self, value: impl Into<reqwest::Body>) -> Self {
        self.builder = self.builder.body(value);
        self
    }

    pub fn send(self) -> Result<HttpResponse, reqwest::Error> {
        let builder = self.builder;
        rt::sync_await(async move {
            let response = builder.send().await?;
            Ok(HttpResponse { inner: response })
        })
    }
}

pub struct HttpResponse {
    inner: Response,
}

impl HttpResponse {
    pub fn status(&self) -> reqwest::StatusCode {
        self.inner.status()
    }

    pub fn text(self) -> Result<String, reqwest::Error> {
        let inner = self.inner;
        rt::sync_await(async move { inner.text().await })
    }
}

/// Which half of the response the body is read from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodyStream {
    Success,
    Error,
}

/// One open HTTP exchange. Dropping it releases the connection and its streams.
pub trait Connection {
    /// Writes the request and returns the response status code.
    fn send(&mut self, headers: &HeaderMap, payload: Vec<u8>) -> Result<u16, TransportError>;

    /// Reads the whole response body as UTF-8 text.
    fn read_body(&mut self, stream: BodyStream) -> Result<String, TransportError>;
}

/// Opens connections for [`HttpExchange`].
pub trait Connector: Send + Sync {
    fn open(&self, url: &Url) -> Result<Box<dyn Connection>, TransportError>;
}

impl<T> Connector for Arc<T>
where
    T: Connector + ?Sized,
{
    fn open(&self, url: &Url) -> Result<Box<dyn Connection>, TransportError> {
        (**self).open(url)
    }
}

/// [`Connector`] backed by the shared reqwest client.
#[derive(Clone)]
pub struct ReqwestConnector {
    http: Http,
}

impl ReqwestConnector {
    pub fn new(settings: &HttpSettings) -> Result<Self, TransportError> {
        Ok(Self {
            http: Http::new(settings)?,
        })
    }
}

impl Connector for ReqwestConnector {
    fn open(&self, url: &Url) -> Result<Box<dyn Connection>, TransportError> {
        Ok(Box::new(ReqwestConnection {
            http: self.http.clone(),
            url: url.clone(),
            response: None,
        }))
    }
}

struct ReqwestConnection {
    http: Http,
    url: Url,
    response: Option<HttpResponse>,
}

impl ReqwestConnection {
    fn failure(&self, err: reqwest::Error) -> TransportError {
        TransportError::Connection {
            url: self.url.to_string(),
            message: err.to_string(),
        }
    }
}

impl Connection for ReqwestConnection {
    fn send(&mut self, headers: &HeaderMap, payload: Vec<u8>) -> Result<u16, TransportError> {
        let response = self
            .http
            .post(&self.url)
            .headers(headers.clone())
            .body(payload)
            .send()
            .map_err(|err| self.failure(err))?;
        let status = response.status().as_u16();
        self.response = Some(response);
        Ok(status)
    }

    fn read_body(&mut self, _stream: BodyStream) -> Result<String, TransportError> {
        // reqwest exposes success and error bodies through the same stream.
        let response = self.response.take().ok_or_else(|| TransportError::Connection {
            url: self.url.to_string(),
            message: "response body requested before the request was sent".into(),
        })?;
        response.text().map_err(|err| self.failure(err))
    }
}

/// Status code plus the body read from the matching stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub body: String,
}

impl HttpReply {
    pub fn is_success(&self) -> bool {
        self.status == 200
    }
}

/// Stateless SOAP-over-HTTP POST helper.
#[derive(Clone)]
pub struct HttpExchange {
    connector: Arc<dyn Connector>,
}

impl HttpExchange {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector }
    }

    /// Exchange backed by a reqwest client built from `settings`.
    pub fn from_settings(settings: &HttpSettings) -> Result<Self, TransportError> {
        Ok(Self::new(Arc::new(ReqwestConnector::new(settings)?)))
    }

    /// POST `payload` to `url` with the given SOAP action label.
    ///
    /// Status 200 is a success. Status 500 is handed back to the caller, since the
    /// body usually holds a SOAP fault, unless `fail_on_server_error` is set. Any
    /// other status is an [`TransportError::UnexpectedStatus`].
    pub fn post(
        &self,
        url: &str,
        action: &str,
        payload: &str,
        fail_on_server_error: bool,
    ) -> Result<HttpReply, TransportError> {
        let target = Url::parse(url).map_err(|err| TransportError::Connection {
            url: url.to_string(),
            message: format!("invalid url: {err}"),
        })?;
        let headers = soap_headers(url, action)?;

        let mut connection = self.connector.open(&target)?;
        let status = connection.send(&headers, payload.as_bytes().to_vec())?;
        let stream = if status == 200 {
            BodyStream::Success
        } else {
            BodyStream::Error
        };
        let body = connection.read_body(stream)?;
        drop(connection);

        debug!(%url, action, status, bytes = body.len(), "soap exchange finished");
        if status != 200 && (status != 500 || fail_on_server_error) {
            warn!(%url, status, "unexpected http status");
            return Err(TransportError::UnexpectedStatus {
                code: status,
                url: url.to_string(),
            });
        }
        Ok(HttpReply { status, body })
    }
}

fn soap_headers(url: &str, action: &str) -> Result<HeaderMap, TransportError> {
    let action_value =
        HeaderValue::from_str(&format!("\"{action}\"")).map_err(|_| TransportError::Connection {
            url: url.to_string(),
            message: format!("action label {action:?} is not a valid header value"),
        })?;
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(XML_CONTENT_TYPE));
    headers.insert(HeaderName::from_static("soapaction"), action_value);
    Ok(headers)
}
