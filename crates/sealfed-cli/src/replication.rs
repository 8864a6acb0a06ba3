//! Replication requests against the registry copy service.
//!
//! A page is an Atom feed; the id of its last entry ends with the offset to send
//! with the next request.

use anyhow::{Context, Result, anyhow};
use sealfed_core::{Element, SignedTransport};
use tracing::debug;

pub const REPLICATION_NS: &str = "http://nsi.dk/2011/10/21/StamdataKrs/";
pub const INITIAL_OFFSET: &str = "00000000000000000000";
pub const REQUEST_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationRequest {
    pub register: String,
    pub datatype: String,
    pub offset: Option<String>,
    pub version: u32,
    pub max_records: u32,
}

impl ReplicationRequest {
    pub fn new(register: impl Into<String>, datatype: impl Into<String>) -> Self {
        Self {
            register: register.into(),
            datatype: datatype.into(),
            offset: None,
            version: REQUEST_VERSION,
            max_records: 1,
        }
    }

    pub fn with_offset(mut self, offset: Option<String>) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_max_records(mut self, max_records: u32) -> Self {
        self.max_records = max_records;
        self
    }

    pub fn to_element(&self) -> Element {
        let field = |name: &str, value: String| Element::new(format!("rep:{name}")).with_text(value);
        Element::new("rep:ReplicationRequest")
            .with_attr("xmlns:rep", REPLICATION_NS)
            .with_child(field("register", self.register.clone()))
            .with_child(field("datatype", self.datatype.clone()))
            .with_child(field("version", self.version.to_string()))
            .with_child(field(
                "offset",
                self.offset.clone().unwrap_or_else(|| INITIAL_OFFSET.to_string()),
            ))
            .with_child(field("maxRecords", self.max_records.to_string()))
    }
}

/// Offset token carried by the last entry of `feed`.
pub fn last_offset(feed: &Element) -> Option<String> {
    let last = feed.elements().last()?;
    if last.local_name() != "entry" {
        return None;
    }
    let id = last.child_text("id")?;
    let token = id.rsplit('/').next().unwrap_or_default();
    (!token.is_empty()).then(|| token.to_string())
}

#[derive(Debug, Clone)]
pub struct ReplicationPage {
    pub feed: Element,
    pub next_offset: Option<String>,
}

impl ReplicationPage {
    /// Reads the feed out of a `ReplicationResponse` element.
    pub fn from_response(response: &Element) -> Result<Self> {
        let first = response
            .first_element()
            .ok_or_else(|| anyhow!("replication response holds no feed"))?;
        let feed = response
            .extract_path(&[first.local_name()])
            .ok_or_else(|| anyhow!("replication response holds no feed"))?;
        let next_offset = last_offset(&feed);
        Ok(Self { feed, next_offset })
    }
}

pub struct ReplicationClient {
    transport: SignedTransport,
    url: String,
    max_records: u32,
}

impl ReplicationClient {
    pub fn new(transport: SignedTransport, url: impl Into<String>) -> Self {
        Self {
            transport,
            url: url.into(),
            max_records: 1,
        }
    }

    pub fn with_max_records(mut self, max_records: u32) -> Self {
        self.max_records = max_records;
        self
    }

    pub fn fetch_page(
        &self,
        register: &str,
        datatype: &str,
        offset: Option<&str>,
    ) -> Result<ReplicationPage> {
        let request = ReplicationRequest::new(register, datatype)
            .with_offset(offset.map(str::to_string))
            .with_max_records(self.max_records);
        debug!(register, datatype, offset = ?request.offset, "requesting replication page");
        let response = self
            .transport
            .send_service_request(&self.url, &request.to_element())
            .with_context(|| format!("replication request for {register}/{datatype} failed"))?;
        ReplicationPage::from_response(&response)
    }
}
