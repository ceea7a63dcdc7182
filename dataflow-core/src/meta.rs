//! Message metadata propagation.
//!
//! Three attributes ride with every message: a unique id, the URN of the
//! originating source, and a timestamp. Between containers they travel as
//! HTTP headers, or as a JSON envelope over the FIFOs.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use http::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};

/// The header carrying a message's unique id.
pub const HEADER_ID: &str = "dataflow-id";
/// The header carrying a message's source URN.
pub const HEADER_SOURCE: &str = "dataflow-source";
/// The header carrying a message's RFC-3339 timestamp.
pub const HEADER_TIME: &str = "dataflow-time";

/// The metadata attached to a single in-flight message.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Meta {
    /// The URN of the source which produced this message.
    pub source: String,
    /// A unique id for this message, stable across redelivery.
    pub id: String,
    /// The event time of this message.
    pub time: DateTime<Utc>,
}

impl Meta {
    /// Create metadata for a new message from the given source.
    pub fn new(source: impl Into<String>, id: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self {
            source: source.into(),
            id: id.into(),
            time,
        }
    }

    /// Inject this metadata into the given header map.
    pub fn inject(&self, headers: &mut HeaderMap) -> Result<()> {
        headers.insert(HEADER_SOURCE, HeaderValue::from_str(&self.source).context("invalid source header value")?);
        headers.insert(HEADER_ID, HeaderValue::from_str(&self.id).context("invalid id header value")?);
        let time = self.time.to_rfc3339_opts(SecondsFormat::Secs, true);
        headers.insert(HEADER_TIME, HeaderValue::from_str(&time).context("invalid time header value")?);
        Ok(())
    }

    /// Extract metadata from the given header map.
    pub fn extract(headers: &HeaderMap) -> Result<Self> {
        let source = headers
            .get(HEADER_SOURCE)
            .and_then(|val| val.to_str().ok())
            .context("missing or invalid dataflow-source header")?
            .to_string();
        let id = headers
            .get(HEADER_ID)
            .and_then(|val| val.to_str().ok())
            .context("missing or invalid dataflow-id header")?
            .to_string();
        let time = headers
            .get(HEADER_TIME)
            .and_then(|val| val.to_str().ok())
            .and_then(|val| DateTime::parse_from_rfc3339(val).ok())
            .map(|val| val.with_timezone(&Utc))
            .context("missing or invalid dataflow-time header")?;
        Ok(Self { source, id, time })
    }
}

/// The JSON envelope used to carry a message and its metadata over a FIFO.
///
/// The payload is base64 encoded so that the envelope remains a single
/// newline-delimited UTF-8 line regardless of payload content.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Envelope {
    #[serde(flatten)]
    pub meta: Meta,
    pub data: String,
}

impl Envelope {
    /// Wrap the given payload and metadata.
    pub fn new(meta: Meta, data: &[u8]) -> Self {
        Self {
            meta,
            data: base64::encode(data),
        }
    }

    /// Unwrap the payload.
    pub fn data(&self) -> Result<Vec<u8>> {
        base64::decode(&self.data).context("invalid base64 payload in envelope")
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeZone;

    fn meta_fixture() -> Meta {
        Meta::new("urn:dataflow:kafka:broker/topic", "0-42", Utc.ymd(2021, 9, 1).and_hms(12, 0, 0))
    }

    #[test]
    fn header_round_trip() -> Result<()> {
        let meta = meta_fixture();
        let mut headers = HeaderMap::new();
        meta.inject(&mut headers)?;
        assert_eq!(headers.get(HEADER_TIME).and_then(|v| v.to_str().ok()), Some("2021-09-01T12:00:00Z"));
        let extracted = Meta::extract(&headers)?;
        assert_eq!(extracted, meta);
        Ok(())
    }

    #[test]
    fn extract_requires_all_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_ID, HeaderValue::from_static("0-42"));
        assert!(Meta::extract(&headers).is_err());
    }

    #[test]
    fn envelope_round_trip() -> Result<()> {
        let envelope = Envelope::new(meta_fixture(), b"hello\nworld");
        let line = serde_json::to_string(&envelope)?;
        assert!(!line.contains('\n'), "envelope must serialize to a single line: {:?}", line);
        let parsed: Envelope = serde_json::from_str(&line)?;
        assert_eq!(parsed.meta, envelope.meta);
        assert_eq!(parsed.data()?, b"hello\nworld".to_vec());
        Ok(())
    }
}
