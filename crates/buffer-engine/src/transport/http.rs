// HTTP segment loader backed by reqwest.
//
// Segment payloads are passed through untouched: timing comes from the segment
// descriptor, as demuxing is left to the sink.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use tracing::{debug, trace};
use url::Url;

use super::{ParsedSegment, SegmentContext, SegmentTransport};
use crate::error::TransportError;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

pub struct HttpSegmentLoader {
    client: Client,
    base_url: Option<Url>,
    timeout: Duration,
}

impl HttpSegmentLoader {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            base_url: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Relative segment URLs are resolved against `base_url`.
    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = Some(base_url);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn resolve(&self, context: &SegmentContext) -> Result<Url, TransportError> {
        let segment = &context.segment;
        let Some(raw) = segment.url.as_deref() else {
            return Err(TransportError::invalid_request(format!(
                "segment `{}` of representation `{}` has no URL",
                segment.id, context.representation.id
            )));
        };
        let resolved = match &self.base_url {
            Some(base) => base.join(raw),
            None => Url::parse(raw),
        };
        resolved.map_err(|e| TransportError::invalid_request(format!("invalid segment URL `{raw}`: {e}")))
    }
}

#[async_trait]
impl SegmentTransport for HttpSegmentLoader {
    async fn load_segment(&self, context: &SegmentContext) -> Result<Bytes, TransportError> {
        let url = self.resolve(context)?;
        let mut request = self.client.get(url.clone()).timeout(self.timeout);
        if let Some(range) = context.segment.byte_range {
            request = request.header(reqwest::header::RANGE, range.to_header_value());
        }

        let response = request.send().await?;
        let status = response.status();
        trace!(url = %url, status = status.as_u16(), version = ?response.version(), "Segment response");
        if !status.is_success() {
            return Err(TransportError::http(status.as_u16(), url.as_str()));
        }
        let data = response.bytes().await?;
        debug!(url = %url, bytes = data.len(), "Segment downloaded");
        Ok(data)
    }

    async fn parse_segment(&self, data: Bytes, context: &SegmentContext) -> Result<ParsedSegment, TransportError> {
        Ok(ParsedSegment::passthrough(data, &context.segment))
    }
}
