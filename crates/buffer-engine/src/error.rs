use media_types::{OutOfIndexError, TrackType};

/// HTTP status returned by servers when a live request targets stale content.
pub const PRECONDITION_FAILED: u16 = 412;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("request failed with HTTP {status} for {url}")]
    Http { status: u16, url: String },

    #[error("network error: {reason}")]
    Network { reason: String },

    #[error("network unreachable: {reason}")]
    Offline { reason: String },

    #[error("request timed out: {reason}")]
    Timeout { reason: String },

    #[error("failed to parse segment `{segment}`: {reason}")]
    Parse { segment: String, reason: String },

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("request cancelled")]
    Cancelled,
}

impl TransportError {
    pub fn http(status: u16, url: impl Into<String>) -> Self {
        Self::Http {
            status,
            url: url.into(),
        }
    }

    pub fn network(reason: impl Into<String>) -> Self {
        Self::Network {
            reason: reason.into(),
        }
    }

    pub fn offline(reason: impl Into<String>) -> Self {
        Self::Offline {
            reason: reason.into(),
        }
    }

    pub fn timeout(reason: impl Into<String>) -> Self {
        Self::Timeout {
            reason: reason.into(),
        }
    }

    pub fn parse(segment: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Parse {
            segment: segment.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }

    /// Stale live request, recovered by restarting the buffer after a backoff.
    pub fn is_precondition_failed(&self) -> bool {
        matches!(self, Self::Http { status, .. } if *status == PRECONDITION_FAILED)
    }

    pub fn is_offline(&self) -> bool {
        matches!(self, Self::Offline { .. })
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http { status, .. } => {
                *status >= 500 || matches!(*status, 404 | 415 | 429)
            }
            Self::Network { .. } | Self::Offline { .. } | Self::Timeout { .. } => true,
            Self::Parse { .. } | Self::InvalidRequest { .. } | Self::Cancelled => false,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        let url = err.url().map(|u| u.to_string()).unwrap_or_default();
        if let Some(status) = err.status() {
            Self::http(status.as_u16(), url)
        } else if err.is_timeout() {
            Self::timeout(err.to_string())
        } else if err.is_connect() {
            Self::offline(err.to_string())
        } else if err.is_builder() {
            Self::invalid_request(err.to_string())
        } else {
            Self::network(err.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SinkError {
    #[error("sink quota exceeded")]
    QuotaExceeded,

    #[error("sink operation failed: {reason}")]
    Generic { reason: String },

    #[error("sink is closed")]
    Closed,
}

impl SinkError {
    pub fn generic(reason: impl Into<String>) -> Self {
        Self::Generic {
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum BufferError {
    #[error("{track_type} segment request failed: {source}")]
    Transport {
        track_type: TrackType,
        #[source]
        source: TransportError,
    },

    #[error("{track_type} sink error: {source}")]
    Sink {
        track_type: TrackType,
        #[source]
        source: SinkError,
    },

    #[error("{track_type} buffer is full and garbage collection could not free enough space")]
    BufferFull { track_type: TrackType },

    #[error(transparent)]
    OutOfIndex(#[from] OutOfIndexError),

    #[error("no {track_type} representation in adaptation `{adaptation}` satisfies the current constraints")]
    NoValidRepresentation {
        track_type: TrackType,
        adaptation: String,
    },

    #[error("a {track_type} sink already exists")]
    DuplicateSink { track_type: TrackType },

    #[error("no period found for playback time {time:.3}s")]
    MissingPeriod { time: f64 },

    #[error("manifest refresh failed: {source}")]
    ManifestRefresh {
        #[source]
        source: TransportError,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl BufferError {
    pub fn transport(track_type: TrackType, source: TransportError) -> Self {
        Self::Transport { track_type, source }
    }

    pub fn sink(track_type: TrackType, source: SinkError) -> Self {
        Self::Sink { track_type, source }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    pub fn is_precondition_failed(&self) -> bool {
        matches!(self, Self::Transport { source, .. } if source.is_precondition_failed())
    }

    /// Whether this error must stop playback when raised by a `track_type` pipeline.
    ///
    /// Custom (text/image) pipelines are isolated, and a full buffer only stops the
    /// pipeline that hit it.
    pub fn is_fatal_for(&self, track_type: TrackType) -> bool {
        match self {
            Self::Cancelled | Self::BufferFull { .. } | Self::NoValidRepresentation { .. } => false,
            Self::DuplicateSink { .. } | Self::MissingPeriod { .. } | Self::Internal { .. } => true,
            _ => track_type.is_native(),
        }
    }
}
