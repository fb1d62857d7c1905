/// Inclusive byte range of a segment inside a larger resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Value for an HTTP `Range` header.
    pub fn to_header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// A discrete, independently fetchable unit of media data.
///
/// `time` and `duration` are expressed in `timescale` units. Initialization
/// segments carry no timing information.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Segment {
    pub id: String,
    pub time: u64,
    pub duration: u64,
    pub timescale: u32,
    pub byte_range: Option<ByteRange>,
    pub is_init: bool,
    pub url: Option<String>,
}

impl Segment {
    pub fn media(id: impl Into<String>, time: u64, duration: u64, timescale: u32) -> Self {
        Self {
            id: id.into(),
            time,
            duration,
            timescale,
            byte_range: None,
            is_init: false,
            url: None,
        }
    }

    pub fn init(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            time: 0,
            duration: 0,
            timescale: 1,
            byte_range: None,
            is_init: true,
            url: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_byte_range(mut self, range: ByteRange) -> Self {
        self.byte_range = Some(range);
        self
    }

    /// Whether the segment carries a time range (init segments do not).
    #[inline]
    pub fn has_timing(&self) -> bool {
        !self.is_init && self.duration > 0
    }

    /// End of the segment in timescale units.
    #[inline]
    pub fn end(&self) -> u64 {
        self.time.saturating_add(self.duration)
    }

    #[inline]
    pub fn start_secs(&self) -> f64 {
        self.time as f64 / self.scale()
    }

    #[inline]
    pub fn end_secs(&self) -> f64 {
        self.end() as f64 / self.scale()
    }

    #[inline]
    pub fn duration_secs(&self) -> f64 {
        self.duration as f64 / self.scale()
    }

    /// Returns a copy expressed in another timescale.
    pub fn rescaled(&self, timescale: u32) -> Segment {
        if timescale == 0 || timescale == self.timescale {
            return self.clone();
        }
        let mut seg = self.clone();
        seg.time = rescale(self.time, self.timescale, timescale);
        seg.duration = rescale(self.duration, self.timescale, timescale);
        seg.timescale = timescale;
        seg
    }

    fn scale(&self) -> f64 {
        f64::from(self.timescale.max(1))
    }
}

pub(crate) fn rescale(value: u64, from: u32, to: u32) -> u64 {
    let from = u128::from(from.max(1));
    let scaled = u128::from(value) * u128::from(to) / from;
    u64::try_from(scaled).unwrap_or(u64::MAX)
}
