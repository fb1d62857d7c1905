use std::fmt;

/// Kind of media carried by an Adaptation.
///
/// Audio and video are pushed to decoder-attached ("native") sinks, which can only
/// be created once per content. Text and image tracks use custom sinks handled by
/// the player itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TrackType {
    Audio,
    Video,
    Text,
    Image,
}

impl TrackType {
    pub const ALL: [TrackType; 4] = [
        TrackType::Audio,
        TrackType::Video,
        TrackType::Text,
        TrackType::Image,
    ];

    /// Whether data for this track goes to a decoder-attached sink.
    #[inline]
    pub fn is_native(self) -> bool {
        matches!(self, TrackType::Audio | TrackType::Video)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrackType::Audio => "audio",
            TrackType::Video => "video",
            TrackType::Text => "text",
            TrackType::Image => "image",
        }
    }
}

impl fmt::Display for TrackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TrackType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "audio" => Ok(TrackType::Audio),
            "video" => Ok(TrackType::Video),
            "text" => Ok(TrackType::Text),
            "image" => Ok(TrackType::Image),
            other => Err(format!("unknown track type `{other}`")),
        }
    }
}
