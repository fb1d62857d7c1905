//! # Media Types
//!
//! Shared media domain types used by the buffering engine: the parsed manifest
//! model (Periods, Adaptations, Representations), segment descriptors and the
//! per-Representation segment indexes.
//!
//! Manifest-format parsing (DASH, HLS, Smooth) is not part of this crate; parsers
//! produce these types.

mod index;
mod manifest;
mod segment;
mod track;

pub use index::{OutOfIndexError, SegmentIndex, SegmentTemplate};
pub use manifest::{
    Adaptation, Manifest, Period, Representation, Resolution, SharedManifest, SharedSegmentIndex,
};
pub use segment::{ByteRange, Segment};
pub use track::TrackType;
