// Gemini mapper module
// Marker-based segment splitting and envelope reconstruction

pub mod envelope;
pub mod history;
pub mod splitter;

pub use envelope::{extract_candidate_text, EnvelopeTemplate};
pub use splitter::{Segment, SegmentSplitter, StreamMode};
