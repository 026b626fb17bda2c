//! Backend stream decoding and delivery rate limiting.

pub mod coalesce;
pub mod decoder;

// Re-export main types
pub use coalesce::{CoalescingBuffer, ProgressThrottle};
pub use decoder::{decode_frames, Decoded, FrameDecoder};
