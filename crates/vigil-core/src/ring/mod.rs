//! The rotating in-memory capture buffer.
//!
//! Two to three file-backed [`segment::Segment`]s form a ring owned by
//! the [`MemoryDumper`]. The producer appends serialized event frames to
//! the Active segment; retrospective [`job::CaptureJob`]s scan sealed
//! segments from offset zero and then follow the live tail for the
//! future part of their window.

pub mod dumper;
pub mod job;
pub mod segment;

pub use dumper::{CaptureError, DumperError, MemoryDumper, MEM_TEST_FILE, SEGMENT_PREFIX};
pub use job::{CaptureJob, CaptureSpec, JobState};
pub use segment::{Segment, SegmentState};
