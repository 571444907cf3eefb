//! Synthetic capture source
//!
//! Feeds pre-built frames through the same worker path as a real source.
//! Used by the test suites and by the status of dry-run invocations.

use std::collections::VecDeque;
use std::time::Duration;

use super::{CaptureError, PacketSource, RawFrame, SourceStats};

/// A queue of frames played back in order
pub struct SyntheticSource {
    frames: VecDeque<RawFrame>,
    /// When true, an exhausted source idles instead of reporting EOF
    keep_open: bool,
    stats: SourceStats,
}

impl SyntheticSource {
    pub fn new(frames: Vec<RawFrame>) -> Self {
        Self {
            frames: frames.into(),
            keep_open: false,
            stats: SourceStats::default(),
        }
    }

    pub fn keep_open(mut self) -> Self {
        self.keep_open = true;
        self
    }
}

impl PacketSource for SyntheticSource {
    fn next_packet(&mut self) -> Result<Option<RawFrame>, CaptureError> {
        match self.frames.pop_front() {
            Some(frame) => {
                self.stats.received += 1;
                Ok(Some(frame))
            }
            None if self.keep_open => {
                std::thread::sleep(Duration::from_millis(10));
                Ok(None)
            }
            None => Err(CaptureError::Eof),
        }
    }

    fn stats(&mut self) -> SourceStats {
        self.stats
    }
}
