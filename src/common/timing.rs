// src/common/timing.rs

use core::time::Duration;

use super::frame::MAX_FRAME_LEN;

// === Resynchronization ===

/// Bytes the resynchronizer may discard before declaring the stream
/// desynchronized. One maximum-length frame, i.e. one bus turnaround.
pub const DEFAULT_RESYNC_WINDOW: usize = MAX_FRAME_LEN;

// === Monitor ===

/// Fields older than this are omitted from metrics output.
pub const DEFAULT_STALENESS: Duration = Duration::from_secs(300);
/// Pause before a closed transport is reopened by the sniff tool.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(1);
/// Size of a single transport read.
pub const READ_CHUNK: usize = 512;
