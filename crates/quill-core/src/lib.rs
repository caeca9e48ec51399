//! Foundational low-level utilities shared across Quill crates.
//!
//! Provides atomic file writes, rotating NDJSON logs, time helpers, and the
//! injectable clock used by cache bucketing and session idle tracking.

pub mod atomic_io;
pub mod clock;
pub mod ndjson_log;
pub mod sync_utils;
pub mod time_utils;

pub use atomic_io::{remove_file_if_exists, write_text_atomic};
pub use clock::{Clock, ManualClock, SystemClock};
pub use ndjson_log::{append_ndjson_line, rotated_ndjson_path, NdjsonRotationPolicy};
pub use sync_utils::lock_unpoisoned;
pub use time_utils::{current_unix_timestamp_ms, unix_ms_from_datetime};
