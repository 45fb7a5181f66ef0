//! Tracing and logging setup shared by the courier binaries.

/// Initialize process-wide tracing/logging.
///
/// The output format comes from `COURIER_LOG_FORMAT` (`json` by default).
/// Safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init();
}

/// Initialize with an explicit output format.
pub fn init_with(format: LogFormat) {
    tracing::init_with(format);
}

/// Tracing configuration (filters, layers).
pub mod tracing;

pub use self::tracing::{LogFormat, ParseLogFormatError};
