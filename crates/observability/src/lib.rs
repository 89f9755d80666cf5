//! Tracing/logging setup shared by StockPro binaries.

/// Initialize process-wide observability (tracing/logging).
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init(tracing::LogFormat::Json);
}

/// Initialize with human-readable output (interactive terminals).
pub fn init_pretty() {
    tracing::init(tracing::LogFormat::Pretty);
}

/// Tracing configuration (filters, layers).
pub mod tracing;
