//! System-wide default constants.
//!
//! Centralises the healing policy defaults so every tunable has one home.
//! All of these can be overridden via `selfmend.toml` (see [`HealConfig`]).
//!
//! [`HealConfig`]: super::HealConfig

// ============================================================================
// Duplicate Suppression
// ============================================================================

/// Window during which a repeated fault fingerprint is dropped (seconds).
///
/// Long enough to absorb per-frame repeat storms, short enough that a
/// genuinely recurring fault resurfaces while someone is still looking.
pub const SUPPRESSION_WINDOW_SECS: u64 = 5;

/// Leading trace lines contributing to the duplicate fingerprint.
pub const FINGERPRINT_TRACE_LINES: usize = 3;

// ============================================================================
// Retry Policy
// ============================================================================

/// Default retry attempts after the initial call in `guarded_retryable`.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Base delay between retry attempts (milliseconds).
///
/// `delay = DEFAULT_RETRY_DELAY_MS * attempt_number` (linear backoff).
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;

// ============================================================================
// Fault Channel
// ============================================================================

/// Broadcast channel capacity for fault publications.
///
/// Slow subscribers past this depth observe a `Lagged` error rather than
/// backpressuring admission.
pub const FAULT_CHANNEL_CAPACITY: usize = 256;
