//! Shared fault types for the interception pipeline.
//!
//! - `HealCategory`: closed set of fault categories the healer recognizes
//! - `Fault`: a raw fault as captured at the failure site, before admission
//! - `InterceptedFault`: one admitted record, also the broadcast event payload

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::any::Any;

// ============================================================================
// Heal Categories
// ============================================================================

/// Fault categories with a known automated recovery.
///
/// The set is closed: classification either lands in one of these or the
/// fault stays unhealed and is contained by fallback substitution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HealCategory {
    /// Unwrapped absent value (`Option::unwrap` on `None` and friends)
    NullCheck,
    /// State mutation attempted on a component that already tore down
    MutateAfterTeardown,
    /// Lookup through a component handle that is no longer attached
    StaleComponent,
    /// Content exceeded its layout bounds during rendering
    RenderOverflow,
}

impl HealCategory {
    /// All categories, in classification-table order.
    pub const ALL: [Self; 4] = [
        Self::NullCheck,
        Self::MutateAfterTeardown,
        Self::StaleComponent,
        Self::RenderOverflow,
    ];

    /// Stable kebab-case label (used in logs and serialized snapshots).
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NullCheck => "null-check",
            Self::MutateAfterTeardown => "mutate-after-teardown",
            Self::StaleComponent => "stale-component",
            Self::RenderOverflow => "render-overflow",
        }
    }

    /// Title-cased name for human-readable reports.
    pub const fn title(self) -> &'static str {
        match self {
            Self::NullCheck => "Null Check",
            Self::MutateAfterTeardown => "Mutate After Teardown",
            Self::StaleComponent => "Stale Component",
            Self::RenderOverflow => "Render Overflow",
        }
    }
}

impl std::fmt::Display for HealCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Inbound Fault
// ============================================================================

/// A raw fault as captured at the failure site.
///
/// `kind` is a coarse identity tag used for duplicate fingerprinting: the
/// concrete error type name when the type is known statically, the first
/// message line for dynamic error values, or `"panic"` for unwind payloads.
#[derive(Debug, Clone)]
pub struct Fault {
    /// Coarse identity tag of the originating error value
    pub kind: String,
    /// Human-readable error message
    pub message: String,
    /// Capture context: error cause chain, panic backtrace, or guard site
    /// descriptor, one entry per line (outermost first)
    pub trace: String,
    /// Free-text origin label (component name, call site)
    pub origin: Option<String>,
}

impl Fault {
    /// Build a fault from raw parts.
    pub fn new(
        kind: impl Into<String>,
        message: impl Into<String>,
        trace: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            trace: trace.into(),
            origin: None,
        }
    }

    /// Attach an origin label.
    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Capture a statically typed error: the type name becomes the identity
    /// tag, the source chain becomes the trace.
    pub fn from_error<E: std::error::Error>(err: &E) -> Self {
        let mut lines = vec![err.to_string()];
        let mut source = err.source();
        while let Some(cause) = source {
            lines.push(cause.to_string());
            source = cause.source();
        }
        Self {
            kind: std::any::type_name::<E>().to_string(),
            message: err.to_string(),
            trace: lines.join("\n"),
            origin: None,
        }
    }

    /// Capture a dynamic error value: the first message line becomes the
    /// identity tag, the cause chain becomes the trace.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let message = err.to_string();
        let kind = message.lines().next().unwrap_or_default().to_string();
        let trace = err
            .chain()
            .map(std::string::ToString::to_string)
            .collect::<Vec<_>>()
            .join("\n");
        Self {
            kind,
            message,
            trace,
            origin: None,
        }
    }

    /// Capture an unwind payload caught at a guard boundary.
    pub fn from_panic_payload(payload: &(dyn Any + Send), context: impl Into<String>) -> Self {
        Self {
            kind: "panic".to_string(),
            message: panic_message(payload),
            trace: context.into(),
            origin: None,
        }
    }
}

/// Extract the human-readable message from an unwind payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "opaque panic payload".to_string()
    }
}

// ============================================================================
// Admitted Record
// ============================================================================

/// One admitted fault record.
///
/// Immutable once created: the heal decision is made before the record is
/// appended to the log or published, and never revisited.
#[derive(Debug, Clone, Serialize)]
pub struct InterceptedFault {
    /// Coarse identity tag of the originating error value
    pub kind: String,
    /// Human-readable error message
    pub message: String,
    /// Capture context (see [`Fault::trace`])
    pub trace: String,
    /// Free-text origin label
    pub origin: Option<String>,
    /// Capture timestamp
    pub timestamp: DateTime<Utc>,
    /// Matched category, if any rule recognized the message
    pub category: Option<HealCategory>,
    /// Whether the healing action ran
    pub healed: bool,
}

impl InterceptedFault {
    /// Short one-line description for logs.
    pub fn summary(&self) -> String {
        let status = if self.healed { "healed" } else { "unhealed" };
        match self.category {
            Some(cat) => format!("[{status}] {} — {}", cat, self.message),
            None => format!("[{status}] {}", self.message),
        }
    }
}

impl std::fmt::Display for InterceptedFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.summary())
    }
}
