//! Selfmend: runtime fault interception and self-healing for event-driven component UIs.
//!
//! Faults raised by component operations are caught at guard boundaries,
//! classified against a table of recognizable failure patterns, healed where
//! a pattern matches, deduplicated inside a suppression window, and
//! republished on a broadcast channel for observers.
//!
//! ## Architecture
//!
//! - **Heal Registry**: counters of successfully healed fault categories
//! - **Fault Interceptor**: intake pipeline — fingerprint, suppress
//!   duplicates, classify, heal, log, publish
//! - **Protection Scope**: per-component adapter wrapping sync/async/render
//!   operations with fallback substitution, a result cache, and
//!   lifetime-bound timers and subscriptions

pub mod config;
pub mod interceptor;
pub mod registry;
pub mod scope;
pub mod types;

// Re-export the healing policy
pub use config::HealConfig;

// Re-export the intake pipeline
pub use interceptor::{FaultInterceptor, InterceptorStats};

// Re-export registry bookkeeping
pub use registry::{HealRegistry, HealSnapshot};

// Re-export the per-component scope
pub use scope::{ProtectionScope, RenderFallback, RetryPolicy, ScopeStats};

// Re-export shared fault types
pub use types::{Fault, HealCategory, InterceptedFault};
