//! Ordered fault classification rules.
//!
//! Each rule pairs a recognizable message substring with the category whose
//! healing action (registry bookkeeping) applies. Evaluation is first match
//! wins, top to bottom, case-sensitive — the trigger strings are a contract
//! with the surrounding component framework's error messages.

use crate::types::HealCategory;

/// One classification rule: message substring → heal category.
#[derive(Debug, Clone, Copy)]
pub struct ClassifyRule {
    /// Case-sensitive substring the framework emits for this failure class
    pub pattern: &'static str,
    /// Category whose healing action applies on a match
    pub category: HealCategory,
}

/// The classification table, in evaluation order.
pub const RULES: [ClassifyRule; 4] = [
    ClassifyRule {
        pattern: "called `Option::unwrap()` on a `None` value",
        category: HealCategory::NullCheck,
    },
    ClassifyRule {
        pattern: "mutation on unmounted component",
        category: HealCategory::MutateAfterTeardown,
    },
    ClassifyRule {
        pattern: "stale component handle",
        category: HealCategory::StaleComponent,
    },
    ClassifyRule {
        pattern: "overflowed its layout bounds",
        category: HealCategory::RenderOverflow,
    },
];

/// Classify a fault message against the rule table.
///
/// Returns the first matching rule's category, or `None` when the message is
/// not recognizable (the fault stays unhealed).
pub fn classify(message: &str) -> Option<HealCategory> {
    RULES
        .iter()
        .find(|rule| message.contains(rule.pattern))
        .map(|rule| rule.category)
}
