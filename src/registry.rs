//! Heal Registry — process-wide counters of successfully healed fault categories.
//!
//! Pure bookkeeping: increment on each healing action, snapshot/total/report
//! for diagnostics, reset for test isolation. Counts only ever go up between
//! resets.

use crate::types::HealCategory;
use serde::Serialize;
use std::sync::Mutex;
use tracing::debug;

/// Immutable copy of the registry counters at one point in time.
///
/// Entries keep first-encounter order, so reports are deterministic for a
/// given admission sequence.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealSnapshot {
    entries: Vec<(HealCategory, u64)>,
}

impl HealSnapshot {
    /// Count for one category (0 if never healed).
    pub fn count(&self, category: HealCategory) -> u64 {
        self.entries
            .iter()
            .find(|(cat, _)| *cat == category)
            .map_or(0, |(_, n)| *n)
    }

    /// Sum of all counts.
    pub fn total(&self) -> u64 {
        self.entries.iter().map(|(_, n)| n).sum()
    }

    /// Categories and counts in first-encounter order.
    pub fn entries(&self) -> &[(HealCategory, u64)] {
        &self.entries
    }

    /// True when nothing has been healed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Counters of successfully healed fault categories.
///
/// Interior-mutable so a single instance can be shared behind an `Arc` by the
/// interceptor and any diagnostics surface.
#[derive(Debug, Default)]
pub struct HealRegistry {
    /// First-encounter ordered counters — ties in `most_frequent` break
    /// toward the category that reached the maximum first
    counts: Mutex<Vec<(HealCategory, u64)>>,
}

impl HealRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one healed fault of the given category.
    pub fn record_healing(&self, category: HealCategory) {
        let mut counts = lock(&self.counts);
        if let Some(entry) = counts.iter_mut().find(|(cat, _)| *cat == category) {
            entry.1 += 1;
        } else {
            counts.push((category, 1));
        }
        debug!(category = %category, "Healing recorded");
    }

    /// Immutable copy of the current counts.
    pub fn snapshot(&self) -> HealSnapshot {
        HealSnapshot {
            entries: lock(&self.counts).clone(),
        }
    }

    /// Sum of all counts.
    pub fn total(&self) -> u64 {
        lock(&self.counts).iter().map(|(_, n)| n).sum()
    }

    /// Category with the highest count.
    ///
    /// Ties break toward the category first encountered with that maximum;
    /// `None` when nothing has been healed.
    pub fn most_frequent(&self) -> Option<HealCategory> {
        let counts = lock(&self.counts);
        let mut best: Option<(HealCategory, u64)> = None;
        for &(cat, n) in counts.iter() {
            match best {
                Some((_, max)) if n <= max => {}
                _ => best = Some((cat, n)),
            }
        }
        best.map(|(cat, _)| cat)
    }

    /// Clear all counts. Intended for test isolation, not production use.
    pub fn reset(&self) {
        lock(&self.counts).clear();
        debug!("Heal registry reset");
    }

    /// Deterministic human-readable summary of the counters.
    pub fn format_report(&self) -> String {
        let counts = lock(&self.counts);
        let mut report = String::from("Healing Report\n");
        if counts.is_empty() {
            report.push_str("  (no healed faults)\n");
        }
        for &(cat, n) in counts.iter() {
            report.push_str(&format!("  {}: {}\n", cat.title(), n));
        }
        let total: u64 = counts.iter().map(|(_, n)| n).sum();
        report.push_str(&format!("  Total: {total}"));
        report
    }
}

/// Lock a mutex, recovering the data from a poisoned lock.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_healing_creates_and_accumulates() {
        let registry = HealRegistry::new();
        registry.record_healing(HealCategory::NullCheck);
        registry.record_healing(HealCategory::NullCheck);
        registry.record_healing(HealCategory::RenderOverflow);

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.count(HealCategory::NullCheck), 2);
        assert_eq!(snapshot.count(HealCategory::RenderOverflow), 1);
        assert_eq!(snapshot.count(HealCategory::StaleComponent), 0);
        assert_eq!(registry.total(), 3);
    }

    #[test]
    fn snapshot_is_detached_from_internal_state() {
        let registry = HealRegistry::new();
        registry.record_healing(HealCategory::NullCheck);
        let snapshot = registry.snapshot();
        registry.record_healing(HealCategory::NullCheck);
        assert_eq!(snapshot.count(HealCategory::NullCheck), 1);
        assert_eq!(registry.total(), 2);
    }

    #[test]
    fn most_frequent_breaks_ties_by_first_encounter() {
        let registry = HealRegistry::new();
        assert_eq!(registry.most_frequent(), None);

        registry.record_healing(HealCategory::RenderOverflow);
        registry.record_healing(HealCategory::NullCheck);
        // Both at 1 — RenderOverflow was first to reach the maximum.
        assert_eq!(registry.most_frequent(), Some(HealCategory::RenderOverflow));

        registry.record_healing(HealCategory::NullCheck);
        assert_eq!(registry.most_frequent(), Some(HealCategory::NullCheck));
    }

    #[test]
    fn reset_returns_to_empty_state() {
        let registry = HealRegistry::new();
        registry.record_healing(HealCategory::StaleComponent);
        registry.reset();
        assert_eq!(registry.total(), 0);
        assert_eq!(registry.most_frequent(), None);
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn report_is_deterministic_and_title_cased() {
        let registry = HealRegistry::new();
        registry.record_healing(HealCategory::MutateAfterTeardown);
        registry.record_healing(HealCategory::MutateAfterTeardown);
        registry.record_healing(HealCategory::NullCheck);

        let report = registry.format_report();
        assert_eq!(
            report,
            "Healing Report\n  Mutate After Teardown: 2\n  Null Check: 1\n  Total: 3"
        );
    }

    #[test]
    fn empty_report_still_renders() {
        let registry = HealRegistry::new();
        let report = registry.format_report();
        assert!(report.contains("(no healed faults)"));
        assert!(report.contains("Total: 0"));
    }
}
