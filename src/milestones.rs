//! Milestone (badge) derivation from the validated-street count.
//!
//! Badges unlock when the number of validated streets crosses a fixed
//! threshold. The evaluator only produces unlock events; presenting them one
//! at a time is the job of whoever drains the [`BadgeQueue`].
//!
//! ## Example
//! ```rust
//! use street_coverage::milestones::{default_badges, MilestoneEvaluator};
//!
//! let mut evaluator = MilestoneEvaluator::new(default_badges());
//! let unlocked = evaluator.evaluate(1);
//! assert_eq!(unlocked.len(), 1);
//! assert_eq!(unlocked[0].id, "first_step");
//!
//! // Already unlocked badges never fire again
//! assert!(evaluator.evaluate(1).is_empty());
//! ```

use std::collections::{HashSet, VecDeque};

use serde::{Deserialize, Serialize};

/// Static definition of a badge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct BadgeDefinition {
    pub id: String,
    pub name: String,
    pub icon: String,
    /// Number of validated streets required
    pub threshold: u32,
}

impl BadgeDefinition {
    pub fn new(id: &str, name: &str, icon: &str, threshold: u32) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            icon: icon.to_string(),
            threshold,
        }
    }

    pub fn unlock(&self) -> BadgeUnlock {
        BadgeUnlock {
            id: self.id.clone(),
            name: self.name.clone(),
            icon: self.icon.clone(),
        }
    }
}

/// Badge-unlock event handed to the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ffi", derive(uniffi::Record))]
pub struct BadgeUnlock {
    pub id: String,
    pub name: String,
    pub icon: String,
}

/// Standard validated-street thresholds
const DEFAULT_THRESHOLDS: &[(&str, &str, &str, u32)] = &[
    ("first_step", "First Step", "footprints", 1),
    ("street_explorer", "Street Explorer", "compass", 50),
    ("neighbourhood_regular", "Neighbourhood Regular", "map", 125),
    ("city_wanderer", "City Wanderer", "signpost", 249),
    ("urban_cartographer", "Urban Cartographer", "globe", 498),
];

/// The built-in badge ladder.
pub fn default_badges() -> Vec<BadgeDefinition> {
    DEFAULT_THRESHOLDS
        .iter()
        .map(|&(id, name, icon, threshold)| BadgeDefinition::new(id, name, icon, threshold))
        .collect()
}

/// Definitions reached at `validated_count` that are not yet unlocked, in
/// threshold order.
pub fn newly_unlocked<'a>(
    validated_count: usize,
    definitions: &'a [BadgeDefinition],
    unlocked: &HashSet<String>,
) -> Vec<&'a BadgeDefinition> {
    let mut reached: Vec<&BadgeDefinition> = definitions
        .iter()
        .filter(|d| d.threshold as usize <= validated_count && !unlocked.contains(&d.id))
        .collect();
    reached.sort_by_key(|d| d.threshold);
    reached
}

/// Owns the badge ladder and the monotonically growing unlocked set.
#[derive(Debug, Clone)]
pub struct MilestoneEvaluator {
    definitions: Vec<BadgeDefinition>,
    unlocked: HashSet<String>,
}

impl Default for MilestoneEvaluator {
    fn default() -> Self {
        Self::new(default_badges())
    }
}

impl MilestoneEvaluator {
    pub fn new(mut definitions: Vec<BadgeDefinition>) -> Self {
        definitions.sort_by_key(|d| d.threshold);
        Self {
            definitions,
            unlocked: HashSet::new(),
        }
    }

    pub fn definitions(&self) -> &[BadgeDefinition] {
        &self.definitions
    }

    pub fn is_unlocked(&self, id: &str) -> bool {
        self.unlocked.contains(id)
    }

    /// Unlocked badge ids, sorted.
    pub fn unlocked_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.unlocked.iter().cloned().collect();
        ids.sort();
        ids
    }

    pub fn unlocked_count(&self) -> usize {
        self.unlocked.len()
    }

    /// Unlock every badge reached at `validated_count` and return the new
    /// unlocks in threshold order.
    pub fn evaluate(&mut self, validated_count: usize) -> Vec<BadgeUnlock> {
        let fresh: Vec<BadgeUnlock> =
            newly_unlocked(validated_count, &self.definitions, &self.unlocked)
                .into_iter()
                .map(BadgeDefinition::unlock)
                .collect();
        for unlock in &fresh {
            self.unlocked.insert(unlock.id.clone());
        }
        fresh
    }

    /// Seed the unlocked set from a saved exploration. Ids that don't match
    /// a definition are skipped; returns how many were applied.
    pub fn restore(&mut self, ids: &[String]) -> usize {
        let mut applied = 0;
        for id in ids {
            if self.definitions.iter().any(|d| &d.id == id) {
                if self.unlocked.insert(id.clone()) {
                    applied += 1;
                }
            } else {
                log::warn!("[Milestones] Ignoring unknown badge id '{}' in restore", id);
            }
        }
        applied
    }

    pub fn clear(&mut self) {
        self.unlocked.clear();
    }
}

/// FIFO of badge unlocks awaiting presentation, plus the one currently shown.
#[derive(Debug, Clone, Default)]
pub struct BadgeQueue {
    pending: VecDeque<BadgeUnlock>,
    active: Option<BadgeUnlock>,
}

impl BadgeQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, unlock: BadgeUnlock) {
        self.pending.push_back(unlock);
    }

    pub fn extend(&mut self, unlocks: impl IntoIterator<Item = BadgeUnlock>) {
        self.pending.extend(unlocks);
    }

    /// Take the next pending unlock, bypassing the active slot.
    pub fn pop_or_none(&mut self) -> Option<BadgeUnlock> {
        self.pending.pop_front()
    }

    /// The unlock currently on display.
    pub fn active(&self) -> Option<&BadgeUnlock> {
        self.active.as_ref()
    }

    /// Promote the next pending unlock when nothing is on display.
    pub fn advance(&mut self) -> Option<&BadgeUnlock> {
        if self.active.is_none() {
            self.active = self.pending.pop_front();
        }
        self.active.as_ref()
    }

    /// Dismiss the active unlock and promote the next one.
    pub fn dismiss(&mut self) -> Option<&BadgeUnlock> {
        self.active = None;
        self.advance()
    }

    /// Pending unlocks, excluding the active one.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.active.is_none()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.active = None;
    }
}
