//! Per-item outcomes and run totals.

use serde::{Deserialize, Serialize};

use crate::registry::ItemResult;

/// Where an item stands in the processing loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemState {
    /// Not reached before the run halted.
    Unvisited,
    /// A prior result made processing unnecessary.
    Skipped,
    /// Another worker holds the claim marker.
    Locked,
    /// Handed to the scheduler. Reported to observers while the job runs,
    /// never as a final outcome.
    Dispatched,
    /// Result committed to the run.
    Committed,
    /// Permanently failed for this run.
    BadResult,
}

impl ItemState {
    /// Precedence when several workers report the same item.
    fn weight(&self) -> u8 {
        match self {
            ItemState::Unvisited => 0,
            ItemState::Skipped => 1,
            ItemState::Locked => 2,
            ItemState::Dispatched => 3,
            ItemState::BadResult => 4,
            ItemState::Committed => 5,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ItemState::Unvisited => "unvisited",
            ItemState::Skipped => "skipped",
            ItemState::Locked => "locked",
            ItemState::Dispatched => "dispatched",
            ItemState::Committed => "committed",
            ItemState::BadResult => "bad",
        }
    }
}

impl std::fmt::Display for ItemState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Final state of one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemOutcome {
    pub item: String,
    pub state: ItemState,
    /// The committed result, for `Committed` items.
    pub result: Option<ItemResult>,
    /// Why the item was skipped or marked bad.
    pub message: Option<String>,
}

impl ItemOutcome {
    pub fn committed(result: ItemResult) -> Self {
        Self {
            item: result.item.clone(),
            state: ItemState::Committed,
            result: Some(result),
            message: None,
        }
    }

    pub fn skipped(item: &str, message: impl Into<String>) -> Self {
        Self::without_result(item, ItemState::Skipped, message.into())
    }

    pub fn locked(item: &str, message: impl Into<String>) -> Self {
        Self::without_result(item, ItemState::Locked, message.into())
    }

    pub fn bad(item: &str, message: impl Into<String>) -> Self {
        Self::without_result(item, ItemState::BadResult, message.into())
    }

    pub fn dispatched(item: &str) -> Self {
        Self::without_result(item, ItemState::Dispatched, "handed to the scheduler".to_string())
    }

    pub fn unvisited(item: &str, message: impl Into<String>) -> Self {
        Self::without_result(item, ItemState::Unvisited, message.into())
    }

    fn without_result(item: &str, state: ItemState, message: String) -> Self {
        Self {
            item: item.to_string(),
            state,
            result: None,
            message: Some(message),
        }
    }
}

/// Confidence statistics over committed results.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceStats {
    pub count: usize,
    pub mean: f64,
    pub best: f64,
    pub worst: f64,
}

/// What one pass over a backlog did.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run: String,
    pub outcomes: Vec<ItemOutcome>,
}

impl RunSummary {
    pub fn new(run: impl Into<String>) -> Self {
        Self {
            run: run.into(),
            outcomes: Vec::new(),
        }
    }

    pub fn record(&mut self, outcome: ItemOutcome) {
        self.outcomes.push(outcome);
    }

    /// Fold another worker's summary of the same run into this one.
    pub fn merge(&mut self, other: RunSummary) {
        self.outcomes.extend(other.outcomes);
    }

    /// One outcome per item, keeping the most advanced state reported.
    ///
    /// Item order follows first appearance.
    pub fn per_item(&self) -> RunSummary {
        let mut outcomes: Vec<ItemOutcome> = Vec::new();
        for outcome in &self.outcomes {
            match outcomes.iter_mut().find(|o| o.item == outcome.item) {
                Some(kept) if outcome.state.weight() > kept.state.weight() => {
                    *kept = outcome.clone();
                }
                Some(_) => {}
                None => outcomes.push(outcome.clone()),
            }
        }
        RunSummary {
            run: self.run.clone(),
            outcomes,
        }
    }

    pub fn count(&self, state: ItemState) -> usize {
        self.outcomes.iter().filter(|o| o.state == state).count()
    }

    pub fn committed(&self) -> usize {
        self.count(ItemState::Committed)
    }

    pub fn bad(&self) -> usize {
        self.count(ItemState::BadResult)
    }

    pub fn skipped(&self) -> usize {
        self.count(ItemState::Skipped)
    }

    pub fn locked(&self) -> usize {
        self.count(ItemState::Locked)
    }

    pub fn unvisited(&self) -> usize {
        self.count(ItemState::Unvisited)
    }

    /// Outcomes of items marked bad.
    pub fn bad_items(&self) -> impl Iterator<Item = &ItemOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.state == ItemState::BadResult)
    }

    pub fn confidence_stats(&self) -> Option<ConfidenceStats> {
        let values: Vec<f64> = self
            .outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().map(|r| r.confidence))
            .collect();
        if values.is_empty() {
            return None;
        }

        let count = values.len();
        let mean = values.iter().sum::<f64>() / count as f64;
        let best = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let worst = values.iter().copied().fold(f64::INFINITY, f64::min);
        Some(ConfidenceStats {
            count,
            mean,
            best,
            worst,
        })
    }
}
