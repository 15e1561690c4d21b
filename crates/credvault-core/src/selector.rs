//! Picks which stored credential to try first for a device.
//!
//! Ranking is a fixed total order over
//! `(success_rate desc, priority desc, last_used_at asc)`, applied with a
//! stable sort so records that tie on all three keep id order.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::error::Result;
use crate::store::CredentialStore;
use crate::types::CredentialRecord;

/// The fields ranking looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub id: String,
    pub success_count: u64,
    pub failure_count: u64,
    pub priority: i64,
    pub last_used_at: Option<String>,
}

impl From<&CredentialRecord> for Candidate {
    fn from(record: &CredentialRecord) -> Self {
        Self {
            id: record.id.clone(),
            success_count: record.success_count,
            failure_count: record.failure_count,
            priority: record.priority,
            last_used_at: record.last_used_at.clone(),
        }
    }
}

impl Candidate {
    /// `success / max(1, success + failure)`, for display.
    pub fn success_rate(&self) -> f64 {
        self.success_count as f64 / self.attempts().max(1) as f64
    }

    fn attempts(&self) -> u64 {
        self.success_count.saturating_add(self.failure_count)
    }
}

/// Compare success rates exactly by cross-multiplying, no floats.
fn compare_rate(a: &Candidate, b: &Candidate) -> Ordering {
    let lhs = u128::from(a.success_count) * u128::from(b.attempts().max(1));
    let rhs = u128::from(b.success_count) * u128::from(a.attempts().max(1));
    lhs.cmp(&rhs)
}

/// Never-used sorts before any timestamp (least recently tried first).
fn compare_last_used(a: &Option<String>, b: &Option<String>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => x.cmp(y),
    }
}

/// Best candidate first.
pub fn rank_order(a: &Candidate, b: &Candidate) -> Ordering {
    compare_rate(b, a)
        .then_with(|| b.priority.cmp(&a.priority))
        .then_with(|| compare_last_used(&a.last_used_at, &b.last_used_at))
}

/// Sort candidates in place, best first.
pub fn rank(candidates: &mut [Candidate]) {
    candidates.sort_by(rank_order);
}

/// Read-side ranking over the credential store.
pub struct CredentialSelector {
    store: Arc<CredentialStore>,
}

impl CredentialSelector {
    pub fn new(store: Arc<CredentialStore>) -> Self {
        Self { store }
    }

    /// Ranked candidate ids for a device. Empty when nothing matches.
    pub fn select(&self, device_scope: &str) -> Result<Vec<String>> {
        Ok(self
            .ranked(device_scope)?
            .into_iter()
            .map(|c| c.id)
            .collect())
    }

    /// Ranked candidates with their statistics.
    pub fn ranked(&self, device_scope: &str) -> Result<Vec<Candidate>> {
        let mut candidates: Vec<Candidate> = self
            .store
            .candidates(device_scope)?
            .iter()
            .map(Candidate::from)
            .collect();
        rank(&mut candidates);
        Ok(candidates)
    }
}
