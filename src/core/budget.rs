//! Budget ledger.
//!
//! Tracks spend for one session phase against a hard ceiling. Money moves in
//! three steps: `reserve` earmarks an amount, `commit` makes it durable spend,
//! `release` hands it back. Every reservation opens a [`TransactionRecord`]
//! and the record list is append-only so the full audit trail survives the
//! session.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::cost::Cost;

/// Errors raised by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BudgetError {
    /// The amount does not fit under the ceiling.
    #[error("budget exceeded: requested {requested}, remaining {remaining} of {ceiling}")]
    Exceeded { requested: Cost, remaining: Cost, ceiling: Cost },

    /// The handle does not refer to an open reservation.
    #[error("unknown or already settled reservation #{0}")]
    UnknownReservation(u64),
}

/// What a transaction pays for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpendKind {
    Prompt,
    Image,
}

impl std::fmt::Display for SpendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Prompt => write!(f, "prompt"),
            Self::Image => write!(f, "image"),
        }
    }
}

/// Lifecycle of a transaction record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionState {
    Pending,
    Committed,
    RolledBack,
}

/// One attempted spend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Ledger-local sequence number
    pub id: u64,
    /// Correlation id for the provider call this spend covers
    pub call_id: String,
    /// Asset key the spend belongs to
    pub asset: String,
    pub provider: String,
    pub kind: SpendKind,
    pub amount: Cost,
    pub state: TransactionState,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settled_at: Option<DateTime<Utc>>,
    /// Why the spend was rolled back
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Description of a spend to reserve.
#[derive(Debug, Clone)]
pub struct SpendLabel {
    pub asset: String,
    pub provider: String,
    pub kind: SpendKind,
}

impl SpendLabel {
    pub fn new(asset: impl Into<String>, provider: impl Into<String>, kind: SpendKind) -> Self {
        Self { asset: asset.into(), provider: provider.into(), kind }
    }
}

/// Proof of an open reservation.
///
/// Must be settled with [`BudgetLedger::commit`] or [`BudgetLedger::release`];
/// an abandoned handle keeps its amount locked until the session ends.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a reservation must be committed or released"]
pub struct ReservationHandle {
    id: u64,
    amount: Cost,
    call_id: String,
}

impl ReservationHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn amount(&self) -> Cost {
        self.amount
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    committed: Cost,
    reserved: Cost,
    next_id: u64,
    open: HashMap<u64, Cost>,
    records: Vec<TransactionRecord>,
}

impl LedgerState {
    fn open_reservation(&mut self, amount: Cost, label: SpendLabel) -> ReservationHandle {
        self.next_id += 1;
        let id = self.next_id;
        let call_id = Uuid::new_v4().to_string();
        self.reserved += amount;
        self.open.insert(id, amount);
        self.records.push(TransactionRecord {
            id,
            call_id: call_id.clone(),
            asset: label.asset,
            provider: label.provider,
            kind: label.kind,
            amount,
            state: TransactionState::Pending,
            created_at: Utc::now(),
            settled_at: None,
            reason: None,
        });
        ReservationHandle { id, amount, call_id }
    }

    fn record_mut(&mut self, id: u64) -> Option<&mut TransactionRecord> {
        // Ids are assigned sequentially from 1 and records are never removed.
        self.records.get_mut((id - 1) as usize)
    }
}

/// Spend tracker for one session phase.
#[derive(Debug)]
pub struct BudgetLedger {
    ceiling: Cost,
    state: Mutex<LedgerState>,
}

impl BudgetLedger {
    /// Create a ledger with the given hard ceiling.
    pub fn new(ceiling: Cost) -> Self {
        Self { ceiling, state: Mutex::new(LedgerState::default()) }
    }

    pub fn ceiling(&self) -> Cost {
        self.ceiling
    }

    /// Durable spend so far.
    pub fn committed(&self) -> Cost {
        self.state.lock().committed
    }

    /// Amount held by open reservations.
    pub fn reserved(&self) -> Cost {
        self.state.lock().reserved
    }

    /// Headroom left for new reservations.
    pub fn remaining(&self) -> Cost {
        let state = self.state.lock();
        self.ceiling.saturating_sub(state.committed + state.reserved)
    }

    /// Number of reservations not yet settled.
    pub fn open_reservations(&self) -> usize {
        self.state.lock().open.len()
    }

    /// Earmark `amount`. Fails closed when it would not fit under the ceiling.
    pub fn reserve(&self, amount: Cost, label: SpendLabel) -> Result<ReservationHandle, BudgetError> {
        let mut state = self.state.lock();
        self.check_fits(&state, amount, &label)?;
        Ok(state.open_reservation(amount, label))
    }

    /// Earmark several amounts at once: either all fit under the ceiling and
    /// every handle is returned in order, or nothing is reserved.
    pub fn reserve_all(
        &self,
        spends: Vec<(Cost, SpendLabel)>,
    ) -> Result<Vec<ReservationHandle>, BudgetError> {
        let Some((_, first)) = spends.first() else {
            return Ok(Vec::new());
        };
        let total = spends
            .iter()
            .try_fold(Cost::ZERO, |sum, (amount, _)| sum.checked_add(*amount))
            .unwrap_or(Cost::from_micros(u64::MAX));
        let mut state = self.state.lock();
        self.check_fits(&state, total, first)?;

        Ok(spends.into_iter().map(|(amount, label)| state.open_reservation(amount, label)).collect())
    }

    fn check_fits(&self, state: &LedgerState, amount: Cost, label: &SpendLabel) -> Result<(), BudgetError> {
        let in_use = state.committed + state.reserved;
        let fits = in_use.checked_add(amount).is_some_and(|total| total <= self.ceiling);
        if fits {
            return Ok(());
        }
        tracing::debug!(
            asset = %label.asset,
            provider = %label.provider,
            requested = %amount,
            in_use = %in_use,
            "Reservation rejected"
        );
        Err(BudgetError::Exceeded {
            requested: amount,
            remaining: self.ceiling.saturating_sub(in_use),
            ceiling: self.ceiling,
        })
    }

    /// Turn a reservation into durable spend.
    pub fn commit(&self, handle: ReservationHandle) -> Result<TransactionRecord, BudgetError> {
        let mut state = self.state.lock();
        let amount =
            state.open.remove(&handle.id).ok_or(BudgetError::UnknownReservation(handle.id))?;
        state.reserved = state.reserved.saturating_sub(amount);
        state.committed += amount;

        let record = state
            .record_mut(handle.id)
            .ok_or(BudgetError::UnknownReservation(handle.id))?;
        record.state = TransactionState::Committed;
        record.settled_at = Some(Utc::now());
        let record = record.clone();

        tracing::debug!(asset = %record.asset, provider = %record.provider, amount = %amount, "Spend committed");
        Ok(record)
    }

    /// Return a reservation's amount to the pool and roll its record back.
    pub fn release(&self, handle: ReservationHandle, reason: impl Into<String>) {
        let mut state = self.state.lock();
        let Some(amount) = state.open.remove(&handle.id) else {
            return;
        };
        state.reserved = state.reserved.saturating_sub(amount);
        if let Some(record) = state.record_mut(handle.id) {
            record.state = TransactionState::RolledBack;
            record.settled_at = Some(Utc::now());
            record.reason = Some(reason.into());
        }
    }

    /// Snapshot of the audit trail.
    pub fn records(&self) -> Vec<TransactionRecord> {
        self.state.lock().records.clone()
    }

    /// Sum of committed record amounts, recomputed from the audit trail.
    pub fn audited_total(&self) -> Cost {
        self.state
            .lock()
            .records
            .iter()
            .filter(|r| r.state == TransactionState::Committed)
            .map(|r| r.amount)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn label(asset: &str) -> SpendLabel {
        SpendLabel::new(asset, "mock", SpendKind::Prompt)
    }

    fn dollars(d: f64) -> Cost {
        Cost::from_dollars(d)
    }

    #[test]
    fn test_reserve_and_commit() {
        let ledger = BudgetLedger::new(dollars(1.0));
        let handle = ledger.reserve(dollars(0.25), label("icon/a")).unwrap();

        assert_eq!(ledger.reserved(), dollars(0.25));
        assert_eq!(ledger.committed(), Cost::ZERO);

        let record = ledger.commit(handle).unwrap();
        assert_eq!(record.state, TransactionState::Committed);
        assert_eq!(ledger.committed(), dollars(0.25));
        assert_eq!(ledger.reserved(), Cost::ZERO);
        assert_eq!(ledger.remaining(), dollars(0.75));
    }

    #[test]
    fn test_reserve_fails_closed_over_ceiling() {
        let ledger = BudgetLedger::new(dollars(0.10));
        let _held = ledger.reserve(dollars(0.08), label("icon/a")).unwrap();

        let err = ledger.reserve(dollars(0.04), label("icon/b")).unwrap_err();
        assert_eq!(
            err,
            BudgetError::Exceeded {
                requested: dollars(0.04),
                remaining: dollars(0.02),
                ceiling: dollars(0.10)
            }
        );
        // Rejections leave no record behind.
        assert_eq!(ledger.records().len(), 1);
    }

    #[test]
    fn test_exact_fit_is_allowed() {
        let ledger = BudgetLedger::new(dollars(0.08));
        let a = ledger.reserve(dollars(0.04), label("a")).unwrap();
        let b = ledger.reserve(dollars(0.04), label("b")).unwrap();
        ledger.commit(a).unwrap();
        ledger.commit(b).unwrap();
        assert_eq!(ledger.committed(), ledger.ceiling());
        assert_eq!(ledger.remaining(), Cost::ZERO);
    }

    #[test]
    fn test_release_returns_budget_and_rolls_back() {
        let ledger = BudgetLedger::new(dollars(0.05));
        let handle = ledger.reserve(dollars(0.05), label("a")).unwrap();
        ledger.release(handle, "provider failed");

        assert_eq!(ledger.remaining(), dollars(0.05));
        let records = ledger.records();
        assert_eq!(records[0].state, TransactionState::RolledBack);
        assert_eq!(records[0].reason.as_deref(), Some("provider failed"));

        // Released budget can be reserved again.
        assert!(ledger.reserve(dollars(0.05), label("b")).is_ok());
    }

    #[test]
    fn test_records_are_append_only() {
        let ledger = BudgetLedger::new(dollars(1.0));
        for i in 0..5 {
            let handle = ledger.reserve(dollars(0.01), label(&format!("a{i}"))).unwrap();
            if i % 2 == 0 {
                ledger.commit(handle).unwrap();
            } else {
                ledger.release(handle, "failed");
            }
        }

        let records = ledger.records();
        assert_eq!(records.len(), 5);
        assert_eq!(records.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);
        assert_eq!(ledger.audited_total(), dollars(0.03));
        assert_eq!(ledger.audited_total(), ledger.committed());
    }

    #[test]
    fn test_reserve_all_is_all_or_nothing() {
        let ledger = BudgetLedger::new(dollars(0.20));
        let spends = |asset: &str| {
            vec![
                (dollars(0.02), SpendLabel::new(asset, "writer", SpendKind::Prompt)),
                (dollars(0.02), SpendLabel::new(asset, "critic", SpendKind::Prompt)),
                (dollars(0.04), SpendLabel::new(asset, "painter", SpendKind::Image)),
            ]
        };

        let first = ledger.reserve_all(spends("icon/a")).unwrap();
        assert_eq!(first.iter().map(ReservationHandle::amount).collect::<Vec<_>>(), vec![
            dollars(0.02),
            dollars(0.02),
            dollars(0.04)
        ]);
        let _second = ledger.reserve_all(spends("icon/b")).unwrap();
        assert_eq!(ledger.remaining(), dollars(0.04));

        // The third asset would fit its prompts but not its image.
        let err = ledger.reserve_all(spends("icon/c")).unwrap_err();
        assert!(matches!(err, BudgetError::Exceeded { requested, .. } if requested == dollars(0.08)));
        assert_eq!(ledger.records().len(), 6);
        assert_eq!(ledger.reserved(), dollars(0.16));
        assert!(ledger.reserve_all(Vec::new()).unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_reservations_never_exceed_ceiling() {
        use std::sync::Arc;

        let ledger = Arc::new(BudgetLedger::new(dollars(1.0)));
        let handles: Vec<_> = (0..16)
            .map(|t| {
                let ledger = Arc::clone(&ledger);
                std::thread::spawn(move || {
                    for i in 0..20 {
                        if let Ok(handle) =
                            ledger.reserve(dollars(0.01), label(&format!("t{t}-{i}")))
                        {
                            if i % 3 == 0 {
                                ledger.release(handle, "simulated failure");
                            } else {
                                ledger.commit(handle).unwrap();
                            }
                        }
                        assert!(ledger.committed() <= ledger.ceiling());
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert!(ledger.committed() <= ledger.ceiling());
        assert_eq!(ledger.audited_total(), ledger.committed());
        assert_eq!(ledger.open_reservations(), 0);
    }
}
