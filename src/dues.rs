use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::decimal::Money;
use crate::errors::{LedgerError, Result};
use crate::types::{BookingId, DueId, OwnerId, TransactionId};

/// aging bucket for an unsettled due, derived from days overdue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgingBucket {
    Days0To30,
    Days31To60,
    Days61To90,
    Days90Plus,
}

impl AgingBucket {
    pub fn from_days_overdue(days: u32) -> Self {
        match days {
            0..=30 => AgingBucket::Days0To30,
            31..=60 => AgingBucket::Days31To60,
            61..=90 => AgingBucket::Days61To90,
            _ => AgingBucket::Days90Plus,
        }
    }
}

/// one COD collection not yet remitted by the owner to the platform
///
/// append-only audit trail: dues are mutated only by settlement, never
/// deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Due {
    pub id: DueId,
    pub owner: OwnerId,
    pub booking: Option<BookingId>,
    /// net amount the owner owes the platform from this booking;
    /// reduced in place by partial manual settlements
    pub due_amount: Money,
    pub commission_amount: Money,

    pub is_settled: bool,
    /// the transaction that cleared this due
    pub settled_via: Option<TransactionId>,
    /// the cod_collection transaction that created this due
    pub origin_transaction: TransactionId,

    pub due_date: NaiveDate,
    pub expected_payment_date: NaiveDate,
    pub actual_payment_date: Option<DateTime<Utc>>,

    pub days_overdue: u32,
    pub aging_bucket: AgingBucket,

    pub created_at: DateTime<Utc>,
}

/// outcome of a manual settlement against a single due
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ManualSettlement {
    /// the amount credited against the due, capped at the due amount
    pub settled_amount: Money,
    pub fully_settled: bool,
    /// remaining due amount after a partial collection
    pub remaining: Money,
}

/// aging summary line for the dashboard
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AgingLine {
    pub bucket: AgingBucket,
    pub count: usize,
    pub total: Money,
}

/// collection of one owner's dues with aging and settlement-order logic
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DueBook {
    dues: Vec<Due>,
}

impl DueBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// register a new due for an accepted COD payment
    #[allow(clippy::too_many_arguments)]
    pub fn create_due(
        &mut self,
        owner: OwnerId,
        booking: Option<BookingId>,
        origin_transaction: TransactionId,
        due_amount: Money,
        commission_amount: Money,
        today: NaiveDate,
        due_days_threshold: u32,
        now: DateTime<Utc>,
    ) -> DueId {
        let due = Due {
            id: Uuid::new_v4(),
            owner,
            booking,
            due_amount,
            commission_amount,
            is_settled: false,
            settled_via: None,
            origin_transaction,
            due_date: today,
            expected_payment_date: today + chrono::Duration::days(due_days_threshold as i64),
            actual_payment_date: None,
            days_overdue: 0,
            aging_bucket: AgingBucket::Days0To30,
            created_at: now,
        };
        let id = due.id;
        self.dues.push(due);
        id
    }

    /// settle as many dues as possible, oldest first
    ///
    /// greedy full settlement only: stops at the first due the remaining
    /// amount cannot fully cover. partial settlement of a single due is
    /// reserved for the manual path.
    pub fn settle_oldest_first(
        &mut self,
        available_amount: Money,
        via_transaction: TransactionId,
        now: DateTime<Utc>,
    ) -> Vec<Due> {
        let mut order: Vec<usize> = (0..self.dues.len())
            .filter(|&i| !self.dues[i].is_settled)
            .collect();
        order.sort_by_key(|&i| (self.dues[i].due_date, self.dues[i].created_at));

        let mut remaining = available_amount;
        let mut settled = Vec::new();
        for i in order {
            let due = &mut self.dues[i];
            if remaining < due.due_amount {
                break;
            }
            remaining -= due.due_amount;
            due.is_settled = true;
            due.settled_via = Some(via_transaction);
            due.actual_payment_date = Some(now);
            settled.push(due.clone());
        }
        settled
    }

    /// settle a single due against a manually collected amount
    ///
    /// over-collection is credited only up to the due amount; a short
    /// collection reduces the due and leaves it unsettled.
    pub fn settle_manual(
        &mut self,
        due_id: DueId,
        collected_amount: Money,
        via_transaction: TransactionId,
        now: DateTime<Utc>,
    ) -> Result<ManualSettlement> {
        if !collected_amount.is_positive() {
            return Err(LedgerError::Validation {
                message: format!("collected amount must be positive: {}", collected_amount),
            });
        }
        let due = self
            .dues
            .iter_mut()
            .find(|d| d.id == due_id)
            .ok_or(LedgerError::DueNotFound { due: due_id })?;
        if due.is_settled {
            return Err(LedgerError::AlreadySettled { due: due_id });
        }

        let settled_amount = collected_amount.min(due.due_amount);
        if collected_amount >= due.due_amount {
            due.is_settled = true;
            due.settled_via = Some(via_transaction);
            due.actual_payment_date = Some(now);
            Ok(ManualSettlement {
                settled_amount,
                fully_settled: true,
                remaining: Money::ZERO,
            })
        } else {
            due.due_amount -= settled_amount;
            Ok(ManualSettlement {
                settled_amount,
                fully_settled: false,
                remaining: due.due_amount,
            })
        }
    }

    /// refresh days-overdue and aging buckets for unsettled dues
    ///
    /// returns the dues whose bucket or overdue count changed, for event
    /// emission by the periodic sweep.
    pub fn refresh_aging(&mut self, today: NaiveDate) -> Vec<Due> {
        let mut changed = Vec::new();
        for due in self.dues.iter_mut().filter(|d| !d.is_settled) {
            let days = (today - due.expected_payment_date).num_days().max(0) as u32;
            let bucket = AgingBucket::from_days_overdue(days);
            if days != due.days_overdue || bucket != due.aging_bucket {
                due.days_overdue = days;
                due.aging_bucket = bucket;
                changed.push(due.clone());
            }
        }
        changed
    }

    /// sum of unsettled due amounts; must always equal the account's
    /// pending_dues
    pub fn pending_total(&self) -> Money {
        self.dues
            .iter()
            .filter(|d| !d.is_settled)
            .fold(Money::ZERO, |acc, d| acc + d.due_amount)
    }

    /// per-bucket counts and totals over unsettled dues
    pub fn aging_summary(&self) -> Vec<AgingLine> {
        let buckets = [
            AgingBucket::Days0To30,
            AgingBucket::Days31To60,
            AgingBucket::Days61To90,
            AgingBucket::Days90Plus,
        ];
        buckets
            .into_iter()
            .map(|bucket| {
                let matching = self
                    .dues
                    .iter()
                    .filter(|d| !d.is_settled && d.aging_bucket == bucket);
                let mut count = 0;
                let mut total = Money::ZERO;
                for d in matching {
                    count += 1;
                    total += d.due_amount;
                }
                AgingLine { bucket, count, total }
            })
            .collect()
    }

    pub fn get(&self, id: DueId) -> Option<&Due> {
        self.dues.iter().find(|d| d.id == id)
    }

    pub fn dues(&self) -> &[Due] {
        &self.dues
    }
}
