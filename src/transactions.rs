use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use crate::decimal::{Money, Rate};
use crate::errors::{LedgerError, Result};
use crate::types::{BookingId, OwnerId, PaymentId, TransactionId};

/// kind of ledger-affecting event a transaction records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionType {
    /// online payment captured through the gateway
    RazorpayPayment,
    /// COD accepted by the owner, cash not yet remitted
    CodCollection,
    /// a COD due cleared, manually or automatically
    DueSettlement,
    /// audited manual balance adjustment
    Adjustment,
    Refund,
    /// compensating entry for a settled transaction
    Reversal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    Pending,
    Settled,
    Failed,
    Cancelled,
    Reversed,
}

/// immutable-after-settlement record of one commission-affecting event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub owner: OwnerId,
    pub booking: Option<BookingId>,
    pub payment: Option<PaymentId>,
    pub transaction_type: TransactionType,
    pub booking_amount: Money,
    /// commission percentage snapshot at calculation time
    pub commission_percentage: Rate,
    /// negative for reversals
    pub commission_amount: Money,
    pub processing_fee: Money,
    /// negative for reversals
    pub net_amount: Money,
    pub status: TransactionStatus,
    /// globally unique when present; the defense against duplicate webhooks
    pub idempotency_key: Option<String>,
    pub notes: String,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct LogInner {
    transactions: Vec<Transaction>,
    by_key: HashMap<String, TransactionId>,
}

/// append-mostly, idempotent log of every ledger-affecting event
///
/// the idempotency-key uniqueness check happens under the same lock as the
/// insertion, never checked-then-inserted.
#[derive(Debug, Default)]
pub struct TransactionLog {
    inner: Mutex<LogInner>,
}

impl TransactionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// append a transaction, failing on idempotency-key collision
    ///
    /// callers must treat `DuplicateTransaction` as "already processed"
    /// rather than an error to surface; webhook retries are expected.
    pub fn record(&self, transaction: Transaction) -> Result<TransactionId> {
        let mut inner = self.inner.lock().expect("transaction log lock poisoned");
        if let Some(key) = &transaction.idempotency_key {
            if let Some(existing) = inner.by_key.get(key) {
                return Err(LedgerError::DuplicateTransaction {
                    key: key.clone(),
                    existing: *existing,
                });
            }
            inner.by_key.insert(key.clone(), transaction.id);
        }
        let id = transaction.id;
        inner.transactions.push(transaction);
        Ok(id)
    }

    /// append the settlement timestamp exactly once
    ///
    /// settled and reversed transactions are otherwise immutable.
    pub fn mark_settled(&self, id: TransactionId, now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock().expect("transaction log lock poisoned");
        let transaction = inner
            .transactions
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or(LedgerError::Validation {
                message: format!("unknown transaction: {}", id),
            })?;
        match transaction.status {
            TransactionStatus::Pending => {
                transaction.status = TransactionStatus::Settled;
                transaction.settled_at = Some(now);
                Ok(())
            }
            status => Err(LedgerError::Validation {
                message: format!("transaction {} is {:?}, cannot settle", id, status),
            }),
        }
    }

    /// look up a transaction by id
    pub fn get(&self, id: TransactionId) -> Option<Transaction> {
        let inner = self.inner.lock().expect("transaction log lock poisoned");
        inner.transactions.iter().find(|t| t.id == id).cloned()
    }

    /// look up a transaction by idempotency key
    pub fn get_by_key(&self, key: &str) -> Option<Transaction> {
        let inner = self.inner.lock().expect("transaction log lock poisoned");
        let id = inner.by_key.get(key)?;
        inner.transactions.iter().find(|t| t.id == *id).cloned()
    }

    /// the original commission-bearing transaction for a payment, if any
    ///
    /// reversal entries for the same payment are skipped so refund math is
    /// computed against the original capture.
    pub fn find_original_for_payment(&self, payment: PaymentId) -> Option<Transaction> {
        let inner = self.inner.lock().expect("transaction log lock poisoned");
        inner
            .transactions
            .iter()
            .find(|t| {
                t.payment == Some(payment)
                    && matches!(
                        t.transaction_type,
                        TransactionType::RazorpayPayment | TransactionType::CodCollection
                    )
            })
            .cloned()
    }

    /// all transactions for one owner, newest first
    pub fn transactions_for_owner(&self, owner: OwnerId) -> Vec<Transaction> {
        let inner = self.inner.lock().expect("transaction log lock poisoned");
        let mut result: Vec<Transaction> = inner
            .transactions
            .iter()
            .filter(|t| t.owner == owner)
            .cloned()
            .collect();
        result.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        result
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("transaction log lock poisoned");
        inner.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Transaction {
    /// builder for the common fields; amounts filled by the caller
    pub fn new(owner: OwnerId, transaction_type: TransactionType, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner,
            booking: None,
            payment: None,
            transaction_type,
            booking_amount: Money::ZERO,
            commission_percentage: Rate::ZERO,
            commission_amount: Money::ZERO,
            processing_fee: Money::ZERO,
            net_amount: Money::ZERO,
            status: TransactionStatus::Pending,
            idempotency_key: None,
            notes: String::new(),
            created_at: now,
            settled_at: None,
        }
    }
}
