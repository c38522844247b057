use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::decimal::Money;
use crate::types::OwnerId;

/// account status
///
/// only `Active ⇄ Blocked` transitions are automatic; `Suspended` and
/// `Closed` are administrative and never reached by ledger logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountStatus {
    Active,
    Blocked,
    Suspended,
    Closed,
}

/// bank details for payouts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BankDetails {
    pub account_number: String,
    pub ifsc_code: String,
    pub holder_name: String,
    pub verified: bool,
}

/// per-owner running account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OwnerAccount {
    pub owner: OwnerId,

    // balance tracking
    pub total_earned: Money,
    pub total_commission_deducted: Money,
    /// signed; refunds may push it below prior earnings
    pub current_balance: Money,

    // dues tracking (from COD payments)
    pub pending_dues: Money,
    pub settled_dues: Money,

    // block state machine
    pub account_status: AccountStatus,
    pub is_blocked: bool,
    pub blocked_reason: Option<String>,
    pub blocked_at: Option<DateTime<Utc>>,
    pub unblocked_at: Option<DateTime<Utc>>,

    // payout details
    pub bank_details: Option<BankDetails>,
    pub last_payout_date: Option<DateTime<Utc>>,
    pub last_payout_amount: Option<Money>,

    pub created_at: DateTime<Utc>,
}

impl OwnerAccount {
    /// open a fresh account; created lazily on first transaction
    pub fn new(owner: OwnerId, now: DateTime<Utc>) -> Self {
        Self {
            owner,
            total_earned: Money::ZERO,
            total_commission_deducted: Money::ZERO,
            current_balance: Money::ZERO,
            pending_dues: Money::ZERO,
            settled_dues: Money::ZERO,
            account_status: AccountStatus::Active,
            is_blocked: false,
            blocked_reason: None,
            blocked_at: None,
            unblocked_at: None,
            bank_details: None,
            last_payout_date: None,
            last_payout_amount: None,
            created_at: now,
        }
    }

    /// re-evaluate the auto-block threshold after a dues mutation
    ///
    /// blocks when pending dues reach the threshold. never auto-unblocks:
    /// clearing a block is exclusively the explicit, audited `unblock`.
    /// returns true when this call performed the block transition.
    pub fn evaluate_block_status(&mut self, threshold: Money, now: DateTime<Utc>) -> bool {
        if self.pending_dues >= threshold && !self.is_blocked {
            self.is_blocked = true;
            self.account_status = AccountStatus::Blocked;
            self.blocked_reason = Some(format!("dues {} exceed threshold {}", self.pending_dues, threshold));
            self.blocked_at = Some(now);
            return true;
        }
        false
    }

    /// explicit admin unblock
    pub fn unblock(&mut self, reason: &str, now: DateTime<Utc>) {
        self.is_blocked = false;
        self.account_status = AccountStatus::Active;
        self.blocked_reason = None;
        self.blocked_at = None;
        self.unblocked_at = Some(now);
        tracing::info!(owner = %self.owner, reason, "owner unblocked");
    }

    /// blocked owners cannot accept new COD or online bookings
    pub fn can_receive_payment(&self) -> bool {
        !self.is_blocked && self.account_status == AccountStatus::Active
    }

    /// apply a settled capture: called once per settled transaction
    pub fn credit(&mut self, gross_amount: Money, commission: Money, net_amount: Money) {
        self.total_earned += gross_amount;
        self.total_commission_deducted += commission;
        self.current_balance += net_amount;
    }

    /// register a new COD due against this account
    pub fn record_due(&mut self, amount: Money) {
        self.pending_dues += amount;
    }

    /// move a settled amount from pending to settled dues
    ///
    /// caps at the currently pending amount; does not auto-unblock.
    pub fn settle_dues(&mut self, amount: Money) -> Money {
        let settled = self.pending_dues.min(amount);
        self.pending_dues -= settled;
        self.settled_dues += settled;
        settled
    }

    /// apply a refund debit; the balance may go negative, representing an
    /// amount the platform must recover from the owner
    pub fn debit_for_refund(&mut self, amount: Money, commission_reversed: Money) {
        self.current_balance -= amount;
        self.total_commission_deducted -= commission_reversed;
    }

    /// record a completed payout
    pub fn record_payout(&mut self, amount: Money, now: DateTime<Utc>) {
        self.current_balance -= amount;
        self.last_payout_date = Some(now);
        self.last_payout_amount = Some(amount);
    }

    pub fn set_bank_details(&mut self, details: BankDetails) {
        self.bank_details = Some(details);
    }
}
