use chrono::{DateTime, Utc};
use hourglass_rs::SafeTimeProvider;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::account::{BankDetails, OwnerAccount};
use crate::commission;
use crate::decimal::Money;
use crate::dues::{AgingLine, Due, DueBook};
use crate::errors::{LedgerError, Result};
use crate::events::{Event, EventStore};
use crate::gateway::{GatewayStatus, PaymentGateway};
use crate::payment::{
    PaymentMethod, PaymentRecord, PaymentStatus, PayoutRequest, PayoutStatus, Refund,
    RefundReason, RefundStatus,
};
use crate::settings::SettingsStore;
use crate::transactions::{Transaction, TransactionLog, TransactionStatus, TransactionType};
use crate::types::{BookingId, DueId, OwnerId, PaymentId, PayoutId};

/// one owner's mutable ledger state, guarded by a single lock so that all
/// mutating operations on the same owner are serialized
#[derive(Debug)]
struct OwnerState {
    account: OwnerAccount,
    dues: DueBook,
}

/// read-only view of one owner's standing for dashboards; tolerates
/// eventually-consistent snapshots
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnerDashboard {
    pub account: OwnerAccount,
    pub aging: Vec<AgingLine>,
    pub unsettled_due_count: usize,
}

/// serializable audit snapshot of all ledger accounts and dues
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub taken_at: DateTime<Utc>,
    pub accounts: Vec<OwnerAccount>,
    pub dues: Vec<Due>,
}

/// the commission ledger engine
///
/// coordinates the settings store, per-owner accounts, dues tracking, the
/// idempotent transaction log, and the refund/payout lifecycles. gateway
/// calls are injected so the engine never blocks on network I/O it cannot
/// control, and a lock is never held across a gateway call.
pub struct CommissionLedger {
    settings: SettingsStore,
    owners: RwLock<HashMap<OwnerId, Arc<Mutex<OwnerState>>>>,
    log: TransactionLog,
    payments: Mutex<HashMap<PaymentId, PaymentRecord>>,
    refunds: Mutex<Vec<Refund>>,
    payouts: Mutex<Vec<PayoutRequest>>,
    events: Mutex<EventStore>,
}

impl Default for CommissionLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl CommissionLedger {
    pub fn new() -> Self {
        Self {
            settings: SettingsStore::new(),
            owners: RwLock::new(HashMap::new()),
            log: TransactionLog::new(),
            payments: Mutex::new(HashMap::new()),
            refunds: Mutex::new(Vec::new()),
            payouts: Mutex::new(Vec::new()),
            events: Mutex::new(EventStore::new()),
        }
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn transactions(&self) -> &TransactionLog {
        &self.log
    }

    /// drain events emitted since the last call
    pub fn take_events(&self) -> Vec<Event> {
        self.events.lock().expect("event lock poisoned").take_events()
    }

    fn emit(&self, event: Event) {
        self.events.lock().expect("event lock poisoned").emit(event);
    }

    /// fetch or create the per-owner state under the map's write lock, so
    /// concurrent first-time access cannot create duplicate accounts
    fn owner_state(&self, owner: OwnerId, now: DateTime<Utc>) -> Arc<Mutex<OwnerState>> {
        {
            let owners = self.owners.read().expect("owner map lock poisoned");
            if let Some(state) = owners.get(&owner) {
                return Arc::clone(state);
            }
        }
        let mut owners = self.owners.write().expect("owner map lock poisoned");
        let state = owners.entry(owner).or_insert_with(|| {
            self.events
                .lock()
                .expect("event lock poisoned")
                .emit(Event::AccountOpened { owner, timestamp: now });
            Arc::new(Mutex::new(OwnerState {
                account: OwnerAccount::new(owner, now),
                dues: DueBook::new(),
            }))
        });
        Arc::clone(state)
    }

    // ---- payment records -------------------------------------------------

    /// register a payment record for a booking before it is captured
    pub fn register_payment(
        &self,
        booking: BookingId,
        owner: OwnerId,
        amount: Money,
        payment_method: PaymentMethod,
        time: &SafeTimeProvider,
    ) -> Result<PaymentId> {
        if !amount.is_positive() {
            return Err(LedgerError::Validation {
                message: format!("payment amount must be positive: {}", amount),
            });
        }
        let record = PaymentRecord::new(booking, owner, amount, payment_method, time.now());
        let id = record.id;
        self.payments
            .lock()
            .expect("payment lock poisoned")
            .insert(id, record);
        Ok(id)
    }

    /// create a gateway order for an online payment
    pub fn create_order(&self, gateway: &dyn PaymentGateway, payment: PaymentId) -> Result<String> {
        let (amount, booking) = {
            let payments = self.payments.lock().expect("payment lock poisoned");
            let record = payments
                .get(&payment)
                .ok_or(LedgerError::PaymentNotFound { payment })?;
            if record.payment_method != PaymentMethod::Razorpay {
                return Err(LedgerError::Validation {
                    message: "orders only apply to online payments".to_string(),
                });
            }
            (record.amount, record.booking)
        };

        let order_id = gateway.create_order(amount, &format!("booking_{}", booking))?;

        let mut payments = self.payments.lock().expect("payment lock poisoned");
        if let Some(record) = payments.get_mut(&payment) {
            record.gateway_order_id = Some(order_id.clone());
        }
        Ok(order_id)
    }

    /// verify a captured payment's gateway signature before processing it
    pub fn verify_capture(
        &self,
        gateway: &dyn PaymentGateway,
        payment: PaymentId,
        gateway_payment_id: &str,
        signature: &str,
    ) -> Result<()> {
        let order_id = {
            let payments = self.payments.lock().expect("payment lock poisoned");
            let record = payments
                .get(&payment)
                .ok_or(LedgerError::PaymentNotFound { payment })?;
            record
                .gateway_order_id
                .clone()
                .ok_or(LedgerError::Validation {
                    message: "payment has no gateway order".to_string(),
                })?
        };
        if !gateway.verify_signature(&order_id, gateway_payment_id, signature) {
            return Err(LedgerError::Validation {
                message: format!("signature verification failed for {}", gateway_payment_id),
            });
        }
        Ok(())
    }

    pub fn payment(&self, id: PaymentId) -> Option<PaymentRecord> {
        self.payments
            .lock()
            .expect("payment lock poisoned")
            .get(&id)
            .cloned()
    }

    // ---- orchestrated flows ----------------------------------------------

    /// online payment captured: split commission, record an idempotent
    /// settled transaction, auto-settle oldest dues, credit the account
    ///
    /// duplicate webhook deliveries fail with `DuplicateTransaction` before
    /// any ledger mutation; callers treat that as already-processed.
    pub fn process_online_capture(
        &self,
        payment: PaymentId,
        gateway_payment_id: &str,
        time: &SafeTimeProvider,
    ) -> Result<Transaction> {
        let now = time.now();
        let record = self
            .payment(payment)
            .ok_or(LedgerError::PaymentNotFound { payment })?;
        if record.payment_method != PaymentMethod::Razorpay {
            return Err(LedgerError::Validation {
                message: "capture only applies to online payments".to_string(),
            });
        }

        let state = self.owner_state(record.owner, now);
        let mut state = state.lock().expect("owner lock poisoned");

        // settings snapshot captured atomically with the operation
        let settings = self.settings.snapshot();
        let split = commission::calculate(record.amount, &settings)?;

        let mut transaction =
            Transaction::new(record.owner, TransactionType::RazorpayPayment, now);
        transaction.booking = Some(record.booking);
        transaction.payment = Some(payment);
        transaction.booking_amount = split.gross_amount;
        transaction.commission_percentage = split.commission_percentage;
        transaction.commission_amount = split.commission;
        transaction.processing_fee = split.processing_fee;
        transaction.net_amount = split.net_amount;
        transaction.status = TransactionStatus::Settled;
        transaction.settled_at = Some(now);
        transaction.idempotency_key = Some(format!("rzp_{}", gateway_payment_id));
        let result = transaction.clone();

        // the idempotency check is the last fallible step before mutation
        self.log.record(transaction)?;

        if settings.auto_settle_enabled {
            let settled = state
                .dues
                .settle_oldest_first(split.net_amount, result.id, now);
            for due in &settled {
                state.account.settle_dues(due.due_amount);
                self.emit(Event::DueSettled {
                    owner: record.owner,
                    due: due.id,
                    amount: due.due_amount,
                    via_transaction: result.id,
                    timestamp: now,
                });
            }
        }

        state
            .account
            .credit(split.gross_amount, split.commission, split.net_amount);

        // dues only decreased here; block state re-evaluated but never
        // auto-cleared
        let threshold = settings.block_dues_amount;
        if state.account.evaluate_block_status(threshold, now) {
            self.emit_blocked(&state.account, threshold, now);
        }

        {
            let mut payments = self.payments.lock().expect("payment lock poisoned");
            if let Some(p) = payments.get_mut(&payment) {
                p.status = PaymentStatus::Completed;
                p.gateway_payment_id = Some(gateway_payment_id.to_string());
                p.commission_applied = true;
                p.commission_settled = true;
                p.settlement_date = Some(now);
            }
        }

        self.emit(Event::PaymentCaptured {
            owner: record.owner,
            payment,
            gross_amount: split.gross_amount,
            commission: split.commission,
            net_amount: split.net_amount,
            timestamp: now,
        });
        info!(
            owner = %record.owner,
            payment = %payment,
            net = %split.net_amount,
            "online payment captured"
        );
        Ok(result)
    }

    /// COD accepted: record a pending transaction, create a due, accrue
    /// earnings, and re-evaluate the block threshold
    ///
    /// this is the path by which an owner can newly become blocked.
    pub fn process_cod_acceptance(
        &self,
        payment: PaymentId,
        time: &SafeTimeProvider,
    ) -> Result<Transaction> {
        let now = time.now();
        let record = self
            .payment(payment)
            .ok_or(LedgerError::PaymentNotFound { payment })?;
        if record.payment_method != PaymentMethod::Cod {
            return Err(LedgerError::Validation {
                message: "COD acceptance only applies to cash payments".to_string(),
            });
        }

        let state = self.owner_state(record.owner, now);
        let mut state = state.lock().expect("owner lock poisoned");

        if !state.account.can_receive_payment() {
            return Err(LedgerError::AccountBlocked {
                owner: record.owner,
                reason: state
                    .account
                    .blocked_reason
                    .clone()
                    .unwrap_or_else(|| "account not active".to_string()),
            });
        }

        let settings = self.settings.snapshot();
        let split = commission::calculate(record.amount, &settings)?;

        let mut transaction = Transaction::new(record.owner, TransactionType::CodCollection, now);
        transaction.booking = Some(record.booking);
        transaction.payment = Some(payment);
        transaction.booking_amount = split.gross_amount;
        transaction.commission_percentage = split.commission_percentage;
        transaction.commission_amount = split.commission;
        transaction.processing_fee = split.processing_fee;
        transaction.net_amount = split.net_amount;
        transaction.idempotency_key = Some(format!("cod_{}", payment));
        let result = transaction.clone();

        self.log.record(transaction)?;

        let due_id = state.dues.create_due(
            record.owner,
            Some(record.booking),
            result.id,
            split.net_amount,
            split.commission,
            now.date_naive(),
            settings.due_days_threshold,
            now,
        );
        let expected = state
            .dues
            .get(due_id)
            .map(|d| d.expected_payment_date)
            .unwrap_or_else(|| now.date_naive());

        // gross earned and commission accrue now; the balance credit waits
        // until the cash is remitted
        state.account.credit(split.gross_amount, split.commission, Money::ZERO);
        state.account.record_due(split.net_amount);

        let threshold = settings.block_dues_amount;
        if state.account.evaluate_block_status(threshold, now) {
            self.emit_blocked(&state.account, threshold, now);
        }

        {
            let mut payments = self.payments.lock().expect("payment lock poisoned");
            if let Some(p) = payments.get_mut(&payment) {
                p.status = PaymentStatus::Pending;
                p.commission_applied = true;
                p.cod_due_amount = Some(split.net_amount);
                p.cod_due_created = Some(now);
            }
        }

        self.emit(Event::DueCreated {
            owner: record.owner,
            due: due_id,
            amount: split.net_amount,
            expected_payment_date: expected,
        });
        self.emit(Event::CodAccepted {
            owner: record.owner,
            payment,
            gross_amount: split.gross_amount,
            due_amount: split.net_amount,
            timestamp: now,
        });
        info!(
            owner = %record.owner,
            payment = %payment,
            due = %split.net_amount,
            "COD accepted, due created"
        );
        Ok(result)
    }

    /// admin marks a COD due as physically collected
    ///
    /// partial and over-collections are allowed here, unlike the automatic
    /// path: a short collection reduces the due in place, an over-collection
    /// is credited only up to the due amount. never auto-unblocks; the admin
    /// calls `unblock_owner` separately.
    pub fn settle_due_manually(
        &self,
        owner: OwnerId,
        due: DueId,
        collected_amount: Money,
        time: &SafeTimeProvider,
    ) -> Result<Transaction> {
        let now = time.now();
        let state = self.owner_state(owner, now);
        let mut state = state.lock().expect("owner lock poisoned");

        let existing = state
            .dues
            .get(due)
            .cloned()
            .ok_or(LedgerError::DueNotFound { due })?;
        if existing.is_settled {
            return Err(LedgerError::AlreadySettled { due });
        }
        if !collected_amount.is_positive() {
            return Err(LedgerError::Validation {
                message: format!("collected amount must be positive: {}", collected_amount),
            });
        }

        let settled_amount = collected_amount.min(existing.due_amount);

        let mut transaction = Transaction::new(owner, TransactionType::DueSettlement, now);
        transaction.booking = existing.booking;
        transaction.booking_amount = existing.due_amount;
        transaction.net_amount = settled_amount;
        transaction.status = TransactionStatus::Settled;
        transaction.settled_at = Some(now);
        let result = transaction.clone();
        self.log.record(transaction)?;

        let outcome = state.dues.settle_manual(due, collected_amount, result.id, now)?;

        state.account.settle_dues(outcome.settled_amount);
        state.account.current_balance += outcome.settled_amount;

        let settings = self.settings.snapshot();
        if state
            .account
            .evaluate_block_status(settings.block_dues_amount, now)
        {
            self.emit_blocked(&state.account, settings.block_dues_amount, now);
        }

        if outcome.fully_settled {
            // the originating COD transaction finally settles with the cash
            self.log.mark_settled(existing.origin_transaction, now)?;
            self.emit(Event::DueSettled {
                owner,
                due,
                amount: outcome.settled_amount,
                via_transaction: result.id,
                timestamp: now,
            });
        } else {
            self.emit(Event::DuePartiallySettled {
                owner,
                due,
                collected: outcome.settled_amount,
                remaining: outcome.remaining,
                timestamp: now,
            });
        }
        info!(
            owner = %owner,
            due = %due,
            collected = %outcome.settled_amount,
            fully_settled = outcome.fully_settled,
            "due settled manually"
        );
        Ok(result)
    }

    /// initiate a refund against a payment
    ///
    /// the monetary refund goes through the gateway (online) or is marked
    /// for manual handling (COD). commission reversal is best-effort: once
    /// the gateway has accepted the refund, a reversal failure is surfaced
    /// for reconciliation instead of rolling the refund back.
    pub fn initiate_refund(
        &self,
        gateway: &dyn PaymentGateway,
        payment: PaymentId,
        reason: RefundReason,
        refund_amount: Option<Money>,
        time: &SafeTimeProvider,
    ) -> Result<Refund> {
        let now = time.now();
        let record = self
            .payment(payment)
            .ok_or(LedgerError::PaymentNotFound { payment })?;

        let settings = self.settings.snapshot();
        let days_elapsed = (now.date_naive() - record.created_at.date_naive()).num_days();
        if days_elapsed > settings.refund_window_days as i64 {
            return Err(LedgerError::RefundWindowExpired {
                days_elapsed,
                window_days: settings.refund_window_days,
            });
        }

        let amount = refund_amount.unwrap_or(record.amount);
        if !amount.is_positive() || amount > record.amount {
            return Err(LedgerError::Validation {
                message: format!(
                    "refund amount {} invalid for payment of {}",
                    amount, record.amount
                ),
            });
        }

        let refund_charges = amount.percent_of(settings.refund_charge_percentage);
        let net_refund = amount - refund_charges;

        let gateway_payment_id = match record.payment_method {
            PaymentMethod::Razorpay => Some(record.gateway_payment_id.clone().ok_or(
                LedgerError::Validation {
                    message: "payment was never captured by the gateway".to_string(),
                },
            )?),
            // COD refunds are handed back in person; nothing to call
            PaymentMethod::Cod => None,
        };

        let mut refund = Refund {
            id: Uuid::new_v4(),
            payment,
            reason,
            refund_amount: amount,
            refund_charges,
            net_refund_amount: net_refund,
            gateway_refund_id: None,
            status: RefundStatus::Initiated,
            created_at: now,
            completed_at: None,
        };

        // the duplicate check and the insertion happen under one lock
        // acquisition: the record is reserved before the gateway call, so a
        // concurrent initiation for the same payment fails here instead of
        // double-debiting the ledger
        {
            let mut refunds = self.refunds.lock().expect("refund lock poisoned");
            let exists = refunds.iter().any(|r| {
                r.payment == payment
                    && !matches!(r.status, RefundStatus::Failed | RefundStatus::Cancelled)
            });
            if exists || record.status == PaymentStatus::Refunded {
                return Err(LedgerError::AlreadyRefunded { payment });
            }
            refunds.push(refund.clone());
        }

        match &gateway_payment_id {
            Some(gateway_payment_id) => match gateway.create_refund(gateway_payment_id, amount) {
                Ok(refund_id) => {
                    refund.gateway_refund_id = Some(refund_id);
                    refund.status = RefundStatus::Processing;
                }
                Err(err) => {
                    refund.status = RefundStatus::Failed;
                    self.store_refund(&refund);
                    self.emit(Event::RefundFailed {
                        refund: refund.id,
                        reason: err.to_string(),
                        timestamp: now,
                    });
                    error!(payment = %payment, %err, "gateway refund failed");
                    return Err(err);
                }
            },
            None => refund.status = RefundStatus::Processing,
        }
        self.store_refund(&refund);

        // best-effort from here on: money has already left the platform
        self.reverse_commission(&record, amount, net_refund, now);

        {
            let mut payments = self.payments.lock().expect("payment lock poisoned");
            if let Some(p) = payments.get_mut(&payment) {
                p.status = if amount == record.amount {
                    PaymentStatus::Refunded
                } else {
                    PaymentStatus::PartiallyRefunded
                };
            }
        }

        self.emit(Event::RefundInitiated {
            owner: record.owner,
            payment,
            refund: refund.id,
            net_refund,
            timestamp: now,
        });
        info!(payment = %payment, net_refund = %net_refund, "refund initiated");
        Ok(refund)
    }

    /// write back a reserved refund record once its status has moved on
    fn store_refund(&self, refund: &Refund) {
        let mut refunds = self.refunds.lock().expect("refund lock poisoned");
        if let Some(r) = refunds.iter_mut().find(|r| r.id == refund.id) {
            *r = refund.clone();
        }
    }

    /// reverse commission proportionally to the refunded net amount
    ///
    /// failures are logged and emitted for manual reconciliation, never
    /// propagated: the refund itself is already committed.
    fn reverse_commission(
        &self,
        record: &PaymentRecord,
        refund_amount: Money,
        net_refund: Money,
        now: DateTime<Utc>,
    ) {
        let original = match self.log.find_original_for_payment(record.id) {
            Some(t) => t,
            None => {
                warn!(
                    payment = %record.id,
                    "no commission transaction found for refunded payment; manual reconciliation required"
                );
                self.emit(Event::ReconciliationRequired {
                    owner: Some(record.owner),
                    payment: Some(record.id),
                    detail: "refund issued but no original commission transaction found"
                        .to_string(),
                    timestamp: now,
                });
                return;
            }
        };

        // commission reverses in proportion to the gross amount refunded; a
        // full refund reverses the full commission
        let ratio = if original.booking_amount.is_positive() {
            refund_amount.as_decimal() / original.booking_amount.as_decimal()
        } else {
            rust_decimal::Decimal::ZERO
        };
        let reversed_commission = original.commission_amount * ratio;

        let mut reversal = Transaction::new(record.owner, TransactionType::Reversal, now);
        reversal.booking = Some(record.booking);
        reversal.payment = Some(record.id);
        reversal.commission_amount = -reversed_commission;
        reversal.net_amount = -net_refund;
        reversal.status = TransactionStatus::Settled;
        reversal.settled_at = Some(now);
        reversal.notes = format!("reversal for refund of {}", net_refund);
        let reversal_id = reversal.id;

        if let Err(err) = self.log.record(reversal) {
            error!(payment = %record.id, %err, "reversal transaction failed; manual reconciliation required");
            self.emit(Event::ReconciliationRequired {
                owner: Some(record.owner),
                payment: Some(record.id),
                detail: format!("commission reversal failed: {}", err),
                timestamp: now,
            });
            return;
        }

        let state = self.owner_state(record.owner, now);
        let mut state = state.lock().expect("owner lock poisoned");
        state.account.debit_for_refund(net_refund, reversed_commission);

        self.emit(Event::CommissionReversed {
            owner: record.owner,
            payment: record.id,
            reversed_commission,
            net_refund,
            timestamp: now,
        });
        info!(
            owner = %record.owner,
            payment = %record.id,
            reversal = %reversal_id,
            reversed = %reversed_commission,
            "commission reversed"
        );
    }

    // ---- payouts ---------------------------------------------------------

    /// owner requests withdrawal of part of their balance
    pub fn request_payout(
        &self,
        owner: OwnerId,
        amount: Money,
        bank_details: BankDetails,
        time: &SafeTimeProvider,
    ) -> Result<PayoutRequest> {
        let now = time.now();
        if !amount.is_positive() {
            return Err(LedgerError::Validation {
                message: format!("payout amount must be positive: {}", amount),
            });
        }

        let state = self.owner_state(owner, now);
        let state = state.lock().expect("owner lock poisoned");
        if state.account.is_blocked {
            return Err(LedgerError::AccountBlocked {
                owner,
                reason: state
                    .account
                    .blocked_reason
                    .clone()
                    .unwrap_or_else(|| "account blocked".to_string()),
            });
        }
        if amount > state.account.current_balance {
            return Err(LedgerError::InsufficientBalance {
                available: state.account.current_balance,
                requested: amount,
            });
        }
        drop(state);

        let payout = PayoutRequest::new(owner, amount, bank_details, now);
        self.payouts
            .lock()
            .expect("payout lock poisoned")
            .push(payout.clone());
        self.emit(Event::PayoutRequested {
            owner,
            payout: payout.id,
            amount,
            timestamp: now,
        });
        Ok(payout)
    }

    /// admin approves a pending payout; the balance is debited only after
    /// the gateway payout succeeds
    pub fn approve_payout(
        &self,
        gateway: &dyn PaymentGateway,
        payout: PayoutId,
        time: &SafeTimeProvider,
    ) -> Result<PayoutRequest> {
        let now = time.now();
        let (owner, amount, bank) = {
            let mut payouts = self.payouts.lock().expect("payout lock poisoned");
            let request = payouts
                .iter()
                .find(|p| p.id == payout)
                .ok_or(LedgerError::Validation {
                    message: format!("unknown payout: {}", payout),
                })?;
            if request.status != PayoutStatus::Pending {
                return Err(LedgerError::PayoutNotPending {
                    payout,
                    status: request.status,
                });
            }
            let (owner, amount) = (request.owner, request.amount);

            // the balance may have shrunk since the request; re-check here,
            // counting funds already committed to in-flight payouts. the
            // check and the transition to processing happen under the same
            // lock, so concurrent approvals cannot both pass
            let reserved = payouts
                .iter()
                .filter(|p| p.owner == owner && p.status == PayoutStatus::Processing)
                .fold(Money::ZERO, |acc, p| acc + p.amount);
            let available = {
                let state = self.owner_state(owner, now);
                let balance = state.lock().expect("owner lock poisoned").account.current_balance;
                balance - reserved
            };
            if amount > available {
                return Err(LedgerError::InsufficientBalance {
                    available,
                    requested: amount,
                });
            }

            let request = payouts
                .iter_mut()
                .find(|p| p.id == payout)
                .expect("payout disappeared");
            request.status = PayoutStatus::Processing;
            (owner, amount, request.bank_details.clone())
        };

        // no owner lock held across the gateway call
        match gateway.create_payout(&bank, amount) {
            Ok(gateway_payout_id) => {
                let state = self.owner_state(owner, now);
                let mut state = state.lock().expect("owner lock poisoned");
                state.account.record_payout(amount, now);
                drop(state);

                let mut payouts = self.payouts.lock().expect("payout lock poisoned");
                let request = payouts
                    .iter_mut()
                    .find(|p| p.id == payout)
                    .expect("payout disappeared");
                request.status = PayoutStatus::Completed;
                request.gateway_payout_id = Some(gateway_payout_id);
                request.completed_at = Some(now);
                let result = request.clone();
                drop(payouts);

                self.emit(Event::PayoutCompleted {
                    owner,
                    payout,
                    amount,
                    timestamp: now,
                });
                info!(owner = %owner, payout = %payout, amount = %amount, "payout completed");
                Ok(result)
            }
            Err(err) => {
                let mut payouts = self.payouts.lock().expect("payout lock poisoned");
                if let Some(request) = payouts.iter_mut().find(|p| p.id == payout) {
                    request.status = PayoutStatus::Failed;
                }
                drop(payouts);

                self.emit(Event::PayoutFailed {
                    owner,
                    payout,
                    reason: err.to_string(),
                    timestamp: now,
                });
                error!(owner = %owner, payout = %payout, %err, "gateway payout failed");
                Err(err)
            }
        }
    }

    /// admin rejects a pending payout; no balance change
    pub fn reject_payout(
        &self,
        payout: PayoutId,
        reason: &str,
        time: &SafeTimeProvider,
    ) -> Result<PayoutRequest> {
        let now = time.now();
        let mut payouts = self.payouts.lock().expect("payout lock poisoned");
        let request = payouts
            .iter_mut()
            .find(|p| p.id == payout)
            .ok_or(LedgerError::Validation {
                message: format!("unknown payout: {}", payout),
            })?;
        if request.status != PayoutStatus::Pending {
            return Err(LedgerError::PayoutNotPending {
                payout,
                status: request.status,
            });
        }
        request.status = PayoutStatus::Rejected;
        request.rejection_reason = Some(reason.to_string());
        let result = request.clone();
        drop(payouts);

        self.emit(Event::PayoutRejected {
            owner: result.owner,
            payout,
            reason: reason.to_string(),
            timestamp: now,
        });
        Ok(result)
    }

    pub fn payout(&self, id: PayoutId) -> Option<PayoutRequest> {
        self.payouts
            .lock()
            .expect("payout lock poisoned")
            .iter()
            .find(|p| p.id == id)
            .cloned()
    }

    // ---- admin operations ------------------------------------------------

    /// explicit, audited unblock
    pub fn unblock_owner(&self, owner: OwnerId, reason: &str, time: &SafeTimeProvider) {
        let now = time.now();
        let state = self.owner_state(owner, now);
        let mut state = state.lock().expect("owner lock poisoned");
        state.account.unblock(reason, now);
        drop(state);
        self.emit(Event::OwnerUnblocked {
            owner,
            reason: reason.to_string(),
            timestamp: now,
        });
    }

    /// audited manual balance adjustment
    pub fn adjust_balance(
        &self,
        owner: OwnerId,
        amount: Money,
        reason: &str,
        time: &SafeTimeProvider,
    ) -> Result<Transaction> {
        if amount.is_zero() {
            return Err(LedgerError::Validation {
                message: "adjustment amount must be non-zero".to_string(),
            });
        }
        let now = time.now();
        let state = self.owner_state(owner, now);
        let mut state = state.lock().expect("owner lock poisoned");

        let mut transaction = Transaction::new(owner, TransactionType::Adjustment, now);
        transaction.net_amount = amount;
        transaction.status = TransactionStatus::Settled;
        transaction.settled_at = Some(now);
        transaction.notes = reason.to_string();
        let result = transaction.clone();
        self.log.record(transaction)?;

        state.account.current_balance += amount;
        drop(state);

        self.emit(Event::BalanceAdjusted {
            owner,
            amount,
            reason: reason.to_string(),
            timestamp: now,
        });
        info!(owner = %owner, amount = %amount, reason, "balance adjusted");
        Ok(result)
    }

    /// store bank details on an owner's account
    pub fn set_bank_details(&self, owner: OwnerId, details: BankDetails, time: &SafeTimeProvider) {
        let state = self.owner_state(owner, time.now());
        let mut state = state.lock().expect("owner lock poisoned");
        state.account.set_bank_details(details);
    }

    // ---- periodic sweeps -------------------------------------------------

    /// refresh aging for every unsettled due across all owners
    ///
    /// returns the number of dues whose bucket or overdue count changed.
    pub fn refresh_aging(&self, time: &SafeTimeProvider) -> usize {
        let today = time.now().date_naive();
        let states: Vec<Arc<Mutex<OwnerState>>> = {
            let owners = self.owners.read().expect("owner map lock poisoned");
            owners.values().map(Arc::clone).collect()
        };

        let mut changed_count = 0;
        for state in states {
            let mut state = state.lock().expect("owner lock poisoned");
            let changed = state.dues.refresh_aging(today);
            changed_count += changed.len();
            for due in changed {
                self.emit(Event::DueAgingChanged {
                    owner: due.owner,
                    due: due.id,
                    days_overdue: due.days_overdue,
                    bucket: due.aging_bucket,
                });
            }
        }
        changed_count
    }

    /// reconcile in-flight refunds against gateway-reported status
    ///
    /// a refund the gateway reports failed after we debited the ledger is a
    /// discrepancy surfaced for operator review, never silently dropped.
    pub fn reconcile_refunds(
        &self,
        gateway: &dyn PaymentGateway,
        time: &SafeTimeProvider,
    ) -> usize {
        let now = time.now();
        let in_flight: Vec<(Uuid, String, PaymentId)> = {
            let refunds = self.refunds.lock().expect("refund lock poisoned");
            refunds
                .iter()
                .filter(|r| r.status == RefundStatus::Processing)
                .filter_map(|r| {
                    r.gateway_refund_id
                        .clone()
                        .map(|gid| (r.id, gid, r.payment))
                })
                .collect()
        };

        let mut updated = 0;
        for (refund_id, gateway_id, payment) in in_flight {
            match gateway.fetch_status(&gateway_id) {
                Ok(GatewayStatus::Completed) => {
                    let mut refunds = self.refunds.lock().expect("refund lock poisoned");
                    if let Some(r) = refunds.iter_mut().find(|r| r.id == refund_id) {
                        r.status = RefundStatus::Completed;
                        r.completed_at = Some(now);
                    }
                    drop(refunds);
                    self.emit(Event::RefundCompleted {
                        refund: refund_id,
                        timestamp: now,
                    });
                    updated += 1;
                }
                Ok(GatewayStatus::Failed) => {
                    let owner = self.payment(payment).map(|p| p.owner);
                    let mut refunds = self.refunds.lock().expect("refund lock poisoned");
                    if let Some(r) = refunds.iter_mut().find(|r| r.id == refund_id) {
                        r.status = RefundStatus::Failed;
                    }
                    drop(refunds);
                    error!(
                        refund = %refund_id,
                        payment = %payment,
                        "gateway reports refund failed after ledger was adjusted; manual reconciliation required"
                    );
                    self.emit(Event::ReconciliationRequired {
                        owner,
                        payment: Some(payment),
                        detail: "gateway reports refund failed after ledger adjustment"
                            .to_string(),
                        timestamp: now,
                    });
                    updated += 1;
                }
                Ok(_) => {} // still in flight
                Err(err) => {
                    warn!(refund = %refund_id, %err, "refund status fetch failed; will retry next sweep");
                }
            }
        }
        updated
    }

    // ---- read-only views -------------------------------------------------

    pub fn account(&self, owner: OwnerId) -> Option<OwnerAccount> {
        let owners = self.owners.read().expect("owner map lock poisoned");
        let state = owners.get(&owner)?;
        let state = state.lock().expect("owner lock poisoned");
        Some(state.account.clone())
    }

    pub fn dues_for(&self, owner: OwnerId) -> Vec<Due> {
        let owners = self.owners.read().expect("owner map lock poisoned");
        match owners.get(&owner) {
            Some(state) => {
                let state = state.lock().expect("owner lock poisoned");
                state.dues.dues().to_vec()
            }
            None => Vec::new(),
        }
    }

    pub fn refunds_for_payment(&self, payment: PaymentId) -> Vec<Refund> {
        self.refunds
            .lock()
            .expect("refund lock poisoned")
            .iter()
            .filter(|r| r.payment == payment)
            .cloned()
            .collect()
    }

    /// owner dashboard: account snapshot plus aging summary
    pub fn owner_dashboard(&self, owner: OwnerId) -> Option<OwnerDashboard> {
        let owners = self.owners.read().expect("owner map lock poisoned");
        let state = owners.get(&owner)?;
        let state = state.lock().expect("owner lock poisoned");
        Some(OwnerDashboard {
            account: state.account.clone(),
            aging: state.dues.aging_summary(),
            unsettled_due_count: state.dues.dues().iter().filter(|d| !d.is_settled).count(),
        })
    }

    /// serializable snapshot of all accounts and dues for audit export
    pub fn snapshot(&self, time: &SafeTimeProvider) -> LedgerSnapshot {
        let owners = self.owners.read().expect("owner map lock poisoned");
        let mut accounts = Vec::new();
        let mut dues = Vec::new();
        for state in owners.values() {
            let state = state.lock().expect("owner lock poisoned");
            accounts.push(state.account.clone());
            dues.extend_from_slice(state.dues.dues());
        }
        accounts.sort_by_key(|a| a.owner);
        dues.sort_by_key(|d| (d.due_date, d.created_at));
        LedgerSnapshot {
            taken_at: time.now(),
            accounts,
            dues,
        }
    }

    fn emit_blocked(&self, account: &OwnerAccount, threshold: Money, now: DateTime<Utc>) {
        warn!(
            owner = %account.owner,
            pending_dues = %account.pending_dues,
            %threshold,
            "owner auto-blocked on dues threshold"
        );
        self.emit(Event::OwnerBlocked {
            owner: account.owner,
            pending_dues: account.pending_dues,
            threshold,
            timestamp: now,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decimal::Rate;
    use crate::dues::AgingBucket;
    use chrono::{Duration, TimeZone};
    use hourglass_rs::TimeSource;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn test_time() -> SafeTimeProvider {
        SafeTimeProvider::new(TimeSource::Test(
            Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(),
        ))
    }

    fn bank() -> BankDetails {
        BankDetails {
            account_number: "1234567890".to_string(),
            ifsc_code: "HDFC0001234".to_string(),
            holder_name: "Asha Rao".to_string(),
            verified: true,
        }
    }

    struct FakeGateway {
        fail_refunds: AtomicBool,
        fail_payouts: AtomicBool,
        refund_outcome: Mutex<GatewayStatus>,
    }

    impl Default for FakeGateway {
        fn default() -> Self {
            Self {
                fail_refunds: AtomicBool::new(false),
                fail_payouts: AtomicBool::new(false),
                refund_outcome: Mutex::new(GatewayStatus::Processing),
            }
        }
    }

    impl PaymentGateway for FakeGateway {
        fn create_order(&self, _amount: Money, receipt: &str) -> Result<String> {
            Ok(format!("order_{}", receipt))
        }

        fn verify_signature(&self, _order_id: &str, _payment_id: &str, signature: &str) -> bool {
            signature == "valid"
        }

        fn create_refund(&self, gateway_payment_id: &str, _amount: Money) -> Result<String> {
            if self.fail_refunds.load(Ordering::SeqCst) {
                return Err(LedgerError::Gateway {
                    message: "refund declined".to_string(),
                });
            }
            Ok(format!("rfnd_{}", gateway_payment_id))
        }

        fn create_payout(&self, _bank: &BankDetails, _amount: Money) -> Result<String> {
            if self.fail_payouts.load(Ordering::SeqCst) {
                return Err(LedgerError::Gateway {
                    message: "payout declined".to_string(),
                });
            }
            Ok("pout_1".to_string())
        }

        fn fetch_status(&self, _id: &str) -> Result<GatewayStatus> {
            Ok(*self.refund_outcome.lock().unwrap())
        }
    }

    fn captured_online_payment(
        ledger: &CommissionLedger,
        owner: OwnerId,
        amount: Money,
        gateway_payment_id: &str,
        time: &SafeTimeProvider,
    ) -> PaymentId {
        let payment = ledger
            .register_payment(Uuid::new_v4(), owner, amount, PaymentMethod::Razorpay, time)
            .unwrap();
        ledger
            .process_online_capture(payment, gateway_payment_id, time)
            .unwrap();
        payment
    }

    #[test]
    fn test_online_capture_credits_net_amount() {
        let time = test_time();
        let ledger = CommissionLedger::new();
        let owner = Uuid::new_v4();

        // defaults: 10% commission, 2.5% processing fee
        captured_online_payment(&ledger, owner, Money::from_major(1_000), "pay_1", &time);

        let account = ledger.account(owner).unwrap();
        assert_eq!(account.total_earned, Money::from_major(1_000));
        assert_eq!(account.total_commission_deducted, Money::from_major(100));
        assert_eq!(account.current_balance, Money::from_major(875));
        assert_eq!(account.pending_dues, Money::ZERO);

        let events = ledger.take_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::PaymentCaptured { net_amount, .. } if *net_amount == Money::from_major(875))));
    }

    #[test]
    fn test_duplicate_capture_leaves_no_partial_state() {
        let time = test_time();
        let ledger = CommissionLedger::new();
        let owner = Uuid::new_v4();
        let payment = captured_online_payment(
            &ledger,
            owner,
            Money::from_major(1_000),
            "pay_dup",
            &time,
        );

        // webhook redelivery
        let err = ledger
            .process_online_capture(payment, "pay_dup", &time)
            .unwrap_err();
        assert!(err.is_duplicate());

        let account = ledger.account(owner).unwrap();
        assert_eq!(account.current_balance, Money::from_major(875));
        assert_eq!(ledger.transactions().len(), 1);
    }

    #[test]
    fn test_cod_creates_due_and_pending_transaction() {
        let time = test_time();
        let ledger = CommissionLedger::new();
        let owner = Uuid::new_v4();

        let payment = ledger
            .register_payment(
                Uuid::new_v4(),
                owner,
                Money::from_major(500),
                PaymentMethod::Cod,
                &time,
            )
            .unwrap();
        let transaction = ledger.process_cod_acceptance(payment, &time).unwrap();
        assert_eq!(transaction.status, TransactionStatus::Pending);

        // 10% of 500 = 50 == minimum_commission; fee 12.50; net 437.50
        let account = ledger.account(owner).unwrap();
        assert_eq!(account.pending_dues, Money::from_str_exact("437.50").unwrap());
        assert_eq!(account.current_balance, Money::ZERO);
        assert_eq!(account.total_earned, Money::from_major(500));

        let dues = ledger.dues_for(owner);
        assert_eq!(dues.len(), 1);
        assert_eq!(dues[0].due_amount, account.pending_dues);
        assert_eq!(dues[0].origin_transaction, transaction.id);

        let record = ledger.payment(payment).unwrap();
        assert_eq!(record.status, PaymentStatus::Pending);
        assert_eq!(record.cod_due_amount, Some(account.pending_dues));
    }

    #[test]
    fn test_pending_dues_matches_due_book_total() {
        let time = test_time();
        let ledger = CommissionLedger::new();
        let owner = Uuid::new_v4();

        for amount in [500, 800, 1_200] {
            let payment = ledger
                .register_payment(
                    Uuid::new_v4(),
                    owner,
                    Money::from_major(amount),
                    PaymentMethod::Cod,
                    &time,
                )
                .unwrap();
            ledger.process_cod_acceptance(payment, &time).unwrap();
        }

        let account = ledger.account(owner).unwrap();
        let book_total = ledger
            .dues_for(owner)
            .iter()
            .filter(|d| !d.is_settled)
            .fold(Money::ZERO, |acc, d| acc + d.due_amount);
        assert_eq!(account.pending_dues, book_total);
    }

    #[test]
    fn test_block_on_threshold_and_explicit_unblock() {
        let time = test_time();
        let ledger = CommissionLedger::new();
        let owner = Uuid::new_v4();

        // push dues over the default 10,000 threshold: gross 12,000 ->
        // net due 10,500
        let payment = ledger
            .register_payment(
                Uuid::new_v4(),
                owner,
                Money::from_major(12_000),
                PaymentMethod::Cod,
                &time,
            )
            .unwrap();
        ledger.process_cod_acceptance(payment, &time).unwrap();

        let account = ledger.account(owner).unwrap();
        assert!(account.is_blocked);
        assert!(ledger
            .take_events()
            .iter()
            .any(|e| matches!(e, Event::OwnerBlocked { .. })));

        // blocked owner cannot accept further COD
        let next = ledger
            .register_payment(
                Uuid::new_v4(),
                owner,
                Money::from_major(100),
                PaymentMethod::Cod,
                &time,
            )
            .unwrap();
        assert!(matches!(
            ledger.process_cod_acceptance(next, &time),
            Err(LedgerError::AccountBlocked { .. })
        ));

        ledger.unblock_owner(owner, "cleared dues at office", &time);
        assert!(!ledger.account(owner).unwrap().is_blocked);
        ledger.process_cod_acceptance(next, &time).unwrap();
    }

    #[test]
    fn test_online_capture_auto_settles_oldest_dues() {
        let time = test_time();
        let ledger = CommissionLedger::new();
        let owner = Uuid::new_v4();

        // COD of 500 creates a due of 437.50
        let cod = ledger
            .register_payment(
                Uuid::new_v4(),
                owner,
                Money::from_major(500),
                PaymentMethod::Cod,
                &time,
            )
            .unwrap();
        ledger.process_cod_acceptance(cod, &time).unwrap();

        // online capture nets 875, enough to fully cover the due
        captured_online_payment(&ledger, owner, Money::from_major(1_000), "pay_auto", &time);

        let account = ledger.account(owner).unwrap();
        assert_eq!(account.pending_dues, Money::ZERO);
        assert_eq!(account.settled_dues, Money::from_str_exact("437.50").unwrap());
        assert_eq!(account.current_balance, Money::from_major(875));
        assert!(ledger.dues_for(owner)[0].is_settled);

        assert!(ledger
            .take_events()
            .iter()
            .any(|e| matches!(e, Event::DueSettled { .. })));
    }

    #[test]
    fn test_manual_settlement_settles_origin_transaction() {
        let time = test_time();
        let ledger = CommissionLedger::new();
        let owner = Uuid::new_v4();

        let payment = ledger
            .register_payment(
                Uuid::new_v4(),
                owner,
                Money::from_major(500),
                PaymentMethod::Cod,
                &time,
            )
            .unwrap();
        let origin = ledger.process_cod_acceptance(payment, &time).unwrap();
        let due = ledger.dues_for(owner)[0].clone();

        ledger
            .settle_due_manually(owner, due.id, due.due_amount, &time)
            .unwrap();

        let account = ledger.account(owner).unwrap();
        assert_eq!(account.pending_dues, Money::ZERO);
        assert_eq!(account.settled_dues, due.due_amount);
        assert_eq!(account.current_balance, due.due_amount);

        let settled_origin = ledger.transactions().get(origin.id).unwrap();
        assert_eq!(settled_origin.status, TransactionStatus::Settled);
        assert!(settled_origin.settled_at.is_some());

        // settling again is rejected
        assert!(matches!(
            ledger.settle_due_manually(owner, due.id, due.due_amount, &time),
            Err(LedgerError::AlreadySettled { .. })
        ));
    }

    #[test]
    fn test_manual_partial_settlement_keeps_origin_pending() {
        let time = test_time();
        let ledger = CommissionLedger::new();
        let owner = Uuid::new_v4();

        let payment = ledger
            .register_payment(
                Uuid::new_v4(),
                owner,
                Money::from_major(500),
                PaymentMethod::Cod,
                &time,
            )
            .unwrap();
        let origin = ledger.process_cod_acceptance(payment, &time).unwrap();
        let due = ledger.dues_for(owner)[0].clone();

        ledger
            .settle_due_manually(owner, due.id, Money::from_major(100), &time)
            .unwrap();

        let account = ledger.account(owner).unwrap();
        assert_eq!(account.pending_dues, due.due_amount - Money::from_major(100));
        assert_eq!(account.current_balance, Money::from_major(100));
        assert_eq!(
            ledger.transactions().get(origin.id).unwrap().status,
            TransactionStatus::Pending
        );
        assert!(ledger
            .take_events()
            .iter()
            .any(|e| matches!(e, Event::DuePartiallySettled { .. })));
    }

    #[test]
    fn test_full_refund_reverses_full_commission() {
        let time = test_time();
        let ledger = CommissionLedger::new();
        let gateway = FakeGateway::default();
        let owner = Uuid::new_v4();
        let payment =
            captured_online_payment(&ledger, owner, Money::from_major(1_000), "pay_r1", &time);

        let refund = ledger
            .initiate_refund(&gateway, payment, RefundReason::BookingCancelled, None, &time)
            .unwrap();

        // 2% refund charge on 1,000
        assert_eq!(refund.refund_charges, Money::from_major(20));
        assert_eq!(refund.net_refund_amount, Money::from_major(980));
        assert_eq!(refund.status, RefundStatus::Processing);
        assert!(refund.gateway_refund_id.is_some());

        let account = ledger.account(owner).unwrap();
        // balance 875 debited by the 980 net refund
        assert_eq!(account.current_balance, Money::from_major(-105));
        // full commission reversed
        assert_eq!(account.total_commission_deducted, Money::ZERO);

        assert_eq!(
            ledger.payment(payment).unwrap().status,
            PaymentStatus::Refunded
        );
        let events = ledger.take_events();
        assert!(events.iter().any(|e| matches!(
            e,
            Event::CommissionReversed { reversed_commission, .. }
                if *reversed_commission == Money::from_major(100)
        )));
    }

    #[test]
    fn test_partial_refund_reverses_proportional_commission() {
        let time = test_time();
        let ledger = CommissionLedger::new();
        let gateway = FakeGateway::default();
        let owner = Uuid::new_v4();
        let payment =
            captured_online_payment(&ledger, owner, Money::from_major(1_000), "pay_r2", &time);

        ledger
            .initiate_refund(
                &gateway,
                payment,
                RefundReason::CustomerRequest,
                Some(Money::from_major(400)),
                &time,
            )
            .unwrap();

        let account = ledger.account(owner).unwrap();
        // 40% of the 100 commission reversed
        assert_eq!(account.total_commission_deducted, Money::from_major(60));
        // net refund 400 - 2% = 392; balance 875 - 392
        assert_eq!(account.current_balance, Money::from_major(483));
        assert_eq!(
            ledger.payment(payment).unwrap().status,
            PaymentStatus::PartiallyRefunded
        );
    }

    #[test]
    fn test_refund_rejected_outside_window() {
        let time = test_time();
        let ledger = CommissionLedger::new();
        let gateway = FakeGateway::default();
        let owner = Uuid::new_v4();
        let payment =
            captured_online_payment(&ledger, owner, Money::from_major(1_000), "pay_r3", &time);

        let control = time.test_control().unwrap();
        control.advance(Duration::days(8));

        assert!(matches!(
            ledger.initiate_refund(&gateway, payment, RefundReason::CustomerRequest, None, &time),
            Err(LedgerError::RefundWindowExpired { days_elapsed: 8, window_days: 7 })
        ));
    }

    #[test]
    fn test_refund_gateway_failure_leaves_ledger_untouched() {
        let time = test_time();
        let ledger = CommissionLedger::new();
        let gateway = FakeGateway::default();
        gateway.fail_refunds.store(true, Ordering::SeqCst);
        let owner = Uuid::new_v4();
        let payment =
            captured_online_payment(&ledger, owner, Money::from_major(1_000), "pay_r4", &time);

        let err = ledger
            .initiate_refund(&gateway, payment, RefundReason::PaymentError, None, &time)
            .unwrap_err();
        assert!(matches!(err, LedgerError::Gateway { .. }));

        let account = ledger.account(owner).unwrap();
        assert_eq!(account.current_balance, Money::from_major(875));
        assert_eq!(account.total_commission_deducted, Money::from_major(100));
        assert_eq!(
            ledger.payment(payment).unwrap().status,
            PaymentStatus::Completed
        );
        assert_eq!(ledger.refunds_for_payment(payment)[0].status, RefundStatus::Failed);

        // a failed refund does not block a retry
        gateway.fail_refunds.store(false, Ordering::SeqCst);
        ledger
            .initiate_refund(&gateway, payment, RefundReason::PaymentError, None, &time)
            .unwrap();
    }

    #[test]
    fn test_second_refund_rejected() {
        let time = test_time();
        let ledger = CommissionLedger::new();
        let gateway = FakeGateway::default();
        let owner = Uuid::new_v4();
        let payment =
            captured_online_payment(&ledger, owner, Money::from_major(1_000), "pay_r5", &time);

        ledger
            .initiate_refund(&gateway, payment, RefundReason::CustomerRequest, None, &time)
            .unwrap();
        assert!(matches!(
            ledger.initiate_refund(&gateway, payment, RefundReason::CustomerRequest, None, &time),
            Err(LedgerError::AlreadyRefunded { .. })
        ));
    }

    struct ReentrantRefundGateway<'a> {
        ledger: &'a CommissionLedger,
        inner: FakeGateway,
        time: &'a SafeTimeProvider,
        payment: PaymentId,
        second_attempt: Mutex<Option<Result<Refund>>>,
    }

    impl PaymentGateway for ReentrantRefundGateway<'_> {
        fn create_order(&self, amount: Money, receipt: &str) -> Result<String> {
            self.inner.create_order(amount, receipt)
        }

        fn verify_signature(&self, order_id: &str, payment_id: &str, signature: &str) -> bool {
            self.inner.verify_signature(order_id, payment_id, signature)
        }

        fn create_refund(&self, gateway_payment_id: &str, amount: Money) -> Result<String> {
            // a second initiation arrives while this one is still at the
            // gateway; it must see the reserved record and be rejected
            let result = self.ledger.initiate_refund(
                &self.inner,
                self.payment,
                RefundReason::CustomerRequest,
                None,
                self.time,
            );
            *self.second_attempt.lock().unwrap() = Some(result);
            self.inner.create_refund(gateway_payment_id, amount)
        }

        fn create_payout(&self, bank: &BankDetails, amount: Money) -> Result<String> {
            self.inner.create_payout(bank, amount)
        }

        fn fetch_status(&self, id: &str) -> Result<GatewayStatus> {
            self.inner.fetch_status(id)
        }
    }

    #[test]
    fn test_refund_reserved_before_gateway_call() {
        let time = test_time();
        let ledger = CommissionLedger::new();
        let owner = Uuid::new_v4();
        let payment =
            captured_online_payment(&ledger, owner, Money::from_major(1_000), "pay_r8", &time);
        let gateway = ReentrantRefundGateway {
            ledger: &ledger,
            inner: FakeGateway::default(),
            time: &time,
            payment,
            second_attempt: Mutex::new(None),
        };

        ledger
            .initiate_refund(&gateway, payment, RefundReason::CustomerRequest, None, &time)
            .unwrap();

        let second = gateway.second_attempt.lock().unwrap().take().unwrap();
        assert!(matches!(second, Err(LedgerError::AlreadyRefunded { .. })));

        // exactly one refund on file, one commission reversal, one debit
        assert_eq!(ledger.refunds_for_payment(payment).len(), 1);
        let account = ledger.account(owner).unwrap();
        assert_eq!(account.current_balance, Money::from_major(-105));
        assert_eq!(account.total_commission_deducted, Money::ZERO);
    }

    #[test]
    fn test_refund_reconciliation_sweep() {
        let time = test_time();
        let ledger = CommissionLedger::new();
        let gateway = FakeGateway::default();
        let owner = Uuid::new_v4();
        let payment =
            captured_online_payment(&ledger, owner, Money::from_major(1_000), "pay_r6", &time);
        ledger
            .initiate_refund(&gateway, payment, RefundReason::CustomerRequest, None, &time)
            .unwrap();
        ledger.take_events();

        // still in flight: nothing to update
        assert_eq!(ledger.reconcile_refunds(&gateway, &time), 0);

        *gateway.refund_outcome.lock().unwrap() = GatewayStatus::Completed;
        assert_eq!(ledger.reconcile_refunds(&gateway, &time), 1);
        let refund = ledger.refunds_for_payment(payment)[0].clone();
        assert_eq!(refund.status, RefundStatus::Completed);
        assert!(refund.completed_at.is_some());
        assert!(ledger
            .take_events()
            .iter()
            .any(|e| matches!(e, Event::RefundCompleted { .. })));
    }

    #[test]
    fn test_refund_failure_after_debit_flags_reconciliation() {
        let time = test_time();
        let ledger = CommissionLedger::new();
        let gateway = FakeGateway::default();
        let owner = Uuid::new_v4();
        let payment =
            captured_online_payment(&ledger, owner, Money::from_major(1_000), "pay_r7", &time);
        ledger
            .initiate_refund(&gateway, payment, RefundReason::CustomerRequest, None, &time)
            .unwrap();
        ledger.take_events();

        *gateway.refund_outcome.lock().unwrap() = GatewayStatus::Failed;
        assert_eq!(ledger.reconcile_refunds(&gateway, &time), 1);
        assert_eq!(
            ledger.refunds_for_payment(payment)[0].status,
            RefundStatus::Failed
        );
        // the operator event stays attributable to the owner
        assert!(ledger
            .take_events()
            .iter()
            .any(|e| matches!(
                e,
                Event::ReconciliationRequired { owner: Some(o), .. } if *o == owner
            )));
    }

    #[test]
    fn test_payout_lifecycle() {
        let time = test_time();
        let ledger = CommissionLedger::new();
        let gateway = FakeGateway::default();
        let owner = Uuid::new_v4();
        captured_online_payment(&ledger, owner, Money::from_major(1_000), "pay_p1", &time);

        // over-balance request rejected
        assert!(matches!(
            ledger.request_payout(owner, Money::from_major(900), bank(), &time),
            Err(LedgerError::InsufficientBalance { .. })
        ));

        let payout = ledger
            .request_payout(owner, Money::from_major(500), bank(), &time)
            .unwrap();
        assert_eq!(payout.status, PayoutStatus::Pending);
        // balance untouched until approval
        assert_eq!(
            ledger.account(owner).unwrap().current_balance,
            Money::from_major(875)
        );

        let approved = ledger.approve_payout(&gateway, payout.id, &time).unwrap();
        assert_eq!(approved.status, PayoutStatus::Completed);
        assert!(approved.gateway_payout_id.is_some());

        let account = ledger.account(owner).unwrap();
        assert_eq!(account.current_balance, Money::from_major(375));
        assert_eq!(account.last_payout_amount, Some(Money::from_major(500)));

        // a completed payout cannot be approved again
        assert!(matches!(
            ledger.approve_payout(&gateway, payout.id, &time),
            Err(LedgerError::PayoutNotPending { .. })
        ));
    }

    #[test]
    fn test_payout_gateway_failure_keeps_balance() {
        let time = test_time();
        let ledger = CommissionLedger::new();
        let gateway = FakeGateway::default();
        gateway.fail_payouts.store(true, Ordering::SeqCst);
        let owner = Uuid::new_v4();
        captured_online_payment(&ledger, owner, Money::from_major(1_000), "pay_p2", &time);

        let payout = ledger
            .request_payout(owner, Money::from_major(500), bank(), &time)
            .unwrap();
        assert!(ledger.approve_payout(&gateway, payout.id, &time).is_err());

        assert_eq!(ledger.payout(payout.id).unwrap().status, PayoutStatus::Failed);
        assert_eq!(
            ledger.account(owner).unwrap().current_balance,
            Money::from_major(875)
        );
    }

    #[test]
    fn test_payout_approval_rechecks_balance() {
        let time = test_time();
        let ledger = CommissionLedger::new();
        let gateway = FakeGateway::default();
        let owner = Uuid::new_v4();
        captured_online_payment(&ledger, owner, Money::from_major(1_000), "pay_p5", &time);

        // both requests pass the request-time check against the 875 balance
        let first = ledger
            .request_payout(owner, Money::from_major(500), bank(), &time)
            .unwrap();
        let second = ledger
            .request_payout(owner, Money::from_major(500), bank(), &time)
            .unwrap();

        ledger.approve_payout(&gateway, first.id, &time).unwrap();
        assert_eq!(
            ledger.account(owner).unwrap().current_balance,
            Money::from_major(375)
        );

        // the balance shrank since the request; the second approval is
        // rejected instead of driving the balance negative
        assert!(matches!(
            ledger.approve_payout(&gateway, second.id, &time),
            Err(LedgerError::InsufficientBalance { available, requested })
                if available == Money::from_major(375) && requested == Money::from_major(500)
        ));
        assert_eq!(ledger.payout(second.id).unwrap().status, PayoutStatus::Pending);
        assert_eq!(
            ledger.account(owner).unwrap().current_balance,
            Money::from_major(375)
        );
    }

    #[test]
    fn test_payout_rejection_records_reason() {
        let time = test_time();
        let ledger = CommissionLedger::new();
        let owner = Uuid::new_v4();
        captured_online_payment(&ledger, owner, Money::from_major(1_000), "pay_p3", &time);

        let payout = ledger
            .request_payout(owner, Money::from_major(500), bank(), &time)
            .unwrap();
        let rejected = ledger
            .reject_payout(payout.id, "bank details unverified", &time)
            .unwrap();
        assert_eq!(rejected.status, PayoutStatus::Rejected);
        assert_eq!(
            rejected.rejection_reason.as_deref(),
            Some("bank details unverified")
        );
        assert_eq!(
            ledger.account(owner).unwrap().current_balance,
            Money::from_major(875)
        );
    }

    #[test]
    fn test_blocked_owner_cannot_request_payout() {
        let time = test_time();
        let ledger = CommissionLedger::new();
        let owner = Uuid::new_v4();
        captured_online_payment(&ledger, owner, Money::from_major(1_000), "pay_p4", &time);

        let cod = ledger
            .register_payment(
                Uuid::new_v4(),
                owner,
                Money::from_major(12_000),
                PaymentMethod::Cod,
                &time,
            )
            .unwrap();
        ledger.process_cod_acceptance(cod, &time).unwrap();
        assert!(ledger.account(owner).unwrap().is_blocked);

        assert!(matches!(
            ledger.request_payout(owner, Money::from_major(100), bank(), &time),
            Err(LedgerError::AccountBlocked { .. })
        ));
    }

    #[test]
    fn test_aging_sweep_updates_buckets() {
        let time = test_time();
        let ledger = CommissionLedger::new();
        let owner = Uuid::new_v4();

        let cod = ledger
            .register_payment(
                Uuid::new_v4(),
                owner,
                Money::from_major(500),
                PaymentMethod::Cod,
                &time,
            )
            .unwrap();
        ledger.process_cod_acceptance(cod, &time).unwrap();
        ledger.take_events();

        // within the 30-day grace period nothing changes
        assert_eq!(ledger.refresh_aging(&time), 0);

        // 30-day threshold plus 45 days overdue
        let control = time.test_control().unwrap();
        control.advance(Duration::days(75));
        assert_eq!(ledger.refresh_aging(&time), 1);

        let due = &ledger.dues_for(owner)[0];
        assert_eq!(due.days_overdue, 45);
        assert_eq!(due.aging_bucket, AgingBucket::Days31To60);
        assert!(ledger
            .take_events()
            .iter()
            .any(|e| matches!(e, Event::DueAgingChanged { days_overdue: 45, .. })));

        let dashboard = ledger.owner_dashboard(owner).unwrap();
        assert_eq!(dashboard.unsettled_due_count, 1);
        let line = dashboard
            .aging
            .iter()
            .find(|l| l.bucket == AgingBucket::Days31To60)
            .unwrap();
        assert_eq!(line.count, 1);
    }

    #[test]
    fn test_balance_adjustment() {
        let time = test_time();
        let ledger = CommissionLedger::new();
        let owner = Uuid::new_v4();

        let transaction = ledger
            .adjust_balance(owner, Money::from_major(250), "goodwill credit", &time)
            .unwrap();
        assert_eq!(transaction.transaction_type, TransactionType::Adjustment);
        assert_eq!(
            ledger.account(owner).unwrap().current_balance,
            Money::from_major(250)
        );

        ledger
            .adjust_balance(owner, -Money::from_major(50), "chargeback", &time)
            .unwrap();
        assert_eq!(
            ledger.account(owner).unwrap().current_balance,
            Money::from_major(200)
        );

        assert!(ledger
            .adjust_balance(owner, Money::ZERO, "noop", &time)
            .is_err());
    }

    #[test]
    fn test_order_and_signature_verification() {
        let time = test_time();
        let ledger = CommissionLedger::new();
        let gateway = FakeGateway::default();
        let owner = Uuid::new_v4();

        let payment = ledger
            .register_payment(
                Uuid::new_v4(),
                owner,
                Money::from_major(1_000),
                PaymentMethod::Razorpay,
                &time,
            )
            .unwrap();
        let order_id = ledger.create_order(&gateway, payment).unwrap();
        assert_eq!(
            ledger.payment(payment).unwrap().gateway_order_id,
            Some(order_id)
        );

        assert!(ledger
            .verify_capture(&gateway, payment, "pay_sig", "valid")
            .is_ok());
        assert!(ledger
            .verify_capture(&gateway, payment, "pay_sig", "forged")
            .is_err());
    }

    #[test]
    fn test_settings_update_applies_to_new_transactions() {
        let time = test_time();
        let ledger = CommissionLedger::new();
        let owner = Uuid::new_v4();

        let mut settings = ledger.settings().snapshot();
        settings.commission_percentage = Rate::from_percentage(20);
        settings.payment_processing_fee_percentage = Rate::ZERO;
        ledger.settings().update(settings).unwrap();

        captured_online_payment(&ledger, owner, Money::from_major(1_000), "pay_s1", &time);
        let account = ledger.account(owner).unwrap();
        assert_eq!(account.total_commission_deducted, Money::from_major(200));
        assert_eq!(account.current_balance, Money::from_major(800));
    }

    #[test]
    fn test_snapshot_serializes() {
        let time = test_time();
        let ledger = CommissionLedger::new();
        let owner = Uuid::new_v4();
        captured_online_payment(&ledger, owner, Money::from_major(1_000), "pay_snap", &time);

        let snapshot = ledger.snapshot(&time);
        let json = serde_json::to_string(&snapshot).unwrap();
        let parsed: LedgerSnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.accounts.len(), 1);
        assert_eq!(parsed.accounts[0].current_balance, Money::from_major(875));
    }
}
