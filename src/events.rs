use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::decimal::Money;
use crate::dues::AgingBucket;

/// all events emitted by ledger operations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    // account lifecycle
    AccountOpened {
        owner: Uuid,
        timestamp: DateTime<Utc>,
    },
    OwnerBlocked {
        owner: Uuid,
        pending_dues: Money,
        threshold: Money,
        timestamp: DateTime<Utc>,
    },
    OwnerUnblocked {
        owner: Uuid,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    // payment events
    PaymentCaptured {
        owner: Uuid,
        payment: Uuid,
        gross_amount: Money,
        commission: Money,
        net_amount: Money,
        timestamp: DateTime<Utc>,
    },
    CodAccepted {
        owner: Uuid,
        payment: Uuid,
        gross_amount: Money,
        due_amount: Money,
        timestamp: DateTime<Utc>,
    },

    // dues events
    DueCreated {
        owner: Uuid,
        due: Uuid,
        amount: Money,
        expected_payment_date: NaiveDate,
    },
    DueSettled {
        owner: Uuid,
        due: Uuid,
        amount: Money,
        via_transaction: Uuid,
        timestamp: DateTime<Utc>,
    },
    DuePartiallySettled {
        owner: Uuid,
        due: Uuid,
        collected: Money,
        remaining: Money,
        timestamp: DateTime<Utc>,
    },
    DueAgingChanged {
        owner: Uuid,
        due: Uuid,
        days_overdue: u32,
        bucket: AgingBucket,
    },

    // refund events
    RefundInitiated {
        owner: Uuid,
        payment: Uuid,
        refund: Uuid,
        net_refund: Money,
        timestamp: DateTime<Utc>,
    },
    RefundCompleted {
        refund: Uuid,
        timestamp: DateTime<Utc>,
    },
    RefundFailed {
        refund: Uuid,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    CommissionReversed {
        owner: Uuid,
        payment: Uuid,
        reversed_commission: Money,
        net_refund: Money,
        timestamp: DateTime<Utc>,
    },

    // payout events
    PayoutRequested {
        owner: Uuid,
        payout: Uuid,
        amount: Money,
        timestamp: DateTime<Utc>,
    },
    PayoutCompleted {
        owner: Uuid,
        payout: Uuid,
        amount: Money,
        timestamp: DateTime<Utc>,
    },
    PayoutFailed {
        owner: Uuid,
        payout: Uuid,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    PayoutRejected {
        owner: Uuid,
        payout: Uuid,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    // adjustment events
    BalanceAdjusted {
        owner: Uuid,
        amount: Money,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    // operator attention required: local state diverged from gateway state.
    // owner is None only when the diverged record cannot be attributed
    ReconciliationRequired {
        owner: Option<Uuid>,
        payment: Option<Uuid>,
        detail: String,
        timestamp: DateTime<Utc>,
    },
}

/// event store for collecting events during operations
#[derive(Debug, Default)]
pub struct EventStore {
    events: Vec<Event>,
}

impl EventStore {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn emit(&mut self, event: Event) {
        self.events.push(event);
    }

    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}
