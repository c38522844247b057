use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::account::BankDetails;
use crate::decimal::Money;
use crate::types::{BookingId, OwnerId, PaymentId, PayoutId, RefundId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentMethod {
    /// cash collected in person by the owner, creating a platform due
    Cod,
    /// online payment through the gateway
    Razorpay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    Initiated,
    Pending,
    Completed,
    Failed,
    Refunded,
    PartiallyRefunded,
}

/// payment record for a booking, consumed by the ledger
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub id: PaymentId,
    pub booking: BookingId,
    pub owner: OwnerId,
    pub amount: Money,
    pub payment_method: PaymentMethod,
    pub status: PaymentStatus,

    // gateway references
    pub gateway_order_id: Option<String>,
    pub gateway_payment_id: Option<String>,

    // commission tracking
    pub commission_applied: bool,
    pub commission_settled: bool,
    pub settlement_date: Option<DateTime<Utc>>,

    // COD dues
    pub cod_due_amount: Option<Money>,
    pub cod_due_created: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

impl PaymentRecord {
    pub fn new(
        booking: BookingId,
        owner: OwnerId,
        amount: Money,
        payment_method: PaymentMethod,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            booking,
            owner,
            amount,
            payment_method,
            status: PaymentStatus::Initiated,
            gateway_order_id: None,
            gateway_payment_id: None,
            commission_applied: false,
            commission_settled: false,
            settlement_date: None,
            cod_due_amount: None,
            cod_due_created: None,
            created_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefundReason {
    BookingCancelled,
    SpaceUnavailable,
    CustomerRequest,
    PaymentError,
    DisputeResolved,
    QualityIssue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefundStatus {
    Initiated,
    /// gateway accepted the refund; awaiting asynchronous confirmation
    Processing,
    Completed,
    Failed,
    Cancelled,
}

/// refund record against a payment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Refund {
    pub id: RefundId,
    pub payment: PaymentId,
    pub reason: RefundReason,
    pub refund_amount: Money,
    pub refund_charges: Money,
    pub net_refund_amount: Money,
    pub gateway_refund_id: Option<String>,
    pub status: RefundStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PayoutStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Rejected,
}

/// payout request from an owner, approved or rejected by an admin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayoutRequest {
    pub id: PayoutId,
    pub owner: OwnerId,
    pub amount: Money,
    pub status: PayoutStatus,
    /// bank details may differ per payout from the account's stored ones
    pub bank_details: BankDetails,
    pub gateway_payout_id: Option<String>,
    pub rejection_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PayoutRequest {
    pub fn new(owner: OwnerId, amount: Money, bank_details: BankDetails, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner,
            amount,
            status: PayoutStatus::Pending,
            bank_details,
            gateway_payout_id: None,
            rejection_reason: None,
            created_at: now,
            completed_at: None,
        }
    }
}
