use uuid::Uuid;

/// unique identifier for a marketplace owner
pub type OwnerId = Uuid;

/// unique identifier for a booking (external domain, consumed not owned)
pub type BookingId = Uuid;

/// unique identifier for a payment record
pub type PaymentId = Uuid;

/// unique identifier for a commission transaction
pub type TransactionId = Uuid;

/// unique identifier for a COD due
pub type DueId = Uuid;

/// unique identifier for a refund
pub type RefundId = Uuid;

/// unique identifier for a payout request
pub type PayoutId = Uuid;
