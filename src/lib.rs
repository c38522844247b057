pub mod account;
pub mod commission;
pub mod decimal;
pub mod dues;
pub mod errors;
pub mod events;
pub mod gateway;
pub mod ledger;
pub mod payment;
pub mod settings;
pub mod transactions;
pub mod types;

// re-export key types
pub use account::{AccountStatus, BankDetails, OwnerAccount};
pub use commission::CommissionSplit;
pub use decimal::{Money, Rate};
pub use dues::{AgingBucket, AgingLine, Due, DueBook, ManualSettlement};
pub use errors::{LedgerError, Result};
pub use events::{Event, EventStore};
pub use gateway::{GatewayStatus, PaymentGateway};
pub use ledger::{CommissionLedger, LedgerSnapshot, OwnerDashboard};
pub use payment::{
    PaymentMethod, PaymentRecord, PaymentStatus, PayoutRequest, PayoutStatus, Refund,
    RefundReason, RefundStatus,
};
pub use settings::{CommissionSettings, SettingsStore};
pub use transactions::{Transaction, TransactionLog, TransactionStatus, TransactionType};
pub use types::{BookingId, DueId, OwnerId, PaymentId, PayoutId, RefundId, TransactionId};

// re-export external dependencies that users will need
pub use chrono;
pub use hourglass_rs::{SafeTimeProvider, TimeSource};
pub use rust_decimal::Decimal;
pub use uuid::Uuid;
