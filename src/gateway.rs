use crate::account::BankDetails;
use crate::decimal::Money;
use crate::errors::Result;

/// status reported by the gateway for an order, refund, or payout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayStatus {
    Created,
    Processing,
    Completed,
    Failed,
}

/// external payment gateway capability
///
/// all calls are network I/O with nondeterministic latency; implementations
/// convert `Money` to minor units (`to_minor`) at the wire boundary. tests
/// inject deterministic fakes.
pub trait PaymentGateway {
    /// create an order for an online payment, returning the gateway order id
    fn create_order(&self, amount: Money, receipt: &str) -> Result<String>;

    /// verify a captured payment's signature
    fn verify_signature(&self, order_id: &str, payment_id: &str, signature: &str) -> bool;

    /// execute a monetary refund, returning the gateway refund id
    fn create_refund(&self, gateway_payment_id: &str, amount: Money) -> Result<String>;

    /// transfer funds to an owner's bank account, returning the payout id
    fn create_payout(&self, bank: &BankDetails, amount: Money) -> Result<String>;

    /// fetch the current status of a gateway-side object, used by the
    /// reconciliation sweep
    fn fetch_status(&self, id: &str) -> Result<GatewayStatus>;
}
