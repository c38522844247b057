use serde::{Deserialize, Serialize};

use crate::decimal::{Money, Rate};
use crate::errors::{LedgerError, Result};
use crate::settings::CommissionSettings;

/// result of splitting a gross booking amount
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionSplit {
    pub gross_amount: Money,
    /// commission percentage snapshot used for the calculation
    pub commission_percentage: Rate,
    pub commission: Money,
    pub processing_fee: Money,
    /// what the owner is ultimately owed, never negative
    pub net_amount: Money,
}

/// compute the commission split for a gross booking amount
///
/// pure function over a settings snapshot: the caller captures the snapshot
/// atomically with the surrounding operation.
pub fn calculate(gross_amount: Money, settings: &CommissionSettings) -> Result<CommissionSplit> {
    if gross_amount.is_negative() {
        return Err(LedgerError::Validation {
            message: format!("negative booking amount: {}", gross_amount),
        });
    }

    let commission = gross_amount
        .percent_of(settings.commission_percentage)
        .max(settings.minimum_commission);
    let processing_fee = gross_amount.percent_of(settings.payment_processing_fee_percentage);

    // tiny bookings can be eaten entirely by the minimum commission;
    // the owner never owes the platform out of a capture
    let net_amount = (gross_amount - commission - processing_fee).max(Money::ZERO);

    Ok(CommissionSplit {
        gross_amount,
        commission_percentage: settings.commission_percentage,
        commission,
        processing_fee,
        net_amount,
    })
}
