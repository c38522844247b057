use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;

use crate::decimal::{Money, Rate};
use crate::errors::{LedgerError, Result};

/// platform-wide commission settings
///
/// a single instance exists at any time; the store below creates it lazily
/// with these defaults on first access. orchestrated operations capture a
/// snapshot at their start so a mid-operation admin update cannot produce a
/// split calculated under two different settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommissionSettings {
    /// platform cut of the gross booking amount
    pub commission_percentage: Rate,
    /// commission floor per transaction
    pub minimum_commission: Money,
    /// additional processing fee on the gross amount
    pub payment_processing_fee_percentage: Rate,
    /// days before a COD due is expected to be remitted
    pub due_days_threshold: u32,
    /// pending dues at or above this amount auto-block the owner
    pub block_dues_amount: Money,
    /// days within which a refund can be initiated
    pub refund_window_days: u32,
    /// charge retained by the platform on each refund
    pub refund_charge_percentage: Rate,
    /// settle oldest COD dues automatically out of online payments
    pub auto_settle_enabled: bool,
}

impl Default for CommissionSettings {
    fn default() -> Self {
        Self {
            commission_percentage: Rate::from_percentage(10),
            minimum_commission: Money::from_major(50),
            payment_processing_fee_percentage: Rate::from_percentage_decimal(dec!(2.5)),
            due_days_threshold: 30,
            block_dues_amount: Money::from_major(10_000),
            refund_window_days: 7,
            refund_charge_percentage: Rate::from_percentage(2),
            auto_settle_enabled: true,
        }
    }
}

impl CommissionSettings {
    /// validate bounds before the store accepts an update
    pub fn validate(&self) -> Result<()> {
        let pct = self.commission_percentage.as_percentage();
        if pct < Decimal::ZERO || pct > Decimal::from(100) {
            return Err(LedgerError::Validation {
                message: format!("commission percentage out of range: {}", pct),
            });
        }
        if self.minimum_commission.is_negative() {
            return Err(LedgerError::Validation {
                message: format!("negative minimum commission: {}", self.minimum_commission),
            });
        }
        if self.payment_processing_fee_percentage.as_decimal() < Decimal::ZERO {
            return Err(LedgerError::Validation {
                message: "negative processing fee percentage".to_string(),
            });
        }
        if self.block_dues_amount.is_negative() {
            return Err(LedgerError::Validation {
                message: format!("negative block threshold: {}", self.block_dues_amount),
            });
        }
        if self.refund_charge_percentage.as_decimal() < Decimal::ZERO {
            return Err(LedgerError::Validation {
                message: "negative refund charge percentage".to_string(),
            });
        }
        Ok(())
    }
}

/// store holding the singleton settings record
#[derive(Debug, Default)]
pub struct SettingsStore {
    current: RwLock<Option<CommissionSettings>>,
}

impl SettingsStore {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(None),
        }
    }

    /// snapshot the current settings, creating defaults on first access
    pub fn snapshot(&self) -> CommissionSettings {
        {
            let guard = self.current.read().expect("settings lock poisoned");
            if let Some(settings) = guard.as_ref() {
                return settings.clone();
            }
        }
        let mut guard = self.current.write().expect("settings lock poisoned");
        guard
            .get_or_insert_with(CommissionSettings::default)
            .clone()
    }

    /// replace the settings record (admin operation)
    pub fn update(&self, settings: CommissionSettings) -> Result<()> {
        settings.validate()?;
        let mut guard = self.current.write().expect("settings lock poisoned");
        *guard = Some(settings);
        Ok(())
    }
}
