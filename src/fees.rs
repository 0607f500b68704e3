//! Platform fee and jurisdictional tax calculation
//!
//! Pure functions over fixed-point amounts. The platform takes a flat 8%
//! fee on every transaction leg; consumption tax is charged on the fee
//! itself at the combined federal + regional rate of the paying party's
//! jurisdiction. The same calculation is applied independently to the
//! sponsor side (added on top of escrow funding) and the worker side
//! (deducted from the settlement payout).

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Flat platform fee rate (8%).
pub fn platform_fee_rate() -> Decimal {
    Decimal::new(8, 2)
}

/// Federal-only fallback rate for unrecognized jurisdiction codes (5%).
pub fn default_tax_rate() -> Decimal {
    Decimal::new(5, 2)
}

/// Combined federal + regional consumption-tax rate for a jurisdiction code.
///
/// Unknown codes fall back to the 5% federal-only rate rather than failing.
pub fn combined_tax_rate(jurisdiction: &str) -> Decimal {
    match jurisdiction.trim().to_ascii_uppercase().as_str() {
        "ON" => Decimal::new(13, 2),
        "NB" | "NL" | "NS" | "PE" => Decimal::new(15, 2),
        "QC" => Decimal::new(14975, 5),
        "BC" | "MB" => Decimal::new(12, 2),
        "SK" => Decimal::new(11, 2),
        "AB" | "NT" | "NU" | "YT" => Decimal::new(5, 2),
        _ => default_tax_rate(),
    }
}

/// Fee and tax breakdown for a single monetary amount.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeBreakdown {
    /// Platform fee before tax (amount x 8%).
    pub base_fee: Decimal,
    /// Consumption tax charged on the platform fee.
    pub tax_amount: Decimal,
    /// Total charge: base fee + tax.
    pub total_fee: Decimal,
    /// Whether the party was tax-exempt.
    pub exempt: bool,
}

/// Compute the platform fee and jurisdictional tax for `amount`.
///
/// Tax-exempt parties pay the base fee only.
pub fn compute_fee(amount: Decimal, jurisdiction: &str, is_tax_exempt: bool) -> FeeBreakdown {
    let base_fee = (amount * platform_fee_rate()).round_dp(2);

    if is_tax_exempt {
        return FeeBreakdown {
            base_fee,
            tax_amount: Decimal::ZERO,
            total_fee: base_fee,
            exempt: true,
        };
    }

    let tax_amount = (base_fee * combined_tax_rate(jurisdiction)).round_dp(2);
    FeeBreakdown {
        base_fee,
        tax_amount,
        total_fee: base_fee + tax_amount,
        exempt: false,
    }
}
