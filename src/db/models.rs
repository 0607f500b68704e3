//! Database models
//!
//! Row structs mirror the relational schema one-to-one. Monetary amounts
//! are `rust_decimal::Decimal` stored as TEXT so fee/tax math never drifts
//! through floating point. Status columns store the string forms below.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! status_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// String form stored in the database.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!(
                        concat!("unknown ", stringify!($name), ": {}"),
                        other
                    )),
                }
            }
        }
    };
}

status_enum!(ContractStatus {
    Draft => "draft",
    PendingSignatures => "pending_signatures",
    Active => "active",
    Completed => "completed",
    Cancelled => "cancelled",
});

status_enum!(ContractKind {
    Fixed => "fixed",
    Hourly => "hourly",
});

status_enum!(EscrowStatus {
    PendingFunding => "pending_funding",
    Funded => "funded",
    PartiallyReleased => "partially_released",
    Released => "released",
    PaymentFailed => "payment_failed",
});

status_enum!(TxnType {
    Funding => "funding",
    Release => "release",
});

status_enum!(TxnStatus {
    Pending => "pending",
    Completed => "completed",
    Failed => "failed",
});

status_enum!(MilestoneStatus {
    Pending => "pending",
    Submitted => "submitted",
    Approved => "approved",
    Rejected => "rejected",
});

status_enum!(DeliverableStatus {
    Pending => "pending",
    Submitted => "submitted",
    Approved => "approved",
    Rejected => "rejected",
});

status_enum!(TimeEntryStatus {
    Pending => "pending",
    Approved => "approved",
    Rejected => "rejected",
    Paid => "paid",
});

status_enum!(PaymentStatus {
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
});

status_enum!(ProjectStatus {
    Open => "open",
    InProgress => "in_progress",
    Completed => "completed",
    Cancelled => "cancelled",
});

/// Which side of a contract is acting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Party {
    /// The paying party (client/business).
    Sponsor,
    /// The performing party (talent/freelancer).
    Worker,
}

/// User profile fields the engine depends on.
///
/// The full profile lives elsewhere; this table carries only what the
/// settlement preconditions read: mailing address, tax jurisdiction,
/// exemption flag and the gateway connect-account reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileModel {
    pub id: String,
    pub display_name: String,
    pub email: String,
    pub street: Option<String>,
    pub city: Option<String>,
    pub region: Option<String>,
    pub postal_code: Option<String>,
    pub tax_exempt: bool,
    pub gateway_account_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ProfileModel {
    /// A complete mailing address requires street, city, region and postal code.
    pub fn has_complete_address(&self) -> bool {
        [&self.street, &self.city, &self.region, &self.postal_code]
            .iter()
            .all(|f| f.as_deref().map(|s| !s.trim().is_empty()).unwrap_or(false))
    }

    /// Jurisdiction code used for tax lookup (the profile's region).
    pub fn jurisdiction(&self) -> Option<&str> {
        self.region.as_deref().filter(|s| !s.trim().is_empty())
    }
}

/// Project database model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectModel {
    pub id: String,
    pub sponsor_id: String,
    pub title: String,
    pub status: ProjectStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Accepted-proposal fields the engine reads (estimated-hours fallback).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProposalModel {
    pub id: String,
    pub project_id: String,
    pub worker_id: String,
    pub estimated_hours: Option<Decimal>,
    pub created_at: DateTime<Utc>,
}

/// Contract database model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractModel {
    pub id: String,
    pub project_id: String,
    pub proposal_id: String,
    pub sponsor_id: String,
    pub worker_id: String,
    pub kind: ContractKind,
    /// Total amount for fixed-price contracts.
    pub total_amount: Option<Decimal>,
    /// Hourly rate for hourly contracts.
    pub hourly_rate: Option<Decimal>,
    /// Estimated hours for hourly contracts.
    pub estimated_hours: Option<Decimal>,
    /// Anchor date for biweekly pay periods.
    pub start_date: Option<NaiveDate>,
    pub status: ContractStatus,
    pub sponsor_signed_at: Option<DateTime<Utc>>,
    pub worker_signed_at: Option<DateTime<Utc>>,
    /// Set only once both parties have signed.
    pub signed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ContractModel {
    /// Signature timestamp of the given party, if it has signed.
    pub fn signature_of(&self, party: Party) -> Option<DateTime<Utc>> {
        match party {
            Party::Sponsor => self.sponsor_signed_at,
            Party::Worker => self.worker_signed_at,
        }
    }

    /// User id of the given party.
    pub fn party_id(&self, party: Party) -> &str {
        match party {
            Party::Sponsor => &self.sponsor_id,
            Party::Worker => &self.worker_id,
        }
    }
}

/// Escrow account database model (one per contract)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowAccountModel {
    pub id: String,
    pub contract_id: String,
    /// Contract amount the escrow covers, before fee/tax.
    pub base_amount: Decimal,
    pub fee_amount: Decimal,
    pub tax_amount: Decimal,
    /// base + fee + tax: the amount collected from the sponsor.
    pub total_amount: Decimal,
    /// Gateway payment-intent reference.
    pub payment_intent_ref: String,
    pub status: EscrowStatus,
    pub funded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Append-only escrow ledger row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowTransactionModel {
    pub id: String,
    pub escrow_account_id: String,
    pub txn_type: TxnType,
    pub amount: Decimal,
    pub status: TxnStatus,
    /// Gateway reference: intent ref for funding, transfer ref for release.
    pub gateway_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Milestone database model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MilestoneModel {
    pub id: String,
    pub contract_id: String,
    pub title: String,
    pub amount: Decimal,
    /// Position within the contract's milestone sequence.
    pub sequence: i32,
    pub status: MilestoneStatus,
    pub rejection_reason: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Deliverable database model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliverableModel {
    pub id: String,
    pub milestone_id: String,
    pub title: String,
    pub status: DeliverableStatus,
    pub rejection_reason: Option<String>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Time entry database model (hourly contracts)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeEntryModel {
    pub id: String,
    pub contract_id: String,
    pub entry_date: NaiveDate,
    pub hours: Decimal,
    pub description: Option<String>,
    pub status: TimeEntryStatus,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable settlement record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentModel {
    pub id: String,
    pub contract_id: String,
    /// Weak reference; None for hourly period payments.
    pub milestone_id: Option<String>,
    pub payer_id: String,
    pub payee_id: String,
    /// Gross amount before the worker-side fee.
    pub amount: Decimal,
    pub platform_fee: Decimal,
    pub net_amount: Decimal,
    pub status: PaymentStatus,
    /// External transfer reference once executed.
    pub transfer_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips() {
        for status in [
            ContractStatus::Draft,
            ContractStatus::PendingSignatures,
            ContractStatus::Active,
            ContractStatus::Completed,
            ContractStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<ContractStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<EscrowStatus>().is_err());
    }

    #[test]
    fn test_complete_address_requires_all_fields() {
        let mut profile = ProfileModel {
            id: "u1".into(),
            display_name: "Worker".into(),
            email: "w@example.com".into(),
            street: Some("1 Main St".into()),
            city: Some("Toronto".into()),
            region: Some("ON".into()),
            postal_code: Some("M5V 1A1".into()),
            tax_exempt: false,
            gateway_account_id: None,
            created_at: Utc::now(),
        };
        assert!(profile.has_complete_address());

        profile.postal_code = Some("  ".into());
        assert!(!profile.has_complete_address());

        profile.postal_code = None;
        assert!(!profile.has_complete_address());
    }
}
