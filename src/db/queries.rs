//! Database queries
//!
//! One query struct per entity, in the style of the storage layer this
//! engine grew out of. State transitions that double as idempotency or
//! race guards are expressed as guarded UPDATEs whose affected-row count
//! tells the caller whether it won.

use super::{
    ContractModel, Database, DeliverableModel, DeliverableStatus, EscrowAccountModel,
    EscrowStatus, EscrowTransactionModel, MilestoneModel, MilestoneStatus, Party, PaymentModel,
    ProfileModel, ProjectModel, ProjectStatus, ProposalModel, TimeEntryModel, TimeEntryStatus,
    TxnStatus, TxnType,
};
use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{types::Type, OptionalExtension, Row};
use rust_decimal::Decimal;
use std::str::FromStr;
use tracing::info;

fn decimal_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let raw: String = row.get(idx)?;
    raw.parse::<Decimal>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn opt_decimal_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Decimal>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        s.parse::<Decimal>()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn status_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

/// Whether an error is a SQLite unique-constraint violation.
///
/// The milestone release guard relies on this: the partial unique index on
/// live payments turns a double release into a constraint error.
pub fn is_unique_violation(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<rusqlite::Error>(),
        Some(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Profile queries
pub struct ProfileQueries<'a> {
    db: &'a Database,
}

fn map_profile(row: &Row<'_>) -> rusqlite::Result<ProfileModel> {
    Ok(ProfileModel {
        id: row.get(0)?,
        display_name: row.get(1)?,
        email: row.get(2)?,
        street: row.get(3)?,
        city: row.get(4)?,
        region: row.get(5)?,
        postal_code: row.get(6)?,
        tax_exempt: row.get::<_, i32>(7)? != 0,
        gateway_account_id: row.get(8)?,
        created_at: row.get(9)?,
    })
}

const PROFILE_COLS: &str = "id, display_name, email, street, city, region, postal_code, \
                            tax_exempt, gateway_account_id, created_at";

impl<'a> ProfileQueries<'a> {
    /// Create a new query instance
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Insert a profile
    pub async fn insert(&self, profile: &ProfileModel) -> Result<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            &format!("INSERT INTO profiles ({PROFILE_COLS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"),
            rusqlite::params![
                profile.id,
                profile.display_name,
                profile.email,
                profile.street,
                profile.city,
                profile.region,
                profile.postal_code,
                profile.tax_exempt,
                profile.gateway_account_id,
                profile.created_at,
            ],
        )?;
        Ok(())
    }

    /// Get a profile by id
    pub async fn get(&self, id: &str) -> Result<Option<ProfileModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let result = conn
            .query_row(
                &format!("SELECT {PROFILE_COLS} FROM profiles WHERE id = ?1"),
                rusqlite::params![id],
                map_profile,
            )
            .optional()?;
        Ok(result)
    }

    /// Get the profile owning a gateway connect account
    pub async fn get_by_gateway_account(&self, account_ref: &str) -> Result<Option<ProfileModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let result = conn
            .query_row(
                &format!("SELECT {PROFILE_COLS} FROM profiles WHERE gateway_account_id = ?1"),
                rusqlite::params![account_ref],
                map_profile,
            )
            .optional()?;
        Ok(result)
    }

    /// Attach a gateway connect-account reference to a profile
    pub async fn set_gateway_account(&self, id: &str, account_ref: &str) -> Result<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            "UPDATE profiles SET gateway_account_id = ?1 WHERE id = ?2",
            rusqlite::params![account_ref, id],
        )?;
        info!("DB: Linked gateway account {} to profile {}", account_ref, id);
        Ok(())
    }

    /// Update the mailing address fields
    pub async fn update_address(
        &self,
        id: &str,
        street: &str,
        city: &str,
        region: &str,
        postal_code: &str,
    ) -> Result<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            "UPDATE profiles SET street = ?1, city = ?2, region = ?3, postal_code = ?4 WHERE id = ?5",
            rusqlite::params![street, city, region, postal_code, id],
        )?;
        Ok(())
    }
}

/// Project and proposal queries
pub struct ProjectQueries<'a> {
    db: &'a Database,
}

impl<'a> ProjectQueries<'a> {
    /// Create a new query instance
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Insert a project
    pub async fn insert(&self, project: &ProjectModel) -> Result<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            "INSERT INTO projects (id, sponsor_id, title, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                project.id,
                project.sponsor_id,
                project.title,
                project.status.as_str(),
                project.created_at,
                project.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Get a project by id
    pub async fn get(&self, id: &str) -> Result<Option<ProjectModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let result = conn
            .query_row(
                "SELECT id, sponsor_id, title, status, created_at, updated_at
                 FROM projects WHERE id = ?1",
                rusqlite::params![id],
                |row| {
                    Ok(ProjectModel {
                        id: row.get(0)?,
                        sponsor_id: row.get(1)?,
                        title: row.get(2)?,
                        status: status_col(row, 3)?,
                        created_at: row.get(4)?,
                        updated_at: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(result)
    }

    /// Update project status
    pub async fn update_status(&self, id: &str, status: ProjectStatus) -> Result<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            "UPDATE projects SET status = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![status.as_str(), Utc::now(), id],
        )?;
        info!("DB: Updated project status: id={}, status={}", id, status);
        Ok(())
    }

    /// Insert a proposal
    pub async fn insert_proposal(&self, proposal: &ProposalModel) -> Result<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            "INSERT INTO proposals (id, project_id, worker_id, estimated_hours, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                proposal.id,
                proposal.project_id,
                proposal.worker_id,
                proposal.estimated_hours.map(|d| d.to_string()),
                proposal.created_at,
            ],
        )?;
        Ok(())
    }

    /// Get a proposal by id
    pub async fn get_proposal(&self, id: &str) -> Result<Option<ProposalModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let result = conn
            .query_row(
                "SELECT id, project_id, worker_id, estimated_hours, created_at
                 FROM proposals WHERE id = ?1",
                rusqlite::params![id],
                |row| {
                    Ok(ProposalModel {
                        id: row.get(0)?,
                        project_id: row.get(1)?,
                        worker_id: row.get(2)?,
                        estimated_hours: opt_decimal_col(row, 3)?,
                        created_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(result)
    }
}

const CONTRACT_COLS: &str = "id, project_id, proposal_id, sponsor_id, worker_id, kind, \
                             total_amount, hourly_rate, estimated_hours, start_date, status, \
                             sponsor_signed_at, worker_signed_at, signed_at, created_at, updated_at";

fn map_contract(row: &Row<'_>) -> rusqlite::Result<ContractModel> {
    Ok(ContractModel {
        id: row.get(0)?,
        project_id: row.get(1)?,
        proposal_id: row.get(2)?,
        sponsor_id: row.get(3)?,
        worker_id: row.get(4)?,
        kind: status_col(row, 5)?,
        total_amount: opt_decimal_col(row, 6)?,
        hourly_rate: opt_decimal_col(row, 7)?,
        estimated_hours: opt_decimal_col(row, 8)?,
        start_date: row.get::<_, Option<NaiveDate>>(9)?,
        status: status_col(row, 10)?,
        sponsor_signed_at: row.get(11)?,
        worker_signed_at: row.get(12)?,
        signed_at: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

/// Contract queries
pub struct ContractQueries<'a> {
    db: &'a Database,
}

impl<'a> ContractQueries<'a> {
    /// Create a new query instance
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Insert a contract
    pub async fn insert(&self, contract: &ContractModel) -> Result<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            &format!(
                "INSERT INTO contracts ({CONTRACT_COLS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
            ),
            rusqlite::params![
                contract.id,
                contract.project_id,
                contract.proposal_id,
                contract.sponsor_id,
                contract.worker_id,
                contract.kind.as_str(),
                contract.total_amount.map(|d| d.to_string()),
                contract.hourly_rate.map(|d| d.to_string()),
                contract.estimated_hours.map(|d| d.to_string()),
                contract.start_date,
                contract.status.as_str(),
                contract.sponsor_signed_at,
                contract.worker_signed_at,
                contract.signed_at,
                contract.created_at,
                contract.updated_at,
            ],
        )?;
        info!("DB: Inserted contract: id={}, kind={}", contract.id, contract.kind);
        Ok(())
    }

    /// Get a contract by id
    pub async fn get(&self, id: &str) -> Result<Option<ContractModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let result = conn
            .query_row(
                &format!("SELECT {CONTRACT_COLS} FROM contracts WHERE id = ?1"),
                rusqlite::params![id],
                map_contract,
            )
            .optional()?;
        Ok(result)
    }

    /// Record a party's signature timestamp
    pub async fn record_signature(
        &self,
        id: &str,
        party: Party,
        signed_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let column = match party {
            Party::Sponsor => "sponsor_signed_at",
            Party::Worker => "worker_signed_at",
        };
        conn.execute(
            &format!("UPDATE contracts SET {column} = ?1, updated_at = ?2 WHERE id = ?3"),
            rusqlite::params![signed_at, Utc::now(), id],
        )?;
        info!("DB: Recorded {:?} signature on contract {}", party, id);
        Ok(())
    }

    /// Transition a contract to active once both parties have signed
    pub async fn activate(&self, id: &str, signed_at: DateTime<Utc>) -> Result<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            "UPDATE contracts SET status = 'active', signed_at = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![signed_at, Utc::now(), id],
        )?;
        info!("DB: Activated contract {}", id);
        Ok(())
    }

    /// Update contract status
    pub async fn set_status(&self, id: &str, status: super::ContractStatus) -> Result<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            "UPDATE contracts SET status = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![status.as_str(), Utc::now(), id],
        )?;
        info!("DB: Updated contract status: id={}, status={}", id, status);
        Ok(())
    }
}

const ESCROW_COLS: &str = "id, contract_id, base_amount, fee_amount, tax_amount, total_amount, \
                           payment_intent_ref, status, funded_at, created_at, updated_at";

fn map_escrow_account(row: &Row<'_>) -> rusqlite::Result<EscrowAccountModel> {
    Ok(EscrowAccountModel {
        id: row.get(0)?,
        contract_id: row.get(1)?,
        base_amount: decimal_col(row, 2)?,
        fee_amount: decimal_col(row, 3)?,
        tax_amount: decimal_col(row, 4)?,
        total_amount: decimal_col(row, 5)?,
        payment_intent_ref: row.get(6)?,
        status: status_col(row, 7)?,
        funded_at: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

/// Escrow account and transaction-ledger queries
pub struct EscrowQueries<'a> {
    db: &'a Database,
}

impl<'a> EscrowQueries<'a> {
    /// Create a new query instance
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Insert an escrow account
    pub async fn insert_account(&self, account: &EscrowAccountModel) -> Result<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            &format!(
                "INSERT INTO escrow_accounts ({ESCROW_COLS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            ),
            rusqlite::params![
                account.id,
                account.contract_id,
                account.base_amount.to_string(),
                account.fee_amount.to_string(),
                account.tax_amount.to_string(),
                account.total_amount.to_string(),
                account.payment_intent_ref,
                account.status.as_str(),
                account.funded_at,
                account.created_at,
                account.updated_at,
            ],
        )?;
        info!(
            "DB: Inserted escrow account: id={}, contract={}, total={}",
            account.id, account.contract_id, account.total_amount
        );
        Ok(())
    }

    /// Get the escrow account for a contract
    pub async fn account_by_contract(&self, contract_id: &str) -> Result<Option<EscrowAccountModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let result = conn
            .query_row(
                &format!("SELECT {ESCROW_COLS} FROM escrow_accounts WHERE contract_id = ?1"),
                rusqlite::params![contract_id],
                map_escrow_account,
            )
            .optional()?;
        Ok(result)
    }

    /// Locate an escrow account by its gateway payment-intent reference
    pub async fn account_by_intent(&self, intent_ref: &str) -> Result<Option<EscrowAccountModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let result = conn
            .query_row(
                &format!("SELECT {ESCROW_COLS} FROM escrow_accounts WHERE payment_intent_ref = ?1"),
                rusqlite::params![intent_ref],
                map_escrow_account,
            )
            .optional()?;
        Ok(result)
    }

    /// Delete a stale unfunded account and its transactions
    pub async fn delete_account(&self, account_id: &str) -> Result<()> {
        let conn = self.db.conn();
        let mut conn = conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM escrow_transactions WHERE escrow_account_id = ?1",
            rusqlite::params![account_id],
        )?;
        tx.execute(
            "DELETE FROM escrow_accounts WHERE id = ?1",
            rusqlite::params![account_id],
        )?;
        tx.commit()?;
        info!("DB: Deleted stale escrow account {}", account_id);
        Ok(())
    }

    /// Idempotent funded transition.
    ///
    /// Flips the account to funded and completes its pending funding
    /// transaction in one transaction. Returns false if the account was
    /// already funded (or further along), in which case nothing changed;
    /// this is the guard both `confirm_funding` and the webhook reconciler
    /// race through.
    pub async fn mark_funded_if_pending(
        &self,
        account_id: &str,
        gateway_ref: Option<&str>,
        funded_at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.db.conn();
        let mut conn = conn.lock().await;
        let tx = conn.transaction()?;
        let updated = tx.execute(
            "UPDATE escrow_accounts
             SET status = 'funded', funded_at = ?1, updated_at = ?2
             WHERE id = ?3 AND status IN ('pending_funding', 'payment_failed')",
            rusqlite::params![funded_at, Utc::now(), account_id],
        )?;
        if updated > 0 {
            tx.execute(
                "UPDATE escrow_transactions
                 SET status = 'completed', gateway_ref = COALESCE(?1, gateway_ref), updated_at = ?2
                 WHERE escrow_account_id = ?3 AND txn_type = 'funding' AND status = 'pending'",
                rusqlite::params![gateway_ref, Utc::now(), account_id],
            )?;
        }
        tx.commit()?;
        if updated > 0 {
            info!("DB: Marked escrow account {} funded", account_id);
        }
        Ok(updated > 0)
    }

    /// Mark an account's funding attempt failed, failing the pending transaction
    pub async fn mark_funding_failed(&self, account_id: &str) -> Result<bool> {
        let conn = self.db.conn();
        let mut conn = conn.lock().await;
        let tx = conn.transaction()?;
        let updated = tx.execute(
            "UPDATE escrow_accounts SET status = 'payment_failed', updated_at = ?1
             WHERE id = ?2 AND status = 'pending_funding'",
            rusqlite::params![Utc::now(), account_id],
        )?;
        if updated > 0 {
            tx.execute(
                "UPDATE escrow_transactions SET status = 'failed', updated_at = ?1
                 WHERE escrow_account_id = ?2 AND txn_type = 'funding' AND status = 'pending'",
                rusqlite::params![Utc::now(), account_id],
            )?;
        }
        tx.commit()?;
        Ok(updated > 0)
    }

    /// Update escrow account status
    pub async fn set_account_status(&self, account_id: &str, status: EscrowStatus) -> Result<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            "UPDATE escrow_accounts SET status = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![status.as_str(), Utc::now(), account_id],
        )?;
        info!("DB: Updated escrow account status: id={}, status={}", account_id, status);
        Ok(())
    }

    /// Append a ledger transaction
    pub async fn insert_transaction(&self, txn: &EscrowTransactionModel) -> Result<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            "INSERT INTO escrow_transactions
             (id, escrow_account_id, txn_type, amount, status, gateway_ref, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                txn.id,
                txn.escrow_account_id,
                txn.txn_type.as_str(),
                txn.amount.to_string(),
                txn.status.as_str(),
                txn.gateway_ref,
                txn.created_at,
                txn.updated_at,
            ],
        )?;
        info!(
            "DB: Inserted escrow transaction: id={}, account={}, type={}, amount={}, status={}",
            txn.id, txn.escrow_account_id, txn.txn_type, txn.amount, txn.status
        );
        Ok(())
    }

    /// List an account's ledger transactions
    pub async fn list_transactions(&self, account_id: &str) -> Result<Vec<EscrowTransactionModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, escrow_account_id, txn_type, amount, status, gateway_ref, created_at, updated_at
             FROM escrow_transactions WHERE escrow_account_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map(rusqlite::params![account_id], |row| {
            Ok(EscrowTransactionModel {
                id: row.get(0)?,
                escrow_account_id: row.get(1)?,
                txn_type: status_col(row, 2)?,
                amount: decimal_col(row, 3)?,
                status: status_col(row, 4)?,
                gateway_ref: row.get(5)?,
                created_at: row.get(6)?,
                updated_at: row.get(7)?,
            })
        })?;
        let mut txns = Vec::new();
        for row in rows {
            txns.push(row?);
        }
        Ok(txns)
    }

    /// Sum of completed transactions of one type for an account.
    ///
    /// Released must never exceed funded; callers check this before
    /// recording a release.
    pub async fn completed_total(&self, account_id: &str, txn_type: TxnType) -> Result<Decimal> {
        let txns = self.list_transactions(account_id).await?;
        Ok(txns
            .iter()
            .filter(|t| t.txn_type == txn_type && t.status == TxnStatus::Completed)
            .map(|t| t.amount)
            .sum())
    }
}

const MILESTONE_COLS: &str = "id, contract_id, title, amount, sequence, status, rejection_reason, \
                              submitted_at, reviewed_at, created_at, updated_at";

fn map_milestone(row: &Row<'_>) -> rusqlite::Result<MilestoneModel> {
    Ok(MilestoneModel {
        id: row.get(0)?,
        contract_id: row.get(1)?,
        title: row.get(2)?,
        amount: decimal_col(row, 3)?,
        sequence: row.get(4)?,
        status: status_col(row, 5)?,
        rejection_reason: row.get(6)?,
        submitted_at: row.get(7)?,
        reviewed_at: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn map_deliverable(row: &Row<'_>) -> rusqlite::Result<DeliverableModel> {
    Ok(DeliverableModel {
        id: row.get(0)?,
        milestone_id: row.get(1)?,
        title: row.get(2)?,
        status: status_col(row, 3)?,
        rejection_reason: row.get(4)?,
        submitted_at: row.get(5)?,
        reviewed_at: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

const DELIVERABLE_COLS: &str = "id, milestone_id, title, status, rejection_reason, submitted_at, \
                                reviewed_at, created_at, updated_at";

/// Milestone and deliverable queries
pub struct MilestoneQueries<'a> {
    db: &'a Database,
}

impl<'a> MilestoneQueries<'a> {
    /// Create a new query instance
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Insert a milestone
    pub async fn insert(&self, milestone: &MilestoneModel) -> Result<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            &format!(
                "INSERT INTO milestones ({MILESTONE_COLS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
            ),
            rusqlite::params![
                milestone.id,
                milestone.contract_id,
                milestone.title,
                milestone.amount.to_string(),
                milestone.sequence,
                milestone.status.as_str(),
                milestone.rejection_reason,
                milestone.submitted_at,
                milestone.reviewed_at,
                milestone.created_at,
                milestone.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Get a milestone by id
    pub async fn get(&self, id: &str) -> Result<Option<MilestoneModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let result = conn
            .query_row(
                &format!("SELECT {MILESTONE_COLS} FROM milestones WHERE id = ?1"),
                rusqlite::params![id],
                map_milestone,
            )
            .optional()?;
        Ok(result)
    }

    /// List a contract's milestones in sequence order
    pub async fn list_by_contract(&self, contract_id: &str) -> Result<Vec<MilestoneModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MILESTONE_COLS} FROM milestones WHERE contract_id = ?1 ORDER BY sequence"
        ))?;
        let rows = stmt.query_map(rusqlite::params![contract_id], map_milestone)?;
        let mut milestones = Vec::new();
        for row in rows {
            milestones.push(row?);
        }
        Ok(milestones)
    }

    /// Mark a milestone submitted
    pub async fn mark_submitted(&self, id: &str, submitted_at: DateTime<Utc>) -> Result<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            "UPDATE milestones SET status = 'submitted', submitted_at = ?1, rejection_reason = NULL,
             updated_at = ?2 WHERE id = ?3",
            rusqlite::params![submitted_at, Utc::now(), id],
        )?;
        info!("DB: Milestone {} submitted", id);
        Ok(())
    }

    /// Record a milestone review outcome
    pub async fn mark_reviewed(
        &self,
        id: &str,
        status: MilestoneStatus,
        rejection_reason: Option<&str>,
        reviewed_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            "UPDATE milestones SET status = ?1, rejection_reason = ?2, reviewed_at = ?3,
             updated_at = ?4 WHERE id = ?5",
            rusqlite::params![status.as_str(), rejection_reason, reviewed_at, Utc::now(), id],
        )?;
        info!("DB: Milestone {} reviewed: {}", id, status);
        Ok(())
    }

    /// Insert a deliverable
    pub async fn insert_deliverable(&self, deliverable: &DeliverableModel) -> Result<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            &format!(
                "INSERT INTO deliverables ({DELIVERABLE_COLS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            ),
            rusqlite::params![
                deliverable.id,
                deliverable.milestone_id,
                deliverable.title,
                deliverable.status.as_str(),
                deliverable.rejection_reason,
                deliverable.submitted_at,
                deliverable.reviewed_at,
                deliverable.created_at,
                deliverable.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Get a deliverable by id
    pub async fn get_deliverable(&self, id: &str) -> Result<Option<DeliverableModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let result = conn
            .query_row(
                &format!("SELECT {DELIVERABLE_COLS} FROM deliverables WHERE id = ?1"),
                rusqlite::params![id],
                map_deliverable,
            )
            .optional()?;
        Ok(result)
    }

    /// List a milestone's deliverables
    pub async fn list_deliverables(&self, milestone_id: &str) -> Result<Vec<DeliverableModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {DELIVERABLE_COLS} FROM deliverables WHERE milestone_id = ?1 ORDER BY created_at"
        ))?;
        let rows = stmt.query_map(rusqlite::params![milestone_id], map_deliverable)?;
        let mut deliverables = Vec::new();
        for row in rows {
            deliverables.push(row?);
        }
        Ok(deliverables)
    }

    /// Mark a deliverable submitted
    pub async fn mark_deliverable_submitted(
        &self,
        id: &str,
        submitted_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            "UPDATE deliverables SET status = 'submitted', submitted_at = ?1,
             rejection_reason = NULL, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![submitted_at, Utc::now(), id],
        )?;
        info!("DB: Deliverable {} submitted", id);
        Ok(())
    }

    /// Record a deliverable review outcome
    pub async fn mark_deliverable_reviewed(
        &self,
        id: &str,
        status: DeliverableStatus,
        rejection_reason: Option<&str>,
        reviewed_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            "UPDATE deliverables SET status = ?1, rejection_reason = ?2, reviewed_at = ?3,
             updated_at = ?4 WHERE id = ?5",
            rusqlite::params![status.as_str(), rejection_reason, reviewed_at, Utc::now(), id],
        )?;
        info!("DB: Deliverable {} reviewed: {}", id, status);
        Ok(())
    }

    /// Number of a milestone's deliverables not yet approved
    pub async fn unapproved_deliverables(&self, milestone_id: &str) -> Result<i64> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM deliverables WHERE milestone_id = ?1 AND status != 'approved'",
            rusqlite::params![milestone_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Total number of deliverables under a milestone
    pub async fn deliverable_count(&self, milestone_id: &str) -> Result<i64> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM deliverables WHERE milestone_id = ?1",
            rusqlite::params![milestone_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Milestones of a contract that have no completed payment yet
    pub async fn unreleased_count(&self, contract_id: &str) -> Result<i64> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM milestones m
             WHERE m.contract_id = ?1
               AND NOT EXISTS (
                   SELECT 1 FROM payments p
                   WHERE p.milestone_id = m.id AND p.status = 'completed'
               )",
            rusqlite::params![contract_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

const TIME_ENTRY_COLS: &str = "id, contract_id, entry_date, hours, description, status, paid_at, \
                               created_at, updated_at";

fn map_time_entry(row: &Row<'_>) -> rusqlite::Result<TimeEntryModel> {
    Ok(TimeEntryModel {
        id: row.get(0)?,
        contract_id: row.get(1)?,
        entry_date: row.get(2)?,
        hours: decimal_col(row, 3)?,
        description: row.get(4)?,
        status: status_col(row, 5)?,
        paid_at: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

/// Time entry queries (hourly contracts)
pub struct TimeEntryQueries<'a> {
    db: &'a Database,
}

impl<'a> TimeEntryQueries<'a> {
    /// Create a new query instance
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Insert a time entry
    pub async fn insert(&self, entry: &TimeEntryModel) -> Result<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            &format!(
                "INSERT INTO time_entries ({TIME_ENTRY_COLS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            ),
            rusqlite::params![
                entry.id,
                entry.contract_id,
                entry.entry_date,
                entry.hours.to_string(),
                entry.description,
                entry.status.as_str(),
                entry.paid_at,
                entry.created_at,
                entry.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Get a time entry by id
    pub async fn get(&self, id: &str) -> Result<Option<TimeEntryModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let result = conn
            .query_row(
                &format!("SELECT {TIME_ENTRY_COLS} FROM time_entries WHERE id = ?1"),
                rusqlite::params![id],
                map_time_entry,
            )
            .optional()?;
        Ok(result)
    }

    /// Edit a still-pending entry. Returns false once the entry has been
    /// reviewed (approved/rejected/paid entries are immutable to the worker).
    pub async fn update_pending(
        &self,
        id: &str,
        entry_date: NaiveDate,
        hours: Decimal,
        description: Option<&str>,
    ) -> Result<bool> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let updated = conn.execute(
            "UPDATE time_entries SET entry_date = ?1, hours = ?2, description = ?3, updated_at = ?4
             WHERE id = ?5 AND status = 'pending'",
            rusqlite::params![entry_date, hours.to_string(), description, Utc::now(), id],
        )?;
        Ok(updated > 0)
    }

    /// Delete a still-pending entry. Returns false once reviewed.
    pub async fn delete_pending(&self, id: &str) -> Result<bool> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM time_entries WHERE id = ?1 AND status = 'pending'",
            rusqlite::params![id],
        )?;
        Ok(deleted > 0)
    }

    /// Set review status on an entry
    pub async fn set_status(&self, id: &str, status: TimeEntryStatus) -> Result<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            "UPDATE time_entries SET status = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![status.as_str(), Utc::now(), id],
        )?;
        info!("DB: Time entry {} -> {}", id, status);
        Ok(())
    }

    /// Approved entries for a contract within a date range (inclusive)
    pub async fn list_approved_in_range(
        &self,
        contract_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<TimeEntryModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TIME_ENTRY_COLS} FROM time_entries
             WHERE contract_id = ?1 AND status = 'approved'
               AND entry_date >= ?2 AND entry_date <= ?3
             ORDER BY entry_date"
        ))?;
        let rows = stmt.query_map(rusqlite::params![contract_id, start, end], map_time_entry)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    /// Transition every approved entry in the range to paid, stamping the
    /// payment timestamp. Returns the number of entries paid.
    pub async fn mark_paid_in_range(
        &self,
        contract_id: &str,
        start: NaiveDate,
        end: NaiveDate,
        paid_at: DateTime<Utc>,
    ) -> Result<usize> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let updated = conn.execute(
            "UPDATE time_entries SET status = 'paid', paid_at = ?1, updated_at = ?2
             WHERE contract_id = ?3 AND status = 'approved'
               AND entry_date >= ?4 AND entry_date <= ?5",
            rusqlite::params![paid_at, Utc::now(), contract_id, start, end],
        )?;
        info!(
            "DB: Marked {} time entries paid for contract {} ({} .. {})",
            updated, contract_id, start, end
        );
        Ok(updated)
    }
}

const PAYMENT_COLS: &str = "id, contract_id, milestone_id, payer_id, payee_id, amount, \
                            platform_fee, net_amount, status, transfer_ref, created_at, completed_at";

fn map_payment(row: &Row<'_>) -> rusqlite::Result<PaymentModel> {
    Ok(PaymentModel {
        id: row.get(0)?,
        contract_id: row.get(1)?,
        milestone_id: row.get(2)?,
        payer_id: row.get(3)?,
        payee_id: row.get(4)?,
        amount: decimal_col(row, 5)?,
        platform_fee: decimal_col(row, 6)?,
        net_amount: decimal_col(row, 7)?,
        status: status_col(row, 8)?,
        transfer_ref: row.get(9)?,
        created_at: row.get(10)?,
        completed_at: row.get(11)?,
    })
}

/// Settlement payment queries
pub struct PaymentQueries<'a> {
    db: &'a Database,
}

impl<'a> PaymentQueries<'a> {
    /// Create a new query instance
    pub fn new(db: &'a Database) -> Self {
        Self { db }
    }

    /// Insert a payment record.
    ///
    /// For milestone payments the partial unique index makes this the
    /// serialization point against double release; callers classify the
    /// constraint failure with [`is_unique_violation`].
    pub async fn insert(&self, payment: &PaymentModel) -> Result<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            &format!(
                "INSERT INTO payments ({PAYMENT_COLS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
            ),
            rusqlite::params![
                payment.id,
                payment.contract_id,
                payment.milestone_id,
                payment.payer_id,
                payment.payee_id,
                payment.amount.to_string(),
                payment.platform_fee.to_string(),
                payment.net_amount.to_string(),
                payment.status.as_str(),
                payment.transfer_ref,
                payment.created_at,
                payment.completed_at,
            ],
        )?;
        info!(
            "DB: Inserted payment: id={}, contract={}, milestone={:?}, net={}, status={}",
            payment.id, payment.contract_id, payment.milestone_id, payment.net_amount, payment.status
        );
        Ok(())
    }

    /// Get a payment by id
    pub async fn get(&self, id: &str) -> Result<Option<PaymentModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let result = conn
            .query_row(
                &format!("SELECT {PAYMENT_COLS} FROM payments WHERE id = ?1"),
                rusqlite::params![id],
                map_payment,
            )
            .optional()?;
        Ok(result)
    }

    /// List a contract's payments
    pub async fn list_by_contract(&self, contract_id: &str) -> Result<Vec<PaymentModel>> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PAYMENT_COLS} FROM payments WHERE contract_id = ?1 ORDER BY created_at"
        ))?;
        let rows = stmt.query_map(rusqlite::params![contract_id], map_payment)?;
        let mut payments = Vec::new();
        for row in rows {
            payments.push(row?);
        }
        Ok(payments)
    }

    /// Complete a processing payment with its transfer reference
    pub async fn mark_completed(
        &self,
        id: &str,
        transfer_ref: &str,
        completed_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            "UPDATE payments SET status = 'completed', transfer_ref = ?1, completed_at = ?2
             WHERE id = ?3 AND status = 'processing'",
            rusqlite::params![transfer_ref, completed_at, id],
        )?;
        info!("DB: Payment {} completed (transfer {})", id, transfer_ref);
        Ok(())
    }

    /// Fail a processing payment
    pub async fn mark_failed(&self, id: &str) -> Result<()> {
        let conn = self.db.conn();
        let conn = conn.lock().await;
        conn.execute(
            "UPDATE payments SET status = 'failed' WHERE id = ?1 AND status = 'processing'",
            rusqlite::params![id],
        )?;
        info!("DB: Payment {} failed", id);
        Ok(())
    }
}
