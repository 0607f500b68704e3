//! Database module for the escrow engine
//!
//! Persistent storage for:
//! - Contracts, escrow accounts and the escrow transaction ledger
//! - Milestones, deliverables and time entries
//! - Settlement payment records
//! - The profile fields settlement preconditions read

use rusqlite::Connection;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

mod models;
mod queries;

pub use models::*;
pub use queries::*;

/// Database connection handle
#[derive(Clone)]
pub struct Database {
    /// SQLite connection (wrapped in Arc<Mutex> for thread safety)
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Connect to the database
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        info!("Connecting to database at {}", database_url);

        let path = if database_url.starts_with("sqlite:") {
            database_url.strip_prefix("sqlite:").unwrap_or(database_url)
        } else {
            database_url
        };

        // Ensure the directory exists for file-based databases
        if path != ":memory:" {
            if let Some(parent) = Path::new(path).parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON")?;

        Self::run_migrations(&conn)?;

        info!("Database connected successfully");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run database migrations
    fn run_migrations(conn: &Connection) -> anyhow::Result<()> {
        debug!("Running database migrations...");

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS profiles (
                id TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                email TEXT NOT NULL,
                street TEXT,
                city TEXT,
                region TEXT,
                postal_code TEXT,
                tax_exempt BOOLEAN NOT NULL DEFAULT 0,
                gateway_account_id TEXT,
                created_at DATETIME NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS projects (
                id TEXT PRIMARY KEY,
                sponsor_id TEXT NOT NULL,
                title TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS proposals (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                worker_id TEXT NOT NULL,
                estimated_hours TEXT,
                created_at DATETIME NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS contracts (
                id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                proposal_id TEXT NOT NULL,
                sponsor_id TEXT NOT NULL,
                worker_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                total_amount TEXT,
                hourly_rate TEXT,
                estimated_hours TEXT,
                start_date TEXT,
                status TEXT NOT NULL,
                sponsor_signed_at DATETIME,
                worker_signed_at DATETIME,
                signed_at DATETIME,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
            )
            "#,
            [],
        )?;

        // One escrow account per contract
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS escrow_accounts (
                id TEXT PRIMARY KEY,
                contract_id TEXT NOT NULL UNIQUE,
                base_amount TEXT NOT NULL,
                fee_amount TEXT NOT NULL,
                tax_amount TEXT NOT NULL,
                total_amount TEXT NOT NULL,
                payment_intent_ref TEXT NOT NULL,
                status TEXT NOT NULL,
                funded_at DATETIME,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS escrow_transactions (
                id TEXT PRIMARY KEY,
                escrow_account_id TEXT NOT NULL,
                txn_type TEXT NOT NULL,
                amount TEXT NOT NULL,
                status TEXT NOT NULL,
                gateway_ref TEXT,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS milestones (
                id TEXT PRIMARY KEY,
                contract_id TEXT NOT NULL,
                title TEXT NOT NULL,
                amount TEXT NOT NULL,
                sequence INTEGER NOT NULL,
                status TEXT NOT NULL,
                rejection_reason TEXT,
                submitted_at DATETIME,
                reviewed_at DATETIME,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS deliverables (
                id TEXT PRIMARY KEY,
                milestone_id TEXT NOT NULL,
                title TEXT NOT NULL,
                status TEXT NOT NULL,
                rejection_reason TEXT,
                submitted_at DATETIME,
                reviewed_at DATETIME,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS time_entries (
                id TEXT PRIMARY KEY,
                contract_id TEXT NOT NULL,
                entry_date TEXT NOT NULL,
                hours TEXT NOT NULL,
                description TEXT,
                status TEXT NOT NULL,
                paid_at DATETIME,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS payments (
                id TEXT PRIMARY KEY,
                contract_id TEXT NOT NULL,
                milestone_id TEXT,
                payer_id TEXT NOT NULL,
                payee_id TEXT NOT NULL,
                amount TEXT NOT NULL,
                platform_fee TEXT NOT NULL,
                net_amount TEXT NOT NULL,
                status TEXT NOT NULL,
                transfer_ref TEXT,
                created_at DATETIME NOT NULL,
                completed_at DATETIME
            )
            "#,
            [],
        )?;

        // At most one non-failed payment per milestone. Concurrent release
        // attempts serialize here instead of racing to the gateway.
        conn.execute(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_payments_milestone_live
            ON payments(milestone_id)
            WHERE milestone_id IS NOT NULL AND status != 'failed'
            "#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_escrow_intent ON escrow_accounts(payment_intent_ref)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_escrow_txn_account ON escrow_transactions(escrow_account_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_milestones_contract ON milestones(contract_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_deliverables_milestone ON deliverables(milestone_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_time_entries_contract ON time_entries(contract_id, entry_date)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_payments_contract ON payments(contract_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_profiles_gateway ON profiles(gateway_account_id)",
            [],
        )?;

        debug!("Database migrations completed");
        Ok(())
    }

    /// Get the database connection
    pub fn conn(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }

    /// Close the database connection
    pub async fn close(&self) {
        info!("Closing database connection...");
        // The connection is closed when the Arc is dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_database_connect() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let conn_lock = db.conn();
        let conn = conn_lock.lock().await;
        let count: i64 = conn.query_row("SELECT 1", [], |row| row.get(0)).unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_milestone_payment_unique_index() {
        let db = Database::connect("sqlite::memory:").await.unwrap();
        let conn_lock = db.conn();
        let conn = conn_lock.lock().await;

        let insert = |id: &str, status: &str| {
            conn.execute(
                r#"INSERT INTO payments (id, contract_id, milestone_id, payer_id, payee_id,
                   amount, platform_fee, net_amount, status, created_at)
                   VALUES (?1, 'c1', 'm1', 'sponsor', 'worker', '100', '8', '92', ?2, '2024-01-01T00:00:00Z')"#,
                rusqlite::params![id, status],
            )
        };

        insert("p1", "processing").unwrap();
        // A second live payment for the same milestone is rejected
        assert!(insert("p2", "processing").is_err());
        // A failed payment does not block a retry
        conn.execute("UPDATE payments SET status = 'failed' WHERE id = 'p1'", [])
            .unwrap();
        insert("p3", "processing").unwrap();
    }
}
