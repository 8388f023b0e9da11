//! Shared network backend using PostgreSQL
//!
//! Every table name carries a configurable prefix so several ledgers can
//! share one database. Statements are rendered once at connect time.

use super::{ExtendedQueries, LoadedAccount, StorageBackend, TransactionFilter, NEW_ACCOUNT_REASON};
use crate::config::PostgresConfig;
use crate::error::{Error, Result};
use crate::types::{AccountId, AccountRecord, TopBalanceEntry, TransactionEntry};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, FromRow)]
struct AccountRow {
    uuid: Uuid,
    player_name: Option<String>,
    balance: Decimal,
    total_earned: Decimal,
    total_spent: Decimal,
    last_transaction: String,
    last_transaction_at: Option<DateTime<Utc>>,
}

impl From<AccountRow> for AccountRecord {
    fn from(row: AccountRow) -> Self {
        AccountRecord {
            id: AccountId::new(row.uuid),
            display_name: row.player_name,
            balance: row.balance,
            total_earned: row.total_earned,
            total_spent: row.total_spent,
            last_transaction: row.last_transaction,
            last_transaction_at: row.last_transaction_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct TransactionRow {
    timestamp: DateTime<Utc>,
    kind: String,
    source_uuid: Uuid,
    target_uuid: Option<Uuid>,
    player_name: String,
    amount: Decimal,
}

impl TryFrom<TransactionRow> for TransactionEntry {
    type Error = Error;

    fn try_from(row: TransactionRow) -> Result<Self> {
        Ok(TransactionEntry {
            timestamp: row.timestamp,
            kind: row.kind.parse()?,
            source: AccountId::new(row.source_uuid),
            target: row.target_uuid.map(AccountId::new),
            amount: row.amount,
            display_name: row.player_name,
        })
    }
}

#[derive(Debug, FromRow)]
struct TopRow {
    uuid: Uuid,
    player_name: Option<String>,
    balance: Decimal,
    trend: Decimal,
}

impl From<TopRow> for TopBalanceEntry {
    fn from(row: TopRow) -> Self {
        TopBalanceEntry {
            id: AccountId::new(row.uuid),
            name: row.player_name,
            balance: row.balance,
            trend: row.trend,
        }
    }
}

/// SQL rendered for one table prefix
#[derive(Debug, Clone)]
struct Statements {
    schema: Vec<String>,
    select_account: String,
    insert_default: String,
    upsert_account: String,
    select_all: String,
    exists: String,
    delete: String,
    count: String,
    find_by_name: String,
    select_name: String,
    update_name: String,
    insert_transaction: String,
    query_transactions: String,
    count_transactions: String,
    top_balances: String,
    top_balances_period: String,
    snapshot: String,
    count_greater: String,
    all_names: String,
}

const ACCOUNT_COLUMNS: &str =
    "uuid, player_name, balance, total_earned, total_spent, last_transaction, last_transaction_at";

const TRANSACTION_FILTER: &str =
    "($1::text IS NULL OR LOWER(player_name) LIKE $1) AND ($2::uuid IS NULL OR source_uuid = $2 OR target_uuid = $2)";

impl Statements {
    fn new(p: &str) -> Self {
        Self {
            schema: vec![
                format!(
                    "CREATE TABLE IF NOT EXISTS {p}balances (
                        uuid UUID PRIMARY KEY,
                        player_name TEXT,
                        balance NUMERIC NOT NULL DEFAULT 0,
                        total_earned NUMERIC NOT NULL DEFAULT 0,
                        total_spent NUMERIC NOT NULL DEFAULT 0,
                        last_transaction TEXT NOT NULL DEFAULT '',
                        last_transaction_at TIMESTAMPTZ,
                        updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    )"
                ),
                format!("CREATE INDEX IF NOT EXISTS {p}idx_balances_name ON {p}balances (LOWER(player_name))"),
                format!("CREATE INDEX IF NOT EXISTS {p}idx_balances_balance ON {p}balances (balance DESC)"),
                format!(
                    "CREATE TABLE IF NOT EXISTS {p}transactions (
                        id BIGSERIAL PRIMARY KEY,
                        timestamp TIMESTAMPTZ NOT NULL,
                        kind TEXT NOT NULL,
                        source_uuid UUID NOT NULL,
                        target_uuid UUID,
                        player_name TEXT NOT NULL,
                        amount NUMERIC NOT NULL
                    )"
                ),
                format!("CREATE INDEX IF NOT EXISTS {p}idx_transactions_ts ON {p}transactions (timestamp DESC)"),
                format!(
                    "CREATE TABLE IF NOT EXISTS {p}balance_snapshots (
                        snap_day DATE NOT NULL,
                        uuid UUID NOT NULL,
                        balance NUMERIC NOT NULL,
                        PRIMARY KEY (snap_day, uuid)
                    )"
                ),
            ],
            select_account: format!("SELECT {ACCOUNT_COLUMNS} FROM {p}balances WHERE uuid = $1"),
            insert_default: format!(
                "INSERT INTO {p}balances ({ACCOUNT_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (uuid) DO NOTHING"
            ),
            upsert_account: format!(
                "INSERT INTO {p}balances ({ACCOUNT_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (uuid) DO UPDATE SET
                    player_name = COALESCE(EXCLUDED.player_name, {p}balances.player_name),
                    balance = EXCLUDED.balance,
                    total_earned = EXCLUDED.total_earned,
                    total_spent = EXCLUDED.total_spent,
                    last_transaction = EXCLUDED.last_transaction,
                    last_transaction_at = EXCLUDED.last_transaction_at,
                    updated_at = NOW()"
            ),
            select_all: format!("SELECT {ACCOUNT_COLUMNS} FROM {p}balances"),
            exists: format!("SELECT EXISTS (SELECT 1 FROM {p}balances WHERE uuid = $1)"),
            delete: format!("DELETE FROM {p}balances WHERE uuid = $1"),
            count: format!("SELECT COUNT(*) FROM {p}balances"),
            find_by_name: format!(
                "SELECT uuid FROM {p}balances WHERE LOWER(player_name) = LOWER($1) LIMIT 1"
            ),
            select_name: format!("SELECT player_name FROM {p}balances WHERE uuid = $1"),
            update_name: format!("UPDATE {p}balances SET player_name = $2 WHERE uuid = $1"),
            insert_transaction: format!(
                "INSERT INTO {p}transactions (timestamp, kind, source_uuid, target_uuid, player_name, amount)
                 VALUES ($1, $2, $3, $4, $5, $6)"
            ),
            query_transactions: format!(
                "SELECT timestamp, kind, source_uuid, target_uuid, player_name, amount
                 FROM {p}transactions WHERE {TRANSACTION_FILTER}
                 ORDER BY timestamp DESC, id DESC LIMIT $3 OFFSET $4"
            ),
            count_transactions: format!(
                "SELECT COUNT(*) FROM {p}transactions WHERE {TRANSACTION_FILTER}"
            ),
            top_balances: format!(
                "SELECT uuid, player_name, balance, 0::numeric AS trend FROM {p}balances
                 ORDER BY balance DESC, uuid LIMIT $1 OFFSET $2"
            ),
            top_balances_period: format!(
                "SELECT b.uuid, b.player_name, b.balance,
                        (b.balance - COALESCE(s.balance, 0)) AS trend
                 FROM {p}balances b
                 LEFT JOIN {p}balance_snapshots s ON s.uuid = b.uuid AND s.snap_day = $3
                 ORDER BY trend DESC, b.uuid LIMIT $1 OFFSET $2"
            ),
            snapshot: format!(
                "INSERT INTO {p}balance_snapshots (snap_day, uuid, balance)
                 SELECT $1, uuid, balance FROM {p}balances
                 ON CONFLICT (snap_day, uuid) DO UPDATE SET balance = EXCLUDED.balance"
            ),
            count_greater: format!("SELECT COUNT(*) FROM {p}balances WHERE balance > $1"),
            all_names: format!(
                "SELECT uuid, player_name FROM {p}balances WHERE player_name IS NOT NULL"
            ),
        }
    }
}

/// Table prefixes are spliced into SQL, so only identifier characters pass
fn validate_prefix(prefix: &str) -> Result<()> {
    if prefix.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(Error::Config(format!(
            "Invalid table prefix '{}': only [A-Za-z0-9_] allowed",
            prefix
        )))
    }
}

/// `LIKE` pattern for a case-insensitive substring match
fn like_pattern(name: &str) -> String {
    let escaped = name
        .to_lowercase()
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

/// PostgreSQL account store
pub struct PostgresBackend {
    pool: PgPool,
    sql: Statements,
}

impl PostgresBackend {
    /// Connect the pool and verify the connection
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        validate_prefix(&config.table_prefix)?;

        tracing::info!("Connecting to database...");
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
            .connect(&config.url)
            .await?;

        sqlx::query("SELECT 1").fetch_one(&pool).await?;
        tracing::info!("Database connection verified");

        Ok(Self::with_pool(pool, &config.table_prefix))
    }

    fn with_pool(pool: PgPool, table_prefix: &str) -> Self {
        Self {
            pool,
            sql: Statements::new(table_prefix),
        }
    }

    fn filter_binds(filter: &TransactionFilter) -> (Option<String>, Option<Uuid>) {
        (
            filter
                .name
                .as_deref()
                .filter(|n| !n.is_empty())
                .map(like_pattern),
            filter.account.map(|a| *a.as_uuid()),
        )
    }

    async fn fetch_account(&self, id: AccountId) -> Result<Option<AccountRecord>> {
        let row: Option<AccountRow> = sqlx::query_as(&self.sql.select_account)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(AccountRecord::from))
    }

    fn upsert<'q>(
        sql: &'q str,
        record: &'q AccountRecord,
    ) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
        sqlx::query(sql)
            .bind(record.id.as_uuid())
            .bind(record.display_name.as_deref())
            .bind(record.balance)
            .bind(record.total_earned)
            .bind(record.total_spent)
            .bind(record.last_transaction.as_str())
            .bind(record.last_transaction_at)
    }
}

#[async_trait]
impl StorageBackend for PostgresBackend {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn initialize(&self) -> Result<()> {
        for statement in &self.sql.schema {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::info!("PostgreSQL schema ready");
        Ok(())
    }

    async fn load_account(&self, id: AccountId, starting_balance: Decimal) -> Result<LoadedAccount> {
        if let Some(record) = self.fetch_account(id).await? {
            return Ok(LoadedAccount {
                record,
                created: false,
            });
        }

        let fresh = AccountRecord::with_starting_balance(id, starting_balance, NEW_ACCOUNT_REASON);
        let inserted = Self::upsert(&self.sql.insert_default, &fresh)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if inserted == 1 {
            return Ok(LoadedAccount {
                record: fresh,
                created: true,
            });
        }

        // Another process created it first
        let record = self
            .fetch_account(id)
            .await?
            .ok_or_else(|| Error::Storage(format!("Account {} vanished during creation", id)))?;
        Ok(LoadedAccount {
            record,
            created: false,
        })
    }

    async fn save_account(&self, record: &AccountRecord) -> Result<()> {
        Self::upsert(&self.sql.upsert_account, record)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn save_all(&self, records: &[AccountRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for record in records {
            Self::upsert(&self.sql.upsert_account, record)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        tracing::debug!(count = records.len(), "Saved account batch");
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<AccountRecord>> {
        let rows: Vec<AccountRow> = sqlx::query_as(&self.sql.select_all)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(AccountRecord::from).collect())
    }

    async fn account_exists(&self, id: AccountId) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(&self.sql.exists)
            .bind(id.as_uuid())
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn delete_account(&self, id: AccountId) -> Result<bool> {
        let deleted = sqlx::query(&self.sql.delete)
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(deleted > 0)
    }

    async fn account_count(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar(&self.sql.count)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    async fn find_account_by_name(&self, name: &str) -> Result<Option<AccountId>> {
        let id: Option<Uuid> = sqlx::query_scalar(&self.sql.find_by_name)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id.map(AccountId::new))
    }

    async fn display_name(&self, id: AccountId) -> Result<Option<String>> {
        let name: Option<Option<String>> = sqlx::query_scalar(&self.sql.select_name)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        Ok(name.flatten())
    }

    async fn update_display_name(&self, id: AccountId, name: &str) -> Result<()> {
        sqlx::query(&self.sql.update_name)
            .bind(id.as_uuid())
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn append_transactions(&self, entries: &[TransactionEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for entry in entries {
            sqlx::query(&self.sql.insert_transaction)
                .bind(entry.timestamp)
                .bind(entry.kind.code())
                .bind(entry.source.as_uuid())
                .bind(entry.target.map(|t| *t.as_uuid()))
                .bind(entry.display_name.as_str())
                .bind(entry.amount)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.pool.close().await;
        tracing::info!("PostgreSQL pool closed");
        Ok(())
    }

    fn extended(&self) -> Option<&dyn ExtendedQueries> {
        Some(self)
    }
}

#[async_trait]
impl ExtendedQueries for PostgresBackend {
    async fn query_transactions(
        &self,
        filter: &TransactionFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<TransactionEntry>> {
        let (name, account) = Self::filter_binds(filter);
        let rows: Vec<TransactionRow> = sqlx::query_as(&self.sql.query_transactions)
            .bind(name)
            .bind(account)
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(TransactionEntry::try_from).collect()
    }

    async fn count_transactions(&self, filter: &TransactionFilter) -> Result<u64> {
        let (name, account) = Self::filter_binds(filter);
        let count: i64 = sqlx::query_scalar(&self.sql.count_transactions)
            .bind(name)
            .bind(account)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn top_balances(&self, limit: usize, offset: usize) -> Result<Vec<TopBalanceEntry>> {
        let rows: Vec<TopRow> = sqlx::query_as(&self.sql.top_balances)
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(TopBalanceEntry::from).collect())
    }

    async fn top_balances_period(
        &self,
        limit: usize,
        offset: usize,
        days_ago: u32,
    ) -> Result<Vec<TopBalanceEntry>> {
        let day = Utc::now().date_naive() - chrono::Duration::days(i64::from(days_ago));
        let rows: Vec<TopRow> = sqlx::query_as(&self.sql.top_balances_period)
            .bind(limit as i64)
            .bind(offset as i64)
            .bind(day)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(TopBalanceEntry::from).collect())
    }

    async fn snapshot_balances(&self, day: NaiveDate) -> Result<usize> {
        let written = sqlx::query(&self.sql.snapshot)
            .bind(day)
            .execute(&self.pool)
            .await?
            .rows_affected();
        tracing::info!(%day, count = written, "Balance snapshot recorded");
        Ok(written as usize)
    }

    async fn count_accounts_with_balance_greater(&self, amount: Decimal) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(&self.sql.count_greater)
            .bind(amount)
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn all_display_names(&self) -> Result<Vec<(AccountId, String)>> {
        let rows: Vec<(Uuid, String)> = sqlx::query_as(&self.sql.all_names)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|(uuid, name)| (AccountId::new(uuid), name))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_validation() {
        assert!(validate_prefix("eco_").is_ok());
        assert!(validate_prefix("").is_ok());
        assert!(validate_prefix("eco; DROP TABLE x; --").is_err());
        assert!(validate_prefix("eco-").is_err());
    }

    #[test]
    fn test_statements_carry_prefix() {
        let sql = Statements::new("shop_");
        assert!(sql.select_account.contains("shop_balances"));
        assert!(sql.top_balances_period.contains("shop_balance_snapshots"));
        assert!(sql.schema.iter().all(|s| s.contains("shop_")));
    }

    #[test]
    fn test_like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("Bob"), "%bob%");
        assert_eq!(like_pattern("50%_off"), "%50\\%\\_off%");
    }

    #[tokio::test]
    #[ignore] // Only run with database available
    async fn test_database_round_trip() {
        let backend = PostgresBackend::connect(&PostgresConfig {
            table_prefix: "ledger_test_".to_string(),
            ..PostgresConfig::default()
        })
        .await
        .unwrap();
        backend.initialize().await.unwrap();

        let id = AccountId::random();
        let loaded = backend.load_account(id, Decimal::new(100, 0)).await.unwrap();
        assert!(loaded.created);

        let mut record = loaded.record;
        record.credit(Decimal::new(25, 0), "test");
        backend.save_all(&[record]).await.unwrap();

        let again = backend.load_account(id, Decimal::ZERO).await.unwrap();
        assert!(!again.created);
        assert_eq!(again.record.balance, Decimal::new(125, 0));

        assert!(backend.delete_account(id).await.unwrap());
        backend.shutdown().await.unwrap();
    }
}
