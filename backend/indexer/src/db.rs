//! Database layer — migrations, the SQLite circle store, audit-log queries,
//! and cursor management.

use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::errors::{IndexerError, Result};
use crate::store::{AuditRecord, Circle, CircleState, CircleStore, TerminalProvenance};

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };

    // Make sure the file is created if it doesn't exist yet.
    let options = SqliteConnectOptions::from_str(&url)?.create_if_missing(true);

    // Every connection to an in-memory database gets its own empty copy, so
    // keep exactly one alive for the life of the pool.
    let pool_options = if url.contains(":memory:") {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(5)
    };

    let pool = pool_options.connect_with(options).await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

// ─────────────────────────────────────────────────────────
// Cursor helpers
// ─────────────────────────────────────────────────────────

/// Read the last-seen block from the cursor row.
/// Returns `0` when no cursor has been persisted yet.
pub async fn get_last_block(pool: &SqlitePool) -> Result<i64> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT last_block FROM indexer_cursor WHERE id = 1")
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|(v,)| v).unwrap_or(0))
}

/// Persist the last-seen block (and optionally a pagination cursor string).
pub async fn save_cursor(pool: &SqlitePool, last_block: i64, last_cursor: Option<&str>) -> Result<()> {
    sqlx::query("UPDATE indexer_cursor SET last_block = ?1, last_cursor = ?2 WHERE id = 1")
        .bind(last_block)
        .bind(last_cursor)
        .execute(pool)
        .await?;
    Ok(())
}

/// Read back the raw cursor string (used to resume pagination mid-range).
pub async fn get_cursor_string(pool: &SqlitePool) -> Result<Option<String>> {
    let row: Option<(Option<String>,)> =
        sqlx::query_as("SELECT last_cursor FROM indexer_cursor WHERE id = 1")
            .fetch_optional(pool)
            .await?;
    Ok(row.and_then(|(v,)| v))
}

// ─────────────────────────────────────────────────────────
// Circle rows
// ─────────────────────────────────────────────────────────

const CIRCLE_COLUMNS: &str = r#"
    circle_id, creator, is_stablecoin_denominated, goal_value_to_raise,
    lead_duration, due_duration, originator_score_at_creation,
    contributors, contribution_amounts, state,
    block_number, block_timestamp, tx_hash, last_log_index,
    killed_block_number, killed_timestamp, killed_tx_hash, killed_amount,
    redeemed_block_number, redeemed_timestamp, redeemed_tx_hash, redeemed_amount
"#;

/// Flat row shape of the `circles` table.
#[derive(Debug, sqlx::FromRow)]
struct CircleRow {
    circle_id: String,
    creator: String,
    is_stablecoin_denominated: bool,
    goal_value_to_raise: String,
    lead_duration: i64,
    due_duration: i64,
    originator_score_at_creation: String,
    contributors: String,
    contribution_amounts: String,
    state: String,
    block_number: i64,
    block_timestamp: i64,
    tx_hash: String,
    last_log_index: i64,
    killed_block_number: Option<i64>,
    killed_timestamp: Option<i64>,
    killed_tx_hash: Option<String>,
    killed_amount: Option<String>,
    redeemed_block_number: Option<i64>,
    redeemed_timestamp: Option<i64>,
    redeemed_tx_hash: Option<String>,
    redeemed_amount: Option<String>,
}

fn provenance(
    block_number: Option<i64>,
    timestamp: Option<i64>,
    tx_hash: Option<String>,
    amount: Option<String>,
) -> Option<TerminalProvenance> {
    match (block_number, timestamp, tx_hash) {
        (Some(block_number), Some(timestamp), Some(tx_hash)) => Some(TerminalProvenance {
            block_number,
            timestamp,
            tx_hash,
            amount,
        }),
        _ => None,
    }
}

fn duration_from_row(circle_id: &str, v: i64) -> Result<u64> {
    u64::try_from(v)
        .map_err(|_| IndexerError::CorruptRecord(format!("circle {circle_id}: negative duration {v}")))
}

fn duration_to_row(circle_id: &str, v: u64) -> Result<i64> {
    i64::try_from(v)
        .map_err(|_| IndexerError::CorruptRecord(format!("circle {circle_id}: duration {v} out of range")))
}

impl TryFrom<CircleRow> for Circle {
    type Error = IndexerError;

    fn try_from(row: CircleRow) -> Result<Self> {
        let state = CircleState::parse(&row.state).ok_or_else(|| {
            IndexerError::CorruptRecord(format!("circle {}: unknown state {}", row.circle_id, row.state))
        })?;
        let contributors: Vec<String> = serde_json::from_str(&row.contributors)?;
        let contribution_amounts: Vec<String> = serde_json::from_str(&row.contribution_amounts)?;
        if contributors.len() != contribution_amounts.len() {
            return Err(IndexerError::CorruptRecord(format!(
                "circle {}: {} contributors but {} amounts",
                row.circle_id,
                contributors.len(),
                contribution_amounts.len()
            )));
        }

        Ok(Circle {
            lead_duration: duration_from_row(&row.circle_id, row.lead_duration)?,
            due_duration: duration_from_row(&row.circle_id, row.due_duration)?,
            killed: provenance(
                row.killed_block_number,
                row.killed_timestamp,
                row.killed_tx_hash,
                row.killed_amount,
            ),
            redeemed: provenance(
                row.redeemed_block_number,
                row.redeemed_timestamp,
                row.redeemed_tx_hash,
                row.redeemed_amount,
            ),
            circle_id: row.circle_id,
            creator: row.creator,
            is_stablecoin_denominated: row.is_stablecoin_denominated,
            goal_value_to_raise: row.goal_value_to_raise,
            originator_score_at_creation: row.originator_score_at_creation,
            contributors,
            contribution_amounts,
            state,
            block_number: row.block_number,
            block_timestamp: row.block_timestamp,
            tx_hash: row.tx_hash,
            last_log_index: row.last_log_index,
        })
    }
}

// ─────────────────────────────────────────────────────────
// Store adapter
// ─────────────────────────────────────────────────────────

/// [`CircleStore`] backed by the SQLite pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CircleStore for SqliteStore {
    async fn load(&self, circle_id: &str) -> Result<Option<Circle>> {
        get_circle(&self.pool, circle_id).await
    }

    /// Creation fields are only written on first insert; later saves touch the
    /// mutable columns.
    async fn save(&self, circle: &Circle) -> Result<()> {
        let killed = circle.killed.as_ref();
        let redeemed = circle.redeemed.as_ref();
        sqlx::query(&format!(
            r#"
            INSERT INTO circles ({CIRCLE_COLUMNS})
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11,
                    ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)
            ON CONFLICT (circle_id) DO UPDATE SET
                contributors          = excluded.contributors,
                contribution_amounts  = excluded.contribution_amounts,
                state                 = excluded.state,
                block_number          = excluded.block_number,
                block_timestamp       = excluded.block_timestamp,
                tx_hash               = excluded.tx_hash,
                last_log_index        = excluded.last_log_index,
                killed_block_number   = COALESCE(circles.killed_block_number, excluded.killed_block_number),
                killed_timestamp      = COALESCE(circles.killed_timestamp, excluded.killed_timestamp),
                killed_tx_hash        = COALESCE(circles.killed_tx_hash, excluded.killed_tx_hash),
                killed_amount         = COALESCE(circles.killed_amount, excluded.killed_amount),
                redeemed_block_number = COALESCE(circles.redeemed_block_number, excluded.redeemed_block_number),
                redeemed_timestamp    = COALESCE(circles.redeemed_timestamp, excluded.redeemed_timestamp),
                redeemed_tx_hash      = COALESCE(circles.redeemed_tx_hash, excluded.redeemed_tx_hash),
                redeemed_amount       = COALESCE(circles.redeemed_amount, excluded.redeemed_amount)
            "#
        ))
        .bind(&circle.circle_id)
        .bind(&circle.creator)
        .bind(circle.is_stablecoin_denominated)
        .bind(&circle.goal_value_to_raise)
        .bind(duration_to_row(&circle.circle_id, circle.lead_duration)?)
        .bind(duration_to_row(&circle.circle_id, circle.due_duration)?)
        .bind(&circle.originator_score_at_creation)
        .bind(serde_json::to_string(&circle.contributors)?)
        .bind(serde_json::to_string(&circle.contribution_amounts)?)
        .bind(circle.state.as_str())
        .bind(circle.block_number)
        .bind(circle.block_timestamp)
        .bind(&circle.tx_hash)
        .bind(circle.last_log_index)
        .bind(killed.map(|k| k.block_number))
        .bind(killed.map(|k| k.timestamp))
        .bind(killed.map(|k| k.tx_hash.as_str()))
        .bind(killed.and_then(|k| k.amount.as_deref()))
        .bind(redeemed.map(|r| r.block_number))
        .bind(redeemed.map(|r| r.timestamp))
        .bind(redeemed.map(|r| r.tx_hash.as_str()))
        .bind(redeemed.and_then(|r| r.amount.as_deref()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_audit(&self, record: &AuditRecord) -> Result<bool> {
        let rows_affected = sqlx::query(
            r#"
            INSERT OR IGNORE INTO audit_events
                (tx_hash, log_index, event_type, circle_id, schema_version,
                 block_number, block_timestamp, payload)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(&record.tx_hash)
        .bind(record.log_index)
        .bind(&record.event_type)
        .bind(&record.circle_id)
        .bind(record.schema_version)
        .bind(record.block_number)
        .bind(record.block_timestamp)
        .bind(&record.payload)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(rows_affected == 1)
    }
}

// ─────────────────────────────────────────────────────────
// Reads
// ─────────────────────────────────────────────────────────

pub async fn get_circle(pool: &SqlitePool, circle_id: &str) -> Result<Option<Circle>> {
    let row = sqlx::query_as::<_, CircleRow>(&format!(
        "SELECT {CIRCLE_COLUMNS} FROM circles WHERE circle_id = ?1"
    ))
    .bind(circle_id)
    .fetch_optional(pool)
    .await?;
    row.map(Circle::try_from).transpose()
}

/// All circles, most recently touched first.
pub async fn list_circles(pool: &SqlitePool) -> Result<Vec<Circle>> {
    let rows = sqlx::query_as::<_, CircleRow>(&format!(
        "SELECT {CIRCLE_COLUMNS} FROM circles ORDER BY block_number DESC, last_log_index DESC"
    ))
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(Circle::try_from).collect()
}

/// Audit records for one circle, in chain order.
pub async fn get_audit_for_circle(pool: &SqlitePool, circle_id: &str) -> Result<Vec<AuditRecord>> {
    let rows = sqlx::query_as::<_, AuditRecord>(
        r#"
        SELECT tx_hash, log_index, event_type, circle_id, schema_version,
               block_number, block_timestamp, payload
        FROM   audit_events
        WHERE  circle_id = ?1
        ORDER  BY block_number ASC, log_index ASC
        "#,
    )
    .bind(circle_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// The whole audit log, in chain order.
pub async fn get_all_audit(pool: &SqlitePool) -> Result<Vec<AuditRecord>> {
    let rows = sqlx::query_as::<_, AuditRecord>(
        r#"
        SELECT tx_hash, log_index, event_type, circle_id, schema_version,
               block_number, block_timestamp, payload
        FROM   audit_events
        ORDER  BY block_number ASC, log_index ASC
        "#,
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}
