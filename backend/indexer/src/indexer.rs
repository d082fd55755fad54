//! Long-running background task that polls the log feed and projects
//! decoded circle events, strictly one at a time and in chain order.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::db::{self, SqliteStore};
use crate::errors::{IndexerError, Result};
use crate::events::ChainEvent;
use crate::projector::{Outcome, Projector};
use crate::rpc::{self, RawLog};
use crate::store::CircleStore;

pub struct IndexerState {
    pub pool: SqlitePool,
    pub config: Config,
    pub client: Client,
    pub projector: Projector<SqliteStore>,
}

/// Per-page tally, logged after each poll.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PageSummary {
    pub recorded: usize,
    pub applied: usize,
    pub warnings: usize,
    pub malformed: usize,
    pub skipped: usize,
}

/// Run the indexer loop until `shutdown` is cancelled.
pub async fn run(state: Arc<IndexerState>, shutdown: CancellationToken) {
    info!("Indexer starting — contract: {}", state.config.contract_address);

    let (mut current_block, mut cursor) =
        resume_point(&state.pool, state.config.start_block).await;

    info!("Resuming from block {current_block}");

    loop {
        let poll = poll_once(&state, current_block, cursor.as_deref());
        let result = tokio::select! {
            _ = shutdown.cancelled() => break,
            r = poll => r,
        };

        match result {
            Ok((next_block, next_cursor)) => {
                current_block = next_block;
                cursor = next_cursor;
            }
            Err(e) => {
                error!("Indexer poll error: {e}");
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_secs(state.config.poll_interval_secs)) => {}
        }
    }

    info!("Indexer stopped at block {current_block}");
}

/// Load the stored cursor, falling back to `start_block` when there is none
/// or it cannot be read. Replay makes a too-early start harmless.
async fn resume_point(pool: &SqlitePool, start_block: u64) -> (u64, Option<String>) {
    let last_block = match db::get_last_block(pool).await {
        Ok(b) => b,
        Err(e) => {
            warn!("Could not read stored block, starting from {start_block}: {e}");
            0
        }
    };
    let cursor = match db::get_cursor_string(pool).await {
        Ok(c) => c,
        Err(e) => {
            warn!("Could not read stored pagination cursor, ignoring it: {e}");
            None
        }
    };

    let block = if last_block > 0 {
        last_block as u64
    } else {
        start_block
    };
    (block, cursor)
}

/// Perform a single poll iteration.
///
/// Returns `(next_start_block, next_cursor)`. On error nothing is advanced,
/// so the same page is fetched and replayed on the next iteration.
async fn poll_once(
    state: &IndexerState,
    start_block: u64,
    cursor: Option<&str>,
) -> Result<(u64, Option<String>)> {
    let config = &state.config;
    let (raw_logs, next_cursor, latest_block) = rpc::fetch_logs(
        &state.client,
        &config.rpc_url,
        &config.contract_address,
        start_block,
        cursor,
        config.events_per_page,
    )
    .await?;

    if !raw_logs.is_empty() {
        let summary = project_page(&state.projector, &raw_logs, &config.contract_address).await?;
        info!(
            "Polled {} raw logs → {} new audit records, {} aggregate updates, {} warnings, {} malformed, {} skipped",
            raw_logs.len(),
            summary.recorded,
            summary.applied,
            summary.warnings,
            summary.malformed,
            summary.skipped
        );
    }

    // Advance the block cursor:
    // - If there is a next_cursor string, keep the same start_block so the next
    //   call paginates within the same block range.
    // - Otherwise advance to the latest known block.
    let next_block = latest_block
        .map(|b| b.max(start_block))
        .unwrap_or(start_block);

    // Persist cursor so restarts are deterministic.
    db::save_cursor(&state.pool, next_block as i64, next_cursor.as_deref()).await?;

    Ok((next_block, next_cursor))
}

/// Decode a page of raw logs and project them in `(block, log index)` order.
///
/// A malformed log is logged and dropped; the rest of the page still goes
/// through. A persistence error stops the page immediately.
pub async fn project_page<S: CircleStore>(
    projector: &Projector<S>,
    raw_logs: &[RawLog],
    contract_address: &str,
) -> Result<PageSummary> {
    let mut summary = PageSummary::default();
    let mut events: Vec<ChainEvent> = Vec::with_capacity(raw_logs.len());

    for raw in raw_logs {
        match rpc::decode_log(raw, contract_address) {
            Ok(Some(ev)) => events.push(ev),
            Ok(None) => summary.skipped += 1,
            Err(e) => {
                error!("Dropping log {:?}: {e}", raw.transaction_hash);
                summary.malformed += 1;
            }
        }
    }

    events.sort_by_key(|ev| ev.meta.position());

    for ev in &events {
        let projection = match projector.project(ev).await {
            Ok(p) => p,
            Err(e @ IndexerError::MalformedEvent { .. }) => {
                error!("Dropping event at {:?}: {e}", ev.meta.position());
                summary.malformed += 1;
                continue;
            }
            Err(e) => return Err(e),
        };
        debug!(kind = ev.kind().as_str(), ?projection, "projected");

        if projection.recorded {
            summary.recorded += 1;
        }
        match projection.outcome {
            Outcome::Applied => summary.applied += 1,
            Outcome::Warned(_) => summary.warnings += 1,
            Outcome::AuditOnly => {}
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use async_trait::async_trait;

    use super::*;
    use crate::store::{AuditRecord, Circle, CircleState, MemoryStore};

    /// Fails every circle save from `fail_from_block` onwards.
    struct FailingStore {
        inner: MemoryStore,
        fail_from_block: i64,
    }

    #[async_trait]
    impl CircleStore for FailingStore {
        async fn load(&self, circle_id: &str) -> Result<Option<Circle>> {
            self.inner.load(circle_id).await
        }

        async fn save(&self, circle: &Circle) -> Result<()> {
            if circle.block_number >= self.fail_from_block {
                return Err(IndexerError::Database(sqlx::Error::PoolTimedOut));
            }
            self.inner.save(circle).await
        }

        async fn insert_audit(&self, record: &AuditRecord) -> Result<bool> {
            self.inner.insert_audit(record).await
        }
    }

    const CONTRACT: &str = "0xc1c1e5";

    fn log(event: &str, block: u64, index: u64, args: serde_json::Value) -> RawLog {
        RawLog {
            event: Some(event.to_string()),
            args,
            address: Some(CONTRACT.to_string()),
            transaction_hash: Some(format!("0x{block:04x}{index:04x}")),
            block_number: Some(json!(block)),
            block_timestamp: Some(json!(1_700_000_000 + block)),
            log_index: Some(json!(index)),
            removed: None,
            abi_version: None,
        }
    }

    fn created(block: u64) -> RawLog {
        log(
            "CircleCreated",
            block,
            0,
            json!({
                "circleId": "0x01", "creator": "0xC0", "isStablecoin": false,
                "goalValueToRaise": "1000", "leadDuration": 10, "dueDuration": 20,
                "originatorScore": "3"
            }),
        )
    }

    #[tokio::test]
    async fn page_is_projected_in_chain_order() {
        let projector = Projector::new(MemoryStore::default());
        // Delivered out of order: the creation must still be applied first.
        let page = vec![
            log(
                "CircleContribution",
                2,
                1,
                json!({ "circleId": "0x01", "contributor": "0xB", "amount": "20" }),
            ),
            log("CircleKilled1", 3, 0, json!({ "circleId": "0x01", "killedAt": 1_700_000_500 })),
            created(1),
            log(
                "CircleContribution",
                2,
                0,
                json!({ "circleId": "0x01", "contributor": "0xA", "amount": "10" }),
            ),
        ];

        let summary = project_page(&projector, &page, CONTRACT).await.unwrap();
        assert_eq!(
            summary,
            PageSummary {
                recorded: 4,
                applied: 4,
                ..Default::default()
            }
        );

        let c = projector.store().load("0x01").await.unwrap().unwrap();
        assert_eq!(c.contributors, vec!["0xA", "0xB"]);
        assert_eq!(c.contribution_amounts, vec!["10", "20"]);
        assert_eq!(c.state, CircleState::Killed);
        assert_eq!(c.killed.unwrap().timestamp, 1_700_000_500);
    }

    #[tokio::test]
    async fn malformed_log_does_not_stop_the_page() {
        let projector = Projector::new(MemoryStore::default());
        let page = vec![
            created(1),
            log("CircleContribution", 2, 0, json!({ "circleId": "0x01" })),
            log("Transfer", 2, 1, json!({})),
            log(
                "CircleContribution",
                3,
                0,
                json!({ "circleId": "0x01", "contributor": "0xA", "amount": "7" }),
            ),
        ];

        let summary = project_page(&projector, &page, CONTRACT).await.unwrap();
        assert_eq!(summary.malformed, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.recorded, 2);

        let c = projector.store().load("0x01").await.unwrap().unwrap();
        assert_eq!(c.contribution_amounts, vec!["7"]);
    }

    #[tokio::test]
    async fn replayed_page_changes_nothing() {
        let projector = Projector::new(MemoryStore::default());
        let page = vec![
            created(1),
            log(
                "CircleContribution",
                2,
                0,
                json!({ "circleId": "0x01", "contributor": "0xA", "amount": "10" }),
            ),
            log(
                "CircleContribution",
                5,
                0,
                json!({ "circleId": "0xFF", "contributor": "0xA", "amount": "10" }),
            ),
        ];

        project_page(&projector, &page, CONTRACT).await.unwrap();
        let before = projector.store().load("0x01").await.unwrap();

        let again = project_page(&projector, &page, CONTRACT).await.unwrap();
        assert_eq!(again.recorded, 0);
        assert_eq!(again.applied, 0);
        assert_eq!(projector.store().load("0x01").await.unwrap(), before);
        assert!(projector.store().load("0xFF").await.unwrap().is_none());
        assert_eq!(projector.store().audit_records().await.len(), 3);
    }

    #[tokio::test]
    async fn persistence_failure_stops_the_page() {
        let projector = Projector::new(FailingStore {
            inner: MemoryStore::default(),
            fail_from_block: 3,
        });
        let contribution = |block, who: &str| {
            log(
                "CircleContribution",
                block,
                0,
                json!({ "circleId": "0x01", "contributor": who, "amount": "1" }),
            )
        };
        let page = vec![
            created(1),
            contribution(2, "0xA"),
            contribution(3, "0xB"),
            contribution(4, "0xC"),
        ];

        let err = project_page(&projector, &page, CONTRACT).await.unwrap_err();
        assert!(matches!(err, IndexerError::Database(_)));

        // Block 3 left its audit record behind; block 4 was never reached.
        let store = &projector.store().inner;
        assert_eq!(store.audit_records().await.len(), 3);
        let c = store.load("0x01").await.unwrap().unwrap();
        assert_eq!(c.contributors, vec!["0xA"]);

        // Once storage recovers, replaying the same page completes it.
        let recovered = Projector::new(FailingStore {
            inner: MemoryStore::default(),
            fail_from_block: i64::MAX,
        });
        for raw in &page[..3] {
            if let Some(ev) = rpc::decode_log(raw, CONTRACT).unwrap() {
                let record = AuditRecord::from_event(&ev).unwrap();
                recovered.store().inner.insert_audit(&record).await.unwrap();
            }
        }
        recovered.store().inner.save(&c).await.unwrap();

        let summary = project_page(&recovered, &page, CONTRACT).await.unwrap();
        assert_eq!(summary.recorded, 1);
        assert_eq!(summary.applied, 2);
        let c = recovered.store().load("0x01").await.unwrap().unwrap();
        assert_eq!(c.contributors, vec!["0xA", "0xB", "0xC"]);
    }

    #[tokio::test]
    async fn resume_point_prefers_stored_cursor() {
        let pool = db::init_pool("sqlite::memory:").await.unwrap();
        assert_eq!(resume_point(&pool, 500).await, (500, None));

        db::save_cursor(&pool, 812, Some("page-2")).await.unwrap();
        assert_eq!(resume_point(&pool, 500).await, (812, Some("page-2".to_string())));
    }

    #[tokio::test]
    async fn unreadable_cursor_falls_back_to_start_block() {
        let pool = db::init_pool("sqlite::memory:").await.unwrap();
        db::save_cursor(&pool, 812, Some("page-2")).await.unwrap();
        sqlx::query("DROP TABLE indexer_cursor")
            .execute(&pool)
            .await
            .unwrap();

        assert_eq!(resume_point(&pool, 500).await, (500, None));
    }
}
