//! Circle read model and the storage port the projector writes through.
//!
//! A [`Circle`] is a derived convenience view; the per-event
//! [`AuditRecord`]s are the source of truth. Both are written only by the
//! projector, through whatever [`CircleStore`] it was handed.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize, Serializer};

use crate::errors::Result;
use crate::events::{ChainEvent, CircleCreated, EventMeta};

/// Lifecycle stage of a circle.
///
/// ```text
/// Active ──► Killed
///    └─────► Redeemed
/// ```
///
/// Both targets are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircleState {
    Active,
    Killed,
    Redeemed,
}

impl CircleState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Killed => "killed",
            Self::Redeemed => "redeemed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "killed" => Some(Self::Killed),
            "redeemed" => Some(Self::Redeemed),
            _ => None,
        }
    }
}

impl fmt::Display for CircleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where and when a terminal transition happened. Written once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalProvenance {
    pub block_number: i64,
    pub timestamp: i64,
    pub tx_hash: String,
    /// Raised amount (V1 kills) or redeemed amount, when the log carries one.
    pub amount: Option<String>,
}

/// Aggregate root: one per circle identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Circle {
    pub circle_id: String,
    pub creator: String,
    pub is_stablecoin_denominated: bool,
    pub goal_value_to_raise: String,
    pub lead_duration: u64,
    pub due_duration: u64,
    pub originator_score_at_creation: String,
    /// One entry per contribution, duplicates allowed. Index-aligned with
    /// `contribution_amounts`.
    pub contributors: Vec<String>,
    pub contribution_amounts: Vec<String>,
    pub state: CircleState,
    pub block_number: i64,
    pub block_timestamp: i64,
    pub tx_hash: String,
    pub last_log_index: i64,
    pub killed: Option<TerminalProvenance>,
    pub redeemed: Option<TerminalProvenance>,
}

impl Circle {
    /// A fresh `Active` circle with empty contribution sequences.
    pub fn open(created: &CircleCreated, meta: &EventMeta) -> Self {
        Circle {
            circle_id: created.circle_id.clone(),
            creator: created.creator.clone(),
            is_stablecoin_denominated: created.is_stablecoin_denominated,
            goal_value_to_raise: created.goal_value_to_raise.clone(),
            lead_duration: created.lead_duration,
            due_duration: created.due_duration,
            originator_score_at_creation: created.originator_score_at_creation.clone(),
            contributors: Vec::new(),
            contribution_amounts: Vec::new(),
            state: CircleState::Active,
            block_number: meta.block_number,
            block_timestamp: meta.block_timestamp,
            tx_hash: meta.tx_hash.clone(),
            last_log_index: meta.log_index,
            killed: None,
            redeemed: None,
        }
    }

    /// Whether the log at `meta` is at or before the last log folded into
    /// this record. Such a log is a replay and must not mutate it again.
    pub fn has_applied(&self, meta: &EventMeta) -> bool {
        meta.position() <= (self.block_number, self.last_log_index)
    }

    fn touch(&mut self, meta: &EventMeta) {
        self.block_number = meta.block_number;
        self.block_timestamp = meta.block_timestamp;
        self.tx_hash = meta.tx_hash.clone();
        self.last_log_index = meta.log_index;
    }

    pub fn record_contribution(&mut self, contributor: &str, amount: &str, meta: &EventMeta) {
        self.contributors.push(contributor.to_string());
        self.contribution_amounts.push(amount.to_string());
        self.touch(meta);
    }

    /// `Active → Killed`. Returns the current state if already terminal.
    pub fn kill(
        &mut self,
        meta: &EventMeta,
        killed_at: i64,
        raised_amount: Option<String>,
    ) -> std::result::Result<(), CircleState> {
        if self.state.is_terminal() {
            return Err(self.state);
        }
        self.state = CircleState::Killed;
        self.killed = Some(TerminalProvenance {
            block_number: meta.block_number,
            timestamp: killed_at,
            tx_hash: meta.tx_hash.clone(),
            amount: raised_amount,
        });
        self.touch(meta);
        Ok(())
    }

    /// `Active → Redeemed`. Returns the current state if already terminal.
    pub fn redeem(
        &mut self,
        meta: &EventMeta,
        amount: Option<String>,
    ) -> std::result::Result<(), CircleState> {
        if self.state.is_terminal() {
            return Err(self.state);
        }
        self.state = CircleState::Redeemed;
        self.redeemed = Some(TerminalProvenance {
            block_number: meta.block_number,
            timestamp: meta.block_timestamp,
            tx_hash: meta.tx_hash.clone(),
            amount,
        });
        self.touch(meta);
        Ok(())
    }
}

/// Immutable per-event log entry, keyed by `(tx_hash, log_index)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct AuditRecord {
    pub tx_hash: String,
    pub log_index: i64,
    pub event_type: String,
    pub circle_id: Option<String>,
    pub schema_version: i64,
    pub block_number: i64,
    pub block_timestamp: i64,
    /// Typed payload as JSON text.
    #[serde(serialize_with = "as_json_value")]
    pub payload: String,
}

impl AuditRecord {
    pub fn from_event(event: &ChainEvent) -> Result<Self> {
        Ok(AuditRecord {
            tx_hash: event.meta.tx_hash.clone(),
            log_index: event.meta.log_index,
            event_type: event.kind().as_str().to_string(),
            circle_id: event.payload.circle_id().map(String::from),
            schema_version: event.version.as_i64(),
            block_number: event.meta.block_number,
            block_timestamp: event.meta.block_timestamp,
            payload: serde_json::to_string(&event.payload)?,
        })
    }
}

fn as_json_value<S: Serializer>(text: &str, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    match serde_json::from_str::<serde_json::Value>(text) {
        Ok(v) => v.serialize(serializer),
        Err(_) => serializer.serialize_str(text),
    }
}

/// Persistence port used by the projector.
///
/// Implementations must give read-after-write consistency: a `save`
/// followed by a `load` of the same id observes the saved record.
#[async_trait]
pub trait CircleStore: Send + Sync {
    /// Fetch a circle. A missing id is `Ok(None)`, never an error.
    async fn load(&self, circle_id: &str) -> Result<Option<Circle>>;

    /// Upsert a circle. Saving the same state twice is a no-op.
    async fn save(&self, circle: &Circle) -> Result<()>;

    /// Insert an audit record. Returns `false` when a record with the same
    /// key already exists; the existing record is left untouched.
    async fn insert_audit(&self, record: &AuditRecord) -> Result<bool>;
}

#[cfg(test)]
pub use memory::MemoryStore;

#[cfg(test)]
mod memory {
    use std::collections::BTreeMap;

    use tokio::sync::Mutex;

    use super::*;

    /// In-memory [`CircleStore`] used as a test double.
    #[derive(Default)]
    pub struct MemoryStore {
        circles: Mutex<BTreeMap<String, Circle>>,
        audit: Mutex<BTreeMap<(String, i64), AuditRecord>>,
    }

    impl MemoryStore {
        pub async fn audit_records(&self) -> Vec<AuditRecord> {
            self.audit.lock().await.values().cloned().collect()
        }

        pub async fn audit_count(&self, event_type: &str) -> usize {
            self.audit
                .lock()
                .await
                .values()
                .filter(|r| r.event_type == event_type)
                .count()
        }
    }

    #[async_trait]
    impl CircleStore for MemoryStore {
        async fn load(&self, circle_id: &str) -> Result<Option<Circle>> {
            Ok(self.circles.lock().await.get(circle_id).cloned())
        }

        /// Mirrors the SQLite upsert: creation fields and terminal provenance
        /// are written once, everything else is replaced.
        async fn save(&self, circle: &Circle) -> Result<()> {
            let mut circles = self.circles.lock().await;
            let stored = match circles.get(&circle.circle_id) {
                None => circle.clone(),
                Some(existing) => Circle {
                    contributors: circle.contributors.clone(),
                    contribution_amounts: circle.contribution_amounts.clone(),
                    state: circle.state,
                    block_number: circle.block_number,
                    block_timestamp: circle.block_timestamp,
                    tx_hash: circle.tx_hash.clone(),
                    last_log_index: circle.last_log_index,
                    killed: keep_first(existing.killed.as_ref(), circle.killed.as_ref()),
                    redeemed: keep_first(existing.redeemed.as_ref(), circle.redeemed.as_ref()),
                    ..existing.clone()
                },
            };
            circles.insert(circle.circle_id.clone(), stored);
            Ok(())
        }

        async fn insert_audit(&self, record: &AuditRecord) -> Result<bool> {
            let mut audit = self.audit.lock().await;
            let key = (record.tx_hash.clone(), record.log_index);
            if audit.contains_key(&key) {
                return Ok(false);
            }
            audit.insert(key, record.clone());
            Ok(true)
        }
    }

    /// Column-wise `COALESCE(existing, incoming)`.
    fn keep_first(
        existing: Option<&TerminalProvenance>,
        incoming: Option<&TerminalProvenance>,
    ) -> Option<TerminalProvenance> {
        match (existing, incoming) {
            (Some(e), Some(i)) => Some(TerminalProvenance {
                amount: e.amount.clone().or_else(|| i.amount.clone()),
                ..e.clone()
            }),
            (e, i) => e.or(i).cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(block: i64, log: i64) -> EventMeta {
        EventMeta {
            block_number: block,
            block_timestamp: 1_700_000_000 + block,
            tx_hash: format!("0x{block:02x}{log:02x}"),
            log_index: log,
        }
    }

    fn created() -> CircleCreated {
        CircleCreated {
            circle_id: "0x01".into(),
            creator: "0xC0".into(),
            is_stablecoin_denominated: true,
            goal_value_to_raise: "1000".into(),
            lead_duration: 604_800,
            due_duration: 2_592_000,
            originator_score_at_creation: "42".into(),
        }
    }

    #[test]
    fn open_circle_is_active_and_empty() {
        let c = Circle::open(&created(), &meta(1, 0));
        assert_eq!(c.state, CircleState::Active);
        assert!(c.contributors.is_empty());
        assert!(c.contribution_amounts.is_empty());
        assert!(c.killed.is_none() && c.redeemed.is_none());
    }

    #[test]
    fn contributions_stay_index_aligned() {
        let mut c = Circle::open(&created(), &meta(1, 0));
        c.record_contribution("0xA", "250", &meta(2, 0));
        c.record_contribution("0xA", "100", &meta(2, 1));
        assert_eq!(c.contributors, vec!["0xA", "0xA"]);
        assert_eq!(c.contribution_amounts, vec!["250", "100"]);
        assert_eq!(c.last_log_index, 1);
    }

    #[test]
    fn terminal_states_reject_further_transitions() {
        let mut c = Circle::open(&created(), &meta(1, 0));
        c.kill(&meta(3, 0), 1_700_000_003, None).unwrap();
        assert_eq!(c.redeem(&meta(4, 0), None), Err(CircleState::Killed));
        assert_eq!(
            c.kill(&meta(5, 0), 1_700_000_005, None),
            Err(CircleState::Killed)
        );
        assert_eq!(c.killed.as_ref().unwrap().block_number, 3);
        assert!(c.redeemed.is_none());
    }

    #[test]
    fn has_applied_compares_chain_position() {
        let mut c = Circle::open(&created(), &meta(5, 3));
        assert!(c.has_applied(&meta(5, 3)));
        assert!(c.has_applied(&meta(4, 9)));
        assert!(!c.has_applied(&meta(5, 4)));
        c.record_contribution("0xA", "1", &meta(6, 0));
        assert!(c.has_applied(&meta(5, 4)));
    }

    #[tokio::test]
    async fn memory_store_keeps_first_terminal_provenance() {
        let store = MemoryStore::default();
        let mut circle = Circle::open(&created(), &meta(1, 0));
        circle.kill(&meta(3, 0), 1_700_000_100, None).unwrap();
        store.save(&circle).await.unwrap();

        let mut rewritten = circle.clone();
        rewritten.goal_value_to_raise = "1".into();
        rewritten.killed = Some(TerminalProvenance {
            block_number: 99,
            timestamp: 0,
            tx_hash: "0xdead".into(),
            amount: Some("5".into()),
        });
        rewritten.redeemed = Some(TerminalProvenance {
            block_number: 100,
            timestamp: 0,
            tx_hash: "0xbeef".into(),
            amount: None,
        });
        rewritten.record_contribution("0xA", "10", &meta(4, 0));
        store.save(&rewritten).await.unwrap();

        let loaded = store.load("0x01").await.unwrap().unwrap();
        let killed = loaded.killed.unwrap();
        assert_eq!(killed.block_number, 3);
        assert_eq!(killed.tx_hash, meta(3, 0).tx_hash);
        // An empty column is still filled in, as with COALESCE.
        assert_eq!(killed.amount.as_deref(), Some("5"));
        assert_eq!(loaded.redeemed.unwrap().tx_hash, "0xbeef");
        assert_eq!(loaded.goal_value_to_raise, "1000");
        assert_eq!(loaded.contributors, vec!["0xA"]);
        assert_eq!(loaded.block_number, 4);
    }

    #[test]
    fn state_string_round_trip() {
        for s in [CircleState::Active, CircleState::Killed, CircleState::Redeemed] {
            assert_eq!(CircleState::parse(s.as_str()), Some(s));
        }
        assert_eq!(CircleState::parse("paused"), None);
    }
}
