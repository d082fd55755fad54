//! Event projector — folds decoded circle events into the audit log and the
//! [`Circle`] read model.
//!
//! ## Contract
//!
//! * The host calls [`Projector::project`] one event at a time, in chain
//!   order. Nothing here locks; the projector is the only writer.
//! * Every handler writes the audit record first, then applies the aggregate
//!   mutation, and has persisted both before it returns.
//! * Replays are harmless. Audit inserts are keyed by `(tx_hash, log_index)`
//!   and an aggregate only absorbs logs positioned after the last one it
//!   recorded, so re-running any range of blocks converges on the same state.
//!
//! | Event | Aggregate |
//! |---|---|
//! | `CircleCreated` | new `Active` circle |
//! | `CircleContribution` | append contributor + amount |
//! | `CircleKilled` | `Active → Killed` |
//! | `CircleRedeemed` | `Active → Redeemed` |
//! | repayment / role events | audit only |

use tracing::{debug, warn};

use crate::errors::{ProjectionWarning, Result};
use crate::events::{
    ChainEvent, CircleContribution, CircleCreated, CircleEvent, CircleKilled, CircleRedeemed,
    EventKind, EventMeta, SchemaVersion,
};
use crate::store::{AuditRecord, Circle, CircleStore};

/// What happened to the aggregate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The circle was created or mutated.
    Applied,
    /// The event has no aggregate effect, or was already folded in.
    AuditOnly,
    /// The aggregate was left untouched because of an anomaly.
    Warned(ProjectionWarning),
}

/// Result of projecting one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projection {
    /// `false` when the audit record already existed (a replay).
    pub recorded: bool,
    pub outcome: Outcome,
}

pub struct Projector<S> {
    store: S,
}

impl<S: CircleStore> Projector<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    #[cfg(test)]
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Project a single event.
    ///
    /// A malformed event is rejected before anything is written. Any other
    /// error is a persistence failure; the event should be replayed once the
    /// host has recovered.
    pub async fn project(&self, event: &ChainEvent) -> Result<Projection> {
        event.validate()?;

        let recorded = self.record(event).await?;
        if !recorded {
            let (tx_hash, log_index) = event.meta.key();
            debug!(tx_hash, log_index, "audit record already present");
        }

        let meta = &event.meta;
        let outcome = match &event.payload {
            CircleEvent::CircleCreated(ev) => self.on_circle_created(meta, ev, recorded).await?,
            CircleEvent::CircleContribution(ev) => self.on_circle_contribution(meta, ev).await?,
            CircleEvent::CircleKilled(ev) => self.on_circle_killed(meta, event.version, ev).await?,
            CircleEvent::CircleRedeemed(ev) => self.on_circle_redeemed(meta, ev).await?,
            CircleEvent::RepaymentFailed(ev) => self.on_repayment(meta, &ev.circle_id, false),
            CircleEvent::RepaymentSuccessful(ev) => self.on_repayment(meta, &ev.circle_id, true),
            CircleEvent::RoleAdminChanged(ev) => self.on_role_change(meta, event.kind(), &ev.role),
            CircleEvent::RoleGranted(ev) | CircleEvent::RoleRevoked(ev) => {
                self.on_role_change(meta, event.kind(), &ev.role)
            }
        };

        if let Outcome::Warned(w) = &outcome {
            warn!(
                tx_hash = %meta.tx_hash,
                log_index = meta.log_index,
                block = meta.block_number,
                "{w}"
            );
        }

        Ok(Projection { recorded, outcome })
    }

    async fn record(&self, event: &ChainEvent) -> Result<bool> {
        let record = AuditRecord::from_event(event)?;
        self.store.insert_audit(&record).await
    }

    /// `recorded == false` means this exact log was seen before, so an
    /// existing circle is its own earlier projection rather than a clash.
    async fn on_circle_created(
        &self,
        meta: &EventMeta,
        ev: &CircleCreated,
        recorded: bool,
    ) -> Result<Outcome> {
        if self.store.load(&ev.circle_id).await?.is_some() {
            if !recorded {
                return Ok(Outcome::AuditOnly);
            }
            return Ok(Outcome::Warned(ProjectionWarning::DuplicateCreation {
                circle_id: ev.circle_id.clone(),
            }));
        }

        let circle = Circle::open(ev, meta);
        self.store.save(&circle).await?;
        debug!(circle_id = %circle.circle_id, "circle created");
        Ok(Outcome::Applied)
    }

    async fn on_circle_contribution(
        &self,
        meta: &EventMeta,
        ev: &CircleContribution,
    ) -> Result<Outcome> {
        let Some(mut circle) = self.load_for(meta, &ev.circle_id, "CircleContribution").await?
        else {
            return Ok(dangling(&ev.circle_id, "CircleContribution"));
        };
        if circle.has_applied(meta) {
            return Ok(Outcome::AuditOnly);
        }

        circle.record_contribution(&ev.contributor, &ev.amount, meta);
        self.store.save(&circle).await?;
        debug!(
            circle_id = %circle.circle_id,
            contributions = circle.contributors.len(),
            "contribution recorded"
        );
        Ok(Outcome::Applied)
    }

    async fn on_circle_killed(
        &self,
        meta: &EventMeta,
        version: SchemaVersion,
        ev: &CircleKilled,
    ) -> Result<Outcome> {
        let Some(mut circle) = self.load_for(meta, &ev.circle_id, "CircleKilled").await? else {
            return Ok(dangling(&ev.circle_id, "CircleKilled"));
        };
        if circle.has_applied(meta) {
            return Ok(Outcome::AuditOnly);
        }

        // V2 kills carry their own timestamp; V1 kills only have the block's.
        let killed_at = match version {
            SchemaVersion::V2 => ev.killed_at.unwrap_or(meta.block_timestamp),
            SchemaVersion::V1 => meta.block_timestamp,
        };

        match circle.kill(meta, killed_at, ev.raised_amount.clone()) {
            Ok(()) => {
                self.store.save(&circle).await?;
                Ok(Outcome::Applied)
            }
            Err(state) => Ok(Outcome::Warned(
                ProjectionWarning::RedundantTerminalTransition {
                    circle_id: ev.circle_id.clone(),
                    event: "CircleKilled",
                    state,
                },
            )),
        }
    }

    async fn on_circle_redeemed(&self, meta: &EventMeta, ev: &CircleRedeemed) -> Result<Outcome> {
        let Some(mut circle) = self.load_for(meta, &ev.circle_id, "CircleRedeemed").await? else {
            return Ok(dangling(&ev.circle_id, "CircleRedeemed"));
        };
        if circle.has_applied(meta) {
            return Ok(Outcome::AuditOnly);
        }

        match circle.redeem(meta, ev.amount.clone()) {
            Ok(()) => {
                self.store.save(&circle).await?;
                Ok(Outcome::Applied)
            }
            Err(state) => Ok(Outcome::Warned(
                ProjectionWarning::RedundantTerminalTransition {
                    circle_id: ev.circle_id.clone(),
                    event: "CircleRedeemed",
                    state,
                },
            )),
        }
    }

    /// Repayments are not folded into the circle; the audit record is the
    /// only trace.
    fn on_repayment(&self, meta: &EventMeta, circle_id: &str, succeeded: bool) -> Outcome {
        debug!(circle_id, succeeded, block = meta.block_number, "repayment audited");
        Outcome::AuditOnly
    }

    fn on_role_change(&self, meta: &EventMeta, kind: EventKind, role: &str) -> Outcome {
        debug!(event = kind.as_str(), role, block = meta.block_number, "role change audited");
        Outcome::AuditOnly
    }

    async fn load_for(
        &self,
        meta: &EventMeta,
        circle_id: &str,
        event: &'static str,
    ) -> Result<Option<Circle>> {
        let circle = self.store.load(circle_id).await?;
        if circle.is_none() {
            debug!(circle_id, event, block = meta.block_number, "no aggregate for event");
        }
        Ok(circle)
    }
}

fn dangling(circle_id: &str, event: &'static str) -> Outcome {
    Outcome::Warned(ProjectionWarning::DanglingReference {
        circle_id: circle_id.to_string(),
        event,
    })
}
