//! Canonical event types emitted by the funding circles contract.
//!
//! Two ABI generations exist on chain. [`SchemaVersion::V1`] is the legacy
//! contract: it has no redemption event and its kill event carries the amount
//! raised so far. [`SchemaVersion::V2`] adds `CircleFundRedeemed` and reshapes
//! the kill event (published in the ABI as `CircleKilled1`) to carry the kill
//! timestamp instead. Both kill shapes decode into the single
//! [`CircleKilled`] payload with optional fields.

use serde::{Deserialize, Serialize};

use crate::errors::{IndexerError, Result};

/// ABI generation a log was decoded against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaVersion {
    V1,
    V2,
}

impl SchemaVersion {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::V1 => 1,
            Self::V2 => 2,
        }
    }
}

/// All recognised event kinds from the circles contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A new circle was opened (`CircleCreated`).
    CircleCreated,
    /// Someone contributed to a circle (`CircleContribution`).
    CircleContribution,
    /// The circle was cancelled (`CircleKilled` / `CircleKilled1`).
    CircleKilled,
    /// The creator redeemed the raised funds (`CircleFundRedeemed`).
    CircleRedeemed,
    /// Repayment window closed without full repayment.
    RepaymentFailed,
    /// Repayment completed.
    RepaymentSuccessful,
    /// Access-control admin role changed.
    RoleAdminChanged,
    /// Access-control role granted.
    RoleGranted,
    /// Access-control role revoked.
    RoleRevoked,
    /// An event from this contract that we don't recognise yet.
    Unknown,
}

impl EventKind {
    /// Parse the ABI event name into an [`EventKind`].
    pub fn from_name(name: &str) -> Self {
        match name {
            "CircleCreated" => Self::CircleCreated,
            "CircleContribution" => Self::CircleContribution,
            "CircleKilled" | "CircleKilled1" => Self::CircleKilled,
            "CircleFundRedeemed" | "CircleRedeemed" => Self::CircleRedeemed,
            "RepaymentFailed" => Self::RepaymentFailed,
            "RepaymentSuccessful" => Self::RepaymentSuccessful,
            "RoleAdminChanged" => Self::RoleAdminChanged,
            "RoleGranted" => Self::RoleGranted,
            "RoleRevoked" => Self::RoleRevoked,
            _ => Self::Unknown,
        }
    }

    /// Return a short identifier string suitable for storage in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CircleCreated => "circle_created",
            Self::CircleContribution => "circle_contribution",
            Self::CircleKilled => "circle_killed",
            Self::CircleRedeemed => "circle_redeemed",
            Self::RepaymentFailed => "repayment_failed",
            Self::RepaymentSuccessful => "repayment_successful",
            Self::RoleAdminChanged => "role_admin_changed",
            Self::RoleGranted => "role_granted",
            Self::RoleRevoked => "role_revoked",
            Self::Unknown => "unknown",
        }
    }
}

/// Chain-supplied provenance carried by every log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMeta {
    pub block_number: i64,
    pub block_timestamp: i64,
    pub tx_hash: String,
    pub log_index: i64,
}

impl EventMeta {
    /// Audit identity; unique even for several logs in one transaction.
    pub fn key(&self) -> (&str, i64) {
        (&self.tx_hash, self.log_index)
    }

    /// Position in the chain's total order. Log indices are block-wide, so
    /// `(block, log)` already orders logs across transactions.
    pub fn position(&self) -> (i64, i64) {
        (self.block_number, self.log_index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircleCreated {
    pub circle_id: String,
    pub creator: String,
    pub is_stablecoin_denominated: bool,
    pub goal_value_to_raise: String,
    pub lead_duration: u64,
    pub due_duration: u64,
    pub originator_score_at_creation: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircleContribution {
    pub circle_id: String,
    pub contributor: String,
    pub amount: String,
}

/// Kill event of either ABI generation.
///
/// V1 logs fill `raised_amount`; V2 logs fill `killed_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircleKilled {
    pub circle_id: String,
    pub raised_amount: Option<String>,
    pub killed_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircleRedeemed {
    pub circle_id: String,
    pub redeemer: Option<String>,
    pub amount: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepaymentFailed {
    pub circle_id: String,
    pub creator: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepaymentSuccessful {
    pub circle_id: String,
    pub creator: Option<String>,
    pub amount: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAdminChanged {
    pub role: String,
    pub previous_admin_role: String,
    pub new_admin_role: String,
}

/// Payload shared by `RoleGranted` and `RoleRevoked`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleMembership {
    pub role: String,
    pub account: String,
    pub sender: String,
}

/// Typed payload of a decoded log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "args", rename_all = "snake_case")]
pub enum CircleEvent {
    CircleCreated(CircleCreated),
    CircleContribution(CircleContribution),
    CircleKilled(CircleKilled),
    CircleRedeemed(CircleRedeemed),
    RepaymentFailed(RepaymentFailed),
    RepaymentSuccessful(RepaymentSuccessful),
    RoleAdminChanged(RoleAdminChanged),
    RoleGranted(RoleMembership),
    RoleRevoked(RoleMembership),
}

impl CircleEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::CircleCreated(_) => EventKind::CircleCreated,
            Self::CircleContribution(_) => EventKind::CircleContribution,
            Self::CircleKilled(_) => EventKind::CircleKilled,
            Self::CircleRedeemed(_) => EventKind::CircleRedeemed,
            Self::RepaymentFailed(_) => EventKind::RepaymentFailed,
            Self::RepaymentSuccessful(_) => EventKind::RepaymentSuccessful,
            Self::RoleAdminChanged(_) => EventKind::RoleAdminChanged,
            Self::RoleGranted(_) => EventKind::RoleGranted,
            Self::RoleRevoked(_) => EventKind::RoleRevoked,
        }
    }

    /// The circle this event concerns; `None` for access-control events.
    pub fn circle_id(&self) -> Option<&str> {
        match self {
            Self::CircleCreated(e) => Some(&e.circle_id),
            Self::CircleContribution(e) => Some(&e.circle_id),
            Self::CircleKilled(e) => Some(&e.circle_id),
            Self::CircleRedeemed(e) => Some(&e.circle_id),
            Self::RepaymentFailed(e) => Some(&e.circle_id),
            Self::RepaymentSuccessful(e) => Some(&e.circle_id),
            Self::RoleAdminChanged(_) | Self::RoleGranted(_) | Self::RoleRevoked(_) => None,
        }
    }
}

/// A fully decoded log, ready to be projected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEvent {
    pub meta: EventMeta,
    pub version: SchemaVersion,
    pub payload: CircleEvent,
}

impl ChainEvent {
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// Reject events that could not have come from the chain: empty
    /// identifiers, negative positions, or a payload shape the declared
    /// [`SchemaVersion`] never emits.
    pub fn validate(&self) -> Result<()> {
        let kind = self.kind().as_str();
        let fail = |reason: &str| Err(IndexerError::malformed(kind, reason));

        if self.meta.tx_hash.is_empty() {
            return fail("empty transaction hash");
        }
        if self.meta.block_number < 0 || self.meta.log_index < 0 {
            return fail("negative block number or log index");
        }
        if matches!(self.payload.circle_id(), Some("")) {
            return fail("empty circle id");
        }

        match (&self.payload, self.version) {
            (CircleEvent::CircleRedeemed(_), SchemaVersion::V1) => {
                fail("redemption events do not exist in schema v1")
            }
            (CircleEvent::CircleKilled(k), SchemaVersion::V1) if k.killed_at.is_some() => {
                fail("schema v1 kill events carry no timestamp")
            }
            (CircleEvent::CircleKilled(k), SchemaVersion::V2) if k.raised_amount.is_some() => {
                fail("schema v2 kill events carry no raised amount")
            }
            (CircleEvent::CircleContribution(c), _) if c.contributor.is_empty() => {
                fail("empty contributor")
            }
            (CircleEvent::CircleCreated(c), _) if c.creator.is_empty() => fail("empty creator"),
            _ => Ok(()),
        }
    }
}
