//! Upstream log feed client — polls `circles_getLogs` and decodes circle
//! events.
//!
//! The feed node has already ABI-decoded each log into an event name plus
//! named `args`; this module turns those loosely typed JSON objects into
//! [`ChainEvent`]s and rejects anything that doesn't fit the schema.
//!
//! ## Resilience
//!
//! * Exponential back-off is applied when the RPC returns an error or rate-limit
//!   response, up to [`MAX_BACKOFF_SECS`] seconds.
//! * Transient network errors (connection reset, timeout) are retried silently.

use std::time::Duration;

use primitive_types::U256;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::errors::{IndexerError, Result};
use crate::events::{
    ChainEvent, CircleContribution, CircleCreated, CircleEvent, CircleKilled, CircleRedeemed,
    EventKind, EventMeta, RepaymentFailed, RepaymentSuccessful, RoleAdminChanged,
    RoleMembership, SchemaVersion,
};

const MAX_BACKOFF_SECS: u64 = 60;
const INITIAL_BACKOFF_SECS: u64 = 2;

// ─────────────────────────────────────────────────────────
// JSON-RPC response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RpcResponse {
    pub result: Option<LogsResult>,
    pub error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct LogsResult {
    pub logs: Vec<RawLog>,
    pub cursor: Option<String>,
    #[serde(rename = "latestBlock")]
    pub latest_block: Option<u64>,
}

/// One ABI-decoded log as the feed returns it. Numeric fields may arrive as
/// JSON numbers, decimal strings, or `0x` hex strings.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct RawLog {
    pub event: Option<String>,
    #[serde(default)]
    pub args: Value,
    pub address: Option<String>,
    pub transaction_hash: Option<String>,
    pub block_number: Option<Value>,
    pub block_timestamp: Option<Value>,
    pub log_index: Option<Value>,
    /// Set by the node when the log was dropped by a reorg.
    pub removed: Option<bool>,
    /// Explicit ABI generation, when the feed knows it.
    pub abi_version: Option<u8>,
}

// ─────────────────────────────────────────────────────────
// Public API
// ─────────────────────────────────────────────────────────

/// Fetch a page of logs from the feed.
///
/// * `from_block` — the block to scan from (inclusive).
/// * `cursor`     — optional opaque pagination cursor from a previous response.
/// * `limit`      — maximum number of logs to return.
///
/// Returns `(logs, next_cursor, latest_block)`.
pub async fn fetch_logs(
    client: &Client,
    rpc_url: &str,
    contract_address: &str,
    from_block: u64,
    cursor: Option<&str>,
    limit: u32,
) -> Result<(Vec<RawLog>, Option<String>, Option<u64>)> {
    let mut backoff = INITIAL_BACKOFF_SECS;

    loop {
        let params = build_params(contract_address, from_block, cursor, limit);

        let response = client
            .post(rpc_url)
            .json(&json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "circles_getLogs",
                "params": params,
            }))
            .send()
            .await;

        match response {
            Err(e) => {
                warn!("RPC request failed (will retry in {backoff}s): {e}");
                tokio::time::sleep(Duration::from_secs(backoff)).await;
                backoff = (backoff * 2).min(MAX_BACKOFF_SECS);
                continue;
            }
            Ok(resp) => {
                let status = resp.status();
                if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                    warn!("Rate-limited by RPC (will retry in {backoff}s)");
                    tokio::time::sleep(Duration::from_secs(backoff)).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF_SECS);
                    continue;
                }

                let body: RpcResponse = resp.json().await?;

                if let Some(err) = body.error {
                    // Code -32600 / -32601 are hard failures; everything else we retry
                    if err.code == -32600 || err.code == -32601 {
                        return Err(IndexerError::EventParse(format!(
                            "RPC hard error {}: {}",
                            err.code, err.message
                        )));
                    }
                    warn!(
                        "RPC soft error (will retry in {backoff}s): {} {}",
                        err.code, err.message
                    );
                    tokio::time::sleep(Duration::from_secs(backoff)).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF_SECS);
                    continue;
                }

                let result = body.result.ok_or_else(|| {
                    IndexerError::EventParse("Empty result from circles_getLogs".to_string())
                })?;

                debug!(
                    "Fetched {} logs (latest_block={:?})",
                    result.logs.len(),
                    result.latest_block
                );

                return Ok((result.logs, result.cursor, result.latest_block));
            }
        }
    }
}

fn build_params(contract_address: &str, from_block: u64, cursor: Option<&str>, limit: u32) -> Value {
    let mut params = json!({
        "address": contract_address,
        "pagination": {
            "limit": limit
        }
    });

    if let Some(cur) = cursor {
        params["pagination"]["cursor"] = json!(cur);
    } else {
        params["fromBlock"] = json!(from_block);
    }

    params
}

// ─────────────────────────────────────────────────────────
// Log decoding
// ─────────────────────────────────────────────────────────

/// Decode one raw log.
///
/// * `Ok(None)` — not ours to project: unknown event name, a log removed by a
///   reorg, or a log from another contract.
/// * `Err(MalformedEvent)` — a recognised event missing a required field or
///   carrying one of the wrong shape.
pub fn decode_log(raw: &RawLog, contract_address: &str) -> Result<Option<ChainEvent>> {
    let name = raw
        .event
        .as_deref()
        .ok_or_else(|| IndexerError::malformed("unknown", "missing event name"))?;
    let kind = EventKind::from_name(name);
    if kind == EventKind::Unknown {
        debug!(event = name, "skipping unrecognised event");
        return Ok(None);
    }
    if raw.removed == Some(true) {
        debug!(event = name, "skipping log removed by reorg");
        return Ok(None);
    }
    if let Some(addr) = raw.address.as_deref() {
        if !addr.eq_ignore_ascii_case(contract_address) {
            debug!(event = name, address = addr, "skipping log from another contract");
            return Ok(None);
        }
    }

    let d = Decoder {
        kind: kind.as_str(),
        args: &raw.args,
    };
    let meta = decode_meta(raw, &d)?;
    let (payload, shape_version) = decode_payload(name, kind, &d)?;

    let version = match (shape_version, raw.abi_version) {
        (Some(v), _) => v,
        (None, Some(1)) => SchemaVersion::V1,
        (None, Some(2)) | (None, None) => SchemaVersion::V2,
        (None, Some(other)) => {
            return Err(d.fail(format!("unsupported abi version {other}")));
        }
    };

    let event = ChainEvent {
        meta,
        version,
        payload,
    };
    event.validate()?;
    Ok(Some(event))
}

fn decode_meta(raw: &RawLog, d: &Decoder<'_>) -> Result<EventMeta> {
    let tx_hash = raw
        .transaction_hash
        .clone()
        .ok_or_else(|| d.fail("missing transactionHash"))?;
    let digits = tx_hash.strip_prefix("0x").unwrap_or(&tx_hash);
    if digits.is_empty() || hex::decode(digits).is_err() {
        return Err(d.fail(format!("transactionHash {tx_hash} is not hex")));
    }

    let block_number = raw
        .block_number
        .as_ref()
        .and_then(parse_int)
        .ok_or_else(|| d.fail("missing or invalid blockNumber"))?;
    let log_index = raw
        .log_index
        .as_ref()
        .and_then(parse_int)
        .ok_or_else(|| d.fail("missing or invalid logIndex"))?;
    let block_timestamp = raw
        .block_timestamp
        .as_ref()
        .and_then(|v| parse_int(v).or_else(|| v.as_str().and_then(parse_iso_to_unix)))
        .ok_or_else(|| d.fail("missing or invalid blockTimestamp"))?;

    Ok(EventMeta {
        block_number,
        block_timestamp,
        tx_hash,
        log_index,
    })
}

/// Returns the payload plus the schema version its shape implies, if any.
fn decode_payload(
    name: &str,
    kind: EventKind,
    d: &Decoder<'_>,
) -> Result<(CircleEvent, Option<SchemaVersion>)> {
    let decoded = match kind {
        EventKind::CircleCreated => (
            CircleEvent::CircleCreated(CircleCreated {
                circle_id: d.text(&["circleId", "id"])?,
                creator: d.text(&["creator", "originator"])?,
                is_stablecoin_denominated: d.flag(&["isStablecoin", "isStablecoinDenominated"])?,
                goal_value_to_raise: d.amount(&["goalValueToRaise", "goal"])?,
                lead_duration: d.duration(&["leadDuration"])?,
                due_duration: d.duration(&["dueDuration"])?,
                originator_score_at_creation: d.amount(&["originatorScore", "score"])?,
            }),
            None,
        ),
        EventKind::CircleContribution => (
            CircleEvent::CircleContribution(CircleContribution {
                circle_id: d.text(&["circleId", "id"])?,
                contributor: d.text(&["contributor", "from"])?,
                amount: d.amount(&["amount", "value"])?,
            }),
            None,
        ),
        EventKind::CircleKilled => {
            let circle_id = d.text(&["circleId", "id"])?;
            let raised_amount = d.opt_amount(&["raisedAmount", "amountRaised"])?;
            let killed_at = d.opt_int(&["killedAt", "timestamp"])?;
            let version = match (name, &raised_amount, killed_at) {
                ("CircleKilled1", _, _) | (_, None, Some(_)) => SchemaVersion::V2,
                (_, Some(_), None) => SchemaVersion::V1,
                (_, Some(_), Some(_)) => {
                    return Err(d.fail("carries both raisedAmount and a kill timestamp"));
                }
                (_, None, None) => {
                    return Err(d.fail("carries neither raisedAmount nor a kill timestamp"));
                }
            };
            (
                CircleEvent::CircleKilled(CircleKilled {
                    circle_id,
                    raised_amount,
                    killed_at,
                }),
                Some(version),
            )
        }
        EventKind::CircleRedeemed => (
            CircleEvent::CircleRedeemed(CircleRedeemed {
                circle_id: d.text(&["circleId", "id"])?,
                redeemer: d.opt_text(&["redeemer", "creator"]),
                amount: d.opt_amount(&["amount"])?,
            }),
            Some(SchemaVersion::V2),
        ),
        EventKind::RepaymentFailed => (
            CircleEvent::RepaymentFailed(RepaymentFailed {
                circle_id: d.text(&["circleId", "id"])?,
                creator: d.opt_text(&["creator", "borrower"]),
            }),
            None,
        ),
        EventKind::RepaymentSuccessful => (
            CircleEvent::RepaymentSuccessful(RepaymentSuccessful {
                circle_id: d.text(&["circleId", "id"])?,
                creator: d.opt_text(&["creator", "borrower"]),
                amount: d.opt_amount(&["amount"])?,
            }),
            None,
        ),
        EventKind::RoleAdminChanged => (
            CircleEvent::RoleAdminChanged(RoleAdminChanged {
                role: d.text(&["role"])?,
                previous_admin_role: d.text(&["previousAdminRole"])?,
                new_admin_role: d.text(&["newAdminRole"])?,
            }),
            None,
        ),
        EventKind::RoleGranted | EventKind::RoleRevoked => {
            let membership = RoleMembership {
                role: d.text(&["role"])?,
                account: d.text(&["account"])?,
                sender: d.text(&["sender"])?,
            };
            let payload = if kind == EventKind::RoleGranted {
                CircleEvent::RoleGranted(membership)
            } else {
                CircleEvent::RoleRevoked(membership)
            };
            (payload, None)
        }
        EventKind::Unknown => return Err(d.fail("unrecognised event")),
    };
    Ok(decoded)
}

/// Field accessors over one log's `args`, reporting failures against the
/// event kind.
struct Decoder<'a> {
    kind: &'static str,
    args: &'a Value,
}

impl Decoder<'_> {
    fn fail(&self, reason: impl Into<String>) -> IndexerError {
        IndexerError::malformed(self.kind, reason)
    }

    fn lookup(&self, keys: &[&str]) -> Option<&Value> {
        keys.iter()
            .find_map(|k| self.args.get(*k))
            .filter(|v| !v.is_null())
    }

    fn opt_text(&self, keys: &[&str]) -> Option<String> {
        self.lookup(keys).and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    }

    fn text(&self, keys: &[&str]) -> Result<String> {
        self.opt_text(keys)
            .ok_or_else(|| self.fail(format!("missing {}", keys[0])))
    }

    fn flag(&self, keys: &[&str]) -> Result<bool> {
        match self.lookup(keys) {
            Some(Value::Bool(b)) => Ok(*b),
            Some(Value::String(s)) if s == "true" => Ok(true),
            Some(Value::String(s)) if s == "false" => Ok(false),
            Some(other) => Err(self.fail(format!("{} is not a boolean: {other}", keys[0]))),
            None => Err(self.fail(format!("missing {}", keys[0]))),
        }
    }

    fn opt_amount(&self, keys: &[&str]) -> Result<Option<String>> {
        match self.lookup(keys) {
            None => Ok(None),
            Some(v) => parse_amount(v)
                .map(Some)
                .ok_or_else(|| self.fail(format!("{} is not an unsigned integer: {v}", keys[0]))),
        }
    }

    fn amount(&self, keys: &[&str]) -> Result<String> {
        self.opt_amount(keys)?
            .ok_or_else(|| self.fail(format!("missing {}", keys[0])))
    }

    fn opt_int(&self, keys: &[&str]) -> Result<Option<i64>> {
        match self.lookup(keys) {
            None => Ok(None),
            Some(v) => parse_int(v)
                .map(Some)
                .ok_or_else(|| self.fail(format!("{} is not an integer: {v}", keys[0]))),
        }
    }

    fn duration(&self, keys: &[&str]) -> Result<u64> {
        let v = self
            .opt_int(keys)?
            .ok_or_else(|| self.fail(format!("missing {}", keys[0])))?;
        u64::try_from(v).map_err(|_| self.fail(format!("{} is negative", keys[0])))
    }
}

/// Unsigned 256-bit integer, normalised to a decimal string.
///
/// JSON numbers beyond `u64` are rejected: serde_json has already rounded
/// them through `f64`, so the exact value is gone.
fn parse_amount(v: &Value) -> Option<String> {
    let n = match v {
        Value::Number(n) => U256::from(n.as_u64()?),
        Value::String(s) => match strip_hex_prefix(s) {
            Some(digits) => fold_digits(digits, 16)?,
            None if !s.is_empty() => fold_digits(s, 10)?,
            None => return None,
        },
        _ => return None,
    };
    Some(n.to_string())
}

/// Overflow past 2^256-1 yields `None`.
fn fold_digits(digits: &str, radix: u32) -> Option<U256> {
    digits.chars().try_fold(U256::zero(), |acc, c| {
        acc.checked_mul(U256::from(radix))?
            .checked_add(U256::from(c.to_digit(radix)?))
    })
}

/// Non-negative integer that fits an `i64`, from a number, decimal string,
/// or `0x` hex string.
fn parse_int(v: &Value) -> Option<i64> {
    let n = match v {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => match strip_hex_prefix(s) {
            Some(hex_digits) => i64::from_str_radix(hex_digits, 16).ok()?,
            None => s.parse::<i64>().ok()?,
        },
        _ => return None,
    };
    (n >= 0).then_some(n)
}

fn strip_hex_prefix(s: &str) -> Option<&str> {
    s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))
}

/// Parse an ISO-8601 timestamp string into a Unix epoch (seconds).
fn parse_iso_to_unix(s: &str) -> Option<i64> {
    use chrono::DateTime;
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.timestamp())
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────
