//! On-the-wire message types.
//!
//! Two surfaces live here:
//!
//! - **Discovery datagrams** — single-packet UTF-8 text: `HELLO <id>` and
//!   `GOSSIP <sender>;<now>[,<id>;<ts>]*`. Parsing is tolerant: a malformed
//!   entry or timestamp is skipped, never fatal.
//! - **RPC envelope** — tagged JSON `Request`/`Response` enums, one frame
//!   per line (see [`crate::codec`]).

use serde::{Deserialize, Serialize};

use crate::board::{Outcome, Symbol};

// ── Discovery datagrams ───────────────────────────────────────────────

/// One `id;timestamp` pair from a GOSSIP digest. Timestamps are
/// milliseconds since the epoch on the sender's clock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GossipEntry {
    pub id: String,
    pub ts: i64,
}

/// A parsed discovery datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Datagram {
    /// Periodic multicast presence announcement.
    Hello { id: String },
    /// On-change unicast digest of the sender's view. The sender itself is
    /// the first entry, stamped with its current clock.
    Gossip { entries: Vec<GossipEntry> },
}

impl Datagram {
    /// Parse a datagram payload. Returns `None` for packets that are not
    /// discovery messages at all; inside a GOSSIP, malformed entries are
    /// dropped individually.
    pub fn parse(payload: &str) -> Option<Self> {
        if let Some(id) = payload.strip_prefix("HELLO ") {
            let id = id.trim();
            if id.is_empty() {
                return None;
            }
            return Some(Datagram::Hello { id: id.to_owned() });
        }
        if let Some(body) = payload.strip_prefix("GOSSIP ") {
            let entries = body.trim().split(',').filter_map(parse_entry).collect();
            return Some(Datagram::Gossip { entries });
        }
        None
    }

    /// Encode for the wire.
    pub fn encode(&self) -> String {
        match self {
            Datagram::Hello { id } => format!("HELLO {id}"),
            Datagram::Gossip { entries } => {
                let body: Vec<String> = entries
                    .iter()
                    .map(|e| format!("{};{}", e.id, e.ts))
                    .collect();
                format!("GOSSIP {}", body.join(","))
            }
        }
    }
}

fn parse_entry(raw: &str) -> Option<GossipEntry> {
    let (id, ts) = raw.split_once(';')?;
    let id = id.trim();
    if id.is_empty() {
        return None;
    }
    let ts: i64 = ts.trim().parse().ok()?;
    Some(GossipEntry {
        id: id.to_owned(),
        ts,
    })
}

// ── RPC envelope ──────────────────────────────────────────────────────

/// A remote operation. The `op` field tags the variant on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Availability probe: true iff the callee is looking for matches and
    /// not already in a game.
    Ping,
    /// Identity echo.
    GetId,
    /// Session status.
    IsInGame,
    /// Matchmaking step 1: may `proposer_id` pair with the callee?
    ProposeMatch { proposer_id: String },
    /// Matchmaking step 2: commit the pairing on the callee.
    ConfirmMatch {
        opponent_id: String,
        start_with_token: bool,
        symbol: Symbol,
    },
    /// Yield the turn to the callee.
    ReceiveToken,
    /// A move by the caller, with the caller's post-move outcome.
    UpdateMove {
        row: i32,
        col: i32,
        symbol: Symbol,
        outcome: Outcome,
    },
    /// Blocking: the callee's local rematch answer.
    GetRematchDecision,
    /// Begin the next game of the same session.
    StartRematch {
        start_with_token: bool,
        symbol: Symbol,
    },
    /// The session ends definitively.
    NoRematch,
}

/// A remote operation result. The `result` field tags the variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum Response {
    /// Completed without a return value.
    Unit,
    /// Boolean return (ping, is_in_game, propose_match, rematch decision).
    Bool { value: bool },
    /// Identity return (get_id).
    Id { value: String },
    /// The remote side failed to execute the operation.
    Error { message: String },
}
