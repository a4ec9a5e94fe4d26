//! meshtris — a serverless peer-to-peer tic-tac-toe mesh.
//!
//! Every process is an equal peer: it announces itself over LAN multicast,
//! discovers others, negotiates an exclusive pairing with deterministic
//! symmetry breaking on the lexicographic `host:port` order, plays a
//! token-coordinated game over a small JSON RPC surface, and runs a
//! two-peer rematch consensus when the board reaches a terminal state.
//!
//! Modules, leaves first:
//!
//! - [`board`] — the pure 3×3 grid
//! - [`wire`] — discovery datagrams and the RPC envelope
//! - [`codec`] — newline-delimited JSON framing
//! - [`view`] — membership view with last-seen bookkeeping
//! - [`discovery`] — multicast HELLO, on-change gossip, cleaner
//! - [`rpc`] — peer handles and the published operation surface
//! - [`console`] — interaction adapter for the local player
//! - [`peer`] — matchmaking, token protocol, rematch consensus, liveness

pub mod board;
pub mod codec;
pub mod config;
pub mod console;
pub mod discovery;
pub mod error;
pub mod peer;
pub mod rpc;
pub mod view;
pub mod wire;

pub use error::{Error, Result};
