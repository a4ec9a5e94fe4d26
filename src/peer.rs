//! The peer core — distributed matchmaking, the token-passing game loop,
//! the two-peer rematch consensus, and opponent liveness.
//!
//! Every peer is simultaneously a server (the inbound operations of
//! [`crate::wire::Request`]) and a client (the matchmaking and liveness
//! timers, the interactive turn executor). All session state lives behind
//! one mutex that is never held across an await: remote calls are issued
//! outside the lock and commits re-check state under it, so transitions
//! appear atomic to inbound handlers.
//!
//! Symmetry breaking rests entirely on the lexicographic order of
//! `host:port` ids: proposals flow only from smaller to larger id, the
//! smaller id starts as X with the token, and the smaller id coordinates
//! the rematch consensus.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::board::{Board, Outcome, Symbol};
use crate::config::PeerConfig;
use crate::console::{Console, MoveInput};
use crate::rpc::{PeerApi, PeerHandle};
use crate::view::MembershipView;
use crate::wire::{Request, Response};

/// Local decision slot for the rematch consensus.
///
/// Set at most once per session; `Cancelled` resolves any pending reader
/// to "no" and is what a reader sees between sessions, so a decision can
/// never leak from one session into the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RematchSlot {
    Unset,
    Decided(bool),
    Cancelled,
}

/// Mutable session state, all behind one lock.
#[derive(Debug)]
struct SessionState {
    board: Board,
    in_game: bool,
    has_token: bool,
    my_symbol: Symbol,
    opponent: Option<PeerHandle>,
    opponent_id: Option<String>,
    last_opponent_id: Option<String>,
    looking_for_matches: bool,
}

/// One peer process: identity, session state, and the timers around them.
pub struct Peer {
    id: String,
    state: Mutex<SessionState>,
    rematch: watch::Sender<RematchSlot>,
    view: Arc<MembershipView>,
    console: Console,
    config: PeerConfig,
    shutdown: watch::Sender<bool>,
    timers: Mutex<Vec<JoinHandle<()>>>,
}

impl Peer {
    pub fn new(
        id: impl Into<String>,
        view: Arc<MembershipView>,
        console: Console,
        config: PeerConfig,
    ) -> Arc<Self> {
        let (rematch, _) = watch::channel(RematchSlot::Cancelled);
        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            id: id.into(),
            state: Mutex::new(SessionState {
                board: Board::new(),
                in_game: false,
                has_token: false,
                my_symbol: Symbol::X,
                opponent: None,
                opponent_id: None,
                last_opponent_id: None,
                looking_for_matches: true,
            }),
            rematch,
            view,
            console,
            config,
            shutdown,
            timers: Mutex::new(Vec::new()),
        })
    }

    // ── Introspection ─────────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_in_game(&self) -> bool {
        self.lock().in_game
    }

    pub fn has_token(&self) -> bool {
        self.lock().has_token
    }

    pub fn last_opponent(&self) -> Option<String> {
        self.lock().last_opponent_id.clone()
    }

    /// Fires once when the local user opts out of the matchmaking pool.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn available(&self) -> bool {
        let s = self.lock();
        s.looking_for_matches && !s.in_game
    }

    // ── Timers ────────────────────────────────────────────────────────

    /// Start the matchmaking and liveness timers.
    pub fn run(self: Arc<Self>) {
        let matchmaking = {
            let peer = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(peer.config.matchmaking_delay).await;
                let mut ticker = tokio::time::interval(peer.config.matchmaking_period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    peer.clone().try_matchmaking().await;
                }
            })
        };
        let liveness = {
            let peer = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(peer.config.liveness_period).await;
                let mut ticker = tokio::time::interval(peer.config.liveness_period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    peer.check_opponent_liveness().await;
                }
            })
        };
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        timers.push(matchmaking);
        timers.push(liveness);
    }

    fn cancel_timers(&self) {
        let timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        for timer in timers.iter() {
            timer.abort();
        }
    }

    // ── Matchmaking ───────────────────────────────────────────────────

    /// One matchmaking round. Aborts quietly whenever the peer is busy,
    /// out of the pool, or finds nobody suitable.
    async fn try_matchmaking(self: Arc<Self>) {
        if !self.available() {
            return;
        }

        // Snapshot of the discovered ids, already sorted, self excluded.
        let candidates = self.view.snapshot();
        if candidates.is_empty() {
            return;
        }

        // Keep candidates that answer ping with "free". Transport failures
        // exclude a candidate silently.
        let mut free: Vec<PeerHandle> = Vec::new();
        for id in candidates {
            match PeerHandle::resolve(&id).await {
                Ok(handle) => match handle.ping().await {
                    Ok(true) => free.push(handle),
                    Ok(false) => {}
                    Err(e) => debug!(peer = %id, error = %e, "candidate excluded, ping failed"),
                },
                Err(e) => debug!(peer = %id, error = %e, "candidate excluded, resolve failed"),
            }
        }
        if free.is_empty() {
            return;
        }

        // Avoid an immediate rematch with the previous opponent; when it is
        // the only free peer, wait for someone else instead.
        let last = self.lock().last_opponent_id.clone();
        if let Some(last) = last {
            if free.iter().any(|h| h.id() == last) {
                if free.len() == 1 {
                    return;
                }
                free.retain(|h| h.id() != last);
            }
        }

        let ids: Vec<&str> = free.iter().map(|h| h.id()).collect();
        let Some(target_id) = pick_target(&ids, &self.id) else {
            return;
        };
        let target_id = target_id.to_owned();
        let Some(target) = free.into_iter().find(|h| h.id() == target_id) else {
            return;
        };

        match target.propose_match(&self.id).await {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                debug!(target = %target.id(), error = %e, "proposal failed");
                return;
            }
        }

        // Commit under the lock, re-checking that nothing changed while
        // the proposal was in flight.
        let i_start = {
            let mut s = self.lock();
            if s.in_game || !s.looking_for_matches {
                return;
            }
            let i_start = self.id.as_str() < target.id();
            s.opponent = Some(target.clone());
            s.opponent_id = Some(target.id().to_owned());
            s.in_game = true;
            s.my_symbol = if i_start { Symbol::X } else { Symbol::O };
            s.has_token = i_start;
            s.board.reset();
            i_start
        };
        self.rematch.send_replace(RematchSlot::Unset);

        let opponent_symbol = if i_start { Symbol::O } else { Symbol::X };
        if let Err(e) = target
            .confirm_match(&self.id, !i_start, opponent_symbol)
            .await
        {
            warn!(target = %target.id(), error = %e, "confirm failed");
            println!("Opponent unreachable, terminating match.");
            self.end_game();
            return;
        }

        {
            let s = self.lock();
            println!(
                "Match started with {} | my symbol: {} | token: {}",
                target.id(),
                s.my_symbol,
                s.has_token
            );
        }
        info!(opponent = %target.id(), "match established");

        if i_start {
            self.schedule_turn();
        }
    }

    /// Inbound proposal. Accepted iff this peer is free, still in the
    /// pool, and the proposer's id is lexicographically smaller.
    async fn on_propose_match(self: Arc<Self>, proposer_id: String) -> bool {
        {
            let s = self.lock();
            if s.in_game || !s.looking_for_matches {
                return false;
            }
        }
        if proposer_id.as_str() >= self.id.as_str() {
            return false;
        }

        // Resolve outside the lock; an unresolvable proposer is rejected.
        let handle = match PeerHandle::resolve(&proposer_id).await {
            Ok(h) => h,
            Err(e) => {
                debug!(proposer = %proposer_id, error = %e, "rejecting proposal, resolve failed");
                return false;
            }
        };

        let accepted = {
            let mut s = self.lock();
            if s.in_game || !s.looking_for_matches {
                false
            } else {
                s.opponent = Some(handle);
                s.opponent_id = Some(proposer_id.clone());
                true
            }
        };

        if accepted {
            // The pairing stays tentative until confirm_match arrives;
            // revert it if the proposer never follows through.
            let peer = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(peer.config.confirm_timeout).await;
                let mut s = peer.lock();
                if !s.in_game && s.opponent_id.as_deref() == Some(proposer_id.as_str()) {
                    debug!(proposer = %proposer_id, "confirm never arrived, reverting tentative pairing");
                    s.opponent = None;
                    s.opponent_id = None;
                }
            });
        }
        accepted
    }

    /// Inbound confirmation: the proposer committed on its side; commit
    /// here and start playing if the token landed on this peer.
    async fn on_confirm_match(
        self: Arc<Self>,
        opponent_id: String,
        start_with_token: bool,
        symbol: Symbol,
    ) {
        {
            let s = self.lock();
            if s.in_game || !s.looking_for_matches {
                return;
            }
        }
        let handle = match PeerHandle::resolve(&opponent_id).await {
            Ok(h) => h,
            Err(e) => {
                warn!(opponent = %opponent_id, error = %e, "confirmed opponent unresolvable, dropping match");
                let mut s = self.lock();
                s.opponent = None;
                s.opponent_id = None;
                return;
            }
        };

        {
            let mut s = self.lock();
            if s.in_game || !s.looking_for_matches {
                return;
            }
            s.in_game = true;
            s.my_symbol = symbol;
            s.has_token = start_with_token;
            s.opponent_id = Some(opponent_id.clone());
            s.opponent = Some(handle);
            s.board.reset();
        }
        self.rematch.send_replace(RematchSlot::Unset);

        println!(
            "Match started with {opponent_id} | my symbol: {symbol} | token: {start_with_token}"
        );
        info!(opponent = %opponent_id, "match confirmed");

        if start_with_token {
            self.schedule_turn();
        }
    }

    // ── Game loop ─────────────────────────────────────────────────────

    fn schedule_turn(self: Arc<Self>) {
        tokio::spawn(self.play_turn());
    }

    /// Inbound token grant: it is this peer's turn now.
    fn on_receive_token(self: Arc<Self>) {
        {
            let mut s = self.lock();
            if !s.in_game {
                return;
            }
            s.has_token = true;
        }
        self.schedule_turn();
    }

    /// Inbound opponent move. An invalid move is ignored for the board
    /// update; the outcome field still drives the session forward.
    fn on_update_move(self: Arc<Self>, row: i32, col: i32, symbol: Symbol, outcome: Outcome) {
        {
            let mut s = self.lock();
            if !s.in_game {
                return;
            }
            if s.board.is_valid(row, col) {
                s.board.apply(row, col, symbol);
            }
        }
        println!("Opponent played: {} {}", row + 1, col + 1);

        if outcome.is_terminal() {
            let peer = self.clone();
            tokio::spawn(async move {
                peer.announce_and_handle_end(outcome).await;
            });
        }
        // An ongoing game continues when receive_token arrives.
    }

    /// One local turn while holding the token: prompt until a playable
    /// move, apply, notify, then either finish or pass the token.
    async fn play_turn(self: Arc<Self>) {
        loop {
            {
                let s = self.lock();
                if !s.in_game || !s.has_token {
                    return;
                }
                println!("{}", render_status(&self.id, &s));
            }

            let (row, col) = match self.console.prompt_move().await {
                MoveInput::Quit => {
                    println!("Leaving the game.");
                    let opponent = self.lock().opponent.clone();
                    if let Some(opponent) = opponent {
                        // Best effort: the session ends locally regardless.
                        let _ = opponent.no_rematch().await;
                    }
                    self.on_no_rematch();
                    return;
                }
                MoveInput::Cell { row, col } => (row, col),
            };

            let (outcome, opponent, symbol) = {
                let mut s = self.lock();
                if !s.in_game || !s.has_token {
                    return;
                }
                if !s.board.is_valid(row, col) {
                    println!("Invalid move: cell occupied or out of range. Try again.");
                    continue;
                }
                let symbol = s.my_symbol;
                s.board.apply(row, col, symbol);
                println!("{}", render_status(&self.id, &s));
                let outcome = s.board.check();
                if outcome == Outcome::Ongoing {
                    // Cleared before the pass so a late local attempt to
                    // move is a no-op.
                    s.has_token = false;
                }
                let Some(opponent) = s.opponent.clone() else {
                    return;
                };
                (outcome, opponent, symbol)
            };

            if let Err(e) = opponent.update_move(row, col, symbol, outcome).await {
                warn!(error = %e, "move notification failed");
                println!("Opponent unreachable, terminating match.");
                self.end_game();
                return;
            }

            if outcome.is_terminal() {
                self.announce_and_handle_end(outcome).await;
            } else if let Err(e) = opponent.receive_token().await {
                warn!(error = %e, "token pass failed");
                println!("Opponent unreachable, terminating match.");
                self.end_game();
            }
            return;
        }
    }

    /// Print the final board and the result, then run the rematch phase.
    async fn announce_and_handle_end(self: Arc<Self>, outcome: Outcome) {
        let my_symbol = {
            let s = self.lock();
            println!("{}", render_status(&self.id, &s));
            s.my_symbol
        };
        match outcome {
            Outcome::Draw => println!("Draw."),
            Outcome::Win(winner) if winner == my_symbol => println!("You won!"),
            Outcome::Win(_) => println!("You lost."),
            Outcome::Ongoing => return,
        }
        self.handle_game_end().await;
    }

    // ── Rematch consensus ─────────────────────────────────────────────

    /// Both peers run this after a terminal outcome; the one with the
    /// smaller id coordinates.
    async fn handle_game_end(self: Arc<Self>) {
        let (coordinator, opponent, my_symbol) = {
            let mut s = self.lock();
            s.has_token = false;
            let coordinator = s
                .opponent_id
                .as_deref()
                .map(|opp| self.id.as_str() < opp)
                .unwrap_or(false);
            (coordinator, s.opponent.clone(), s.my_symbol)
        };
        self.rematch.send_replace(RematchSlot::Unset);

        if !coordinator {
            // Publish the local answer; the coordinator reads it over RPC
            // and drives the outcome from its side.
            self.prompt_local_rematch().await;
            return;
        }

        let local_wants = self.prompt_local_rematch().await;
        println!("Waiting for the opponent's rematch decision...");

        let Some(opponent) = opponent else {
            return;
        };
        let remote_wants = opponent.get_rematch_decision().await.unwrap_or(false);

        if local_wants && remote_wants {
            // Alternate the opening: whoever played O starts the new game.
            let i_start_new = my_symbol == Symbol::O;
            let new_symbol = my_symbol.flip();
            if let Err(e) = opponent
                .start_rematch(!i_start_new, new_symbol.flip())
                .await
            {
                warn!(error = %e, "rematch start failed");
                println!("Opponent unreachable, terminating match.");
                self.end_game();
                return;
            }
            self.on_start_rematch(i_start_new, new_symbol);
        } else {
            let _ = opponent.no_rematch().await;
            self.on_no_rematch();
        }
    }

    /// Ask the local user and publish the answer into the rematch slot,
    /// waking any blocked `get_rematch_decision` call.
    async fn prompt_local_rematch(&self) -> bool {
        let wants = self.console.ask_yes_no("Play another game? (s/n): ").await;
        self.rematch.send_replace(RematchSlot::Decided(wants));
        wants
    }

    /// Inbound blocking read of the local rematch answer.
    async fn on_get_rematch_decision(&self) -> bool {
        let mut rx = self.rematch.subscribe();
        loop {
            match *rx.borrow_and_update() {
                RematchSlot::Decided(wants) => return wants,
                RematchSlot::Cancelled => return false,
                RematchSlot::Unset => {}
            }
            if rx.changed().await.is_err() {
                return false;
            }
        }
    }

    /// Begin the next game of the session: flip symbols per the
    /// coordinator's instruction, reset the board, maybe take the turn.
    fn on_start_rematch(self: Arc<Self>, start_with_token: bool, symbol: Symbol) {
        let opponent_id = {
            let mut s = self.lock();
            s.my_symbol = symbol;
            s.has_token = start_with_token;
            s.in_game = true;
            s.board.reset();
            s.opponent_id.clone().unwrap_or_default()
        };
        self.rematch.send_replace(RematchSlot::Unset);

        println!(
            "New game with {opponent_id} | my symbol: {symbol} | token: {start_with_token}"
        );
        if start_with_token {
            self.schedule_turn();
        }
    }

    /// The session is over for good: tear down, then ask whether to stay
    /// in the matchmaking pool. The prompt runs on its own task so the
    /// inbound RPC returns immediately.
    fn on_no_rematch(self: Arc<Self>) {
        println!("The opponent declined a rematch, or no agreement was reached.");
        self.end_game();
        let peer = self.clone();
        tokio::spawn(async move {
            peer.ask_stay_in_queue().await;
        });
    }

    async fn ask_stay_in_queue(&self) {
        let stay = self
            .console
            .ask_yes_no("Keep searching automatically for a new opponent? (s/n): ")
            .await;
        if stay {
            println!("Returning to queue.");
            return;
        }
        println!("Ok, no longer searching for opponents.");
        self.lock().looking_for_matches = false;
        self.cancel_timers();
        self.shutdown.send_replace(true);
    }

    // ── Teardown ──────────────────────────────────────────────────────

    /// Atomic teardown: forget the session, remember the opponent, and
    /// become available for matchmaking again.
    fn end_game(&self) {
        {
            let mut s = self.lock();
            s.in_game = false;
            s.has_token = false;
            if let Some(prev) = s.opponent_id.take() {
                s.last_opponent_id = Some(prev);
            }
            s.opponent = None;
            s.board.reset();
        }
        self.rematch.send_replace(RematchSlot::Cancelled);
        println!("Game over. Back in the pool for a new match.");
    }

    /// Periodic probe: any transport failure toward the current opponent
    /// tears the session down so a crashed peer never leaves this one
    /// stuck in a game.
    async fn check_opponent_liveness(&self) {
        let opponent = {
            let s = self.lock();
            if !s.in_game {
                return;
            }
            s.opponent.clone()
        };
        let Some(opponent) = opponent else {
            return;
        };
        if let Err(e) = opponent.ping().await {
            warn!(opponent = %opponent.id(), error = %e, "liveness probe failed");
            println!("Opponent unreachable, terminating match.");
            self.end_game();
        }
    }
}

impl PeerApi for Peer {
    fn handle(
        self: Arc<Self>,
        request: Request,
    ) -> impl std::future::Future<Output = Response> + Send {
        async move {
            match request {
                Request::Ping => Response::Bool {
                    value: self.available(),
                },
                Request::GetId => Response::Id {
                    value: self.id.clone(),
                },
                Request::IsInGame => Response::Bool {
                    value: self.is_in_game(),
                },
                Request::ProposeMatch { proposer_id } => Response::Bool {
                    value: self.clone().on_propose_match(proposer_id).await,
                },
                Request::ConfirmMatch {
                    opponent_id,
                    start_with_token,
                    symbol,
                } => {
                    self.clone()
                        .on_confirm_match(opponent_id, start_with_token, symbol)
                        .await;
                    Response::Unit
                }
                Request::ReceiveToken => {
                    self.clone().on_receive_token();
                    Response::Unit
                }
                Request::UpdateMove {
                    row,
                    col,
                    symbol,
                    outcome,
                } => {
                    self.clone().on_update_move(row, col, symbol, outcome);
                    Response::Unit
                }
                Request::GetRematchDecision => Response::Bool {
                    value: self.on_get_rematch_decision().await,
                },
                Request::StartRematch {
                    start_with_token,
                    symbol,
                } => {
                    self.clone().on_start_rematch(start_with_token, symbol);
                    Response::Unit
                }
                Request::NoRematch => {
                    self.clone().on_no_rematch();
                    Response::Unit
                }
            }
        }
    }
}

/// Lexicographic successor of `self_id` among `sorted_ids`, wrapping to
/// the smallest id when no candidate is greater.
fn pick_target<'a>(sorted_ids: &[&'a str], self_id: &str) -> Option<&'a str> {
    sorted_ids
        .iter()
        .copied()
        .find(|id| *id > self_id)
        .or_else(|| sorted_ids.first().copied())
}

fn render_status(id: &str, s: &SessionState) -> String {
    let mut out = format!(
        "=== {} | symbol {} | token {} ===\n",
        id, s.my_symbol, s.has_token
    );
    if let Some(opponent) = &s.opponent_id {
        out.push_str(&format!("Opponent: {opponent}\n"));
    }
    out.push_str(&s.board.render());
    out
}
