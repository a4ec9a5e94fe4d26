//! End-to-end tests: two in-process peers over loopback TCP.
//!
//! Discovery is bypassed — the membership views are seeded directly, as
//! if the multicast loops had run — so the tests exercise matchmaking,
//! the token protocol, the rematch consensus, and liveness teardown
//! deterministically and without touching the network beyond 127.0.0.1.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, BufReader, ReadBuf};

use meshtris::config::PeerConfig;
use meshtris::console::Console;
use meshtris::peer::Peer;
use meshtris::rpc::{self, RpcServer};
use meshtris::view::{now_ms, MembershipView};

/// An input stream that never yields: the player never answers a prompt.
struct NeverAnswers;

impl AsyncRead for NeverAnswers {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        _buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Poll::Pending
    }
}

struct TestPeer {
    peer: Arc<Peer>,
    view: Arc<MembershipView>,
    server: Option<RpcServer>,
    id: String,
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).expect("bind");
    listener.local_addr().expect("local addr").port()
}

fn fast_config() -> PeerConfig {
    PeerConfig {
        matchmaking_delay: Duration::from_millis(50),
        matchmaking_period: Duration::from_millis(100),
        liveness_period: Duration::from_millis(200),
        confirm_timeout: Duration::from_secs(5),
    }
}

async fn spawn_peer(port: u16, console: Console, config: PeerConfig) -> TestPeer {
    let id = format!("127.0.0.1:{port}");
    let view = Arc::new(MembershipView::new(&id));
    let peer = Peer::new(id.clone(), view.clone(), console, config);
    let server = rpc::publish(peer.clone(), SocketAddr::from(([127, 0, 0, 1], port)))
        .await
        .expect("publish");
    TestPeer {
        peer,
        view,
        server: Some(server),
        id,
    }
}

/// Seed both views and start both peers' timers.
fn link_and_run(a: &TestPeer, b: &TestPeer) {
    a.view.observe_hello(&b.id, now_ms());
    b.view.observe_hello(&a.id, now_ms());
    a.peer.clone().run();
    b.peer.clone().run();
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn two_peers_play_a_full_game_and_part_ways() {
    let (port_a, port_b) = (free_port(), free_port());
    let (id_a, id_b) = (format!("127.0.0.1:{port_a}"), format!("127.0.0.1:{port_b}"));

    // The lexicographically smaller peer proposes, plays X, and holds the
    // token first; it wins on the top row. Both then decline the rematch
    // and leave the pool.
    let x_script = "1 1\n1 2\n1 3\nn\nn\n";
    let o_script = "2 1\n2 2\nn\nn\n";
    let (script_a, script_b) = if id_a < id_b {
        (x_script, o_script)
    } else {
        (o_script, x_script)
    };

    let a = spawn_peer(port_a, Console::scripted(script_a), fast_config()).await;
    let b = spawn_peer(port_b, Console::scripted(script_b), fast_config()).await;
    link_and_run(&a, &b);

    let mut shutdown_a = a.peer.shutdown_signal();
    let mut shutdown_b = b.peer.shutdown_signal();
    tokio::time::timeout(Duration::from_secs(30), async {
        shutdown_a.changed().await.expect("a shutdown");
        shutdown_b.changed().await.expect("b shutdown");
    })
    .await
    .expect("both peers should opt out after the declined rematch");

    assert!(!a.peer.is_in_game());
    assert!(!b.peer.is_in_game());
    assert_eq!(a.peer.last_opponent(), Some(b.id.clone()));
    assert_eq!(b.peer.last_opponent(), Some(a.id.clone()));
}

#[tokio::test]
async fn rematch_swaps_symbols_and_the_opening_move() {
    let (port_a, port_b) = (free_port(), free_port());
    let (id_a, id_b) = (format!("127.0.0.1:{port_a}"), format!("127.0.0.1:{port_b}"));

    // Game 1: the smaller id is X, holds the token, and wins the top row.
    // Both answer "s": the previous O opens game 2 as X and wins it the
    // same way. Both then decline and leave the pool. A wrong symbol or
    // token assignment in the rematch would leave both peers waiting and
    // time the test out.
    let first_x = "1 1\n1 2\n1 3\ns\n2 1\n2 2\nn\nn\n";
    let first_o = "2 1\n2 2\ns\n1 1\n1 2\n1 3\nn\nn\n";
    let (script_a, script_b) = if id_a < id_b {
        (first_x, first_o)
    } else {
        (first_o, first_x)
    };

    let a = spawn_peer(port_a, Console::scripted(script_a), fast_config()).await;
    let b = spawn_peer(port_b, Console::scripted(script_b), fast_config()).await;
    link_and_run(&a, &b);

    let mut shutdown_a = a.peer.shutdown_signal();
    let mut shutdown_b = b.peer.shutdown_signal();
    tokio::time::timeout(Duration::from_secs(30), async {
        shutdown_a.changed().await.expect("a shutdown");
        shutdown_b.changed().await.expect("b shutdown");
    })
    .await
    .expect("the rematch and the second game should complete");

    assert!(!a.peer.is_in_game());
    assert!(!b.peer.is_in_game());
}

#[tokio::test]
async fn quitting_mid_game_ends_the_session_on_both_sides() {
    let (port_a, port_b) = (free_port(), free_port());
    let (id_a, id_b) = (format!("127.0.0.1:{port_a}"), format!("127.0.0.1:{port_b}"));

    // The token holder quits on its first turn; the opponent only ever
    // sees the stay-in-queue prompt.
    let quitter_script = "quit\nn\n";
    let other_script = "n\n";
    let (script_a, script_b) = if id_a < id_b {
        (quitter_script, other_script)
    } else {
        (other_script, quitter_script)
    };

    let a = spawn_peer(port_a, Console::scripted(script_a), fast_config()).await;
    let b = spawn_peer(port_b, Console::scripted(script_b), fast_config()).await;
    link_and_run(&a, &b);

    let mut shutdown_a = a.peer.shutdown_signal();
    let mut shutdown_b = b.peer.shutdown_signal();
    tokio::time::timeout(Duration::from_secs(30), async {
        shutdown_a.changed().await.expect("a shutdown");
        shutdown_b.changed().await.expect("b shutdown");
    })
    .await
    .expect("both peers should shut down after the quit");

    assert!(!a.peer.is_in_game());
    assert!(!b.peer.is_in_game());
}

#[tokio::test]
async fn exactly_one_peer_holds_the_token() {
    let (port_a, port_b) = (free_port(), free_port());

    let a = spawn_peer(
        port_a,
        Console::with_reader(BufReader::new(NeverAnswers)),
        fast_config(),
    )
    .await;
    let b = spawn_peer(
        port_b,
        Console::with_reader(BufReader::new(NeverAnswers)),
        fast_config(),
    )
    .await;
    link_and_run(&a, &b);

    wait_until("both peers to enter the game", || {
        a.peer.is_in_game() && b.peer.is_in_game()
    })
    .await;

    assert!(
        a.peer.has_token() ^ b.peer.has_token(),
        "token must sit on exactly one side"
    );

    // The starter is X and holds the token; X is the smaller id.
    let (smaller, larger) = if a.id < b.id { (&a, &b) } else { (&b, &a) };
    assert!(smaller.peer.has_token());
    assert!(!larger.peer.has_token());
}

#[tokio::test]
async fn unreachable_opponent_tears_the_session_down() {
    let (port_a, port_b) = (free_port(), free_port());

    let a = spawn_peer(
        port_a,
        Console::with_reader(BufReader::new(NeverAnswers)),
        fast_config(),
    )
    .await;
    let mut b = spawn_peer(
        port_b,
        Console::with_reader(BufReader::new(NeverAnswers)),
        fast_config(),
    )
    .await;
    link_and_run(&a, &b);

    wait_until("both peers to enter the game", || {
        a.peer.is_in_game() && b.peer.is_in_game()
    })
    .await;

    // Simulate a crash of b: its RPC endpoint disappears.
    b.server.take();

    wait_until("the liveness probe to release a", || !a.peer.is_in_game()).await;
    assert_eq!(a.peer.last_opponent(), Some(b.id.clone()));
}

#[tokio::test]
async fn busy_peers_reject_new_proposals() {
    let (port_a, port_b) = (free_port(), free_port());

    let a = spawn_peer(
        port_a,
        Console::with_reader(BufReader::new(NeverAnswers)),
        fast_config(),
    )
    .await;
    let b = spawn_peer(
        port_b,
        Console::with_reader(BufReader::new(NeverAnswers)),
        fast_config(),
    )
    .await;
    link_and_run(&a, &b);

    wait_until("both peers to enter the game", || {
        a.peer.is_in_game() && b.peer.is_in_game()
    })
    .await;

    // A proposal from an even smaller id passes the order check but is
    // still rejected because both peers are busy; ping reports the same.
    let handle_a = rpc::PeerHandle::resolve(&a.id).await.expect("resolve a");
    let handle_b = rpc::PeerHandle::resolve(&b.id).await.expect("resolve b");
    assert!(!handle_a.ping().await.expect("ping a"), "busy peer is not free");
    assert!(!handle_b.ping().await.expect("ping b"), "busy peer is not free");
    assert!(!handle_a
        .propose_match("0.0.0.0:1")
        .await
        .expect("propose to a"));
}
