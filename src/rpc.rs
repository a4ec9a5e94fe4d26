//! RPC transport — request/response between peers addressed by `host:port`.
//!
//! Each outbound call opens a short-lived TCP connection, writes one
//! JSON-framed request line, and reads one response line; the server side
//! accepts connections and answers until the client hangs up. There are no
//! retries and no per-call timeout: any transport failure is terminal for
//! the calling session, by contract.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::board::{Outcome, Symbol};
use crate::codec::{CodecError, JsonLines};
use crate::wire::{Request, Response};

/// Client-side framing: decode responses, encode requests.
type ClientFrames = Framed<TcpStream, JsonLines<Response, Request>>;
/// Server-side framing: decode requests, encode responses.
type ServerFrames = Framed<TcpStream, JsonLines<Request, Response>>;

/// Transport failure modes. All of them end the caller's session.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("malformed peer address '{0}'")]
    MalformedAddress(String),
    #[error("no peer bound at {0}")]
    NotBound(String),
    #[error("peer unreachable: {0}")]
    Unreachable(#[source] std::io::Error),
    #[error("remote error: {0}")]
    Remote(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<CodecError> for RpcError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Io(io) => RpcError::Unreachable(io),
            other => RpcError::Protocol(other.to_string()),
        }
    }
}

/// A resolved remote peer. Holds no connection: every call dials anew.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    id: String,
    addr: SocketAddr,
}

impl PeerHandle {
    /// Resolve a logical id to a callable handle.
    ///
    /// Confirms that something answers `get_id` at the address: a handle is
    /// known-reachable at resolution time and nothing more.
    pub async fn resolve(id: &str) -> Result<Self, RpcError> {
        let addr = resolve_addr(id).await?;
        let handle = Self {
            id: id.to_owned(),
            addr,
        };
        let echoed = handle.get_id().await?;
        if echoed != handle.id {
            debug!(expected = %handle.id, got = %echoed, "peer answers under a different id");
        }
        Ok(handle)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn ping(&self) -> Result<bool, RpcError> {
        self.call_bool(Request::Ping).await
    }

    pub async fn get_id(&self) -> Result<String, RpcError> {
        match self.call(Request::GetId).await? {
            Response::Id { value } => Ok(value),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn is_in_game(&self) -> Result<bool, RpcError> {
        self.call_bool(Request::IsInGame).await
    }

    pub async fn propose_match(&self, proposer_id: &str) -> Result<bool, RpcError> {
        self.call_bool(Request::ProposeMatch {
            proposer_id: proposer_id.to_owned(),
        })
        .await
    }

    pub async fn confirm_match(
        &self,
        opponent_id: &str,
        start_with_token: bool,
        symbol: Symbol,
    ) -> Result<(), RpcError> {
        self.call_unit(Request::ConfirmMatch {
            opponent_id: opponent_id.to_owned(),
            start_with_token,
            symbol,
        })
        .await
    }

    pub async fn receive_token(&self) -> Result<(), RpcError> {
        self.call_unit(Request::ReceiveToken).await
    }

    pub async fn update_move(
        &self,
        row: i32,
        col: i32,
        symbol: Symbol,
        outcome: Outcome,
    ) -> Result<(), RpcError> {
        self.call_unit(Request::UpdateMove {
            row,
            col,
            symbol,
            outcome,
        })
        .await
    }

    /// Blocks until the remote user has answered the rematch prompt.
    pub async fn get_rematch_decision(&self) -> Result<bool, RpcError> {
        self.call_bool(Request::GetRematchDecision).await
    }

    pub async fn start_rematch(
        &self,
        start_with_token: bool,
        symbol: Symbol,
    ) -> Result<(), RpcError> {
        self.call_unit(Request::StartRematch {
            start_with_token,
            symbol,
        })
        .await
    }

    pub async fn no_rematch(&self) -> Result<(), RpcError> {
        self.call_unit(Request::NoRematch).await
    }

    async fn call(&self, request: Request) -> Result<Response, RpcError> {
        let stream = TcpStream::connect(self.addr).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::ConnectionRefused {
                RpcError::NotBound(self.id.clone())
            } else {
                RpcError::Unreachable(e)
            }
        })?;
        let mut frames: ClientFrames = Framed::new(stream, JsonLines::default());
        frames.send(request).await?;
        match frames.next().await {
            Some(Ok(Response::Error { message })) => Err(RpcError::Remote(message)),
            Some(Ok(response)) => Ok(response),
            Some(Err(e)) => Err(e.into()),
            None => Err(RpcError::Protocol(
                "connection closed before response".into(),
            )),
        }
    }

    async fn call_bool(&self, request: Request) -> Result<bool, RpcError> {
        match self.call(request).await? {
            Response::Bool { value } => Ok(value),
            other => Err(unexpected(&other)),
        }
    }

    async fn call_unit(&self, request: Request) -> Result<(), RpcError> {
        match self.call(request).await? {
            Response::Unit => Ok(()),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(response: &Response) -> RpcError {
    RpcError::Protocol(format!("unexpected response shape: {response:?}"))
}

/// Parse `host:port`, resolving the host when it is not a literal address.
async fn resolve_addr(id: &str) -> Result<SocketAddr, RpcError> {
    let (host, port_str) = id
        .rsplit_once(':')
        .ok_or_else(|| RpcError::MalformedAddress(id.to_owned()))?;
    if host.is_empty() {
        return Err(RpcError::MalformedAddress(id.to_owned()));
    }
    let port: u16 = port_str
        .parse()
        .map_err(|_| RpcError::MalformedAddress(id.to_owned()))?;
    let mut addrs = lookup_host((host, port))
        .await
        .map_err(RpcError::Unreachable)?;
    addrs
        .next()
        .ok_or_else(|| RpcError::MalformedAddress(id.to_owned()))
}

// ── Server side ───────────────────────────────────────────────────────

/// The inbound operation surface a published peer implements.
///
/// `handle` may legitimately block for a long time (the rematch decision
/// waits on the local user), so every connection gets its own task.
pub trait PeerApi: Send + Sync + 'static {
    fn handle(self: Arc<Self>, request: Request) -> impl Future<Output = Response> + Send;
}

/// A published peer: accepts inbound calls until closed or dropped.
pub struct RpcServer {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RpcServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting. In-flight connections finish on their own.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        self.close();
        self.task.abort();
    }
}

/// Make `api` reachable for inbound invocations at `addr`.
pub async fn publish<A: PeerApi>(api: Arc<A>, addr: SocketAddr) -> Result<RpcServer, RpcError> {
    let listener = TcpListener::bind(addr).await.map_err(RpcError::Unreachable)?;
    let local_addr = listener.local_addr().map_err(RpcError::Unreachable)?;
    let (shutdown, mut shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        debug!(%remote, "inbound rpc connection");
                        let api = api.clone();
                        tokio::spawn(serve_connection(api, stream));
                    }
                    Err(e) => warn!(error = %e, "rpc accept error"),
                },
            }
        }
    });

    Ok(RpcServer {
        local_addr,
        shutdown,
        task,
    })
}

async fn serve_connection<A: PeerApi>(api: Arc<A>, stream: TcpStream) {
    let mut frames: ServerFrames = Framed::new(stream, JsonLines::default());
    while let Some(next) = frames.next().await {
        match next {
            Ok(request) => {
                let response = api.clone().handle(request).await;
                if frames.send(response).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                // The stream position is unreliable after a framing error:
                // answer once and hang up.
                debug!(error = %e, "undecodable rpc frame");
                let _ = frames
                    .send(Response::Error {
                        message: e.to_string(),
                    })
                    .await;
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Answers every operation with fixed values; records nothing.
    struct EchoApi {
        id: String,
    }

    impl PeerApi for EchoApi {
        fn handle(
            self: Arc<Self>,
            request: Request,
        ) -> impl Future<Output = Response> + Send {
            async move {
                match request {
                    Request::Ping => Response::Bool { value: true },
                    Request::GetId => Response::Id {
                        value: self.id.clone(),
                    },
                    Request::ProposeMatch { proposer_id } => Response::Bool {
                        value: proposer_id < self.id,
                    },
                    _ => Response::Unit,
                }
            }
        }
    }

    async fn publish_echo(echo_id: &str) -> (RpcServer, String) {
        let api = Arc::new(EchoApi {
            id: echo_id.to_owned(),
        });
        let server = publish(api, "127.0.0.1:0".parse().unwrap()).await.unwrap();
        let id = format!("127.0.0.1:{}", server.local_addr().port());
        (server, id)
    }

    #[tokio::test]
    async fn resolve_and_call_round_trip() {
        let (_server, id) = publish_echo("anyone:1").await;

        // resolve only requires that *something* answers get_id.
        let handle = PeerHandle::resolve(&id).await.unwrap();
        assert_eq!(handle.id(), id);
        assert!(handle.ping().await.unwrap());
        handle.receive_token().await.unwrap();
    }

    #[tokio::test]
    async fn multiple_calls_per_handle() {
        let (_server, id) = publish_echo("echo:1").await;
        let handle = PeerHandle::resolve(&id).await.unwrap();
        for _ in 0..3 {
            assert!(handle.ping().await.unwrap());
        }
        assert_eq!(handle.get_id().await.unwrap(), "echo:1");
    }

    #[tokio::test]
    async fn propose_match_carries_the_proposer() {
        let (_server, id) = publish_echo("128.0.0.0:1").await;
        let handle = PeerHandle::resolve(&id).await.unwrap();
        assert!(handle.propose_match("0.0.0.0:1").await.unwrap());
        assert!(!handle.propose_match("255.0.0.0:1").await.unwrap());
    }

    #[tokio::test]
    async fn not_bound_when_nothing_listens() {
        // Bind then immediately drop to get a port that refuses.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = PeerHandle::resolve(&format!("127.0.0.1:{port}"))
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::NotBound(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn malformed_addresses_rejected() {
        for id in ["no-port", ":5000", "host:", "host:notaport"] {
            let err = PeerHandle::resolve(id).await.unwrap_err();
            assert!(
                matches!(err, RpcError::MalformedAddress(_)),
                "{id} should be malformed, got {err:?}"
            );
        }
    }

    #[tokio::test]
    async fn closed_server_stops_answering() {
        let (server, id) = publish_echo("echo:1").await;
        let handle = PeerHandle::resolve(&id).await.unwrap();
        assert!(handle.ping().await.is_ok());

        drop(server);
        // Give the accept loop a moment to die.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(handle.ping().await.is_err());
    }
}
