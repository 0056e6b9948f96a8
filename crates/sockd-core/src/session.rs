/// Per-connection SOCKS4/4A session.
///
/// A session drives one accepted client connection through the whole
/// protocol: request decode, destination resolution, firewall evaluation,
/// the CONNECT or BIND leg, the reply, and finally the byte relay. Every
/// failure mode maps to either a single reject reply or a silent close, and
/// never reaches beyond this session.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use chrono::Utc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::audit::{self, Audit, Decision, SessionRecord};
use crate::config::Settings;
use crate::firewall::Firewall;
use crate::relay::{self, MAX_FRAME};
use crate::resolver::{self, ResolveError};
use crate::stats::{GlobalStats, SessionInfo};
use crate::wire::{self, Command, DecodeError, Reply, Request};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum SessionError {
    /// Malformed first message; closed silently, no reply.
    #[error("malformed request: {0}")]
    Decode(#[from] DecodeError),
    /// Client closed or failed before a request arrived; closed silently.
    #[error("no request received: {0}")]
    Request(std::io::Error),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    /// No firewall rule permits the request.
    #[error("rejected by firewall")]
    Rejected,
    #[error("outbound connect to {1} failed: {0}")]
    Connect(std::io::Error, SocketAddrV4),
    #[error("could not obtain a bind listener: {0}")]
    BindListener(std::io::Error),
    #[error("bind accept failed: {0}")]
    Accept(std::io::Error),
    /// BIND peer arrived from an unexpected address; closed silently
    /// without a second reply.
    #[error("bind peer {actual} does not match resolved address {expected}")]
    PeerMismatch { expected: Ipv4Addr, actual: IpAddr },
    #[error("reply write failed: {0}")]
    Reply(std::io::Error),
    #[error("{phase} phase timed out")]
    Timeout { phase: &'static str },
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

pub struct Session {
    id: u64,
    client: TcpStream,
    peer: SocketAddr,
    settings: Arc<Settings>,
    stats: Arc<GlobalStats>,
    audit: Arc<Audit>,
}

impl Session {
    pub fn new(
        client: TcpStream,
        peer: SocketAddr,
        settings: Arc<Settings>,
        stats: Arc<GlobalStats>,
        audit: Arc<Audit>,
    ) -> Self {
        let id = stats.next_session_id();
        Session {
            id,
            client,
            peer,
            settings,
            stats,
            audit,
        }
    }

    /// Run the session to completion. The phases below correspond one to one
    /// with the protocol states; each `.await` is a suspension point.
    pub async fn run(mut self) -> Result<(), SessionError> {
        let request = self.read_request().await?;
        debug!(
            session = self.id,
            peer = %self.peer,
            command = %request.command,
            host = %request.host(),
            port = request.dst_port,
            "request decoded"
        );

        let endpoint = match self.resolve_destination(&request).await {
            Ok(endpoint) => endpoint,
            Err(err) => {
                self.reject(&request, request.host()).await;
                return Err(err);
            }
        };

        if !self.authorize(request.command, *endpoint.ip()).await {
            self.reject(&request, endpoint.ip().to_string()).await;
            return Err(SessionError::Rejected);
        }

        match request.command {
            Command::Connect => self.run_connect(request, endpoint).await,
            Command::Bind => self.run_bind(request, endpoint).await,
        }
    }

    // -- AwaitRequest --------------------------------------------------------

    async fn read_request(&mut self) -> Result<Request, SessionError> {
        let mut buf = [0u8; MAX_FRAME];
        let n = timeout(self.settings.handshake_timeout(), self.client.read(&mut buf))
            .await
            .map_err(|_| SessionError::Timeout { phase: "request" })?
            .map_err(SessionError::Request)?;
        if n == 0 {
            return Err(SessionError::Request(
                std::io::ErrorKind::UnexpectedEof.into(),
            ));
        }
        audit::trace_dump("client request", &buf[..n]);
        Ok(wire::decode_request(&buf[..n])?)
    }

    // -- Resolving -----------------------------------------------------------

    async fn resolve_destination(&self, request: &Request) -> Result<SocketAddrV4, SessionError> {
        let host = request.host();
        let endpoint = timeout(
            self.settings.handshake_timeout(),
            resolver::resolve(&host, request.dst_port),
        )
        .await
        .map_err(|_| SessionError::Timeout { phase: "resolve" })??;
        Ok(endpoint)
    }

    // -- FirewallCheck -------------------------------------------------------

    async fn authorize(&self, command: Command, ip: Ipv4Addr) -> bool {
        match Firewall::load(&self.settings.firewall_path).await {
            Ok(firewall) => firewall.permits(command, ip),
            Err(err) => {
                // Fail closed: an unreadable or malformed rule file denies
                // this session; the file is read again for the next one.
                warn!(session = self.id, error = %err, "firewall unavailable, denying request");
                false
            }
        }
    }

    // -- Connecting ----------------------------------------------------------

    async fn run_connect(
        mut self,
        request: Request,
        endpoint: SocketAddrV4,
    ) -> Result<(), SessionError> {
        let server = match timeout(self.settings.connect_timeout(), TcpStream::connect(endpoint)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                self.reject(&request, endpoint.ip().to_string()).await;
                return Err(SessionError::Connect(err, endpoint));
            }
            Err(_) => {
                self.reject(&request, endpoint.ip().to_string()).await;
                return Err(SessionError::Timeout { phase: "connect" });
            }
        };
        info!(session = self.id, peer = %self.peer, %endpoint, "outbound connection established");

        self.send_reply(&Reply::grant(0, Ipv4Addr::UNSPECIFIED))
            .await
            .map_err(SessionError::Reply)?;
        self.record(&request, endpoint.ip().to_string(), Decision::Accept);

        self.relay_streams(request.command, endpoint, server).await;
        Ok(())
    }

    // -- Binding -------------------------------------------------------------

    async fn run_bind(
        mut self,
        request: Request,
        endpoint: SocketAddrV4,
    ) -> Result<(), SessionError> {
        // The acceptor belongs to this session alone. An OS-assigned
        // ephemeral port stands in for the historical incrementing scan.
        let listener = match TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
            Ok(listener) => listener,
            Err(err) => {
                self.reject(&request, endpoint.ip().to_string()).await;
                return Err(SessionError::BindListener(err));
            }
        };
        let bound_port = match listener.local_addr() {
            Ok(addr) => addr.port(),
            Err(err) => {
                self.reject(&request, endpoint.ip().to_string()).await;
                return Err(SessionError::BindListener(err));
            }
        };
        let local_ip = match self.client.local_addr() {
            Ok(SocketAddr::V4(addr)) => *addr.ip(),
            _ => Ipv4Addr::UNSPECIFIED,
        };

        // First reply tells the client where the destination should connect.
        let reply = Reply::grant(bound_port, local_ip);
        self.send_reply(&reply).await.map_err(SessionError::Reply)?;
        self.record(&request, endpoint.ip().to_string(), Decision::Accept);
        info!(session = self.id, peer = %self.peer, bound_port, "bind listener ready, awaiting peer");

        let (server, peer_addr) = listener.accept().await.map_err(SessionError::Accept)?;
        if peer_addr.ip() != IpAddr::V4(*endpoint.ip()) {
            debug!(session = self.id, %peer_addr, expected = %endpoint.ip(), "bind peer mismatch");
            return Err(SessionError::PeerMismatch {
                expected: *endpoint.ip(),
                actual: peer_addr.ip(),
            });
        }
        drop(listener);

        // Second, identical reply confirms the verified peer; only then does
        // the relay start.
        self.send_reply(&reply).await.map_err(SessionError::Reply)?;
        info!(session = self.id, peer = %self.peer, %peer_addr, "bind peer accepted");

        self.relay_streams(request.command, endpoint, server).await;
        Ok(())
    }

    // -- Relaying ------------------------------------------------------------

    async fn relay_streams(self, command: Command, endpoint: SocketAddrV4, server: TcpStream) {
        self.stats.session_started(SessionInfo {
            id: self.id,
            source: self.peer.to_string(),
            target: endpoint.to_string(),
            command,
            started_at: Utc::now(),
        });

        let totals = relay::run(self.client, server).await;

        self.stats.session_finished(self.id, totals);
        info!(
            session = self.id,
            client_to_server = totals.client_to_server,
            server_to_client = totals.server_to_client,
            "session finished"
        );
    }

    // -- Helpers -------------------------------------------------------------

    async fn send_reply(&mut self, reply: &Reply) -> Result<(), std::io::Error> {
        let bytes = reply.encode();
        audit::trace_dump("reply", &bytes);
        self.client.write_all(&bytes).await
    }

    /// Send the single reject reply the protocol allows and record the
    /// decision. Write failures are ignored: the session is ending anyway.
    async fn reject(&mut self, request: &Request, dest_ip: String) {
        let _ = self.send_reply(&Reply::reject()).await;
        self.record(request, dest_ip, Decision::Reject);
    }

    fn record(&self, request: &Request, dest_ip: String, decision: Decision) {
        let record = SessionRecord::new(
            self.id,
            self.peer,
            dest_ip,
            request.dst_port,
            request.command,
            decision,
        );
        self.audit.record(&record);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
