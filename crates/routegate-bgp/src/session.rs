//! Peer session tasks.
//!
//! One task per configured peer keeps a session alive: connect, OPEN
//! exchange, keepalive supervision, RIB replay on establishment, UPDATE
//! fan-out, reconnect with capped exponential backoff. Session state
//! changes are pushed onto the speaker's event channel; they never feed
//! back into advertisement decisions.
//!
//! Incoming UPDATEs are framed and counted but not processed: this
//! speaker originates exactly one prefix and never routes by what it
//! hears.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use routegate_config::PeerConfig;

use crate::wire::{
    self, HEADER_LEN, Header, Message, OpenParams, PathSpec, decode_header, decode_message,
};
use crate::{PeerEvent, SessionState};

const OPEN_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// A change to the advertised path set, fanned out to all sessions.
#[derive(Debug, Clone, Copy)]
pub(crate) enum RibUpdate {
    Advertise(PathSpec),
    Withdraw(PathSpec),
}

/// Entry in the local RIB: what is advertised and since when.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RibEntry {
    pub next_hop: Ipv4Addr,
    pub since: std::time::Instant,
}

pub(crate) type Rib = Arc<Mutex<std::collections::HashMap<(Ipv4Addr, u8), RibEntry>>>;

/// Why a session ended.
#[derive(Debug, Error)]
pub(crate) enum SessionError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Wire(#[from] wire::WireError),

    #[error("peer sent notification: code {code} subcode {subcode}")]
    Notification { code: u8, subcode: u8 },

    #[error("unexpected {0} during session")]
    Unexpected(&'static str),

    #[error("timed out waiting for peer OPEN")]
    HandshakeTimeout,

    #[error("hold timer expired")]
    HoldExpired,

    #[error("connection closed by peer")]
    Closed,
}

/// Everything one peer session needs; clones share the speaker state.
#[derive(Clone)]
pub(crate) struct SessionCtx {
    pub peer: PeerConfig,
    /// Peer TCP port, 179 outside of tests.
    pub port: u16,
    pub local: OpenParams,
    pub rib: Rib,
    pub updates: broadcast::Sender<RibUpdate>,
    pub events: mpsc::UnboundedSender<PeerEvent>,
    pub state: Arc<Mutex<SessionState>>,
}

impl SessionCtx {
    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap() = state;
        let _ = self.events.send(PeerEvent {
            peer: self.peer.address,
            asn: self.peer.asn,
            state,
        });
    }

    /// Keep an outbound session alive forever.
    pub(crate) async fn run_active(self) {
        let mut backoff = Duration::from_secs(1);
        loop {
            // An inbound session may own the slot; stay out of its way
            // until it ends.
            if *self.state.lock().unwrap() == SessionState::Established {
                backoff = Duration::from_secs(1);
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
            self.set_state(SessionState::Connect);
            match TcpStream::connect((self.peer.address, self.port)).await {
                Ok(stream) => {
                    match self.drive(stream).await {
                        Ok(()) => backoff = Duration::from_secs(1),
                        Err(err) => {
                            warn!(peer = %self.peer.address, error = %err, "session ended");
                            backoff = (backoff * 2).min(MAX_BACKOFF);
                        }
                    }
                }
                Err(err) => {
                    debug!(peer = %self.peer.address, error = %err, "connect failed");
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
            // drive already published Idle for sessions that reached
            // establishment; clear only our own Connect marker so an
            // inbound session that grabbed the slot meanwhile is not
            // stomped.
            if *self.state.lock().unwrap() == SessionState::Connect {
                self.set_state(SessionState::Idle);
            }
            tokio::time::sleep(backoff).await;
        }
    }

    /// Run one session over an established TCP connection, inbound or
    /// outbound, until it fails or the peer closes it.
    pub(crate) async fn drive(&self, stream: TcpStream) -> Result<(), SessionError> {
        stream.set_nodelay(true).ok();
        let (mut rd, mut wr) = stream.into_split();

        // Both sides open simultaneously; confirm theirs with a
        // keepalive and wait for ours to be confirmed.
        wr.write_all(&wire::encode_open(&self.local)).await?;

        let peer_open = match tokio::time::timeout(OPEN_TIMEOUT, read_message(&mut rd)).await {
            Err(_) => return Err(SessionError::HandshakeTimeout),
            Ok(msg) => match msg? {
                Message::Open(open) => open,
                Message::Notification { code, subcode } => {
                    return Err(SessionError::Notification { code, subcode });
                }
                _ => return Err(SessionError::Unexpected("message before OPEN")),
            },
        };
        wr.write_all(&wire::encode_keepalive()).await?;

        match tokio::time::timeout(OPEN_TIMEOUT, read_message(&mut rd)).await {
            Err(_) => return Err(SessionError::HandshakeTimeout),
            Ok(msg) => match msg? {
                Message::Keepalive => {}
                Message::Notification { code, subcode } => {
                    return Err(SessionError::Notification { code, subcode });
                }
                _ => return Err(SessionError::Unexpected("message before open confirm")),
            },
        }

        let mut hold_secs = u64::from(self.local.hold_time.min(peer_open.hold_time));
        if hold_secs == 0 {
            // Peer negotiated hold 0 (no keepalives); supervise with
            // our own configured hold instead of running untimed.
            hold_secs = u64::from(self.local.hold_time);
        }

        info!(
            peer = %self.peer.address,
            peer_asn = self.peer.asn,
            peer_router_id = %peer_open.router_id,
            hold = hold_secs,
            "session established"
        );
        // Subscribe before publishing Established and before the RIB
        // snapshot: an update issued the moment the state flips must
        // not be missed. A duplicate advertisement is harmless.
        let rx = self.updates.subscribe();
        self.set_state(SessionState::Established);
        let result = self.established(rd, &mut wr, rx, hold_secs).await;
        // However the session ends, the slot must stop reading
        // Established: the accept loop and the active connect loop both
        // key off it.
        self.set_state(SessionState::Idle);
        result
    }

    async fn established(
        &self,
        mut rd: OwnedReadHalf,
        wr: &mut OwnedWriteHalf,
        updates: broadcast::Receiver<RibUpdate>,
        hold_secs: u64,
    ) -> Result<(), SessionError> {
        self.replay_rib(wr).await?;

        // read_exact is not cancel-safe, so frames are decoded on a
        // dedicated task and consumed through a channel.
        let (msg_tx, msg_rx) = mpsc::channel::<Result<Message, SessionError>>(16);
        let reader = tokio::spawn(async move {
            loop {
                let res = read_message(&mut rd).await;
                let failed = res.is_err();
                if msg_tx.send(res).await.is_err() || failed {
                    break;
                }
            }
        });

        let result = self.established_loop(wr, msg_rx, updates, hold_secs).await;
        reader.abort();
        result
    }

    async fn established_loop(
        &self,
        wr: &mut OwnedWriteHalf,
        mut messages: mpsc::Receiver<Result<Message, SessionError>>,
        mut updates: broadcast::Receiver<RibUpdate>,
        hold_secs: u64,
    ) -> Result<(), SessionError> {
        let hold = Duration::from_secs(hold_secs);
        // A keepalive was just sent during open-confirm; schedule the
        // first periodic one a full period out rather than letting the
        // interval's immediate first tick duplicate it.
        let keepalive_period = Duration::from_secs((hold_secs / 3).max(1));
        let mut keepalive = tokio::time::interval_at(
            tokio::time::Instant::now() + keepalive_period,
            keepalive_period,
        );
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut hold_deadline = tokio::time::Instant::now() + hold;

        loop {
            tokio::select! {
                _ = keepalive.tick() => {
                    wr.write_all(&wire::encode_keepalive()).await?;
                }
                msg = messages.recv() => {
                    let msg = msg.ok_or(SessionError::Closed)??;
                    hold_deadline = tokio::time::Instant::now() + hold;
                    match msg {
                        Message::Keepalive => {}
                        Message::Update { body_len } => {
                            debug!(peer = %self.peer.address, bytes = body_len, "update from peer ignored");
                        }
                        Message::Notification { code, subcode } => {
                            return Err(SessionError::Notification { code, subcode });
                        }
                        Message::Open(_) => {
                            return Err(SessionError::Unexpected("OPEN after establishment"));
                        }
                    }
                }
                update = updates.recv() => {
                    match update {
                        Ok(RibUpdate::Advertise(path)) => {
                            wr.write_all(&wire::encode_update_advertise(
                                &path,
                                self.local.asn,
                                self.peer.asn,
                            ))
                            .await?;
                        }
                        Ok(RibUpdate::Withdraw(path)) => {
                            wr.write_all(&wire::encode_update_withdraw(&path)).await?;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(peer = %self.peer.address, skipped, "update stream lagged; replaying rib");
                            self.replay_rib(wr).await?;
                        }
                        Err(broadcast::error::RecvError::Closed) => return Ok(()),
                    }
                }
                _ = tokio::time::sleep_until(hold_deadline) => {
                    return Err(SessionError::HoldExpired);
                }
            }
        }
    }

    /// Send the full advertised path set to the peer.
    async fn replay_rib(&self, wr: &mut OwnedWriteHalf) -> Result<(), SessionError> {
        let paths: Vec<PathSpec> = {
            let rib = self.rib.lock().unwrap();
            rib.iter()
                .map(|(&(prefix, prefix_len), entry)| PathSpec {
                    prefix,
                    prefix_len,
                    next_hop: entry.next_hop,
                })
                .collect()
        };
        for path in paths {
            debug!(peer = %self.peer.address, %path, "replaying path");
            wr.write_all(&wire::encode_update_advertise(
                &path,
                self.local.asn,
                self.peer.asn,
            ))
            .await?;
        }
        Ok(())
    }
}

/// Read and decode one framed message.
pub(crate) async fn read_message<R: AsyncRead + Unpin>(rd: &mut R) -> Result<Message, SessionError> {
    let mut header_buf = [0u8; HEADER_LEN];
    rd.read_exact(&mut header_buf).await?;
    let header: Header = decode_header(&header_buf)?;
    let mut body = vec![0u8; header.body_len];
    rd.read_exact(&mut body).await?;
    Ok(decode_message(header, &body)?)
}
