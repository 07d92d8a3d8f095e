//! The embedded speaker: local RIB, peer registry, session lifecycle.

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use routegate_config::{LocalConfig, PeerConfig};
use routegate_metrics::{AdvertisementGauge, PathLabels};

use crate::session::{Rib, RibEntry, RibUpdate, SessionCtx};
use crate::wire::{BGP_PORT, HOLD_TIME_SECS, OpenParams, PathSpec};
use crate::{PathInfo, PeerEvent, PeerPathInfo, RouteAdvertiser, SessionState, SpeakerError};

struct PeerSlot {
    ctx: SessionCtx,
    handle: tokio::task::JoinHandle<()>,
}

/// The local BGP speaker.
///
/// Owns the RIB and the peer sessions; implements [`RouteAdvertiser`]
/// for the controller. Dropping the speaker aborts all session tasks.
pub struct Speaker {
    local: OpenParams,
    rib: Rib,
    updates: broadcast::Sender<RibUpdate>,
    peers: Arc<Mutex<Vec<PeerSlot>>>,
    events: mpsc::UnboundedSender<PeerEvent>,
    gauge: AdvertisementGauge,
    session_port: u16,
    listener: Option<tokio::task::JoinHandle<()>>,
}

impl Speaker {
    /// Start the local speaker.
    ///
    /// Fails if the router ID is not an IPv4 address or, when
    /// `listen_port` is positive, if the passive listener cannot bind.
    /// No session exists until peers are added.
    pub async fn start(
        local: &LocalConfig,
        gauge: AdvertisementGauge,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Speaker, SpeakerError> {
        let router_id: Ipv4Addr = local
            .router_id
            .parse()
            .map_err(|_| SpeakerError::InvalidIdentity(local.router_id.clone()))?;

        let open = OpenParams {
            asn: local.asn,
            hold_time: HOLD_TIME_SECS,
            router_id,
        };
        let (updates, _) = broadcast::channel(64);
        let peers: Arc<Mutex<Vec<PeerSlot>>> = Arc::new(Mutex::new(Vec::new()));

        let listener = if local.listen_port > 0 {
            let addr = format!("0.0.0.0:{}", local.listen_port);
            let listener = tokio::net::TcpListener::bind(&addr)
                .await
                .map_err(SpeakerError::Listen)?;
            info!(%addr, "listening for inbound sessions");
            Some(tokio::spawn(accept_loop(listener, peers.clone())))
        } else {
            None
        };

        info!(router_id = %router_id, asn = local.asn, "speaker started");
        Ok(Speaker {
            local: open,
            rib: Arc::new(Mutex::new(std::collections::HashMap::new())),
            updates,
            peers,
            events,
            gauge,
            session_port: BGP_PORT,
            listener,
        })
    }

    /// Override the peer TCP port (tests peer with loopback listeners).
    pub(crate) fn set_session_port(&mut self, port: u16) {
        self.session_port = port;
    }

    /// Register a peer and start its session task.
    ///
    /// The peer set is fixed at startup; re-registering an address is
    /// an error.
    pub fn add_peer(&self, peer: &PeerConfig) -> Result<(), SpeakerError> {
        let mut peers = self.peers.lock().unwrap();
        if peers.iter().any(|slot| slot.ctx.peer.address == peer.address) {
            return Err(SpeakerError::DuplicatePeer(peer.address));
        }

        let ctx = SessionCtx {
            peer: peer.clone(),
            port: self.session_port,
            local: self.local,
            rib: self.rib.clone(),
            updates: self.updates.clone(),
            events: self.events.clone(),
            state: Arc::new(Mutex::new(SessionState::Idle)),
        };
        let handle = tokio::spawn(ctx.clone().run_active());
        peers.push(PeerSlot { ctx, handle });

        info!(peer = %peer.address, asn = peer.asn, "peer added");
        Ok(())
    }

    fn peer_facts(&self) -> Vec<PeerPathInfo> {
        self.peers
            .lock()
            .unwrap()
            .iter()
            .map(|slot| PeerPathInfo {
                address: slot.ctx.peer.address,
                asn: slot.ctx.peer.asn,
                state: *slot.ctx.state.lock().unwrap(),
            })
            .collect()
    }

    fn labels(prefix: Ipv4Addr, prefix_len: u8, next_hop: Ipv4Addr) -> PathLabels {
        PathLabels::new(prefix.to_string(), prefix_len.to_string(), next_hop.to_string())
    }
}

impl Drop for Speaker {
    fn drop(&mut self) {
        if let Some(listener) = &self.listener {
            listener.abort();
        }
        for slot in self.peers.lock().unwrap().iter() {
            slot.handle.abort();
        }
    }
}

#[async_trait]
impl RouteAdvertiser for Speaker {
    async fn advertise(
        &self,
        prefix: Ipv4Addr,
        prefix_len: u8,
        next_hop: Ipv4Addr,
    ) -> Result<(), SpeakerError> {
        let path = PathSpec {
            prefix,
            prefix_len,
            next_hop,
        };
        self.rib.lock().unwrap().insert(
            (prefix, prefix_len),
            RibEntry {
                next_hop,
                since: Instant::now(),
            },
        );
        // No receiver just means no session is established yet; the
        // RIB replay covers those peers when they come up.
        let _ = self.updates.send(RibUpdate::Advertise(path));
        self.gauge.set(&Self::labels(prefix, prefix_len, next_hop));
        info!(%path, "path advertised");
        Ok(())
    }

    async fn withdraw(
        &self,
        prefix: Ipv4Addr,
        prefix_len: u8,
        next_hop: Ipv4Addr,
    ) -> Result<(), SpeakerError> {
        let path = PathSpec {
            prefix,
            prefix_len,
            next_hop,
        };
        let removed = self.rib.lock().unwrap().remove(&(prefix, prefix_len));
        if removed.is_none() {
            return Err(SpeakerError::PathNotAdvertised(path.to_string()));
        }
        let _ = self.updates.send(RibUpdate::Withdraw(path));
        self.gauge.unset(&Self::labels(prefix, prefix_len, next_hop));
        info!(%path, "path withdrawn");
        Ok(())
    }

    async fn list_paths(&self) -> Vec<PathInfo> {
        let peers = self.peer_facts();
        let rib = self.rib.lock().unwrap();
        rib.iter()
            .map(|(&(prefix, prefix_len), entry)| PathInfo {
                prefix,
                prefix_len,
                next_hop: entry.next_hop,
                age: entry.since.elapsed(),
                peers: peers.clone(),
            })
            .collect()
    }
}

/// Accept inbound connections and hand them to the matching peer's
/// session context. Unknown sources and already-established peers are
/// dropped.
async fn accept_loop(listener: tokio::net::TcpListener, peers: Arc<Mutex<Vec<PeerSlot>>>) {
    loop {
        let (stream, remote) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(error = %err, "accept failed");
                continue;
            }
        };

        let ctx = {
            let peers = peers.lock().unwrap();
            peers
                .iter()
                .find(|slot| slot.ctx.peer.address == remote.ip())
                .map(|slot| (slot.ctx.clone(), *slot.ctx.state.lock().unwrap()))
        };
        match ctx {
            Some((ctx, state)) if state != SessionState::Established => {
                debug!(peer = %remote, "inbound session accepted");
                tokio::spawn(async move {
                    if let Err(err) = ctx.drive(stream).await {
                        warn!(peer = %remote, error = %err, "inbound session ended");
                    }
                });
            }
            Some(_) => {
                debug!(peer = %remote, "dropping inbound connection; session already established");
            }
            None => {
                debug!(source = %remote, "dropping connection from unknown source");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::read_message;
    use crate::wire::{self, Message};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn local() -> LocalConfig {
        LocalConfig {
            router_id: "10.88.0.200".to_string(),
            asn: 65512,
            listen_port: -1,
        }
    }

    async fn speaker() -> (Speaker, mpsc::UnboundedReceiver<PeerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let speaker = Speaker::start(&local(), AdvertisementGauge::new(), tx)
            .await
            .unwrap();
        (speaker, rx)
    }

    #[tokio::test]
    async fn rejects_bad_router_id() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut cfg = local();
        cfg.router_id = "fe80::1".to_string();

        let result = Speaker::start(&cfg, AdvertisementGauge::new(), tx).await;
        assert!(matches!(result, Err(SpeakerError::InvalidIdentity(_))));
    }

    #[tokio::test]
    async fn rejects_duplicate_peer() {
        let (speaker, _rx) = speaker().await;
        let peer = PeerConfig {
            address: "10.88.0.253".parse().unwrap(),
            asn: 65512,
        };

        speaker.add_peer(&peer).unwrap();
        assert!(matches!(
            speaker.add_peer(&peer),
            Err(SpeakerError::DuplicatePeer(_))
        ));
    }

    #[tokio::test]
    async fn advertise_updates_rib_gauge_and_listing() {
        let (speaker, _rx) = speaker().await;
        let prefix = Ipv4Addr::new(10, 88, 2, 1);
        let next_hop = Ipv4Addr::new(10, 88, 0, 200);
        let labels = Speaker::labels(prefix, 32, next_hop);

        speaker.advertise(prefix, 32, next_hop).await.unwrap();
        assert_eq!(speaker.gauge.get(&labels), Some(1));

        let paths = speaker.list_paths().await;
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].prefix, prefix);
        assert_eq!(paths[0].prefix_len, 32);
        assert_eq!(paths[0].next_hop, next_hop);

        speaker.withdraw(prefix, 32, next_hop).await.unwrap();
        assert_eq!(speaker.gauge.get(&labels), Some(0));
        assert!(speaker.list_paths().await.is_empty());
    }

    #[tokio::test]
    async fn withdraw_of_unknown_path_is_error() {
        let (speaker, _rx) = speaker().await;
        let result = speaker
            .withdraw(Ipv4Addr::new(10, 88, 2, 1), 32, Ipv4Addr::new(10, 88, 0, 200))
            .await;
        assert!(matches!(result, Err(SpeakerError::PathNotAdvertised(_))));
    }

    #[tokio::test]
    async fn end_to_end_advertisement_reaches_peer() {
        // A loopback listener plays the BGP neighbor.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let peer_task = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let open = read_message(&mut stream).await.unwrap();
            assert!(matches!(open, Message::Open(_)));
            stream
                .write_all(&wire::encode_open(&wire::OpenParams {
                    asn: 65513,
                    hold_time: 90,
                    router_id: Ipv4Addr::new(10, 88, 0, 253),
                }))
                .await
                .unwrap();
            let confirm = read_message(&mut stream).await.unwrap();
            assert_eq!(confirm, Message::Keepalive);
            stream.write_all(&wire::encode_keepalive()).await.unwrap();
            read_message(&mut stream).await.unwrap()
        });

        let (tx, _rx) = mpsc::unbounded_channel();
        let mut speaker = Speaker::start(&local(), AdvertisementGauge::new(), tx)
            .await
            .unwrap();
        speaker.set_session_port(port);
        speaker
            .add_peer(&PeerConfig {
                address: "127.0.0.1".parse().unwrap(),
                asn: 65513,
            })
            .unwrap();

        // Wait for establishment, then advertise.
        for _ in 0..100 {
            let facts = speaker.peer_facts();
            if facts[0].state == SessionState::Established {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        speaker
            .advertise(Ipv4Addr::new(10, 88, 2, 1), 32, Ipv4Addr::new(10, 88, 0, 200))
            .await
            .unwrap();

        let update = tokio::time::timeout(Duration::from_secs(5), peer_task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(update, Message::Update { .. }));
    }
}
