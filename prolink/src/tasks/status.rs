use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use log::{debug, info, warn};
use tokio::{
    net::UdpSocket,
    sync::mpsc::{self, error::TrySendError},
    time::{self, Instant},
};

use crate::{
    metadata::{MetadataClient, TrackMetadata},
    status::{DeviceStatus, TrackRef},
    tasks::mixstatus::EngineInput,
    Config, Message, Peer, ProlinkError, Result,
};

const PEER_TIMEOUT: Duration = Duration::from_secs(10);

/// Devices seen on the status port, keyed by device number.
#[derive(Default)]
struct PeerTable {
    peers: HashMap<u8, Peer>,
}

impl PeerTable {
    /// Records a sighting, returning the peer if it was not known before.
    fn observe(&mut self, status: &DeviceStatus, ip_addr: Ipv4Addr) -> Option<Peer> {
        let peer = Peer {
            name: status.name.clone(),
            device_num: status.device_id,
            ip_addr,
            last_seen: status.timestamp,
        };

        match self.peers.insert(status.device_id, peer.clone()) {
            Some(prev) if prev.is_same(&peer) => None,
            _ => Some(peer),
        }
    }

    fn expire(&mut self, now: Instant) -> Vec<Peer> {
        // This should use drain_filter once stabilized.
        let timed_out: Vec<u8> = self
            .peers
            .iter()
            .filter(|(_, peer)| now.saturating_duration_since(peer.last_seen) > PEER_TIMEOUT)
            .map(|(id, _)| *id)
            .collect();

        timed_out
            .iter()
            .filter_map(|id| self.peers.remove(id))
            .collect()
    }

    fn ip_addr(&self, device_num: u8) -> Option<Ipv4Addr> {
        self.peers.get(&device_num).map(|peer| peer.ip_addr)
    }
}

/// Decodes player status packets and feeds them to the mixstatus task.
pub(crate) struct StatusTask {
    config: Config,
    socket: UdpSocket,
    msg_tx: mpsc::Sender<Message>,
    engine_tx: mpsc::Sender<EngineInput>,
    peers: PeerTable,
    current_tracks: HashMap<u8, TrackRef>,
}

impl StatusTask {
    pub(crate) async fn new(
        config: &Config,
        msg_tx: mpsc::Sender<Message>,
        engine_tx: mpsc::Sender<EngineInput>,
    ) -> Result<StatusTask> {
        let socket = UdpSocket::bind(config.status_addr).await?;
        info!(target: "prolink", "listening for status on {}", config.status_addr);
        Ok(StatusTask {
            config: config.clone(),
            socket,
            msg_tx,
            engine_tx,
            peers: PeerTable::default(),
            current_tracks: HashMap::new(),
        })
    }

    pub(crate) async fn run(mut self) -> Result<()> {
        match self.run_impl().await {
            Err(ProlinkError::Terminating) => Ok(()),
            res => res,
        }
    }

    async fn run_impl(&mut self) -> Result<()> {
        let mut buf = [0; 4096];
        let mut timeouts = time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = self.msg_tx.closed() => {
                    return Ok(())
                }
                _ = timeouts.tick() => {
                    self.process_timeouts().await?;
                }
                res = self.socket.recv_from(&mut buf) => {
                    if let Ok((len, src)) = res {
                        let pkt = &buf[0..len];
                        match DeviceStatus::parse(pkt, Instant::now()) {
                            Ok(status) => self.handle_status(status, src).await?,
                            Err(e) => {
                                debug!(target: "prolink", "{}", e);
                                #[cfg(feature = "log_bad_packets")]
                                debug!(target: "prolink", "\n{}", pretty_hex::pretty_hex(&pkt));
                            }
                        }
                    }
                }
            }
        }
    }

    async fn handle_status(&mut self, status: DeviceStatus, src: SocketAddr) -> Result<()> {
        if let IpAddr::V4(ip_addr) = src.ip() {
            if let Some(peer) = self.peers.observe(&status, ip_addr) {
                info!(target: "prolink", "peer joined {:?}", &peer);
                self.send(Message::PeerJoined(peer.to_message()))?;
            }
        }

        let track = status.track();
        let new_track = self.current_tracks.insert(status.device_id, track) != Some(track);
        if new_track && track.track_id != 0 && self.config.fetch_metadata {
            self.spawn_metadata_fetch(status.device_id, track);
        }

        self.engine_tx
            .send(EngineInput::Status(status.clone()))
            .await
            .map_err(|_| ProlinkError::Terminating)?;
        self.send(Message::Status(status))
    }

    async fn process_timeouts(&mut self) -> Result<()> {
        for peer in self.peers.expire(Instant::now()) {
            info!(target: "prolink", "peer left {:?}", &peer);
            self.current_tracks.remove(&peer.device_num);
            self.engine_tx
                .send(EngineInput::DeviceLeft(peer.device_num))
                .await
                .map_err(|_| ProlinkError::Terminating)?;
            self.send(Message::PeerLeft(peer.to_message()))?;
        }
        Ok(())
    }

    fn spawn_metadata_fetch(&self, device_num: u8, track: TrackRef) {
        let ip_addr = match self.peers.ip_addr(track.device_id) {
            Some(ip_addr) => ip_addr,
            None => {
                warn!(
                    target: "prolink",
                    "unable to look up peer {} for track metadata", track.device_id
                );
                return;
            }
        };

        let our_device_num = self.config.device_num;
        let max_field_len = self.config.max_field_len;
        let msg_tx = self.msg_tx.clone();
        tokio::spawn(async move {
            match Self::fetch_metadata(ip_addr, our_device_num, max_field_len, &track).await {
                Ok(Some(metadata)) => {
                    let _ = msg_tx
                        .send(Message::TrackMetadata {
                            device_num,
                            track,
                            metadata,
                        })
                        .await;
                }
                Ok(None) => debug!(target: "prolink", "no metadata for {:?}", track),
                Err(e) => warn!(target: "prolink", "metadata fetch failed: {}", e),
            }
        });
    }

    async fn fetch_metadata(
        ip_addr: Ipv4Addr,
        our_device_num: u8,
        max_field_len: u32,
        track: &TrackRef,
    ) -> Result<Option<TrackMetadata>> {
        let mut client = MetadataClient::connect(ip_addr, our_device_num, max_field_len).await?;
        client.track_metadata(track).await
    }

    // Drops rather than waits when the application is not draining
    // messages, so the engine keeps seeing statuses.
    fn send(&self, msg: Message) -> Result<()> {
        match self.msg_tx.try_send(msg) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(msg)) => {
                debug!(target: "prolink", "message queue full, dropping {:?}", msg);
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(ProlinkError::Terminating),
        }
    }
}
