use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs},
    time::Duration,
};

use anyhow::{anyhow, Result};
use log::{info, warn};
use prolink::{
    Config, DeviceStatus, Message, MetadataClient, MixEvent, MixstatusConfig, Prolink,
    TrackMetadata, TrackRef, STATUS_PORT,
};
use serde::Serialize;
use structopt::StructOpt;
use tide::{prelude::*, sse, Request};
use tokio::sync::{broadcast, watch};

#[derive(StructOpt)]
#[structopt(about = "prolink utility")]
enum Opt {
    /// Print peers and mix events as they happen.
    Watch {
        #[structopt(flatten)]
        net: NetOpt,

        /// Also print every status packet.
        #[structopt(short, long)]
        verbose: bool,
    },
    /// Serve mix events and deck state as server-sent events.
    Serve {
        #[structopt(flatten)]
        net: NetOpt,

        #[structopt(long, default_value = "127.0.0.1:8080")]
        listen: String,
    },
    /// Fetch metadata for one track from a player's database.
    Metadata {
        host: String,
        slot: u8,
        track_type: u8,
        id: u32,

        #[structopt(long, default_value = "5")]
        device_num: u8,

        #[structopt(long, default_value = "16777216")]
        max_field_len: u32,
    },
}

#[derive(StructOpt)]
struct NetOpt {
    #[structopt(long, default_value = "5")]
    device_num: u8,

    #[structopt(long, default_value = "400")]
    confirm_ms: u64,

    #[structopt(long, default_value = "2000")]
    grace_ms: u64,

    /// Treat every player as on air.
    #[structopt(long)]
    ignore_on_air: bool,

    #[structopt(long)]
    fetch_metadata: bool,

    #[structopt(long, default_value = "16777216")]
    max_field_len: u32,
}

impl NetOpt {
    fn config(&self) -> Config {
        Config {
            device_num: self.device_num,
            status_addr: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), STATUS_PORT),
            fetch_metadata: self.fetch_metadata,
            max_field_len: self.max_field_len,
            mixstatus: MixstatusConfig {
                confirmation_window: Duration::from_millis(self.confirm_ms),
                grace_window: Duration::from_millis(self.grace_ms),
                use_on_air: !self.ignore_on_air,
            },
        }
    }
}

async fn watch(config: Config, verbose: bool) -> Result<()> {
    let mut prolink = Prolink::join(config).await?;
    println!("connected");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                break;
            }
            res = prolink.next() => {
                match res? {
                    Message::PeerJoined(peer) => {
                        println!("joined: {} ({})", peer.name, peer.device_num)
                    }
                    Message::PeerLeft(peer) => {
                        println!("left: {} ({})", peer.name, peer.device_num)
                    }
                    Message::Mix(event) => println!("{}", json!(event)),
                    Message::TrackMetadata { device_num, metadata, .. } => {
                        println!("deck {}: {} - {}", device_num, metadata.artist, metadata.title)
                    }
                    Message::Status(status) if verbose => println!("{:?}", status),
                    Message::Status(_) => (),
                }
            }
        }
    }

    println!("terminating");
    prolink.terminate().await;
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Serialize)]
struct DeckInfo {
    name: String,
    track: TrackRef,
    is_playing: bool,
    is_on_air: bool,
    is_master: bool,
    bpm: Option<f32>,
    metadata: Option<TrackMetadata>,
}

impl DeckInfo {
    fn update(&mut self, status: &DeviceStatus) {
        if self.track != status.track() {
            self.metadata = None;
        }
        self.name = status.name.clone();
        self.track = status.track();
        self.is_playing = status.is_playing;
        self.is_on_air = status.is_on_air;
        self.is_master = status.is_master;
        self.bpm = status.bpm;
    }
}

#[derive(Clone)]
struct WebState {
    decks: watch::Receiver<HashMap<u8, DeckInfo>>,
    mix: broadcast::Sender<MixEvent>,
}

struct ProlinkTask {
    prolink: Prolink,
    decks_tx: watch::Sender<HashMap<u8, DeckInfo>>,
    mix_tx: broadcast::Sender<MixEvent>,
    decks: HashMap<u8, DeckInfo>,
}

impl ProlinkTask {
    async fn start(
        config: Config,
        decks_tx: watch::Sender<HashMap<u8, DeckInfo>>,
        mix_tx: broadcast::Sender<MixEvent>,
    ) -> Result<()> {
        let prolink = Prolink::join(config).await?;

        let task = ProlinkTask {
            prolink,
            decks_tx,
            mix_tx,
            decks: HashMap::new(),
        };
        info!("connected");

        task.run().await
    }

    async fn run(mut self) -> Result<()> {
        let mut mix_rx = self.prolink.subscribe();
        loop {
            tokio::select! {
                res = mix_rx.recv() => {
                    match res {
                        Ok(event) => {
                            let _ = self.mix_tx.send(event);
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("dropped {} mix events", n)
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                res = self.prolink.next() => {
                    if self.handle_message(res?) {
                        self.decks_tx.send(self.decks.clone())?;
                    }
                }
            }
        }
        self.prolink.terminate().await;

        Ok(())
    }

    /// Returns true when the deck table changed.
    fn handle_message(&mut self, msg: Message) -> bool {
        match msg {
            Message::Status(status) => {
                let deck = self
                    .decks
                    .entry(status.device_id)
                    .or_insert_with(|| DeckInfo {
                        name: status.name.clone(),
                        track: status.track(),
                        is_playing: false,
                        is_on_air: false,
                        is_master: false,
                        bpm: None,
                        metadata: None,
                    });
                let before = deck.clone();
                deck.update(&status);
                *deck != before
            }
            Message::TrackMetadata {
                device_num,
                track,
                metadata,
            } => match self.decks.get_mut(&device_num) {
                Some(deck) if deck.track == track => {
                    deck.metadata = Some(metadata);
                    true
                }
                _ => false,
            },
            Message::PeerLeft(peer) => self.decks.remove(&peer.device_num).is_some(),
            Message::PeerJoined(_) | Message::Mix(_) => false,
        }
    }
}

async fn web(listen: String, state: WebState) -> Result<()> {
    let mut app = tide::with_state(state);
    app.at("/decks")
        .get(sse::endpoint(|req: Request<WebState>, sender| async move {
            let mut decks_rx = req.state().decks.clone();
            loop {
                let decks = {
                    let decks = decks_rx.borrow();
                    json!(*decks).to_string()
                };
                sender.send("decks", decks, None).await?;
                if decks_rx.changed().await.is_err() {
                    break;
                }
            }

            Ok(())
        }));
    app.at("/mix")
        .get(sse::endpoint(|req: Request<WebState>, sender| async move {
            let mut mix_rx = req.state().mix.subscribe();
            loop {
                match mix_rx.recv().await {
                    Ok(event) => sender.send("mix", json!(event).to_string(), None).await?,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }

            Ok(())
        }));
    app.listen(listen).await?;
    Ok(())
}

async fn serve(config: Config, listen: String) -> Result<()> {
    let (decks_tx, decks_rx) = watch::channel(HashMap::new());
    let (mix_tx, _) = broadcast::channel(64);

    let state = WebState {
        decks: decks_rx,
        mix: mix_tx.clone(),
    };
    let _ = tokio::spawn(async move {
        if let Err(e) = web(listen, state).await {
            println!("web task error: {}", e);
        }
    });
    let _ = tokio::spawn(async move {
        if let Err(e) = ProlinkTask::start(config, decks_tx, mix_tx).await {
            println!("prolink task error: {}", e);
        }
    });
    tokio::signal::ctrl_c().await?;
    println!("terminating");

    Ok(())
}

fn lookup_host(host: &str) -> Result<Ipv4Addr> {
    (host, 0)
        .to_socket_addrs()?
        .find_map(|addr| match addr.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
        .ok_or_else(|| anyhow!("failed to look up {}", host))
}

async fn metadata(
    host: &str,
    track: TrackRef,
    device_num: u8,
    max_field_len: u32,
) -> Result<()> {
    let ip = lookup_host(host)?;
    let mut client = MetadataClient::connect(ip, device_num, max_field_len).await?;
    match client.track_metadata(&track).await? {
        Some(metadata) => println!("{}", json!(metadata)),
        None => println!("no track {} in slot {}", track.track_id, track.slot),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let opt = Opt::from_args();

    match opt {
        Opt::Watch { net, verbose } => watch(net.config(), verbose).await,
        Opt::Serve { net, listen } => serve(net.config(), listen).await,
        Opt::Metadata {
            host,
            slot,
            track_type,
            id,
            device_num,
            max_field_len,
        } => {
            let track = TrackRef {
                device_id: 0,
                slot,
                track_type,
                track_id: id,
            };
            metadata(&host, track, device_num, max_field_len).await
        }
    }
}
