use std::net::{Ipv4Addr, SocketAddr};

use anyhow::anyhow;
use log::error;
use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
    time::Instant,
};

pub mod field;
pub mod message;
pub mod metadata;
pub mod mixstatus;
pub mod status;
mod tasks;

use tasks::{mixstatus::MixstatusTask, status::StatusTask};

pub use field::{Field, FieldError, FieldType};
pub use message::Message;
pub use metadata::{MetadataClient, TrackMetadata};
pub use mixstatus::{MixEvent, MixstatusConfig, MixstatusEngine};
pub use status::{DeviceStatus, PlayState, TrackRef};

pub const STATUS_PORT: u16 = 50002;

#[derive(Clone, Debug)]
struct Peer {
    name: String,
    device_num: u8,
    ip_addr: Ipv4Addr,
    last_seen: Instant,
}

impl Peer {
    fn is_same(&self, other: &Self) -> bool {
        self.name == other.name && self.ip_addr == other.ip_addr
    }

    fn to_message(&self) -> message::Peer {
        message::Peer {
            name: self.name.clone(),
            device_num: self.device_num,
        }
    }
}

#[derive(Error, Debug)]
pub enum ProlinkError {
    #[error("terminating")]
    Terminating,

    #[error(transparent)]
    Field(#[from] FieldError),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProlinkError>;

#[derive(Debug, Clone)]
pub struct Config {
    /// Device number used when talking to players' remote databases.
    pub device_num: u8,
    pub status_addr: SocketAddr,
    pub fetch_metadata: bool,
    /// Largest string or blob accepted from a remote database.
    pub max_field_len: u32,
    pub mixstatus: MixstatusConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device_num: 5,
            status_addr: SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), STATUS_PORT),
            fetch_metadata: false,
            max_field_len: field::DEFAULT_MAX_FIELD_LEN,
            mixstatus: MixstatusConfig::default(),
        }
    }
}

pub struct Prolink {
    child_tasks: Vec<JoinHandle<()>>,
    msg_rx: mpsc::Receiver<Message>,
    events_tx: broadcast::Sender<MixEvent>,
}

impl Prolink {
    pub async fn join(config: Config) -> Result<Prolink> {
        let (msg_tx, msg_rx) = mpsc::channel(256);
        let (engine_tx, engine_rx) = mpsc::channel(256);
        let (events_tx, _) = broadcast::channel(64);

        let status = StatusTask::new(&config, msg_tx.clone(), engine_tx).await?;
        let mixstatus =
            MixstatusTask::new(config.mixstatus.clone(), engine_rx, msg_tx, events_tx.clone());

        let mixstatus_handle = tokio::spawn(async move {
            if let Err(e) = mixstatus.run().await {
                error!(target: "prolink", "mixstatus task error: {}", e);
            }
        });

        let status_handle = tokio::spawn(async move {
            if let Err(e) = status.run().await {
                error!(target: "prolink", "status task error: {}", e);
            }
        });

        Ok(Prolink {
            child_tasks: vec![status_handle, mixstatus_handle],
            msg_rx,
            events_tx,
        })
    }

    pub async fn next(&mut self) -> Result<Message> {
        self.msg_rx
            .recv()
            .await
            .ok_or_else(|| anyhow!("status task has terminated").into())
    }

    /// Independent feed of mix events. Receivers only see events emitted
    /// after they subscribed.
    pub fn subscribe(&self) -> broadcast::Receiver<MixEvent> {
        self.events_tx.subscribe()
    }

    pub async fn terminate(self) {
        // Children exit once they notice the message channel closed.
        drop(self.msg_rx);
        for t in self.child_tasks {
            let _ = tokio::join!(t);
        }
    }
}
