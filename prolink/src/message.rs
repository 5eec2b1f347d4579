use serde::Serialize;

use crate::{
    metadata::TrackMetadata,
    mixstatus::MixEvent,
    status::{DeviceStatus, TrackRef},
};

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Peer {
    pub name: String,
    pub device_num: u8,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum Message {
    PeerJoined(Peer),
    PeerLeft(Peer),
    Status(DeviceStatus),
    Mix(MixEvent),
    TrackMetadata {
        device_num: u8,
        track: TrackRef,
        metadata: TrackMetadata,
    },
}
