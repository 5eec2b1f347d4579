use anyhow::anyhow;
use nom::{
    bytes::complete::{tag, take},
    number::complete::{be_u16, be_u32, be_u8},
    IResult,
};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use serde::Serialize;
use strum::Display;
use tokio::time::Instant;

use crate::Result;

const HEADER: &[u8] = &[0x51, 0x73, 0x70, 0x74, 0x31, 0x57, 0x6d, 0x4a, 0x4f, 0x4c];
const CDJ_STATUS_TYPE: u8 = 0x0a;

const FLAG_PLAYING: u8 = 0x40;
const FLAG_MASTER: u8 = 0x20;
const FLAG_SYNC: u8 = 0x10;
const FLAG_ON_AIR: u8 = 0x08;

const NO_BPM: u16 = 0xffff;
const NO_BEAT: u32 = 0xffffffff;
const PITCH_NORMAL: f32 = 0x100000 as f32;

#[derive(Clone, Copy, Debug, Display, Eq, FromPrimitive, PartialEq, Serialize)]
#[repr(u8)]
pub enum PlayState {
    Empty = 0x00,
    Loading = 0x02,
    Playing = 0x03,
    Looping = 0x04,
    Paused = 0x05,
    Cued = 0x06,
    CuePlaying = 0x07,
    CueScratching = 0x08,
    Searching = 0x09,
    SpunDown = 0x0e,
    Ended = 0x11,
}

/// Where a loaded track lives and how to ask for it.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize)]
pub struct TrackRef {
    pub device_id: u8,
    pub slot: u8,
    pub track_type: u8,
    pub track_id: u32,
}

/// One status observation from a player.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DeviceStatus {
    pub name: String,
    pub device_id: u8,
    pub track_id: u32,
    pub track_device_id: u8,
    pub track_slot: u8,
    pub track_type: u8,
    pub is_playing: bool,
    pub is_on_air: bool,
    pub is_master: bool,
    pub is_sync: bool,
    pub play_state: Option<PlayState>,
    pub bpm: Option<f32>,
    /// Pitch adjustment in percent.
    pub pitch: f32,
    pub beat: Option<u32>,
    pub beat_in_bar: u8,
    pub packet_num: u32,
    /// Local arrival time.
    #[serde(skip)]
    pub timestamp: Instant,
}

impl DeviceStatus {
    pub fn track(&self) -> TrackRef {
        TrackRef {
            device_id: self.track_device_id,
            slot: self.track_slot,
            track_type: self.track_type,
            track_id: self.track_id,
        }
    }

    /// Decodes a CDJ status packet received at `timestamp`.
    pub fn parse(data: &[u8], timestamp: Instant) -> Result<DeviceStatus> {
        let (_, status) = Self::parse_packet(timestamp)(data)
            .map_err(|e| anyhow!("error parsing status packet: {:?}", e))?;
        Ok(status)
    }

    fn parse_packet(timestamp: Instant) -> impl Fn(&[u8]) -> IResult<&[u8], DeviceStatus> {
        move |i: &[u8]| -> IResult<&[u8], DeviceStatus> {
            let (i, _) = tag(HEADER)(i)?;
            let (i, _) = tag(&[CDJ_STATUS_TYPE])(i)?;
            let (i, raw_name) = take(20usize)(i)?;
            let name = String::from_utf8_lossy(raw_name)
                .trim_end_matches('\0')
                .to_string();
            let (i, _) = tag(&[0x01])(i)?;
            let (i, _proto_ver) = be_u8(i)?;
            let (i, device_id) = be_u8(i)?;
            let (i, _len) = be_u16(i)?;

            // 0x24
            let (i, _) = take(4usize)(i)?;
            let (i, track_device_id) = be_u8(i)?;
            let (i, track_slot) = be_u8(i)?;
            let (i, track_type) = be_u8(i)?;
            let (i, _) = take(1usize)(i)?;

            // 0x2c
            let (i, track_id) = be_u32(i)?;
            let (i, _) = take(0x4busize)(i)?;

            // 0x7b
            let (i, play_state) = be_u8(i)?;
            let (i, _) = take(0x0dusize)(i)?;

            // 0x89
            let (i, flags) = be_u8(i)?;
            let (i, _) = take(2usize)(i)?;

            // 0x8c
            let (i, pitch_raw) = be_u32(i)?;
            let (i, _) = take(2usize)(i)?;
            let (i, bpm_raw) = be_u16(i)?;
            let (i, _) = take(0x0cusize)(i)?;

            // 0xa0
            let (i, beat) = be_u32(i)?;
            let (i, _) = take(2usize)(i)?;
            let (i, beat_in_bar) = be_u8(i)?;
            let (i, _) = take(0x21usize)(i)?;

            // 0xc8
            let (i, packet_num) = be_u32(i)?;

            Ok((
                i,
                DeviceStatus {
                    name,
                    device_id,
                    track_id,
                    track_device_id,
                    track_slot,
                    track_type,
                    is_playing: flags & FLAG_PLAYING != 0,
                    is_on_air: flags & FLAG_ON_AIR != 0,
                    is_master: flags & FLAG_MASTER != 0,
                    is_sync: flags & FLAG_SYNC != 0,
                    play_state: PlayState::from_u8(play_state),
                    bpm: if bpm_raw == NO_BPM {
                        None
                    } else {
                        Some(bpm_raw as f32 / 100.0)
                    },
                    pitch: (pitch_raw as f32 - PITCH_NORMAL) / PITCH_NORMAL * 100.0,
                    beat: if beat == NO_BEAT { None } else { Some(beat) },
                    beat_in_bar,
                    packet_num,
                    timestamp,
                },
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_packet() -> Vec<u8> {
        let mut data = vec![0u8; 0xd4];
        data[0..10].copy_from_slice(HEADER);
        data[0x0a] = CDJ_STATUS_TYPE;
        data[0x0b..0x0b + 12].copy_from_slice(b"CDJ-2000NXS2");
        data[0x1f] = 0x01;
        data[0x20] = 0x03;
        data[0x21] = 2;
        data[0x22..0x24].copy_from_slice(&0x00b0u16.to_be_bytes());
        data[0x24] = 2;
        data[0x28] = 3;
        data[0x29] = 3;
        data[0x2a] = 1;
        data[0x2c..0x30].copy_from_slice(&1234u32.to_be_bytes());
        data[0x7b] = PlayState::Playing as u8;
        data[0x89] = FLAG_PLAYING | FLAG_ON_AIR | FLAG_MASTER;
        data[0x8c..0x90].copy_from_slice(&0x100000u32.to_be_bytes());
        data[0x92..0x94].copy_from_slice(&12800u16.to_be_bytes());
        data[0xa0..0xa4].copy_from_slice(&57u32.to_be_bytes());
        data[0xa6] = 1;
        data[0xc8..0xcc].copy_from_slice(&0x2a2au32.to_be_bytes());
        data
    }

    #[test]
    fn test_parse_status() {
        let now = Instant::now();
        let status = DeviceStatus::parse(&status_packet(), now).unwrap();

        assert_eq!(
            status,
            DeviceStatus {
                name: "CDJ-2000NXS2".to_string(),
                device_id: 2,
                track_id: 1234,
                track_device_id: 3,
                track_slot: 3,
                track_type: 1,
                is_playing: true,
                is_on_air: true,
                is_master: true,
                is_sync: false,
                play_state: Some(PlayState::Playing),
                bpm: Some(128.0),
                pitch: 0.0,
                beat: Some(57),
                beat_in_bar: 1,
                packet_num: 0x2a2a,
                timestamp: now,
            }
        );
        assert_eq!(
            status.track(),
            TrackRef {
                device_id: 3,
                slot: 3,
                track_type: 1,
                track_id: 1234,
            }
        );
    }

    #[test]
    fn test_parse_empty_deck() {
        let mut data = status_packet();
        data[0x2c..0x30].copy_from_slice(&[0; 4]);
        data[0x7b] = PlayState::Empty as u8;
        data[0x89] = 0;
        data[0x92..0x94].copy_from_slice(&[0xff, 0xff]);
        data[0xa0..0xa4].copy_from_slice(&[0xff; 4]);
        // +8% pitch
        data[0x8c..0x90].copy_from_slice(&0x00114800u32.to_be_bytes());

        let status = DeviceStatus::parse(&data, Instant::now()).unwrap();
        assert_eq!(status.track_id, 0);
        assert_eq!(status.play_state, Some(PlayState::Empty));
        assert!(!status.is_playing);
        assert!(!status.is_on_air);
        assert_eq!(status.bpm, None);
        assert_eq!(status.beat, None);
        assert!((status.pitch - 8.0).abs() < 0.01);
    }

    #[test]
    fn test_parse_rejects_bad_packets() {
        let mut wrong_type = status_packet();
        wrong_type[0x0a] = 0x29;
        assert!(DeviceStatus::parse(&wrong_type, Instant::now()).is_err());

        let short = &status_packet()[..0xc0];
        assert!(DeviceStatus::parse(short, Instant::now()).is_err());

        assert!(DeviceStatus::parse(&[0u8], Instant::now()).is_err());
    }
}
