use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use anyhow::anyhow;
use log::debug;
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use serde::Serialize;
use strum::Display;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream},
    net::TcpStream,
};

use crate::{
    field::{read_field_limited, Field, FieldType},
    status::TrackRef,
    Result,
};

const METADATA_PORT_LOOKUP_PORT: u16 = 12523;
const MESSAGE_MAGIC: u32 = 0x872349ae;
const SETUP_TX_ID: u32 = 0xfffffffe;
const MAX_ARGS: usize = 12;

const MSG_SETUP: u16 = 0x0000;
const MSG_METADATA_REQUEST: u16 = 0x2002;
const MSG_ARTWORK_REQUEST: u16 = 0x2003;
const MSG_RENDER_MENU: u16 = 0x3000;
const MSG_SUCCESS: u16 = 0x4000;
const MSG_MENU_HEADER: u16 = 0x4001;
const MSG_ARTWORK: u16 = 0x4002;
const MSG_MENU_ITEM: u16 = 0x4101;
const MSG_MENU_FOOTER: u16 = 0x4201;

const MENU_MAIN: u8 = 0x01;
const MENU_DATA: u8 = 0x08;

#[derive(Clone, Copy, Debug, Display, FromPrimitive, PartialEq)]
#[repr(u32)]
enum MenuItemType {
    AlbumTitle = 0x0002,
    TrackTitle = 0x0004,
    Genre = 0x0006,
    Artist = 0x0007,
    Rating = 0x000a,
    Duration = 0x000b,
    Tempo = 0x000d,
    Label = 0x000e,
    Key = 0x000f,
    BitRate = 0x0010,
    Year = 0x0011,
    ColorNone = 0x0013,
    ColorPink = 0x0014,
    ColorRed = 0x0015,
    ColorOrange = 0x0016,
    ColorYellow = 0x0017,
    ColorGreen = 0x0018,
    ColorAqua = 0x0019,
    ColorBlue = 0x001a,
    ColorPurple = 0x001b,
    Comment = 0x0023,
    OriginalArtist = 0x0028,
    Remixer = 0x0029,
    DateAdded = 0x002e,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TrackMetadata {
    pub title: String,
    pub artist: String,
    pub album: String,
    pub genre: String,
    pub label: String,
    pub key: String,
    pub comment: String,
    pub original_artist: String,
    pub remixer: String,
    pub date_added: String,
    pub color: Option<String>,
    /// Seconds.
    pub duration: u32,
    pub tempo: f32,
    pub rating: u32,
    pub bitrate: u32,
    pub year: u32,
    pub artwork_id: Option<u32>,
}

impl TrackMetadata {
    fn apply(&mut self, item: &Message) -> Result<()> {
        let item_type = match MenuItemType::from_u32(item.arg_u32(6)?) {
            Some(t) => t,
            None => return Ok(()),
        };
        let number = item.arg_u32(1)?;
        let text = item.arg_string(3)?.trim_end_matches('\0').to_string();

        match item_type {
            MenuItemType::TrackTitle => {
                self.title = text;
                let artwork_id = item.arg_u32(8)?;
                if artwork_id > 0 {
                    self.artwork_id = Some(artwork_id);
                }
            }
            MenuItemType::Artist => self.artist = text,
            MenuItemType::AlbumTitle => self.album = text,
            MenuItemType::Genre => self.genre = text,
            MenuItemType::Label => self.label = text,
            MenuItemType::Key => self.key = text,
            MenuItemType::Comment => self.comment = text,
            MenuItemType::OriginalArtist => self.original_artist = text,
            MenuItemType::Remixer => self.remixer = text,
            MenuItemType::DateAdded => self.date_added = text,
            MenuItemType::Duration => self.duration = number,
            MenuItemType::Tempo => self.tempo = number as f32 / 100.0,
            MenuItemType::Rating => self.rating = number,
            MenuItemType::BitRate => self.bitrate = number,
            MenuItemType::Year => self.year = number,
            MenuItemType::ColorNone => self.color = None,
            color => {
                self.color = Some(if text.is_empty() {
                    color.to_string()
                } else {
                    text
                })
            }
        }
        Ok(())
    }
}

#[derive(Debug, PartialEq)]
struct Message {
    tx_id: u32,
    ty: u16,
    args: Vec<Field>,
}

impl Message {
    fn new(tx_id: u32, ty: u16, args: Vec<Field>) -> Result<Message> {
        if args.len() > MAX_ARGS {
            return Err(anyhow!("too many args").into());
        }

        Ok(Message { tx_id, ty, args })
    }

    fn arg_tags(&self) -> Result<Vec<u8>> {
        let mut tags = vec![0u8; MAX_ARGS];
        for (tag, arg) in tags.iter_mut().zip(&self.args) {
            *tag = match arg {
                Field::UInt32(_) => 0x06,
                Field::Binary(_) => 0x03,
                Field::String(_) => 0x02,
                _ => return Err(anyhow!("no known tag for field {:?}", arg).into()),
            };
        }
        Ok(tags)
    }

    fn arg(&self, idx: usize) -> Result<&Field> {
        self.args
            .get(idx)
            .ok_or_else(|| anyhow!("index {} out of range", idx).into())
    }

    fn arg_u32(&self, idx: usize) -> Result<u32> {
        match self.arg(idx)? {
            Field::UInt32(val) => Ok(*val),
            arg => Err(anyhow!("wrong arg type {}", arg.field_type()).into()),
        }
    }

    fn arg_string(&self, idx: usize) -> Result<&str> {
        match self.arg(idx)? {
            Field::String(val) => Ok(val),
            arg => Err(anyhow!("wrong arg type {}", arg.field_type()).into()),
        }
    }

    fn arg_blob(&self, idx: usize) -> Result<&[u8]> {
        match self.arg(idx)? {
            Field::Binary(val) => Ok(val),
            arg => Err(anyhow!("wrong arg type {}", arg.field_type()).into()),
        }
    }

    fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        Field::UInt32(MESSAGE_MAGIC).encode(&mut data)?;
        Field::UInt32(self.tx_id).encode(&mut data)?;
        Field::UInt16(self.ty).encode(&mut data)?;
        Field::UInt8(self.args.len() as u8).encode(&mut data)?;
        Field::Binary(self.arg_tags()?).encode(&mut data)?;

        for arg in &self.args {
            arg.encode(&mut data)?;
        }

        Ok(data)
    }

    async fn read<R: AsyncRead + Unpin>(r: &mut R, max_len: u32) -> Result<Message> {
        let magic = read_field_limited(r, Some(FieldType::UInt32), max_len).await?;
        if magic != Field::UInt32(MESSAGE_MAGIC) {
            return Err(anyhow!("bad message magic {:?}", magic).into());
        }

        let tx_id = Self::read_number(r, FieldType::UInt32, max_len).await?;
        let ty = Self::read_number(r, FieldType::UInt16, max_len).await? as u16;
        let num_args = Self::read_number(r, FieldType::UInt8, max_len).await? as usize;
        if num_args > MAX_ARGS {
            return Err(anyhow!("message has {} args", num_args).into());
        }
        let _tags = read_field_limited(r, Some(FieldType::Binary), max_len).await?;

        let mut args = Vec::with_capacity(num_args);
        for _ in 0..num_args {
            args.push(read_field_limited(r, None, max_len).await?);
        }

        Ok(Message { tx_id, ty, args })
    }

    async fn read_number<R: AsyncRead + Unpin>(
        r: &mut R,
        ty: FieldType,
        max_len: u32,
    ) -> Result<u32> {
        let field = read_field_limited(r, Some(ty), max_len).await?;
        field
            .as_u32()
            .ok_or_else(|| anyhow!("{} field is not a number", ty).into())
    }
}

/// Asks a player which port its remote database listens on.
pub async fn lookup_port(ip: Ipv4Addr) -> Result<u16> {
    let addr = SocketAddr::new(IpAddr::V4(ip), METADATA_PORT_LOOKUP_PORT);
    let mut stream = TcpStream::connect(addr).await?;

    let msg = b"\x00\x00\x00\x0fRemoteDBServer\x00";
    stream.write_all(msg).await?;
    let port = stream.read_u16().await?;

    Ok(port)
}

/// Connection to a player's remote database.
pub struct MetadataClient<S = TcpStream> {
    stream: BufStream<S>,
    our_device_num: u8,
    tx_id: u32,
    max_field_len: u32,
}

impl MetadataClient<TcpStream> {
    pub async fn connect(ip: Ipv4Addr, our_device_num: u8, max_field_len: u32) -> Result<Self> {
        let port = lookup_port(ip).await?;
        debug!(target: "prolink", "remote database of {} on port {}", ip, port);
        let stream = TcpStream::connect(SocketAddr::new(IpAddr::V4(ip), port)).await?;
        Self::from_stream(stream, our_device_num, max_field_len).await
    }
}

impl<S> MetadataClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub async fn from_stream(stream: S, our_device_num: u8, max_field_len: u32) -> Result<Self> {
        let mut client = MetadataClient {
            stream: BufStream::new(stream),
            our_device_num,
            tx_id: 0,
            max_field_len,
        };

        let hello = Field::UInt32(1);
        client.write(&hello.to_bytes()?).await?;
        let reply =
            read_field_limited(&mut client.stream, Some(FieldType::UInt32), max_field_len).await?;
        if reply != hello {
            return Err(anyhow!("did not get connection reply from metadata server").into());
        }

        let setup = Message::new(
            SETUP_TX_ID,
            MSG_SETUP,
            vec![Field::UInt32(our_device_num as u32)],
        )?;
        client.write(&setup.to_bytes()?).await?;
        let response = client.read_message().await?;
        if response.ty != MSG_SUCCESS {
            return Err(anyhow!("metadata setup rejected with type 0x{:04x}", response.ty).into());
        }

        Ok(client)
    }

    /// Fetches metadata for `track`, `None` when the player does not know it.
    pub async fn track_metadata(&mut self, track: &TrackRef) -> Result<Option<TrackMetadata>> {
        let dmst = Field::dmst(self.our_device_num, MENU_MAIN, track.slot, track.track_type);
        self.send_message(
            MSG_METADATA_REQUEST,
            vec![dmst.clone(), Field::UInt32(track.track_id)],
        )
        .await?;

        let response = self.read_message().await?;
        if response.ty != MSG_SUCCESS
            || response.args.len() != 2
            || response.arg_u32(0)? != MSG_METADATA_REQUEST as u32
        {
            return Err(anyhow!("unexpected metadata response {:?}", response).into());
        }
        let num_items = response.arg_u32(1)?;
        if num_items == 0 || num_items == 0xffffffff {
            return Ok(None);
        }

        self.send_message(
            MSG_RENDER_MENU,
            vec![
                dmst,
                Field::UInt32(0),         // offset
                Field::UInt32(num_items), // limit
                Field::UInt32(0),
                Field::UInt32(num_items), // total
                Field::UInt32(0),
            ],
        )
        .await?;

        let mut metadata = TrackMetadata::default();
        loop {
            let item = self.read_message().await?;
            match item.ty {
                MSG_MENU_HEADER => (),
                MSG_MENU_ITEM => metadata.apply(&item)?,
                MSG_MENU_FOOTER => break,
                ty => return Err(anyhow!("unexpected menu message type 0x{:04x}", ty).into()),
            }
        }

        Ok(Some(metadata))
    }

    pub async fn artwork(&mut self, track: &TrackRef, artwork_id: u32) -> Result<Option<Vec<u8>>> {
        self.send_message(
            MSG_ARTWORK_REQUEST,
            vec![
                Field::dmst(self.our_device_num, MENU_DATA, track.slot, track.track_type),
                Field::UInt32(artwork_id),
            ],
        )
        .await?;

        let response = self.read_message().await?;
        if response.ty == MSG_ARTWORK && response.args.len() == 4 {
            Ok(Some(response.arg_blob(3)?.to_vec()))
        } else {
            Ok(None)
        }
    }

    async fn send_message(&mut self, ty: u16, args: Vec<Field>) -> Result<()> {
        self.tx_id += 1;
        let data = Message::new(self.tx_id, ty, args)?.to_bytes()?;
        self.write(&data).await
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn read_message(&mut self) -> Result<Message> {
        Message::read(&mut self.stream, self.max_field_len).await
    }
}
