//! Sahara handshake: identify the device and upload the programmer.
//!
//! The device drives the transfer. After its hello, it asks for
//! `(image, offset, length)` slices until it reports end-of-image, and
//! the host only answers. A successful run yields a [`Handoff`], which is
//! the only way to build a Firehose engine on the same channel.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Cursor;
use std::time::Duration;

use byteorder::{LittleEndian, ReadBytesExt};
use thiserror::Error;
use tracing::{debug, info, instrument, trace};

use super::constants::*;
use crate::events::{ProgressEvent, QdlEvent, QdlObserver};
use crate::transport::{Channel, TransportError};

#[derive(Error, Debug)]
pub enum SaharaError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Malformed packet: {0}")]
    Malformed(String),
    #[error("Unexpected command 0x{got:02X} while {state}")]
    UnexpectedCommand { got: u32, state: &'static str },
    #[error("Unsupported Sahara mode {0}")]
    UnsupportedMode(u32),
    #[error("Device requested unknown image id {0}")]
    UnsupportedImage(u64),
    #[error("Read of {length} bytes at {offset} exceeds image {image} ({size} bytes)")]
    OutOfRange {
        image: u64,
        offset: u64,
        length: u64,
        size: usize,
    },
    #[error("Device rejected image {image} with status {status}")]
    ImageRejected { image: u64, status: u32 },
    #[error("Device reported transfer status {0} on done")]
    DoneRejected(u32),
}

impl From<std::io::Error> for SaharaError {
    fn from(e: std::io::Error) -> Self {
        SaharaError::Malformed(e.to_string())
    }
}

/// Images the host can serve, keyed by Sahara image id.
#[derive(Debug, Clone, Default)]
pub struct SaharaImages {
    images: BTreeMap<u64, Vec<u8>>,
}

impl SaharaImages {
    /// Serve `data` as the Firehose programmer.
    pub fn programmer(data: Vec<u8>) -> Self {
        let mut images = Self::default();
        images.insert(SAHARA_PROGRAMMER_IMAGE_ID, data);
        images
    }

    pub fn insert(&mut self, id: u64, data: Vec<u8>) {
        self.images.insert(id, data);
    }

    pub fn get(&self, id: u64) -> Option<&[u8]> {
        self.images.get(&id).map(Vec::as_slice)
    }
}

/// Fields of the device hello.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    pub version: u32,
    pub version_compatible: u32,
    pub max_cmd_len: u32,
    pub mode: u32,
}

/// Handshake state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaharaState {
    Idle,
    AwaitingHello,
    Negotiating { hello: Hello },
    ImageUpload { image: Option<u64>, served: u64 },
    HandoffComplete,
    Failed,
}

impl SaharaState {
    fn name(&self) -> &'static str {
        match self {
            SaharaState::Idle => "idle",
            SaharaState::AwaitingHello => "awaiting hello",
            SaharaState::Negotiating { .. } => "negotiating",
            SaharaState::ImageUpload { .. } => "uploading image",
            SaharaState::HandoffComplete => "handed off",
            SaharaState::Failed => "failed",
        }
    }
}

impl fmt::Display for SaharaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Device-to-host packets.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Packet {
    Hello(Hello),
    /// `cmd` is READ_DATA or READ_DATA_64.
    ReadData {
        cmd: u32,
        image: u64,
        offset: u64,
        length: u64,
    },
    EndOfImage { image: u64, status: u32 },
    DoneResp { status: u32 },
    Other(u32),
}

fn parse_packet(bytes: &[u8]) -> Result<Packet, SaharaError> {
    if bytes.len() < 8 {
        return Err(SaharaError::Malformed(format!(
            "{} byte packet is shorter than the header",
            bytes.len()
        )));
    }
    let mut cur = Cursor::new(bytes);
    let cmd = cur.read_u32::<LittleEndian>()?;
    let len = cur.read_u32::<LittleEndian>()? as usize;
    if len < 8 || len > bytes.len() {
        return Err(SaharaError::Malformed(format!(
            "command 0x{cmd:02X} declares {len} bytes, got {}",
            bytes.len()
        )));
    }

    let need = |min: usize| -> Result<(), SaharaError> {
        if len < min {
            Err(SaharaError::Malformed(format!(
                "command 0x{cmd:02X} needs {min} bytes, declares {len}"
            )))
        } else {
            Ok(())
        }
    };

    let packet = match cmd {
        SAHARA_HELLO => {
            need(SAHARA_HELLO_LEN)?;
            Packet::Hello(Hello {
                version: cur.read_u32::<LittleEndian>()?,
                version_compatible: cur.read_u32::<LittleEndian>()?,
                max_cmd_len: cur.read_u32::<LittleEndian>()?,
                mode: cur.read_u32::<LittleEndian>()?,
            })
        }
        SAHARA_READ_DATA => {
            need(SAHARA_READ_DATA_LEN)?;
            Packet::ReadData {
                cmd,
                image: cur.read_u32::<LittleEndian>()? as u64,
                offset: cur.read_u32::<LittleEndian>()? as u64,
                length: cur.read_u32::<LittleEndian>()? as u64,
            }
        }
        SAHARA_READ_DATA_64 => {
            need(SAHARA_READ_DATA_64_LEN)?;
            Packet::ReadData {
                cmd,
                image: cur.read_u64::<LittleEndian>()?,
                offset: cur.read_u64::<LittleEndian>()?,
                length: cur.read_u64::<LittleEndian>()?,
            }
        }
        SAHARA_END_OF_IMAGE => {
            need(SAHARA_END_OF_IMAGE_LEN)?;
            Packet::EndOfImage {
                image: cur.read_u32::<LittleEndian>()? as u64,
                status: cur.read_u32::<LittleEndian>()?,
            }
        }
        SAHARA_DONE_RESP => {
            need(SAHARA_DONE_RESP_LEN)?;
            Packet::DoneResp {
                status: cur.read_u32::<LittleEndian>()?,
            }
        }
        other => Packet::Other(other),
    };
    Ok(packet)
}

fn hello_response(mode: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(SAHARA_HELLO_LEN);
    for word in [
        SAHARA_HELLO_RESP,
        SAHARA_HELLO_LEN as u32,
        SAHARA_VERSION,
        SAHARA_VERSION_COMPATIBLE,
        0, // status
        mode,
    ] {
        buf.extend_from_slice(&word.to_le_bytes());
    }
    buf.resize(SAHARA_HELLO_LEN, 0);
    buf
}

fn done_request() -> Vec<u8> {
    let mut buf = Vec::with_capacity(SAHARA_DONE_LEN);
    buf.extend_from_slice(&SAHARA_DONE.to_le_bytes());
    buf.extend_from_slice(&(SAHARA_DONE_LEN as u32).to_le_bytes());
    buf
}

/// Channel that finished Sahara and now speaks Firehose.
pub struct Handoff<C> {
    pub(super) channel: C,
}

impl<C> Handoff<C> {
    /// Treat `channel` as already running a programmer.
    #[cfg(test)]
    pub(crate) fn assume_programmer_running(channel: C) -> Self {
        Self { channel }
    }
}

/// Sahara state machine over one channel.
pub struct Sahara<'a, C: Channel, O: QdlObserver> {
    channel: C,
    observer: &'a O,
    state: SaharaState,
    timeout: Duration,
}

impl<'a, C: Channel, O: QdlObserver> Sahara<'a, C, O> {
    pub fn new(channel: C, observer: &'a O, timeout: Duration) -> Self {
        Self {
            channel,
            observer,
            state: SaharaState::Idle,
            timeout,
        }
    }

    pub fn state(&self) -> &SaharaState {
        &self.state
    }

    fn goto(&mut self, next: SaharaState) {
        debug!(from = %self.state, to = %next, "Sahara transition");
        self.state = next;
    }

    /// Run the handshake to completion. Any failure is final.
    #[instrument(skip_all, name = "sahara")]
    pub fn run(mut self, images: &SaharaImages) -> Result<Handoff<C>, SaharaError> {
        self.goto(SaharaState::AwaitingHello);
        loop {
            match self.step(images) {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => {
                    self.goto(SaharaState::Failed);
                    return Err(e);
                }
            }
        }
        info!("Programmer running, handing off to Firehose");
        Ok(Handoff {
            channel: self.channel,
        })
    }

    fn read_packet(&mut self) -> Result<Packet, SaharaError> {
        let bytes = self.channel.read(SAHARA_MAX_PACKET, self.timeout)?;
        trace!(len = bytes.len(), "Sahara packet");
        parse_packet(&bytes)
    }

    /// Advance one state. Returns `true` once handed off.
    fn step(&mut self, images: &SaharaImages) -> Result<bool, SaharaError> {
        match self.state.clone() {
            SaharaState::Idle => {
                self.goto(SaharaState::AwaitingHello);
                Ok(false)
            }
            SaharaState::AwaitingHello => match self.read_packet()? {
                Packet::Hello(hello) => {
                    info!(
                        version = hello.version,
                        mode = hello.mode,
                        max_cmd_len = hello.max_cmd_len,
                        "Sahara hello"
                    );
                    self.goto(SaharaState::Negotiating { hello });
                    Ok(false)
                }
                other => Err(self.unexpected(&other)),
            },
            SaharaState::Negotiating { hello } => {
                if hello.mode != SAHARA_MODE_IMAGE_TX_PENDING {
                    return Err(SaharaError::UnsupportedMode(hello.mode));
                }
                self.channel
                    .write_all(&hello_response(hello.mode), self.timeout)?;
                self.goto(SaharaState::ImageUpload {
                    image: None,
                    served: 0,
                });
                Ok(false)
            }
            SaharaState::ImageUpload { image, served } => match self.read_packet()? {
                Packet::ReadData {
                    image: id,
                    offset,
                    length,
                    ..
                } => {
                    let served = self.serve(images, id, offset, length, served)?;
                    self.goto(SaharaState::ImageUpload {
                        image: Some(id),
                        served,
                    });
                    Ok(false)
                }
                Packet::EndOfImage { image: id, status } => {
                    if status != 0 {
                        return Err(SaharaError::ImageRejected { image: id, status });
                    }
                    debug!(image = id, ?image, "End of image");
                    self.channel.write_all(&done_request(), self.timeout)?;
                    match self.read_packet()? {
                        Packet::DoneResp { status: 0 } => {}
                        Packet::DoneResp { status } => {
                            return Err(SaharaError::DoneRejected(status));
                        }
                        other => return Err(self.unexpected(&other)),
                    }
                    self.goto(SaharaState::HandoffComplete);
                    Ok(true)
                }
                other => Err(self.unexpected(&other)),
            },
            SaharaState::HandoffComplete => Ok(true),
            SaharaState::Failed => Err(SaharaError::Malformed("handshake already failed".into())),
        }
    }

    fn serve(
        &mut self,
        images: &SaharaImages,
        id: u64,
        offset: u64,
        length: u64,
        served: u64,
    ) -> Result<u64, SaharaError> {
        let data = images.get(id).ok_or(SaharaError::UnsupportedImage(id))?;
        let end = offset.checked_add(length).filter(|&e| e <= data.len() as u64);
        let Some(end) = end else {
            return Err(SaharaError::OutOfRange {
                image: id,
                offset,
                length,
                size: data.len(),
            });
        };

        debug!(image = id, offset, length, "Serving image slice");
        self.channel
            .write_all(&data[offset as usize..end as usize], self.timeout)?;

        let total = data.len() as u64;
        let served = served.max(end).min(total);
        self.observer
            .on_event(&QdlEvent::Progress(ProgressEvent::new("programmer", served, total)));
        Ok(served)
    }

    fn unexpected(&self, packet: &Packet) -> SaharaError {
        let got = match packet {
            Packet::Hello(_) => SAHARA_HELLO,
            Packet::ReadData { cmd, .. } => *cmd,
            Packet::EndOfImage { .. } => SAHARA_END_OF_IMAGE,
            Packet::DoneResp { .. } => SAHARA_DONE_RESP,
            Packet::Other(cmd) => *cmd,
        };
        SaharaError::UnexpectedCommand {
            got,
            state: self.state.name(),
        }
    }
}
