//! Scream protocol framing
//!
//! One UDP datagram per chunk: a 5-byte header followed by raw PCM.
//! Header layout:
//!   byte 0: sample rate; high bit set = 48k family with the low 7 bits
//!           rate/1000, clear = 44.1k family with the low 7 bits
//!           rate/1102.5
//!   byte 1: bit depth
//!   byte 2: channel count
//!   bytes 3-4: WAVEFORMATEX channel mask, little-endian

use std::io;
use std::net::{SocketAddr, UdpSocket};

use sr_core::AudioFormat;

pub const SCREAM_HEADER_LEN: usize = 5;

/// Decoded Scream header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreamHeader {
    pub sample_rate: u32,
    pub bit_depth: u16,
    pub channels: u16,
    pub channel_layout: u16,
}

impl ScreamHeader {
    pub fn new(format: AudioFormat, channel_layout: u16) -> Self {
        Self {
            sample_rate: format.sample_rate,
            bit_depth: format.bit_depth,
            channels: format.channels,
            channel_layout,
        }
    }

    fn rate_byte(rate: u32) -> u8 {
        if rate % 44100 == 0 {
            (rate as f64 / 1102.5) as u8 & 0x7F
        } else {
            0x80 | ((rate / 1000) as u8 & 0x7F)
        }
    }

    fn rate_from_byte(byte: u8) -> u32 {
        if byte & 0x80 != 0 {
            u32::from(byte & 0x7F) * 1000
        } else {
            (f64::from(byte & 0x7F) * 1102.5) as u32
        }
    }

    pub fn to_bytes(&self) -> [u8; SCREAM_HEADER_LEN] {
        let layout = self.channel_layout.to_le_bytes();
        [
            Self::rate_byte(self.sample_rate),
            self.bit_depth as u8,
            self.channels as u8,
            layout[0],
            layout[1],
        ]
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < SCREAM_HEADER_LEN {
            return None;
        }
        Some(Self {
            sample_rate: Self::rate_from_byte(bytes[0]),
            bit_depth: u16::from(bytes[1]),
            channels: u16::from(bytes[2]),
            channel_layout: u16::from_le_bytes([bytes[3], bytes[4]]),
        })
    }
}

/// Scream payload sender: header + chunk, one datagram each
pub struct ScreamSender {
    socket: Option<UdpSocket>,
    header: [u8; SCREAM_HEADER_LEN],
    packet: Vec<u8>,
}

impl ScreamSender {
    pub fn new(
        dest: SocketAddr,
        format: AudioFormat,
        channel_layout: u16,
        max_payload: usize,
    ) -> io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect(dest)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket: Some(socket),
            header: ScreamHeader::new(format, channel_layout).to_bytes(),
            packet: Vec::with_capacity(SCREAM_HEADER_LEN + max_payload),
        })
    }

    pub fn send(&mut self, payload: &[u8]) -> io::Result<()> {
        let Some(socket) = &self.socket else {
            return Ok(());
        };
        self.packet.clear();
        self.packet.extend_from_slice(&self.header);
        self.packet.extend_from_slice(payload);
        socket.send(&self.packet)?;
        Ok(())
    }

    pub fn stop(&mut self) {
        self.socket = None;
    }
}
