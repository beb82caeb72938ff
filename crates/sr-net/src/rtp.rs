//! RTP framing and sender
//!
//! Fixed 12-byte header, network byte order. The sender keeps a random
//! per-session SSRC and a wrapping 16-bit sequence; the marker bit goes out
//! on the first packet after silence or a format change.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::SystemTime;

/// Dynamic payload type used for linear PCM
pub const RTP_PAYLOAD_TYPE_PCM: u8 = 96;
/// Static payload type for MPEG audio sinks
pub const RTP_PAYLOAD_TYPE_MP3: u8 = 14;

const RTP_HEADER_LEN: usize = 12;

/// RTP fixed header
#[derive(Debug, Clone, Copy, Default)]
pub struct RtpHeader {
    /// Version, padding, extension, CSRC count
    pub vpxcc: u8,
    /// Marker and payload type
    pub mpt: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    pub fn new(payload_type: u8, sequence: u16, timestamp: u32, ssrc: u32) -> Self {
        Self {
            vpxcc: 0x80, // version 2, no padding, no extension, 0 CSRC
            mpt: payload_type & 0x7F,
            sequence,
            timestamp,
            ssrc,
        }
    }

    pub fn with_marker(mut self) -> Self {
        self.mpt |= 0x80;
        self
    }

    pub fn marker(&self) -> bool {
        self.mpt & 0x80 != 0
    }

    pub fn to_bytes(&self) -> [u8; RTP_HEADER_LEN] {
        let seq = self.sequence.to_be_bytes();
        let ts = self.timestamp.to_be_bytes();
        let ssrc = self.ssrc.to_be_bytes();
        [
            self.vpxcc, self.mpt, seq[0], seq[1], ts[0], ts[1], ts[2], ts[3], ssrc[0], ssrc[1],
            ssrc[2], ssrc[3],
        ]
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < RTP_HEADER_LEN {
            return None;
        }
        Some(Self {
            vpxcc: bytes[0],
            mpt: bytes[1],
            sequence: u16::from_be_bytes([bytes[2], bytes[3]]),
            timestamp: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
            ssrc: u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
        })
    }
}

/// RTP payload sender with per-session SSRC and sequence state
pub struct RtpSender {
    socket: Option<UdpSocket>,
    payload_type: u8,
    sequence: u16,
    ssrc: u32,
    packet: Vec<u8>,
}

impl RtpSender {
    pub fn new(dest: SocketAddr, payload_type: u8, max_payload: usize) -> io::Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect(dest)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket: Some(socket),
            payload_type,
            sequence: (session_entropy() & 0xFFFF) as u16,
            ssrc: session_entropy(),
            packet: Vec::with_capacity(RTP_HEADER_LEN + max_payload),
        })
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn send(&mut self, payload: &[u8], rtp_timestamp: u32, marker: bool) -> io::Result<()> {
        let Some(socket) = &self.socket else {
            return Ok(());
        };
        let mut header = RtpHeader::new(self.payload_type, self.sequence, rtp_timestamp, self.ssrc);
        if marker {
            header = header.with_marker();
        }
        self.packet.clear();
        self.packet.extend_from_slice(&header.to_bytes());
        self.packet.extend_from_slice(payload);
        socket.send(&self.packet)?;
        self.sequence = self.sequence.wrapping_add(1);
        Ok(())
    }

    pub fn stop(&mut self) {
        self.socket = None;
    }
}

/// Session entropy for SSRC and the sequence start
fn session_entropy() -> u32 {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    (nanos ^ (nanos >> 32)) as u32
}
