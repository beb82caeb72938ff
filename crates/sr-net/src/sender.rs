//! Polymorphism over the two sender kinds
//!
//! A tagged variant instead of a trait object: the set of protocols is
//! closed and the mixer owns its sender by value.

use std::io;
use std::net::SocketAddr;

use sr_core::AudioFormat;

use crate::{RtpSender, ScreamSender, RTP_PAYLOAD_TYPE_MP3, RTP_PAYLOAD_TYPE_PCM};

pub enum NetworkSender {
    Scream(ScreamSender),
    Rtp(RtpSender),
}

impl NetworkSender {
    pub fn scream(
        dest: SocketAddr,
        format: AudioFormat,
        channel_layout: u16,
        max_payload: usize,
    ) -> io::Result<Self> {
        Ok(Self::Scream(ScreamSender::new(
            dest,
            format,
            channel_layout,
            max_payload,
        )?))
    }

    pub fn rtp(dest: SocketAddr, mp3_payload: bool, max_payload: usize) -> io::Result<Self> {
        let pt = if mp3_payload {
            RTP_PAYLOAD_TYPE_MP3
        } else {
            RTP_PAYLOAD_TYPE_PCM
        };
        Ok(Self::Rtp(RtpSender::new(dest, pt, max_payload)?))
    }

    /// Emit one chunk. Scream ignores the RTP fields; RTP stamps them.
    pub fn send(
        &mut self,
        payload: &[u8],
        rtp_timestamp: u32,
        marker: bool,
    ) -> io::Result<()> {
        match self {
            Self::Scream(sender) => sender.send(payload),
            Self::Rtp(sender) => sender.send(payload, rtp_timestamp, marker),
        }
    }

    pub fn stop(&mut self) {
        match self {
            Self::Scream(sender) => sender.stop(),
            Self::Rtp(sender) => sender.stop(),
        }
    }
}
