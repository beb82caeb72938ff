//! sr-net: wire formats and UDP payload senders
//!
//! Two egress protocols share one `send` contract:
//! - Scream: 5-byte format header + PCM payload in a single datagram
//! - RTP: 12-byte fixed header, per-session SSRC, wrapping sequence
//!
//! Senders own their sockets and are owned by their mixers; `stop()`
//! releases the socket and further sends become no-ops.

mod pcm;
mod rtp;
mod scream;
mod sender;

pub use pcm::encode_payload;
pub use rtp::{RtpHeader, RtpSender, RTP_PAYLOAD_TYPE_MP3, RTP_PAYLOAD_TYPE_PCM};
pub use scream::{ScreamHeader, ScreamSender};
pub use sender::NetworkSender;
