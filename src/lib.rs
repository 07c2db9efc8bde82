/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

//! # Stagecast
//!
//! Core of a low-latency multi-party live audio conferencing server. Each
//! performer streams stereo Opus over encrypted UDP; the server time-aligns
//! every stream against its sample clock, mixes each performer a
//! personalized bus, and streams it back — with forward error correction on
//! the wire and adaptive time-stretch keeping the read cursors locked to a
//! target lag.

pub mod board;
pub mod buffer;
pub mod client;
pub mod codec;
pub mod crypto;
pub mod cursor;
pub mod error;
pub mod event_loop;
pub mod formats;
pub mod receiver;
pub mod sender;
pub mod server;
pub mod statistics;
pub mod time_stretch;

pub use error::{Result, StagecastError};
pub use formats::{AudioFrame, Packet};
pub use server::{Server, ServerConfig};

/// Stereo, 48 kHz.
pub const SAMPLE_RATE: u32 = 48_000;
/// Samples per channel in one minimum-latency Opus frame (2.5 ms).
pub const SAMPLES_PER_FRAME: usize = 120;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_functionality() {
        let mut sender = sender::NetworkSender::new().unwrap();
        let receiver = receiver::NetworkReceiver::new().unwrap();

        assert_eq!(sender.next_frame_index(), 0);
        assert_eq!(receiver.next_frame_needed(), 0);

        let section = receiver.set_receiver_section();
        assert!(section.packets_received.is_empty());
        sender.receive_receiver_section(&section).unwrap();
    }
}
