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

//! Per-component counters, aggregated into the periodic server summary.

use serde::{Deserialize, Serialize};

/// Outgoing-side counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SenderStatistics {
    /// Frames evicted unsent because the window filled
    pub frames_dropped: u64,
    /// Packets composed and handed to the socket
    pub packets_sent: u64,
    /// Frames confirmed received by the peer
    pub frames_acked: u64,
}

/// Incoming-side counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReceiverStatistics {
    /// Frames that arrived behind the window (already consumed)
    pub already_acked: u64,
    /// Frames that arrived more than once
    pub redundant: u64,
    /// Window slots vacated while still empty (permanently lost frames)
    pub dropped: u64,
    /// Frames consumed by the cursor
    pub popped: u64,
}

/// Read-cursor counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CursorStatistics {
    pub frames_decoded: u64,
    /// Frames synthesized by packet-loss concealment
    pub frames_concealed: u64,
    /// Ticks with nothing safe to read
    pub stalls: u64,
    /// Stretcher output that missed the board window
    pub spilled: u64,
    pub resets: u64,
}

/// AEAD session counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CryptoStatistics {
    pub decrypt_failures: u64,
    pub replays: u64,
}

/// Handshake counters per known client
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandshakeStatistics {
    pub key_requests: u64,
    pub key_responses: u64,
    pub new_sessions: u64,
}

/// Whole-server counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerStatistics {
    /// Datagrams no known client claimed
    pub invalid_datagrams: u64,
    /// Clock rounds executed
    pub rounds: u64,
    /// Clock rounds abandoned while catching up after a long stall
    pub skipped_rounds: u64,
    pub socket_recoveries: u64,
}
