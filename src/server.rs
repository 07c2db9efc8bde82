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

//! The multi-client server: one UDP socket, one sample clock, one board.
//!
//! Datagram dispatch tries each known client in turn; the clock rule advances
//! the cursor 120 samples at a time and runs every client's decode phase
//! before any mix phase, so all clients see the same cursor per round.

use std::net::{SocketAddr, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use crate::board::{AudioBoard, BOARD_CAPACITY};
use crate::client::KnownClient;
use crate::crypto::LongLivedKey;
use crate::error::Result;
use crate::statistics::ServerStatistics;
use crate::SAMPLES_PER_FRAME;

/// One clock round: 120 samples, 2.5 ms.
pub const TICK: Duration = Duration::from_micros(2500);
/// Board history kept behind the cursor (100 ms).
const KEEP_BEHIND: u64 = 4800;
/// Rounds executed at most per service call when catching up.
const MAX_CATCHUP_ROUNDS: u32 = 40;
/// Pending key offers older than this are rotated.
const STALE_OFFER_AGE: Duration = Duration::from_secs(30);

pub const STATS_INTERVAL: Duration = Duration::from_millis(500);
pub const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:9004".parse().expect("static address"),
        }
    }
}

pub struct Server {
    socket: UdpSocket,
    clients: Vec<KnownClient>,
    board: AudioBoard,
    cursor_sample: u64,
    next_tick: Instant,
    next_stats: Instant,
    next_housekeeping: Instant,
    stats: ServerStatistics,
}

impl Server {
    pub fn new(config: &ServerConfig, keys: Vec<LongLivedKey>) -> Result<Self> {
        let socket = UdpSocket::bind(config.listen)?;
        socket.set_nonblocking(true)?;
        log::info!(
            "listening on {} with {} known clients",
            socket.local_addr()?,
            keys.len()
        );

        let num_pairs = keys.len();
        let clients = keys
            .iter()
            .enumerate()
            .map(|(pair_index, key)| KnownClient::new(key, pair_index, num_pairs))
            .collect();

        let now = Instant::now();
        Ok(Self {
            socket,
            clients,
            board: AudioBoard::new(num_pairs, BOARD_CAPACITY)?,
            cursor_sample: 0,
            next_tick: now + TICK,
            next_stats: now + STATS_INTERVAL,
            next_housekeeping: now + HOUSEKEEPING_INTERVAL,
            stats: ServerStatistics::default(),
        })
    }

    pub fn socket_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    pub fn cursor_sample(&self) -> u64 {
        self.cursor_sample
    }

    pub fn clients(&self) -> &[KnownClient] {
        &self.clients
    }

    pub fn clients_mut(&mut self) -> &mut [KnownClient] {
        &mut self.clients
    }

    pub fn statistics(&self) -> &ServerStatistics {
        &self.stats
    }

    /// Drain the socket; every datagram is offered to each known client.
    pub fn receive_datagrams(&mut self) -> Result<()> {
        let mut buf = [0u8; 2048];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((len, source)) => self.dispatch_datagram(&buf[..len], source)?,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn dispatch_datagram(&mut self, datagram: &[u8], source: SocketAddr) -> Result<()> {
        let clock_sample = self.cursor_sample;
        for client in &mut self.clients {
            if client.receive(source, datagram, clock_sample, &self.socket)? {
                return Ok(());
            }
        }
        self.stats.invalid_datagrams += 1;
        log::debug!("unclaimed datagram from {source} ({} bytes)", datagram.len());
        Ok(())
    }

    pub fn tick_due(&self, now: Instant) -> bool {
        now >= self.next_tick
    }

    /// Advance the sample clock and run the per-client phases for every tick
    /// that has elapsed, bounding catch-up after a stall.
    pub fn service_clock(&mut self, now: Instant) -> Result<()> {
        let mut rounds = 0u32;
        while now >= self.next_tick {
            self.next_tick += TICK;
            if rounds >= MAX_CATCHUP_ROUNDS {
                self.stats.skipped_rounds += 1;
                continue;
            }
            rounds += 1;
            self.cursor_sample += SAMPLES_PER_FRAME as u64;
            self.run_round()?;
        }
        Ok(())
    }

    fn run_round(&mut self) -> Result<()> {
        let cursor_sample = self.cursor_sample;

        for client in &mut self.clients {
            if let Some(session) = client.session_mut() {
                session.decode_audio(cursor_sample, &mut self.board)?;
            }
        }
        for client in &mut self.clients {
            client.mix_and_encode(&self.board, cursor_sample, &self.socket)?;
        }

        self.board.advance(cursor_sample.saturating_sub(KEEP_BEHIND));
        self.stats.rounds += 1;
        Ok(())
    }

    pub fn note_socket_recovery(&mut self) {
        self.stats.socket_recoveries += 1;
    }

    pub fn stats_due(&self, now: Instant) -> bool {
        now >= self.next_stats
    }

    pub fn print_summary(&mut self, now: Instant) {
        self.next_stats = now + STATS_INTERVAL;
        let mut out = String::new();
        for client in &self.clients {
            client.summary(&mut out);
            out.push('\n');
        }
        log::info!(
            "cursor={} rounds={} skipped={} invalid={}\n{}",
            self.cursor_sample,
            self.stats.rounds,
            self.stats.skipped_rounds,
            self.stats.invalid_datagrams,
            out.trim_end()
        );
    }

    pub fn housekeeping_due(&self, now: Instant) -> bool {
        now >= self.next_housekeeping
    }

    /// Slow periodic work: rotate unclaimed key offers.
    pub fn housekeeping(&mut self, now: Instant) {
        self.next_housekeeping = now + HOUSEKEEPING_INTERVAL;
        for client in &mut self.clients {
            client.rotate_stale_offer(STALE_OFFER_AGE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{CryptoSession, KeyMessage, KEYREQ_ID, KEYREQ_SERVER_ID};
    use crate::formats::{AudioFrame, OpusPayload, Packet, SenderSection};

    fn test_server(keys: &[LongLivedKey]) -> Server {
        let config = ServerConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
        };
        Server::new(&config, keys.to_vec()).unwrap()
    }

    fn data_packet(frame_index: u32) -> Vec<u8> {
        let payload = OpusPayload::new(&[1; 20]).unwrap();
        Packet {
            sender_section: SenderSection {
                sequence_number: frame_index,
                frames: vec![AudioFrame::two_channel(frame_index, payload, payload)],
            },
            receiver_section: Default::default(),
        }
        .to_bytes()
    }

    #[test]
    fn unclaimed_datagrams_are_counted() {
        let keys = vec![LongLivedKey::generate("alice", 1)];
        let mut server = test_server(&keys);
        server
            .dispatch_datagram(b"garbage", "127.0.0.1:5".parse().unwrap())
            .unwrap();
        assert_eq!(server.statistics().invalid_datagrams, 1);
    }

    #[test]
    fn clock_rounds_advance_the_cursor() {
        let keys = vec![LongLivedKey::generate("alice", 1)];
        let mut server = test_server(&keys);
        let start = server.next_tick;
        server.service_clock(start + 4 * TICK).unwrap();
        assert_eq!(server.cursor_sample(), 5 * SAMPLES_PER_FRAME as u64);
        assert_eq!(server.statistics().rounds, 5);
    }

    #[test]
    fn long_stall_is_bounded_by_catchup_limit() {
        let keys = vec![LongLivedKey::generate("alice", 1)];
        let mut server = test_server(&keys);
        let start = server.next_tick;
        server.service_clock(start + 200 * TICK).unwrap();
        assert_eq!(server.statistics().rounds, 40);
        assert!(server.statistics().skipped_rounds > 0);
    }

    #[test]
    fn end_to_end_handshake_and_audio_return() {
        let keys = vec![
            LongLivedKey::generate("alice", 1),
            LongLivedKey::generate("bob", 2),
        ];
        let mut server = test_server(&keys);
        let server_addr = {
            // Rebind knowledge: the server socket is bound to an ephemeral port.
            server.socket.local_addr().unwrap()
        };

        let client_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        client_socket
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();

        // Key request for alice.
        let mut long_lived = CryptoSession::client(&keys[0].key_pair);
        let request = long_lived.encrypt(&[KEYREQ_ID], &[]).unwrap();
        client_socket.send_to(&request, server_addr).unwrap();
        server.receive_datagrams().unwrap();

        let mut buf = [0u8; 2048];
        let (len, _) = client_socket.recv_from(&mut buf).unwrap();
        let offer = long_lived.decrypt(&[KEYREQ_SERVER_ID], &buf[..len]).unwrap();
        let message = KeyMessage::from_bytes(&offer).unwrap();
        assert_eq!(message.id, 1);

        // Activate the session and stream a little audio in.
        let mut session = CryptoSession::client(&message.key_pair);
        let first = session.encrypt(&[1], &data_packet(0)).unwrap();
        client_socket.send_to(&first, server_addr).unwrap();
        server.receive_datagrams().unwrap();
        assert_eq!(server.clients()[0].statistics().new_sessions, 1);

        for index in 1..20u32 {
            let sealed = session.encrypt(&[], &data_packet(index)).unwrap();
            client_socket.send_to(&sealed, server_addr).unwrap();
        }
        server.receive_datagrams().unwrap();

        // Run some clock rounds; the server mixes and sends datagrams back.
        let start = server.next_tick;
        server.service_clock(start + 9 * TICK).unwrap();

        let (len, _) = client_socket.recv_from(&mut buf).unwrap();
        let returned = session.decrypt(&[], &buf[..len]).unwrap();
        let packet = Packet::from_bytes(&returned).unwrap();
        assert!(!packet.sender_section.frames.is_empty());
        // The return feed acknowledges what we sent.
        assert!(packet.receiver_section.next_frame_needed > 0);
    }
}
