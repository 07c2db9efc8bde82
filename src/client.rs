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

//! Per-client state: the active session pipeline (decode → mix → encode) and
//! the long-lived identity that owns the handshake.

use std::fmt::Write;
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use crate::board::{AudioBoard, ChannelPair};
use crate::codec::{DecoderPair, EncoderTask, FrameSource};
use crate::crypto::{
    CryptoSession, KeyMessage, KeyPair, LongLivedKey, KEYREQ_ID, KEYREQ_SERVER_ID,
};
use crate::cursor::{Cursor, MAX_TARGET_LAG, MIN_TARGET_LAG};
use crate::error::Result;
use crate::formats::Packet;
use crate::receiver::NetworkReceiver;
use crate::sender::NetworkSender;
use crate::statistics::HandshakeStatistics;
use crate::time_stretch::TimeStretcher;
use crate::SAMPLES_PER_FRAME;

/// Samples of personalized mix buffered ahead of the encoder.
const MIXED_AUDIO_CAPACITY: usize = 16384;
/// Opus bit rate per channel for the return feed.
const ENCODER_BIT_RATE: i32 = 96_000;
/// Key requests are answered at most this often.
const KEY_REPLY_INTERVAL: Duration = Duration::from_millis(250);

/// Default mix gain for every other performer's channel pair.
const DEFAULT_GAIN: (f32, f32) = (2.0, 2.0);

/// An established session: everything that lives only as long as the current
/// keys do.
pub struct Client {
    crypto: CryptoSession,
    sender: NetworkSender,
    receiver: NetworkReceiver,
    cursor: Cursor,
    decoder: DecoderPair,
    encoder: EncoderTask,
    stretcher: TimeStretcher,
    mixed_audio: ChannelPair,
    mix_cursor: u64,
    outbound_frame_offset: Option<u64>,
    peer: Option<SocketAddr>,
    pair_index: usize,
    last_packet: Instant,
    invalid_packets: u64,
}

impl Client {
    pub fn new(pair_index: usize, crypto: CryptoSession) -> Result<Self> {
        Ok(Self {
            crypto,
            sender: NetworkSender::new()?,
            receiver: NetworkReceiver::new()?,
            cursor: Cursor::new(MIN_TARGET_LAG, MAX_TARGET_LAG),
            decoder: DecoderPair::new()?,
            encoder: EncoderTask::new(ENCODER_BIT_RATE)?,
            stretcher: TimeStretcher::new(),
            mixed_audio: ChannelPair::new(MIXED_AUDIO_CAPACITY)?,
            mix_cursor: 0,
            outbound_frame_offset: None,
            peer: None,
            pair_index,
            last_packet: Instant::now(),
            invalid_packets: 0,
        })
    }

    fn client_mix_cursor(&self) -> u64 {
        self.mix_cursor
    }

    fn server_mix_cursor(&self) -> Option<u64> {
        self.outbound_frame_offset
            .map(|offset| self.mix_cursor + offset * SAMPLES_PER_FRAME as u64)
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn quiet_for(&self) -> Duration {
        self.last_packet.elapsed()
    }

    /// Try the datagram against this session. `false` means the AEAD did not
    /// accept it and other interpretations should be tried.
    pub fn receive_packet(
        &mut self,
        source: SocketAddr,
        ciphertext: &[u8],
        clock_sample: u64,
    ) -> bool {
        match self.crypto.decrypt(&[], ciphertext) {
            Ok(plaintext) => {
                self.process_plaintext(source, &plaintext, clock_sample);
                true
            }
            Err(_) => false,
        }
    }

    /// Handle an already-authenticated packet body.
    pub(crate) fn process_plaintext(
        &mut self,
        source: SocketAddr,
        plaintext: &[u8],
        clock_sample: u64,
    ) {
        self.peer = Some(source);
        self.last_packet = Instant::now();
        if self.outbound_frame_offset.is_none() {
            self.outbound_frame_offset = Some(clock_sample / SAMPLES_PER_FRAME as u64);
        }
        match Packet::from_bytes(plaintext) {
            Ok(packet) => {
                if let Err(e) = self.receiver.receive_sender_section(&packet.sender_section) {
                    log::warn!("receive_sender_section: {e}");
                }
                if let Err(e) = self
                    .sender
                    .receive_receiver_section(&packet.receiver_section)
                {
                    log::warn!("receive_receiver_section: {e}");
                }
            }
            Err(_) => {
                self.invalid_packets += 1;
            }
        }
    }

    /// One clock tick of inbound audio onto the board, then retire consumed
    /// frames.
    pub fn decode_audio(&mut self, cursor_sample: u64, board: &mut AudioBoard) -> Result<()> {
        let output = board.pair_mut(self.pair_index);
        self.cursor.sample(
            &self.receiver,
            cursor_sample,
            &mut self.decoder,
            &mut self.stretcher,
            output,
        )?;

        let safe = self.cursor.ok_to_pop(&self.receiver);
        let complete = (self.receiver.next_frame_needed() as u64)
            .saturating_sub(self.receiver.range_begin() as u64);
        self.receiver.pop_frames(safe.min(complete));
        Ok(())
    }

    /// Accumulate every other channel pair into this client's personal mix,
    /// up to the current clock.
    pub fn mix(&mut self, gains: &[(f32, f32)], board: &AudioBoard, cursor_sample: u64) -> Result<()> {
        let frame_samples = SAMPLES_PER_FRAME as u64;
        while let Some(server_mix_cursor) = self.server_mix_cursor() {
            if server_mix_cursor + frame_samples > cursor_sample {
                break;
            }
            if self.client_mix_cursor() + frame_samples > self.mixed_audio.range_end() {
                // The encoder has fallen behind; let it drain first.
                break;
            }
            let target_pos = self.client_mix_cursor();
            self.mixed_audio
                .ch1_mut()
                .region_mut(target_pos, SAMPLES_PER_FRAME)?
                .fill(0.0);
            self.mixed_audio
                .ch2_mut()
                .region_mut(target_pos, SAMPLES_PER_FRAME)?
                .fill(0.0);

            for (pair_i, pair) in board.pairs().iter().enumerate() {
                if pair_i == self.pair_index {
                    continue;
                }
                let (gain1, gain2) = gains.get(pair_i).copied().unwrap_or(DEFAULT_GAIN);

                let source1 = pair.ch1().region(server_mix_cursor, SAMPLES_PER_FRAME)?;
                let target1 = self
                    .mixed_audio
                    .ch1_mut()
                    .region_mut(target_pos, SAMPLES_PER_FRAME)?;
                for (target, &value) in target1.iter_mut().zip(source1) {
                    *target += gain1 * value;
                }

                let source2 = pair.ch2().region(server_mix_cursor, SAMPLES_PER_FRAME)?;
                let target2 = self
                    .mixed_audio
                    .ch2_mut()
                    .region_mut(target_pos, SAMPLES_PER_FRAME)?;
                for (target, &value) in target2.iter_mut().zip(source2) {
                    *target += gain2 * value;
                }
            }
            self.mix_cursor += frame_samples;
        }
        Ok(())
    }

    /// Encode whole mixed frames and emit one datagram per frame.
    pub fn encode_and_send(&mut self, socket: &UdpSocket) -> Result<()> {
        while self.encoder.min_encode_cursor() + SAMPLES_PER_FRAME as u64 <= self.client_mix_cursor()
        {
            self.encoder
                .encode_one_frame(self.mixed_audio.ch1(), self.mixed_audio.ch2())?;
            while self.encoder.has_frame() {
                self.sender.push_frame(&mut self.encoder)?;
                self.send_packet(socket)?;
            }
        }
        self.mixed_audio.pop_before(self.encoder.min_encode_cursor());
        Ok(())
    }

    fn send_packet(&mut self, socket: &UdpSocket) -> Result<()> {
        let Some(peer) = self.peer else {
            return Ok(());
        };
        let receiver_section = self.receiver.set_receiver_section();
        let packet = self.sender.compose_packet(receiver_section)?;
        let sealed = self.crypto.encrypt(&[], &packet.to_bytes())?;
        if let Err(e) = socket.send_to(&sealed, peer) {
            // Send failures are local; the frame stays outstanding and rides
            // the next packet.
            log::warn!("send to {peer}: {e}");
        }
        Ok(())
    }

    pub fn set_cursor_lag(&mut self, num_samples: u32) {
        self.cursor.set_target_lag(num_samples);
        self.cursor.reset();
        self.stretcher.reset();
    }

    pub fn summary(&self, out: &mut String) {
        if let Some(peer) = self.peer {
            let _ = write!(out, " ({peer})");
        }
        out.push(' ');
        self.cursor.summary(out);
        out.push(' ');
        self.sender.summary(out);
        out.push(' ');
        self.receiver.summary(out);
        if self.invalid_packets > 0 {
            let _ = write!(out, " invalid={}", self.invalid_packets);
        }
    }
}

/// A client identity from a key file: long-lived keys, the pending rekey
/// offer, and the active session once one is established.
pub struct KnownClient {
    id: u8,
    name: String,
    long_lived: CryptoSession,
    next_keys: KeyPair,
    next_session: CryptoSession,
    next_keys_generated: Instant,
    next_reply_allowed: Instant,
    pair_index: usize,
    gains: Vec<(f32, f32)>,
    session: Option<Client>,
    stats: HandshakeStatistics,
}

impl KnownClient {
    pub fn new(key: &LongLivedKey, pair_index: usize, num_pairs: usize) -> Self {
        let next_keys = KeyPair::generate();
        Self {
            id: key.id,
            name: key.name.clone(),
            long_lived: CryptoSession::server(&key.key_pair),
            next_session: CryptoSession::server(&next_keys),
            next_keys,
            next_keys_generated: Instant::now(),
            next_reply_allowed: Instant::now(),
            pair_index,
            gains: vec![DEFAULT_GAIN; num_pairs],
            session: None,
            stats: HandshakeStatistics::default(),
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pair_index(&self) -> usize {
        self.pair_index
    }

    pub fn session(&self) -> Option<&Client> {
        self.session.as_ref()
    }

    pub fn session_mut(&mut self) -> Option<&mut Client> {
        self.session.as_mut()
    }

    pub fn set_gain(&mut self, pair_index: usize, left: f32, right: f32) {
        if let Some(gain) = self.gains.get_mut(pair_index) {
            *gain = (left, right);
        }
    }

    pub fn statistics(&self) -> &HandshakeStatistics {
        &self.stats
    }

    /// Try a datagram against this identity: the active session, then a key
    /// request, then activation of the pending session. `false` means it
    /// belongs to someone else.
    pub fn receive(
        &mut self,
        source: SocketAddr,
        ciphertext: &[u8],
        clock_sample: u64,
        socket: &UdpSocket,
    ) -> Result<bool> {
        if let Some(client) = self.session.as_mut() {
            if client.receive_packet(source, ciphertext, clock_sample) {
                return Ok(true);
            }
        }

        if self.try_keyrequest(source, ciphertext, socket)? {
            return Ok(true);
        }

        let plaintext = match self.next_session.decrypt(&[self.id], ciphertext) {
            Ok(plaintext) => plaintext,
            Err(_) => return Ok(false),
        };

        // The pending keys are claimed: promote them and arm a fresh offer.
        let fresh_keys = KeyPair::generate();
        let fresh_session = CryptoSession::server(&fresh_keys);
        let promoted = std::mem::replace(&mut self.next_session, fresh_session);
        self.next_keys = fresh_keys;
        self.next_keys_generated = Instant::now();

        let mut client = Client::new(self.pair_index, promoted)?;
        client.process_plaintext(source, &plaintext, clock_sample);
        self.session = Some(client);
        self.stats.new_sessions += 1;
        log::info!("{}: new session established", self.name);
        Ok(true)
    }

    fn try_keyrequest(
        &mut self,
        source: SocketAddr,
        ciphertext: &[u8],
        socket: &UdpSocket,
    ) -> Result<bool> {
        let plaintext = match self.long_lived.decrypt(&[KEYREQ_ID], ciphertext) {
            Ok(plaintext) => plaintext,
            Err(_) => return Ok(false),
        };
        if !plaintext.is_empty() {
            return Ok(false);
        }

        self.stats.key_requests += 1;
        let now = Instant::now();
        if now < self.next_reply_allowed {
            return Ok(true);
        }

        let message = KeyMessage {
            id: self.id,
            key_pair: self.next_keys,
        };
        let sealed = self
            .long_lived
            .encrypt(&[KEYREQ_SERVER_ID], &message.to_bytes())?;
        if let Err(e) = socket.send_to(&sealed, source) {
            log::warn!("key response to {source}: {e}");
        }
        self.next_reply_allowed = now + KEY_REPLY_INTERVAL;
        self.stats.key_responses += 1;
        Ok(true)
    }

    /// Replace a pending offer nobody claimed, so old key material does not
    /// stay valid indefinitely.
    pub fn rotate_stale_offer(&mut self, max_age: Duration) {
        if self.next_keys_generated.elapsed() > max_age {
            self.next_keys = KeyPair::generate();
            self.next_session = CryptoSession::server(&self.next_keys);
            self.next_keys_generated = Instant::now();
            log::debug!("{}: rotated unclaimed session keys", self.name);
        }
    }

    pub fn summary(&self, out: &mut String) {
        let _ = write!(
            out,
            "{}: requests={} responses={} new_sessions={}",
            self.name, self.stats.key_requests, self.stats.key_responses, self.stats.new_sessions
        );
        if let Some(session) = &self.session {
            session.summary(out);
        }
    }

    /// Per-pair (left, right) gains for this client's personalized mix.
    pub fn gains(&self) -> &[(f32, f32)] {
        &self.gains
    }

    /// Run the outbound half for this client's session, splitting the borrow
    /// between the gain table and the session.
    pub fn mix_and_encode(
        &mut self,
        board: &AudioBoard,
        cursor_sample: u64,
        socket: &UdpSocket,
    ) -> Result<()> {
        let Self { gains, session, .. } = self;
        if let Some(client) = session.as_mut() {
            client.mix(gains, board, cursor_sample)?;
            client.encode_and_send(socket)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::{OpusPayload, SenderSection};
    use std::net::UdpSocket;

    fn local_socket() -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        socket
    }

    fn key_request(key: &LongLivedKey) -> (CryptoSession, Vec<u8>) {
        let mut crypto = CryptoSession::client(&key.key_pair);
        let request = crypto.encrypt(&[KEYREQ_ID], &[]).unwrap();
        (crypto, request)
    }

    fn data_packet(frame_index: u32) -> Packet {
        let payload = OpusPayload::new(&[9; 15]).unwrap();
        Packet {
            sender_section: SenderSection {
                sequence_number: frame_index,
                frames: vec![crate::formats::AudioFrame::two_channel(
                    frame_index,
                    payload,
                    payload,
                )],
            },
            receiver_section: Default::default(),
        }
    }

    #[test]
    fn key_request_answered_then_rate_limited() {
        let key = LongLivedKey::generate("alice", 1);
        let mut known = KnownClient::new(&key, 0, 1);

        let server_socket = local_socket();
        let client_socket = local_socket();
        let client_addr = client_socket.local_addr().unwrap();

        let (mut client_crypto, request) = key_request(&key);
        assert!(known
            .receive(client_addr, &request, 0, &server_socket)
            .unwrap());
        assert_eq!(known.statistics().key_requests, 1);
        assert_eq!(known.statistics().key_responses, 1);

        // The response decrypts to the pending key offer.
        let mut buf = [0u8; 2048];
        let (len, _) = client_socket.recv_from(&mut buf).unwrap();
        let reply = client_crypto
            .decrypt(&[KEYREQ_SERVER_ID], &buf[..len])
            .unwrap();
        let message = KeyMessage::from_bytes(&reply).unwrap();
        assert_eq!(message.id, 1);

        // A second request inside the rate window is accepted but unanswered.
        let request2 = client_crypto.encrypt(&[KEYREQ_ID], &[]).unwrap();
        assert!(known
            .receive(client_addr, &request2, 0, &server_socket)
            .unwrap());
        assert_eq!(known.statistics().key_requests, 2);
        assert_eq!(known.statistics().key_responses, 1);
        assert!(client_socket.recv_from(&mut buf).is_err());
    }

    #[test]
    fn first_data_packet_activates_the_session() {
        let key = LongLivedKey::generate("bob", 2);
        let mut known = KnownClient::new(&key, 0, 2);

        let server_socket = local_socket();
        let client_socket = local_socket();
        let client_addr = client_socket.local_addr().unwrap();

        // Handshake: request, then read the offered session keys.
        let (mut client_crypto, request) = key_request(&key);
        known
            .receive(client_addr, &request, 0, &server_socket)
            .unwrap();
        let mut buf = [0u8; 2048];
        let (len, _) = client_socket.recv_from(&mut buf).unwrap();
        let offer = client_crypto
            .decrypt(&[KEYREQ_SERVER_ID], &buf[..len])
            .unwrap();
        let message = KeyMessage::from_bytes(&offer).unwrap();

        // First data packet rides the offered keys with the node id as AAD.
        let mut session_crypto = CryptoSession::client(&message.key_pair);
        let first = session_crypto
            .encrypt(&[2], &data_packet(0).to_bytes())
            .unwrap();
        assert!(known
            .receive(client_addr, &first, 4800, &server_socket)
            .unwrap());
        assert_eq!(known.statistics().new_sessions, 1);

        let session = known.session().unwrap();
        assert_eq!(session.peer(), Some(client_addr));
        assert_eq!(session.outbound_frame_offset, Some(4800 / 120));
        assert_eq!(session.receiver.next_frame_needed(), 1);

        // Follow-up packets use the plain session AAD.
        let second = session_crypto
            .encrypt(&[], &data_packet(1).to_bytes())
            .unwrap();
        assert!(known
            .receive(client_addr, &second, 4920, &server_socket)
            .unwrap());
        assert_eq!(
            known.session().unwrap().receiver.next_frame_needed(),
            2
        );
    }

    #[test]
    fn unrelated_datagrams_are_not_claimed() {
        let key = LongLivedKey::generate("carol", 3);
        let mut known = KnownClient::new(&key, 0, 1);
        let server_socket = local_socket();
        let source = "127.0.0.1:9".parse().unwrap();

        assert!(!known
            .receive(source, b"not even ciphertext", 0, &server_socket)
            .unwrap());

        let stranger_key = LongLivedKey::generate("mallory", 3);
        let (_, request) = key_request(&stranger_key);
        assert!(!known.receive(source, &request, 0, &server_socket).unwrap());
        assert_eq!(known.statistics().key_requests, 0);
    }

    #[test]
    fn own_channel_pair_is_excluded_from_the_mix() {
        let crypto = CryptoSession::server(&KeyPair::generate());
        let mut client = Client::new(1, crypto).unwrap();
        client.outbound_frame_offset = Some(0);

        let mut board = AudioBoard::new(3, 16384).unwrap();
        // The client's own pair carries a full-scale signal; everyone else is
        // silent.
        board
            .pair_mut(1)
            .ch1_mut()
            .region_mut(0, SAMPLES_PER_FRAME)
            .unwrap()
            .fill(1.0);
        board
            .pair_mut(1)
            .ch2_mut()
            .region_mut(0, SAMPLES_PER_FRAME)
            .unwrap()
            .fill(1.0);

        let gains = vec![(1.0, 1.0); 3];
        client
            .mix(&gains, &board, SAMPLES_PER_FRAME as u64)
            .unwrap();

        assert_eq!(client.mix_cursor, SAMPLES_PER_FRAME as u64);
        let mixed = client.mixed_audio.ch1().region(0, SAMPLES_PER_FRAME).unwrap();
        assert!(mixed.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn other_pairs_mix_in_at_their_gain() {
        let crypto = CryptoSession::server(&KeyPair::generate());
        let mut client = Client::new(1, crypto).unwrap();
        client.outbound_frame_offset = Some(0);

        let mut board = AudioBoard::new(3, 16384).unwrap();
        board
            .pair_mut(0)
            .ch1_mut()
            .region_mut(0, SAMPLES_PER_FRAME)
            .unwrap()
            .fill(0.25);
        board
            .pair_mut(2)
            .ch2_mut()
            .region_mut(0, SAMPLES_PER_FRAME)
            .unwrap()
            .fill(0.5);

        let gains = vec![(2.0, 2.0); 3];
        client
            .mix(&gains, &board, SAMPLES_PER_FRAME as u64)
            .unwrap();

        let mixed1 = client.mixed_audio.ch1().region(0, SAMPLES_PER_FRAME).unwrap();
        let mixed2 = client.mixed_audio.ch2().region(0, SAMPLES_PER_FRAME).unwrap();
        assert!(mixed1.iter().all(|&s| (s - 0.5).abs() < 1e-6));
        assert!(mixed2.iter().all(|&s| (s - 1.0).abs() < 1e-6));
    }

    #[test]
    fn mix_waits_for_the_first_packet() {
        let crypto = CryptoSession::server(&KeyPair::generate());
        let mut client = Client::new(0, crypto).unwrap();
        let board = AudioBoard::new(1, 16384).unwrap();
        client.mix(&[(1.0, 1.0)], &board, 4800).unwrap();
        assert_eq!(client.mix_cursor, 0);
    }
}
