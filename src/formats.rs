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

//! Wire format: little-endian, byte-packed, no padding.
//!
//! A datagram plaintext is one `Packet`: a sender section (sequence number
//! plus up to eight audio frames) followed by a receiver section (the next
//! frame needed plus a compact receive report).

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Read;

use crate::buffer::Plain;
use crate::error::{Result, StagecastError};

/// Upper bound on one encoded Opus channel payload.
pub const MAX_OPUS_PAYLOAD: usize = 255;
/// Frames carried per packet (newest plus redundant older ones).
pub const MAX_FRAMES_PER_PACKET: usize = 8;
/// Receive-report records carried per packet.
pub const MAX_RECORDS_PER_PACKET: usize = 32;
/// Frame indices per receive-report record.
pub const MAX_INDICES_PER_RECORD: usize = 8;
/// Serialized packet budget, chosen so the AEAD framing still fits a
/// 1472-byte UDP payload with headroom.
pub const MAX_PACKET_PLAINTEXT: usize = 1400;

/// Append-only little-endian byte writer.
#[derive(Default)]
pub struct Serializer {
    out: Vec<u8>,
}

impl Serializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u8(&mut self, value: u8) {
        self.out.push(value);
    }

    pub fn u32(&mut self, value: u32) {
        self.out.extend_from_slice(&value.to_le_bytes());
    }

    pub fn bytes(&mut self, data: &[u8]) {
        self.out.extend_from_slice(data);
    }

    pub fn len(&self) -> usize {
        self.out.len()
    }

    pub fn is_empty(&self) -> bool {
        self.out.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.out
    }
}

/// Little-endian byte reader over a borrowed buffer.
pub struct Parser<'a> {
    input: &'a [u8],
}

impl<'a> Parser<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input }
    }

    pub fn u8(&mut self) -> Result<u8> {
        self.input
            .read_u8()
            .map_err(|_| StagecastError::InvalidPacket("truncated"))
    }

    pub fn u32(&mut self) -> Result<u32> {
        self.input
            .read_u32::<LittleEndian>()
            .map_err(|_| StagecastError::InvalidPacket("truncated"))
    }

    pub fn bytes(&mut self, out: &mut [u8]) -> Result<()> {
        self.input
            .read_exact(out)
            .map_err(|_| StagecastError::InvalidPacket("truncated"))
    }

    pub fn remaining(&self) -> usize {
        self.input.len()
    }
}

/// One encoded Opus channel: a length byte and up to 255 payload bytes.
///
/// Backed by a fixed array so frames are plain data and can live in ring
/// storage.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct OpusPayload {
    length: u8,
    bytes: [u8; MAX_OPUS_PAYLOAD],
}

impl OpusPayload {
    pub fn new(data: &[u8]) -> Result<Self> {
        if data.len() > MAX_OPUS_PAYLOAD {
            return Err(StagecastError::InvalidPacket("opus payload too long"));
        }
        let mut payload = Self::default();
        payload.length = data.len() as u8;
        payload.bytes[..data.len()].copy_from_slice(data);
        Ok(payload)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.length as usize]
    }

    pub fn len(&self) -> usize {
        self.length as usize
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn serialized_length(&self) -> usize {
        1 + self.length as usize
    }

    pub fn serialize(&self, s: &mut Serializer) {
        s.u8(self.length);
        s.bytes(self.as_slice());
    }

    pub fn parse(p: &mut Parser) -> Result<Self> {
        let length = p.u8()?;
        let mut payload = Self::default();
        payload.length = length;
        p.bytes(&mut payload.bytes[..length as usize])?;
        Ok(payload)
    }
}

impl Default for OpusPayload {
    fn default() -> Self {
        Self {
            length: 0,
            bytes: [0; MAX_OPUS_PAYLOAD],
        }
    }
}

impl PartialEq for OpusPayload {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for OpusPayload {}

impl std::fmt::Debug for OpusPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OpusPayload({} bytes)", self.length)
    }
}

unsafe impl Plain for OpusPayload {}

/// Channel layout of an [`AudioFrame`].
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    #[default]
    OneChannel = 0,
    TwoChannel = 1,
}

/// One 2.5 ms audio frame: a monotonic frame index plus one or two encoded
/// Opus channels.
#[derive(Clone, Copy, Default)]
#[repr(C)]
pub struct AudioFrame {
    pub frame_index: u32,
    pub frame_type: FrameType,
    pub ch1: OpusPayload,
    pub ch2: OpusPayload,
}

impl AudioFrame {
    pub fn one_channel(frame_index: u32, ch1: OpusPayload) -> Self {
        Self {
            frame_index,
            frame_type: FrameType::OneChannel,
            ch1,
            ch2: OpusPayload::default(),
        }
    }

    pub fn two_channel(frame_index: u32, ch1: OpusPayload, ch2: OpusPayload) -> Self {
        Self {
            frame_index,
            frame_type: FrameType::TwoChannel,
            ch1,
            ch2,
        }
    }

    pub fn serialized_length(&self) -> usize {
        let mut len = 4 + 1 + self.ch1.serialized_length();
        if self.frame_type == FrameType::TwoChannel {
            len += self.ch2.serialized_length();
        }
        len
    }

    pub fn serialize(&self, s: &mut Serializer) {
        s.u32(self.frame_index);
        s.u8(self.frame_type as u8);
        self.ch1.serialize(s);
        if self.frame_type == FrameType::TwoChannel {
            self.ch2.serialize(s);
        }
    }

    pub fn parse(p: &mut Parser) -> Result<Self> {
        let frame_index = p.u32()?;
        let frame_type = match p.u8()? {
            0 => FrameType::OneChannel,
            1 => FrameType::TwoChannel,
            _ => return Err(StagecastError::InvalidPacket("bad frame type")),
        };
        let ch1 = OpusPayload::parse(p)?;
        let ch2 = if frame_type == FrameType::TwoChannel {
            OpusPayload::parse(p)?
        } else {
            OpusPayload::default()
        };
        Ok(Self {
            frame_index,
            frame_type,
            ch1,
            ch2,
        })
    }
}

impl PartialEq for AudioFrame {
    fn eq(&self, other: &Self) -> bool {
        self.frame_index == other.frame_index
            && self.frame_type == other.frame_type
            && self.ch1 == other.ch1
            && (self.frame_type == FrameType::OneChannel || self.ch2 == other.ch2)
    }
}

impl Eq for AudioFrame {}

impl std::fmt::Debug for AudioFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioFrame")
            .field("frame_index", &self.frame_index)
            .field("frame_type", &self.frame_type)
            .field("ch1_len", &self.ch1.len())
            .field("ch2_len", &self.ch2.len())
            .finish()
    }
}

unsafe impl Plain for AudioFrame {}

/// One entry of the receive report: a packet's sequence number and the frame
/// indices accepted from it.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
#[repr(C)]
pub struct PacketRecord {
    pub sequence_number: u32,
    num_indices: u8,
    frame_indices: [u32; MAX_INDICES_PER_RECORD],
}

impl PacketRecord {
    pub fn new(sequence_number: u32, indices: &[u32]) -> Self {
        let mut record = Self {
            sequence_number,
            ..Self::default()
        };
        for &index in indices {
            record.push_index(index);
        }
        record
    }

    pub fn push_index(&mut self, index: u32) {
        if (self.num_indices as usize) < MAX_INDICES_PER_RECORD {
            self.frame_indices[self.num_indices as usize] = index;
            self.num_indices += 1;
        }
    }

    pub fn indices(&self) -> &[u32] {
        &self.frame_indices[..self.num_indices as usize]
    }

    pub fn serialized_length(&self) -> usize {
        4 + 1 + 4 * self.num_indices as usize
    }

    pub fn serialize(&self, s: &mut Serializer) {
        s.u32(self.sequence_number);
        s.u8(self.num_indices);
        for &index in self.indices() {
            s.u32(index);
        }
    }

    pub fn parse(p: &mut Parser) -> Result<Self> {
        let sequence_number = p.u32()?;
        let num_indices = p.u8()?;
        if num_indices as usize > MAX_INDICES_PER_RECORD {
            return Err(StagecastError::InvalidPacket("too many frame indices"));
        }
        let mut record = Self {
            sequence_number,
            num_indices,
            ..Self::default()
        };
        for i in 0..num_indices as usize {
            record.frame_indices[i] = p.u32()?;
        }
        Ok(record)
    }
}

unsafe impl Plain for PacketRecord {}

/// Outgoing half of a packet: sequence number plus up to eight frames,
/// newest first.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct SenderSection {
    pub sequence_number: u32,
    pub frames: Vec<AudioFrame>,
}

impl SenderSection {
    pub fn serialized_length(&self) -> usize {
        4 + 1 + self.frames.iter().map(AudioFrame::serialized_length).sum::<usize>()
    }

    pub fn serialize(&self, s: &mut Serializer) {
        s.u32(self.sequence_number);
        s.u8(self.frames.len() as u8);
        for frame in &self.frames {
            frame.serialize(s);
        }
    }

    pub fn parse(p: &mut Parser) -> Result<Self> {
        let sequence_number = p.u32()?;
        let count = p.u8()?;
        if count as usize > MAX_FRAMES_PER_PACKET {
            return Err(StagecastError::InvalidPacket("too many frames"));
        }
        let mut frames = Vec::with_capacity(count as usize);
        for _ in 0..count {
            frames.push(AudioFrame::parse(p)?);
        }
        Ok(Self {
            sequence_number,
            frames,
        })
    }
}

/// Acknowledgment half of a packet: the rolling next-needed frame index plus
/// the most recent receive records, newest first.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct ReceiverSection {
    pub next_frame_needed: u32,
    pub packets_received: Vec<PacketRecord>,
}

impl ReceiverSection {
    pub fn serialized_length(&self) -> usize {
        4 + 1
            + self
                .packets_received
                .iter()
                .map(PacketRecord::serialized_length)
                .sum::<usize>()
    }

    pub fn serialize(&self, s: &mut Serializer) {
        s.u32(self.next_frame_needed);
        s.u8(self.packets_received.len() as u8);
        for record in &self.packets_received {
            record.serialize(s);
        }
    }

    pub fn parse(p: &mut Parser) -> Result<Self> {
        let next_frame_needed = p.u32()?;
        let count = p.u8()?;
        if count as usize > MAX_RECORDS_PER_PACKET {
            return Err(StagecastError::InvalidPacket("too many records"));
        }
        let mut packets_received = Vec::with_capacity(count as usize);
        for _ in 0..count {
            packets_received.push(PacketRecord::parse(p)?);
        }
        Ok(Self {
            next_frame_needed,
            packets_received,
        })
    }
}

/// One datagram plaintext: both sections end to end.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Packet {
    pub sender_section: SenderSection,
    pub receiver_section: ReceiverSection,
}

impl Packet {
    pub fn serialized_length(&self) -> usize {
        self.sender_section.serialized_length() + self.receiver_section.serialized_length()
    }

    pub fn serialize(&self, s: &mut Serializer) {
        debug_assert!(self.sender_section.frames.len() <= MAX_FRAMES_PER_PACKET);
        debug_assert!(self.receiver_section.packets_received.len() <= MAX_RECORDS_PER_PACKET);
        self.sender_section.serialize(s);
        self.receiver_section.serialize(s);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut s = Serializer::new();
        self.serialize(&mut s);
        s.into_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut p = Parser::new(bytes);
        let sender_section = SenderSection::parse(&mut p)?;
        let receiver_section = ReceiverSection::parse(&mut p)?;
        if p.remaining() != 0 {
            return Err(StagecastError::InvalidPacket("trailing bytes"));
        }
        Ok(Self {
            sender_section,
            receiver_section,
        })
    }
}
