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

//! Outgoing frame window with forward error correction.
//!
//! Every composed packet carries the newest frame plus as many older
//! still-unacknowledged frames as fit, so ordinary packet loss is repaired by
//! the very next datagram without any retransmission timer. Acknowledgments
//! arrive as receive reports and shrink the outstanding set.

use std::fmt::Write;

use crate::buffer::{EndlessBuffer, Plain};
use crate::codec::FrameSource;
use crate::error::Result;
use crate::formats::{
    AudioFrame, Packet, ReceiverSection, SenderSection, MAX_FRAMES_PER_PACKET, MAX_PACKET_PLAINTEXT,
};
use crate::statistics::SenderStatistics;

/// Frames the sender window can hold before evicting unsent audio.
pub const SENDER_WINDOW: usize = 4096;

#[derive(Clone, Copy, Default, Debug)]
#[repr(C)]
pub struct FrameStatus {
    /// Not yet acknowledged by the peer.
    pub outstanding: bool,
    /// Packed into the packet currently being composed.
    pub in_flight: bool,
}

impl FrameStatus {
    fn needs_send(&self) -> bool {
        self.outstanding && !self.in_flight
    }
}

unsafe impl Plain for FrameStatus {}

pub struct NetworkSender {
    frames: EndlessBuffer<AudioFrame>,
    frame_status: EndlessBuffer<FrameStatus>,
    next_frame_index: u32,
    next_sequence_number: u32,
    biggest_seqno_acked: Option<u32>,
    stats: SenderStatistics,
}

impl NetworkSender {
    pub fn new() -> Result<Self> {
        Ok(Self {
            frames: EndlessBuffer::new(SENDER_WINDOW)?,
            frame_status: EndlessBuffer::new(SENDER_WINDOW)?,
            next_frame_index: 0,
            next_sequence_number: 0,
            biggest_seqno_acked: None,
            stats: SenderStatistics::default(),
        })
    }

    pub fn next_frame_index(&self) -> u32 {
        self.next_frame_index
    }

    pub fn range_begin(&self) -> u32 {
        self.frames.range_begin() as u32
    }

    /// Take one frame from the source into the window.
    pub fn push_frame(&mut self, source: &mut dyn FrameSource) -> Result<()> {
        let frame = match source.front() {
            Some(frame) => *frame,
            None => panic!("push_frame from an empty source"),
        };
        assert_eq!(
            frame.frame_index, self.next_frame_index,
            "encoder/sender frame index mismatch"
        );

        let pos = self.next_frame_index as u64;
        if pos >= self.frames.range_end() {
            let to_drop = pos - self.frames.range_end() + 1;
            self.frames.pop(to_drop);
            self.frame_status.pop(to_drop);
            self.stats.frames_dropped += to_drop;
        }

        *self.frames.at_mut(pos)? = frame;
        *self.frame_status.at_mut(pos)? = FrameStatus {
            outstanding: true,
            in_flight: false,
        };
        self.next_frame_index += 1;
        source.pop_frame();
        Ok(())
    }

    /// Compose one packet: the newest frame always, then older outstanding
    /// frames oldest-to-newest while the slot and byte budgets allow.
    pub fn compose_packet(&mut self, receiver_section: ReceiverSection) -> Result<Packet> {
        let begin = self.frames.range_begin();
        let end = self.next_frame_index as u64;
        assert!(end > begin, "compose_packet with an empty window");

        let sequence_number = self.next_sequence_number;
        self.next_sequence_number = self.next_sequence_number.wrapping_add(1);

        // Last round's marks are stale now.
        for status in self.frame_status.region_mut(begin, (end - begin) as usize)? {
            status.in_flight = false;
        }

        let newest_pos = end - 1;
        let newest = *self.frames.at(newest_pos)?;
        {
            let status = self.frame_status.at_mut(newest_pos)?;
            assert!(status.needs_send(), "unexpected frame status");
            status.in_flight = true;
        }

        let mut sender_section = SenderSection {
            sequence_number,
            frames: vec![newest],
        };
        let mut receiver_section = receiver_section;

        // The newest frame and the report must fit; shed old records first.
        while sender_section.serialized_length() + receiver_section.serialized_length()
            > MAX_PACKET_PLAINTEXT
            && !receiver_section.packets_received.is_empty()
        {
            receiver_section.packets_received.pop();
        }

        let mut used = sender_section.serialized_length() + receiver_section.serialized_length();
        for pos in begin..newest_pos {
            if sender_section.frames.len() >= MAX_FRAMES_PER_PACKET {
                break;
            }
            if !self.frame_status.at(pos)?.needs_send() {
                continue;
            }
            let frame = *self.frames.at(pos)?;
            if used + frame.serialized_length() > MAX_PACKET_PLAINTEXT {
                break;
            }
            used += frame.serialized_length();
            sender_section.frames.push(frame);
            self.frame_status.at_mut(pos)?.in_flight = true;
        }

        self.stats.packets_sent += 1;
        Ok(Packet {
            sender_section,
            receiver_section,
        })
    }

    /// Process the peer's receive report: retire acknowledged frames and pop
    /// the settled prefix.
    pub fn receive_receiver_section(&mut self, section: &ReceiverSection) -> Result<()> {
        let begin = self.frames.range_begin();
        let end = self.next_frame_index as u64;

        let limit = (section.next_frame_needed as u64).min(end);
        for pos in begin..limit {
            let status = self.frame_status.at_mut(pos)?;
            if status.outstanding {
                status.outstanding = false;
                self.stats.frames_acked += 1;
            }
        }

        for record in &section.packets_received {
            self.biggest_seqno_acked = Some(match self.biggest_seqno_acked {
                Some(best) => best.max(record.sequence_number),
                None => record.sequence_number,
            });
            for &index in record.indices() {
                let pos = index as u64;
                if pos < begin || pos >= end {
                    continue;
                }
                let status = self.frame_status.at_mut(pos)?;
                if status.outstanding {
                    status.outstanding = false;
                    self.stats.frames_acked += 1;
                }
            }
        }

        let mut settled = 0u64;
        while begin + settled < end && !self.frame_status.at(begin + settled)?.outstanding {
            settled += 1;
        }
        if settled > 0 {
            self.frames.pop(settled);
            self.frame_status.pop(settled);
        }
        Ok(())
    }

    pub fn biggest_seqno_acked(&self) -> Option<u32> {
        self.biggest_seqno_acked
    }

    pub fn statistics(&self) -> &SenderStatistics {
        &self.stats
    }

    /// Outstanding / in-flight counts over the live window.
    pub fn window_status(&self) -> Result<(usize, usize)> {
        let begin = self.frames.range_begin();
        let count = (self.next_frame_index as u64 - begin) as usize;
        let mut outstanding = 0;
        let mut in_flight = 0;
        for status in self.frame_status.region(begin, count)? {
            outstanding += status.outstanding as usize;
            in_flight += status.in_flight as usize;
        }
        Ok((outstanding, in_flight))
    }

    pub fn summary(&self, out: &mut String) {
        let _ = write!(out, "sender:");
        if self.stats.frames_dropped > 0 {
            let _ = write!(out, " dropped={}", self.stats.frames_dropped);
        }
        if let Ok((outstanding, in_flight)) = self.window_status() {
            let _ = write!(out, " outstanding/in-flight={outstanding}/{in_flight}");
        }
        let _ = write!(
            out,
            " sent={} acked={}",
            self.stats.packets_sent, self.stats.frames_acked
        );
    }
}
