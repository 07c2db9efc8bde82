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

//! Incoming frame reassembly.
//!
//! Frames arrive in arbitrary order across redundant datagrams; the receiver
//! files each one at its index, tracks the dense prefix with
//! `next_frame_needed`, and remembers which packets delivered what so the
//! peer can retire its copies.

use std::fmt::Write;

use crate::buffer::{EndlessBuffer, Plain, TypedRingBuffer};
use crate::error::Result;
use crate::formats::{AudioFrame, PacketRecord, ReceiverSection, SenderSection, MAX_RECORDS_PER_PACKET};
use crate::statistics::ReceiverStatistics;

/// Frames the reassembly window can hold.
pub const RECEIVER_WINDOW: usize = 8192;
/// Receive records kept for the rolling report.
pub const RECENT_PACKETS: usize = 512;

/// A window slot: plain-data stand-in for `Option<AudioFrame>` so it can
/// live in ring storage.
#[derive(Clone, Copy, Default)]
#[repr(C)]
pub struct FrameSlot {
    present: bool,
    frame: AudioFrame,
}

impl FrameSlot {
    pub fn get(&self) -> Option<&AudioFrame> {
        self.present.then_some(&self.frame)
    }

    pub fn is_some(&self) -> bool {
        self.present
    }

    pub fn is_none(&self) -> bool {
        !self.present
    }

    fn set(&mut self, frame: AudioFrame) {
        self.present = true;
        self.frame = frame;
    }
}

unsafe impl Plain for FrameSlot {}

pub struct NetworkReceiver {
    frames: EndlessBuffer<FrameSlot>,
    next_frame_needed: u32,
    unreceived_beyond_this_frame_index: u32,
    biggest_seqno_received: Option<u32>,
    recent_packets: TypedRingBuffer<PacketRecord>,
    stats: ReceiverStatistics,
}

impl NetworkReceiver {
    pub fn new() -> Result<Self> {
        Ok(Self {
            frames: EndlessBuffer::new(RECEIVER_WINDOW)?,
            next_frame_needed: 0,
            unreceived_beyond_this_frame_index: 0,
            biggest_seqno_received: None,
            recent_packets: TypedRingBuffer::new(RECENT_PACKETS)?,
            stats: ReceiverStatistics::default(),
        })
    }

    pub fn range_begin(&self) -> u32 {
        self.frames.range_begin() as u32
    }

    pub fn next_frame_needed(&self) -> u32 {
        self.next_frame_needed
    }

    pub fn unreceived_beyond_this_frame_index(&self) -> u32 {
        self.unreceived_beyond_this_frame_index
    }

    pub fn biggest_seqno_received(&self) -> Option<u32> {
        self.biggest_seqno_received
    }

    /// The stored frame at `index`, if it is inside the window and present.
    pub fn frame(&self, index: u32) -> Option<&AudioFrame> {
        self.frames.at(index as u64).ok().and_then(FrameSlot::get)
    }

    /// File every frame of an arriving sender section and record the packet.
    pub fn receive_sender_section(&mut self, section: &SenderSection) -> Result<()> {
        let mut record = PacketRecord::new(section.sequence_number, &[]);

        for frame in &section.frames {
            let pos = frame.frame_index as u64;
            if pos < self.frames.range_begin() {
                self.stats.already_acked += 1;
                continue;
            }
            if pos < self.frames.range_end() && self.frames.at(pos)?.is_some() {
                self.stats.redundant += 1;
                continue;
            }
            if pos >= self.frames.range_end() {
                let discard = pos - self.frames.range_end() + 1;
                self.discard_frames(discard)?;
            }
            self.frames.at_mut(pos)?.set(*frame);
            record.push_index(frame.frame_index);
            self.unreceived_beyond_this_frame_index = self
                .unreceived_beyond_this_frame_index
                .max(frame.frame_index + 1);
        }

        self.advance_next_frame_needed()?;
        self.recent_packets.push_evicting(record);
        self.biggest_seqno_received = Some(match self.biggest_seqno_received {
            Some(best) => best.max(section.sequence_number),
            None => section.sequence_number,
        });
        Ok(())
    }

    /// Vacate the oldest `num` slots to make room at the front of the window,
    /// counting the ones that never arrived.
    fn discard_frames(&mut self, num: u64) -> Result<()> {
        let begin = self.frames.range_begin();
        let live_end = (self.unreceived_beyond_this_frame_index as u64).min(self.frames.range_end());
        let vacated_live = (begin + num).min(live_end);
        for pos in begin..vacated_live {
            if self.frames.at(pos)?.is_none() {
                self.stats.dropped += 1;
            }
        }
        self.frames.pop(num);
        let new_begin = self.frames.range_begin() as u32;
        if self.next_frame_needed < new_begin {
            self.next_frame_needed = new_begin;
        }
        Ok(())
    }

    fn advance_next_frame_needed(&mut self) -> Result<()> {
        while self.next_frame_needed < self.unreceived_beyond_this_frame_index
            && (self.next_frame_needed as u64) < self.frames.range_end()
            && self.frames.at(self.next_frame_needed as u64)?.is_some()
        {
            self.next_frame_needed += 1;
        }
        Ok(())
    }

    /// Build the outgoing receive report, most recent packets first.
    pub fn set_receiver_section(&self) -> ReceiverSection {
        let records = self.recent_packets.readable_region();
        ReceiverSection {
            next_frame_needed: self.next_frame_needed,
            packets_received: records
                .iter()
                .rev()
                .take(MAX_RECORDS_PER_PACKET)
                .copied()
                .collect(),
        }
    }

    /// Consume frames behind the cursor. Never moves past `next_frame_needed`.
    pub fn pop_frames(&mut self, num: u64) {
        assert!(
            self.frames.range_begin() + num <= self.next_frame_needed as u64,
            "pop_frames past next_frame_needed"
        );
        self.stats.popped += num;
        self.frames.pop(num);
    }

    pub fn statistics(&self) -> &ReceiverStatistics {
        &self.stats
    }

    pub fn summary(&self, out: &mut String) {
        let _ = write!(
            out,
            "receiver: next={} horizon={}",
            self.next_frame_needed, self.unreceived_beyond_this_frame_index
        );
        if self.stats.dropped > 0 {
            let _ = write!(out, " dropped={}", self.stats.dropped);
        }
        if self.stats.redundant > 0 {
            let _ = write!(out, " redundant={}", self.stats.redundant);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::OpusPayload;

    fn frame(index: u32) -> AudioFrame {
        let payload = OpusPayload::new(&[index as u8; 10]).unwrap();
        AudioFrame::two_channel(index, payload, payload)
    }

    fn deliver(receiver: &mut NetworkReceiver, seq: u32, indices: &[u32]) {
        let section = SenderSection {
            sequence_number: seq,
            frames: indices.iter().map(|&i| frame(i)).collect(),
        };
        receiver.receive_sender_section(&section).unwrap();
    }

    #[test]
    fn out_of_order_reassembly() {
        let mut receiver = NetworkReceiver::new().unwrap();

        deliver(&mut receiver, 0, &[3]);
        assert_eq!(receiver.next_frame_needed(), 0);
        assert_eq!(receiver.unreceived_beyond_this_frame_index(), 4);

        deliver(&mut receiver, 1, &[1, 3]);
        assert_eq!(receiver.statistics().redundant, 1);

        deliver(&mut receiver, 2, &[0, 2]);
        assert_eq!(receiver.range_begin(), 0);
        for index in 0..4 {
            assert!(receiver.frame(index).is_some(), "frame {index}");
        }
        assert_eq!(receiver.next_frame_needed(), 4);
        assert_eq!(receiver.unreceived_beyond_this_frame_index(), 4);
        assert_eq!(receiver.biggest_seqno_received(), Some(2));

        // A duplicate changes nothing but the counter.
        deliver(&mut receiver, 3, &[2]);
        assert_eq!(receiver.statistics().redundant, 2);
        assert_eq!(receiver.next_frame_needed(), 4);
    }

    #[test]
    fn gap_holds_next_frame_needed() {
        let mut receiver = NetworkReceiver::new().unwrap();
        deliver(&mut receiver, 0, &[0]);
        deliver(&mut receiver, 1, &[1]);
        deliver(&mut receiver, 2, &[5]);

        assert_eq!(receiver.next_frame_needed(), 2);
        assert_eq!(receiver.unreceived_beyond_this_frame_index(), 6);
    }

    #[test]
    fn window_overrun_vacates_and_counts_lost_frames() {
        let mut receiver = NetworkReceiver::new().unwrap();
        deliver(&mut receiver, 0, &[0]);
        deliver(&mut receiver, 1, &[1]);
        deliver(&mut receiver, 2, &[5]);

        // A frame far beyond the window forces out slots 0..=4; 2, 3 and 4
        // were still missing and are now permanently lost.
        deliver(&mut receiver, 3, &[RECEIVER_WINDOW as u32 + 4]);
        assert_eq!(receiver.range_begin(), 5);
        assert_eq!(receiver.statistics().dropped, 3);
        assert_eq!(receiver.next_frame_needed(), 6);
        assert!(receiver.frame(5).is_some());
    }

    #[test]
    fn frames_behind_the_window_count_as_already_acked() {
        let mut receiver = NetworkReceiver::new().unwrap();
        deliver(&mut receiver, 0, &[0, 1]);
        receiver.pop_frames(2);
        deliver(&mut receiver, 1, &[0]);
        assert_eq!(receiver.statistics().already_acked, 1);
    }

    #[test]
    fn receive_report_lists_recent_packets_newest_first() {
        let mut receiver = NetworkReceiver::new().unwrap();
        for seq in 0..40 {
            deliver(&mut receiver, seq, &[seq]);
        }
        let section = receiver.set_receiver_section();
        assert_eq!(section.packets_received.len(), MAX_RECORDS_PER_PACKET);
        assert_eq!(section.packets_received[0].sequence_number, 39);
        assert_eq!(section.packets_received[0].indices(), &[39]);
        assert_eq!(section.packets_received[31].sequence_number, 8);
        assert_eq!(section.next_frame_needed, 40);
    }

    #[test]
    fn fully_redundant_packet_still_recorded() {
        let mut receiver = NetworkReceiver::new().unwrap();
        deliver(&mut receiver, 0, &[0]);
        deliver(&mut receiver, 1, &[0]);
        let section = receiver.set_receiver_section();
        assert_eq!(section.packets_received[0].sequence_number, 1);
        assert!(section.packets_received[0].indices().is_empty());
    }

    #[test]
    fn dense_prefix_matches_delivered_set() {
        let mut receiver = NetworkReceiver::new().unwrap();
        // A fixed scramble of 0..32 with one hole at 17.
        let order = [
            3, 0, 9, 1, 2, 31, 7, 4, 5, 6, 8, 12, 10, 11, 13, 14, 16, 15, 18, 19, 21, 20, 22, 24,
            23, 25, 27, 26, 28, 30, 29,
        ];
        for (i, &index) in order.iter().enumerate() {
            deliver(&mut receiver, i as u32, &[index]);
        }
        assert_eq!(receiver.next_frame_needed(), 17);
        for index in 0..17 {
            assert!(receiver.frame(index).is_some());
        }
        assert!(receiver.frame(17).is_none());

        deliver(&mut receiver, 99, &[17]);
        assert_eq!(receiver.next_frame_needed(), 32);
    }

    #[test]
    #[should_panic(expected = "pop_frames past next_frame_needed")]
    fn pop_frames_cannot_pass_next_frame_needed() {
        let mut receiver = NetworkReceiver::new().unwrap();
        deliver(&mut receiver, 0, &[0, 1, 3]);
        receiver.pop_frames(3);
    }
}
