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

//! The rate-adapting read cursor.
//!
//! Once the receiver has buffered `target_lag` samples, the cursor starts
//! that far behind the newest frame and walks the window one frame per tick:
//! decode when the frame arrived, conceal when it is permanently missing,
//! stall when the verdict is still open. The stretch ratio nudges the actual
//! lag back toward the target; output lands on the client's board pair at
//! the server clock.

use crate::board::ChannelPair;
use crate::codec::DecoderPair;
use crate::error::Result;
use crate::receiver::NetworkReceiver;
use crate::statistics::CursorStatistics;
use crate::time_stretch::TimeStretcher;
use crate::SAMPLES_PER_FRAME;

/// Default lag floor: 960 samples, 20 ms.
pub const MIN_TARGET_LAG: u32 = 960;
/// Lag ceiling: 1920 samples, 40 ms.
pub const MAX_TARGET_LAG: u32 = 1920;

/// Lag error tolerated before the stretcher engages, in samples.
const DEAD_BAND: i64 = 120;
/// Proportional gain of the lag controller.
const GAIN: f64 = 0.25;

pub struct Cursor {
    min_lag: u32,
    max_lag: u32,
    target_lag: u32,
    /// Client-domain playout position (frame-aligned samples).
    cursor_sample: Option<u64>,
    /// Server-domain position of the next output frame.
    output_cursor: Option<u64>,
    stats: CursorStatistics,
}

impl Cursor {
    pub fn new(min_lag: u32, max_lag: u32) -> Self {
        Self {
            min_lag,
            max_lag,
            target_lag: min_lag,
            cursor_sample: None,
            output_cursor: None,
            stats: CursorStatistics::default(),
        }
    }

    pub fn target_lag(&self) -> u32 {
        self.target_lag
    }

    pub fn set_target_lag(&mut self, num_samples: u32) {
        self.target_lag = num_samples.clamp(self.min_lag, self.max_lag);
    }

    /// Forget positions; playout re-locks at the target lag. The caller
    /// resets the stretcher alongside.
    pub fn reset(&mut self) {
        self.cursor_sample = None;
        self.output_cursor = None;
        self.stats.resets += 1;
    }

    /// One 120-sample tick at server position `server_cursor_sample`.
    pub fn sample(
        &mut self,
        receiver: &NetworkReceiver,
        server_cursor_sample: u64,
        decoder: &mut DecoderPair,
        stretcher: &mut TimeStretcher,
        output: &mut ChannelPair,
    ) -> Result<()> {
        let frame_samples = SAMPLES_PER_FRAME as u64;
        let horizon_samples =
            receiver.unreceived_beyond_this_frame_index() as u64 * frame_samples;

        if self.cursor_sample.is_none() {
            if horizon_samples < self.target_lag as u64 {
                self.stats.stalls += 1;
                return Ok(());
            }
            let start = ((horizon_samples - self.target_lag as u64) / frame_samples)
                * frame_samples;
            let start = start.max(receiver.range_begin() as u64 * frame_samples);
            self.cursor_sample = Some(start);
            self.output_cursor = Some(server_cursor_sample);
        }
        let (Some(cursor), Some(mut out_pos)) = (self.cursor_sample, self.output_cursor) else {
            return Ok(());
        };

        let frame_index = (cursor / frame_samples) as u32;
        if frame_index < receiver.next_frame_needed() {
            let mut pcm1 = [0f32; SAMPLES_PER_FRAME];
            let mut pcm2 = [0f32; SAMPLES_PER_FRAME];
            match receiver.frame(frame_index) {
                Some(frame) => match decoder.decode_frame(frame, &mut pcm1, &mut pcm2) {
                    Ok(()) => self.stats.frames_decoded += 1,
                    Err(e) => {
                        // A hostile payload must not take the server down.
                        log::warn!("decode failed at frame {frame_index}: {e}");
                        decoder.conceal(&mut pcm1, &mut pcm2)?;
                        self.stats.frames_concealed += 1;
                    }
                },
                None => {
                    decoder.conceal(&mut pcm1, &mut pcm2)?;
                    self.stats.frames_concealed += 1;
                }
            }
            stretcher.feed(&pcm1, &pcm2);
            self.cursor_sample = Some(cursor + frame_samples);
            self.adjust_ratio(horizon_samples, cursor + frame_samples, stretcher);
        } else {
            self.stats.stalls += 1;
        }

        let mut out1 = [0f32; SAMPLES_PER_FRAME];
        let mut out2 = [0f32; SAMPLES_PER_FRAME];
        while stretcher.pop_frame(&mut out1, &mut out2) {
            if out_pos < output.range_begin() {
                // Fell behind the board window; re-lock to the clock.
                self.stats.spilled += 1;
                out_pos = server_cursor_sample;
            }
            if out_pos + frame_samples <= output.range_end() {
                output
                    .ch1_mut()
                    .region_mut(out_pos, SAMPLES_PER_FRAME)?
                    .copy_from_slice(&out1);
                output
                    .ch2_mut()
                    .region_mut(out_pos, SAMPLES_PER_FRAME)?
                    .copy_from_slice(&out2);
            } else {
                self.stats.spilled += 1;
            }
            out_pos += frame_samples;
        }
        self.output_cursor = Some(out_pos);
        Ok(())
    }

    fn adjust_ratio(&self, horizon_samples: u64, cursor: u64, stretcher: &mut TimeStretcher) {
        let actual_lag = horizon_samples.saturating_sub(cursor) as i64;
        let error = actual_lag - self.target_lag as i64;
        let ratio = if error.abs() <= DEAD_BAND {
            1.0
        } else {
            1.0 - GAIN * error as f64 / self.target_lag as f64
        };
        stretcher.set_ratio(ratio);
    }

    /// Frames strictly behind the cursor, counted from the window front. The
    /// caller additionally bounds the pop by `next_frame_needed`.
    pub fn ok_to_pop(&self, receiver: &NetworkReceiver) -> u64 {
        match self.cursor_sample {
            Some(cursor) => {
                (cursor / SAMPLES_PER_FRAME as u64).saturating_sub(receiver.range_begin() as u64)
            }
            None => 0,
        }
    }

    pub fn statistics(&self) -> &CursorStatistics {
        &self.stats
    }

    pub fn summary(&self, out: &mut String) {
        use std::fmt::Write;
        let _ = write!(
            out,
            "cursor: target_lag={} decoded={} concealed={} stalls={}",
            self.target_lag,
            self.stats.frames_decoded,
            self.stats.frames_concealed,
            self.stats.stalls
        );
    }
}
