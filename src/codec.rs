use opus::{Application, Bitrate, Channels};
use std::collections::VecDeque;

use crate::buffer::EndlessBuffer;
use crate::error::{Result, StagecastError};
use crate::formats::{AudioFrame, OpusPayload, MAX_OPUS_PAYLOAD};
use crate::{SAMPLES_PER_FRAME, SAMPLE_RATE};

fn codec_err(e: opus::Error) -> StagecastError {
    StagecastError::Codec(e.to_string())
}

/// Mono Opus encoder at minimum-latency settings (2.5 ms frames).
pub struct Encoder {
    inner: opus::Encoder,
}

impl Encoder {
    pub fn new(bit_rate: i32) -> Result<Self> {
        let mut inner =
            opus::Encoder::new(SAMPLE_RATE, Channels::Mono, Application::LowDelay).map_err(codec_err)?;
        inner.set_bitrate(Bitrate::Bits(bit_rate)).map_err(codec_err)?;
        Ok(Self { inner })
    }

    pub fn encode(&mut self, samples: &[f32]) -> Result<OpusPayload> {
        let mut buf = [0u8; MAX_OPUS_PAYLOAD];
        let written = self.inner.encode_float(samples, &mut buf).map_err(codec_err)?;
        OpusPayload::new(&buf[..written])
    }
}

/// Mono Opus decoder with packet-loss concealment.
pub struct Decoder {
    inner: opus::Decoder,
}

impl Decoder {
    pub fn new() -> Result<Self> {
        Ok(Self {
            inner: opus::Decoder::new(SAMPLE_RATE, Channels::Mono).map_err(codec_err)?,
        })
    }

    pub fn decode(&mut self, payload: &OpusPayload, samples: &mut [f32]) -> Result<()> {
        let written = self
            .inner
            .decode_float(payload.as_slice(), samples, false)
            .map_err(codec_err)?;
        if written != samples.len() {
            return Err(StagecastError::Codec(format!(
                "unexpected decode length {written}"
            )));
        }
        Ok(())
    }

    /// Synthesize one frame for a lost packet.
    pub fn conceal(&mut self, samples: &mut [f32]) -> Result<()> {
        let written = self
            .inner
            .decode_float(&[], samples, false)
            .map_err(codec_err)?;
        if written != samples.len() {
            return Err(StagecastError::Codec(format!(
                "unexpected concealment length {written}"
            )));
        }
        Ok(())
    }
}

/// Stereo decode as two independent mono streams, matching the wire format.
pub struct DecoderPair {
    ch1: Decoder,
    ch2: Decoder,
}

impl DecoderPair {
    pub fn new() -> Result<Self> {
        Ok(Self {
            ch1: Decoder::new()?,
            ch2: Decoder::new()?,
        })
    }

    /// Decode a stored frame. A one-channel frame is heard on both sides.
    pub fn decode_frame(
        &mut self,
        frame: &AudioFrame,
        out1: &mut [f32],
        out2: &mut [f32],
    ) -> Result<()> {
        self.ch1.decode(&frame.ch1, out1)?;
        match frame.frame_type {
            crate::formats::FrameType::TwoChannel => self.ch2.decode(&frame.ch2, out2)?,
            crate::formats::FrameType::OneChannel => out2.copy_from_slice(out1),
        }
        Ok(())
    }

    /// Conceal a permanently missing frame on both channels.
    pub fn conceal(&mut self, out1: &mut [f32], out2: &mut [f32]) -> Result<()> {
        self.ch1.conceal(out1)?;
        self.ch2.conceal(out2)
    }
}

/// A queue of encoded frames, consumable one at a time.
///
/// The capability set `{has_frame, frame_index, front, pop_frame}` is what
/// `NetworkSender::push_frame` consumes.
pub trait FrameSource {
    fn has_frame(&self) -> bool;
    /// Frame index of the front frame; meaningless when empty.
    fn frame_index(&self) -> u32;
    fn front(&self) -> Option<&AudioFrame>;
    fn pop_frame(&mut self);
}

/// Encodes 120-sample windows of a stereo pair of endless buffers into
/// two-channel frames, tracking its own sample cursor.
pub struct EncoderTask {
    ch1: Encoder,
    ch2: Encoder,
    queue: VecDeque<AudioFrame>,
    encode_cursor: u64,
}

impl EncoderTask {
    pub fn new(bit_rate: i32) -> Result<Self> {
        Ok(Self {
            ch1: Encoder::new(bit_rate)?,
            ch2: Encoder::new(bit_rate)?,
            queue: VecDeque::new(),
            encode_cursor: 0,
        })
    }

    /// Samples consumed so far from the mixed-audio buffers.
    pub fn min_encode_cursor(&self) -> u64 {
        self.encode_cursor
    }

    pub fn encode_one_frame(
        &mut self,
        ch1: &EndlessBuffer<f32>,
        ch2: &EndlessBuffer<f32>,
    ) -> Result<()> {
        let samples1 = ch1.region(self.encode_cursor, SAMPLES_PER_FRAME)?;
        let samples2 = ch2.region(self.encode_cursor, SAMPLES_PER_FRAME)?;
        let index = (self.encode_cursor / SAMPLES_PER_FRAME as u64) as u32;
        let payload1 = self.ch1.encode(samples1)?;
        let payload2 = self.ch2.encode(samples2)?;
        self.queue
            .push_back(AudioFrame::two_channel(index, payload1, payload2));
        self.encode_cursor += SAMPLES_PER_FRAME as u64;
        Ok(())
    }
}

impl FrameSource for EncoderTask {
    fn has_frame(&self) -> bool {
        !self.queue.is_empty()
    }

    fn frame_index(&self) -> u32 {
        self.queue.front().map(|f| f.frame_index).unwrap_or_default()
    }

    fn front(&self) -> Option<&AudioFrame> {
        self.queue.front()
    }

    fn pop_frame(&mut self) {
        self.queue.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(freq: f32) -> Vec<f32> {
        (0..SAMPLES_PER_FRAME)
            .map(|i| {
                let t = i as f32 / SAMPLE_RATE as f32;
                (2.0 * std::f32::consts::PI * freq * t).sin() * 0.5
            })
            .collect()
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut encoder = Encoder::new(96_000).unwrap();
        let mut decoder = Decoder::new().unwrap();
        let input = tone(440.0);

        // Run a few frames so the codec state settles.
        let mut out = [0f32; SAMPLES_PER_FRAME];
        for _ in 0..4 {
            let payload = encoder.encode(&input).unwrap();
            assert!(!payload.is_empty());
            assert!(payload.len() <= MAX_OPUS_PAYLOAD);
            decoder.decode(&payload, &mut out).unwrap();
        }
    }

    #[test]
    fn concealment_fills_whole_frame() {
        let mut decoder = Decoder::new().unwrap();
        let mut out = [1f32; SAMPLES_PER_FRAME];
        decoder.conceal(&mut out).unwrap();
        // Fresh decoder state conceals to silence.
        assert!(out.iter().all(|s| s.abs() < 1e-3));
    }

    #[test]
    fn one_channel_frame_copies_to_both_sides() {
        let mut encoder = Encoder::new(96_000).unwrap();
        let mut pair = DecoderPair::new().unwrap();
        let payload = encoder.encode(&tone(330.0)).unwrap();
        let frame = AudioFrame::one_channel(0, payload);

        let mut out1 = [0f32; SAMPLES_PER_FRAME];
        let mut out2 = [7f32; SAMPLES_PER_FRAME];
        pair.decode_frame(&frame, &mut out1, &mut out2).unwrap();
        assert_eq!(out1, out2);
    }

    #[test]
    fn encoder_task_numbers_frames_sequentially() {
        let mut task = EncoderTask::new(96_000).unwrap();
        let ch1 = EndlessBuffer::<f32>::new(16384).unwrap();
        let ch2 = EndlessBuffer::<f32>::new(16384).unwrap();

        for expected in 0..3u32 {
            task.encode_one_frame(&ch1, &ch2).unwrap();
            assert!(task.has_frame());
            assert_eq!(task.frame_index(), expected);
            task.pop_frame();
        }
        assert!(!task.has_frame());
        assert_eq!(task.min_encode_cursor(), 3 * SAMPLES_PER_FRAME as u64);
    }
}
