//! The mixdown scratch area: one stereo channel pair per performer, indexed
//! by the server sample cursor.

use crate::buffer::EndlessBuffer;
use crate::error::Result;

/// Samples of history each board channel keeps (about 1.4 s at 48 kHz).
pub const BOARD_CAPACITY: usize = 65536;

/// Two audio channels owned by one client, for both its decoded input and
/// its personalized mix.
pub struct ChannelPair {
    ch1: EndlessBuffer<f32>,
    ch2: EndlessBuffer<f32>,
}

impl ChannelPair {
    pub fn new(capacity: usize) -> Result<Self> {
        Ok(Self {
            ch1: EndlessBuffer::new(capacity)?,
            ch2: EndlessBuffer::new(capacity)?,
        })
    }

    pub fn range_begin(&self) -> u64 {
        self.ch1.range_begin()
    }

    pub fn range_end(&self) -> u64 {
        self.ch1.range_end()
    }

    pub fn ch1(&self) -> &EndlessBuffer<f32> {
        &self.ch1
    }

    pub fn ch1_mut(&mut self) -> &mut EndlessBuffer<f32> {
        &mut self.ch1
    }

    pub fn ch2(&self) -> &EndlessBuffer<f32> {
        &self.ch2
    }

    pub fn ch2_mut(&mut self) -> &mut EndlessBuffer<f32> {
        &mut self.ch2
    }

    pub fn pop(&mut self, num_samples: u64) {
        self.ch1.pop(num_samples);
        self.ch2.pop(num_samples);
    }

    pub fn pop_before(&mut self, pos: u64) {
        self.ch1.pop_before(pos);
        self.ch2.pop_before(pos);
    }
}

/// All channel pairs on the server, one per known client.
pub struct AudioBoard {
    pairs: Vec<ChannelPair>,
}

impl AudioBoard {
    pub fn new(num_pairs: usize, capacity: usize) -> Result<Self> {
        let mut pairs = Vec::with_capacity(num_pairs);
        for _ in 0..num_pairs {
            pairs.push(ChannelPair::new(capacity)?);
        }
        Ok(Self { pairs })
    }

    pub fn num_pairs(&self) -> usize {
        self.pairs.len()
    }

    pub fn pair(&self, index: usize) -> &ChannelPair {
        &self.pairs[index]
    }

    pub fn pair_mut(&mut self, index: usize) -> &mut ChannelPair {
        &mut self.pairs[index]
    }

    pub fn pairs(&self) -> &[ChannelPair] {
        &self.pairs
    }

    /// Slide every pair's window forward as the server clock advances.
    pub fn advance(&mut self, before: u64) {
        for pair in &mut self.pairs {
            pair.pop_before(before);
        }
    }
}
