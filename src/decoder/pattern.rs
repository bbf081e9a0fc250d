// SPDX-License-Identifier: GPL-3.0-only

use std::time::Duration;

use rand::{rngs::SmallRng, Rng, SeedableRng};

use super::{DecodedFrame, Decoder, DecoderError, FramePayload};

pub const DEFAULT_FPS: u32 = 30;

const BARS: [u32; 8] = [
    0x00ff_ffff,
    0x00ff_ff00,
    0x0000_ffff,
    0x0000_ff00,
    0x00ff_00ff,
    0x00ff_0000,
    0x0000_00ff,
    0x0000_0000,
];

/// Synthetic color bars with a moving block, the last resort of the decoder ladder.
pub struct PatternDecoder {
    width: u32,
    height: u32,
    fps: u32,
    seq: u64,
    limit: Option<u64>,
    flip_y: bool,
    depth: usize,
    outstanding: usize,
    free: Vec<Vec<u32>>,
    rng: SmallRng,
}

impl PatternDecoder {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        PatternDecoder {
            width: width.max(1),
            height: height.max(1),
            fps: fps.max(1),
            seq: 0,
            limit: None,
            flip_y: false,
            depth: 3,
            outstanding: 0,
            free: Vec::new(),
            rng: SmallRng::seed_from_u64(0x7761_7270),
        }
    }

    /// Reports end of stream after `frames` frames.
    pub fn with_frame_limit(mut self, frames: u64) -> Self {
        self.limit = Some(frames);
        self
    }

    fn capacity(&self) -> usize {
        // queued frames plus what the renderer keeps around
        self.depth + 2
    }

    fn paint(&mut self, pixels: &mut [u32]) {
        let (w, h) = (self.width as usize, self.height as usize);
        let bar_width = w.div_ceil(BARS.len()).max(1);
        let block = (h / 6).max(1);
        let travel = w.saturating_sub(block).max(1);
        let block_x = (self.seq as usize * 4) % travel;
        let block_y = h / 2 - block.min(h / 2) / 2;
        let noise_rows = (h / 16).max(1);

        for y in 0..h {
            let row_index = if self.flip_y { h - 1 - y } else { y };
            let row = &mut pixels[row_index * w..(row_index + 1) * w];
            for (x, pixel) in row.iter_mut().enumerate() {
                *pixel = if y >= h - noise_rows {
                    let level = self.rng.random::<u8>() as u32;
                    level << 16 | level << 8 | level
                } else if (block_y..block_y + block).contains(&y)
                    && (block_x..block_x + block).contains(&x)
                {
                    0x00ff_ffff
                } else {
                    BARS[(x / bar_width).min(BARS.len() - 1)]
                };
            }
        }
    }
}

impl Decoder for PatternDecoder {
    fn name(&self) -> &'static str {
        "pattern"
    }

    fn try_get_next_frame(&mut self) -> Option<DecodedFrame> {
        if self.is_eof() || self.outstanding >= self.capacity() {
            return None;
        }
        let len = self.width as usize * self.height as usize;
        let mut pixels = self.free.pop().unwrap_or_default();
        pixels.resize(len, 0);
        self.paint(&mut pixels);

        let frame = DecodedFrame {
            seq: self.seq,
            pts: Duration::from_secs(self.seq) / self.fps,
            width: self.width,
            height: self.height,
            flipped: self.flip_y,
            payload: FramePayload::Pixels(pixels),
        };
        self.seq += 1;
        self.outstanding += 1;
        Some(frame)
    }

    fn return_frame(&mut self, frame: DecodedFrame) {
        self.outstanding = self.outstanding.saturating_sub(1);
        if let FramePayload::Pixels(pixels) = frame.payload {
            self.free.push(pixels);
        }
    }

    fn is_eof(&self) -> bool {
        self.limit.is_some_and(|limit| self.seq >= limit)
    }

    fn is_fatal_error(&self) -> bool {
        false
    }

    fn rewind(&mut self) -> Result<(), DecoderError> {
        self.seq = 0;
        Ok(())
    }

    fn reset(&mut self) -> Result<(), DecoderError> {
        Ok(())
    }

    fn set_queue_depth(&mut self, depth: usize) {
        self.depth = depth.max(1);
    }

    fn set_flip_y(&mut self, flip: bool) {
        self.flip_y = flip;
    }
}
