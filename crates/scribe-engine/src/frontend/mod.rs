//! Acoustic frontend: fbank → low frame rate stacking → CMVN.
//!
//! Produces the `[T, 560]` feature matrix Paraformer consumes from raw
//! 16 kHz samples. Pure Rust, independent of the inference backend.

pub mod cmvn;
pub mod fbank;

pub use cmvn::Cmvn;
pub use fbank::{FRAME_SHIFT, Fbank, NUM_MEL_BINS, num_frames};

/// Frames stacked per LFR output frame.
pub const LFR_M: usize = 7;
/// Frames advanced per LFR output frame.
pub const LFR_N: usize = 6;
/// Feature dimension after stacking.
pub const FEATURE_DIM: usize = NUM_MEL_BINS * LFR_M;

/// Stack `LFR_M` consecutive frames every `LFR_N` frames.
///
/// The input is left-padded with `(LFR_M - 1) / 2` copies of the first
/// frame; the tail is padded by repeating the last frame.
pub fn apply_lfr(frames: &[Vec<f32>]) -> Vec<Vec<f32>> {
    let Some(first) = frames.first() else {
        return Vec::new();
    };
    let left_pad = (LFR_M - 1) / 2;
    let padded: Vec<&Vec<f32>> = std::iter::repeat_n(first, left_pad).chain(frames).collect();
    let out_frames = frames.len().div_ceil(LFR_N);

    (0..out_frames)
        .map(|i| {
            let start = i * LFR_N;
            let mut row = Vec::with_capacity(FEATURE_DIM);
            for j in 0..LFR_M {
                let idx = (start + j).min(padded.len() - 1);
                row.extend_from_slice(padded[idx]);
            }
            row
        })
        .collect()
}

/// Complete feature pipeline for one engine instance.
#[derive(Debug)]
pub struct Frontend {
    fbank: Fbank,
    cmvn: Cmvn,
}

impl Frontend {
    /// Combine an extractor with CMVN statistics of dimension [`FEATURE_DIM`].
    pub fn new(fbank: Fbank, cmvn: Cmvn) -> Self {
        Self { fbank, cmvn }
    }

    /// Normalized LFR features for `samples`. Empty when shorter than one frame.
    pub fn features(&self, samples: &[f32]) -> Vec<Vec<f32>> {
        let mut lfr = apply_lfr(&self.fbank.compute(samples));
        for row in &mut lfr {
            self.cmvn.apply(row);
        }
        lfr
    }
}

/// Split `carry ++ samples` into the audio to analyse now and the tail to
/// carry into the next chunk.
///
/// The tail is whatever the last full frame shift did not consume, so
/// frames continue seamlessly across chunk boundaries. On the final chunk
/// nothing is carried.
pub fn split_with_carry(carry: &[f32], samples: &[f32], is_final: bool) -> (Vec<f32>, Vec<f32>) {
    let mut audio = Vec::with_capacity(carry.len() + samples.len());
    audio.extend_from_slice(carry);
    audio.extend_from_slice(samples);
    if is_final {
        return (audio, Vec::new());
    }
    let frames = num_frames(audio.len());
    let consumed = frames * FRAME_SHIFT;
    let tail = audio[consumed..].to_vec();
    (audio, tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[allow(clippy::cast_precision_loss)]
    fn frames(n: usize) -> Vec<Vec<f32>> {
        (0..n).map(|i| vec![i as f32; NUM_MEL_BINS]).collect()
    }

    #[test]
    fn lfr_output_length_rounds_up() {
        assert_eq!(apply_lfr(&frames(0)).len(), 0);
        assert_eq!(apply_lfr(&frames(1)).len(), 1);
        assert_eq!(apply_lfr(&frames(6)).len(), 1);
        assert_eq!(apply_lfr(&frames(7)).len(), 2);
        assert_eq!(apply_lfr(&frames(60)).len(), 10);
    }

    #[test]
    fn lfr_pads_left_with_first_frame() {
        let out = apply_lfr(&frames(10));
        assert_eq!(out[0].len(), FEATURE_DIM);
        let firsts: Vec<f32> = out[0].chunks(NUM_MEL_BINS).map(|c| c[0]).collect();
        assert_eq!(firsts, vec![0.0, 0.0, 0.0, 0.0, 1.0, 2.0, 3.0]);
    }

    #[test]
    fn lfr_pads_right_with_last_frame() {
        let out = apply_lfr(&frames(8));
        let firsts: Vec<f32> = out[1].chunks(NUM_MEL_BINS).map(|c| c[0]).collect();
        // padded index 6.. → frames 3..7 then repeat 7
        assert_eq!(firsts, vec![3.0, 4.0, 5.0, 6.0, 7.0, 7.0, 7.0]);
    }

    #[test]
    fn carry_keeps_unconsumed_tail() {
        let (audio, tail) = split_with_carry(&[0.0; 100], &[0.0; 500], false);
        assert_eq!(audio.len(), 600);
        // two frames → 320 consumed
        assert_eq!(tail.len(), 280);
    }

    #[test]
    fn final_chunk_carries_nothing() {
        let (audio, tail) = split_with_carry(&[0.0; 10], &[0.0; 20], true);
        assert_eq!(audio.len(), 30);
        assert!(tail.is_empty());
    }

    #[test]
    fn short_audio_is_carried_whole() {
        let (_, tail) = split_with_carry(&[], &[0.0; 300], false);
        assert_eq!(tail.len(), 300);
    }
}
