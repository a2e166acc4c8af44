//! Kaldi-compatible log-mel filterbank features.
//!
//! Matches `compute-fbank-feats` with `dither=0`, `snip_edges=true`,
//! a Hamming window and power spectrum, which is what Paraformer models
//! were trained on.

use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

/// Samples per analysis frame (25 ms at 16 kHz).
pub const FRAME_LENGTH: usize = 400;
/// Samples between frame starts (10 ms at 16 kHz).
pub const FRAME_SHIFT: usize = 160;
/// Mel bins per frame.
pub const NUM_MEL_BINS: usize = 80;

const N_FFT: usize = 512;
const PREEMPH: f32 = 0.97;
const LOW_FREQ: f32 = 20.0;
/// Input is scaled back to the int16 range Kaldi operates on.
const INT16_SCALE: f32 = 32768.0;

fn mel_scale(freq: f32) -> f32 {
    1127.0 * (1.0 + freq / 700.0).ln()
}

/// Number of full frames in `len` samples.
pub fn num_frames(len: usize) -> usize {
    if len < FRAME_LENGTH {
        0
    } else {
        1 + (len - FRAME_LENGTH) / FRAME_SHIFT
    }
}

/// Filterbank extractor. Construction plans the FFT and builds the mel banks once.
pub struct Fbank {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    /// `NUM_MEL_BINS` rows of `(first_bin, weights)`.
    banks: Vec<(usize, Vec<f32>)>,
}

impl std::fmt::Debug for Fbank {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fbank")
            .field("mel_bins", &self.banks.len())
            .finish_non_exhaustive()
    }
}

impl Fbank {
    /// Build an extractor for audio at `sample_rate`.
    #[allow(clippy::cast_precision_loss)]
    pub fn new(sample_rate: u32) -> Self {
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(N_FFT);

        let denom = (FRAME_LENGTH - 1) as f32;
        let window = (0..FRAME_LENGTH)
            .map(|i| 0.54 - 0.46 * (2.0 * std::f32::consts::PI * i as f32 / denom).cos())
            .collect();

        Self {
            fft,
            window,
            banks: mel_banks(sample_rate as f32),
        }
    }

    /// Compute `num_frames(samples.len())` rows of `NUM_MEL_BINS` log energies.
    ///
    /// `samples` are floats in `[-1.0, 1.0)`.
    pub fn compute(&self, samples: &[f32]) -> Vec<Vec<f32>> {
        let frames = num_frames(samples.len());
        let mut out = Vec::with_capacity(frames);
        let mut frame = vec![0f32; FRAME_LENGTH];
        let mut buffer = vec![Complex::<f32>::new(0.0, 0.0); N_FFT];
        let mut power = vec![0f32; N_FFT / 2 + 1];

        for t in 0..frames {
            let start = t * FRAME_SHIFT;
            for (dst, src) in frame.iter_mut().zip(&samples[start..start + FRAME_LENGTH]) {
                *dst = src * INT16_SCALE;
            }
            process_frame(&mut frame, &self.window);

            for (i, slot) in buffer.iter_mut().enumerate() {
                *slot = Complex::new(frame.get(i).copied().unwrap_or(0.0), 0.0);
            }
            self.fft.process(&mut buffer);
            for (p, c) in power.iter_mut().zip(&buffer) {
                *p = c.norm_sqr();
            }

            let row = self
                .banks
                .iter()
                .map(|(first, weights)| {
                    let energy: f32 = weights
                        .iter()
                        .zip(&power[*first..])
                        .map(|(w, p)| w * p)
                        .sum();
                    energy.max(f32::EPSILON).ln()
                })
                .collect();
            out.push(row);
        }
        out
    }
}

/// DC removal, pre-emphasis and windowing, in place.
fn process_frame(frame: &mut [f32], window: &[f32]) {
    #[allow(clippy::cast_precision_loss)]
    let mean = frame.iter().sum::<f32>() / frame.len() as f32;
    for s in frame.iter_mut() {
        *s -= mean;
    }
    for i in (1..frame.len()).rev() {
        frame[i] -= PREEMPH * frame[i - 1];
    }
    frame[0] -= PREEMPH * frame[0];
    for (s, w) in frame.iter_mut().zip(window) {
        *s *= w;
    }
}

/// Triangular filters spaced evenly on the mel scale between `LOW_FREQ` and Nyquist.
#[allow(clippy::cast_precision_loss)]
fn mel_banks(sample_rate: f32) -> Vec<(usize, Vec<f32>)> {
    let nyquist = sample_rate / 2.0;
    let fft_bin_width = sample_rate / N_FFT as f32;
    let mel_low = mel_scale(LOW_FREQ);
    let mel_high = mel_scale(nyquist);
    let mel_delta = (mel_high - mel_low) / (NUM_MEL_BINS + 1) as f32;
    let num_fft_bins = N_FFT / 2;

    (0..NUM_MEL_BINS)
        .map(|bin| {
            let left = mel_low + bin as f32 * mel_delta;
            let center = left + mel_delta;
            let right = center + mel_delta;

            let weights: Vec<(usize, f32)> = (0..num_fft_bins)
                .filter_map(|k| {
                    let mel = mel_scale(fft_bin_width * k as f32);
                    let w = if mel > left && mel <= center {
                        (mel - left) / (center - left)
                    } else if mel > center && mel < right {
                        (right - mel) / (right - center)
                    } else {
                        return None;
                    };
                    Some((k, w))
                })
                .collect();

            let first = weights.first().map_or(0, |(k, _)| *k);
            (first, weights.into_iter().map(|(_, w)| w).collect())
        })
        .collect()
}
