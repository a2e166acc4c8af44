//! Audio chunks and the PCM16 chunker that produces them.
//!
//! Clients stream raw 16-bit little-endian mono PCM. Frames arrive with
//! arbitrary sizes (even odd byte counts), so [`ChunkBuffer`] keeps the
//! not-yet-decoded tail and cuts fixed-length [`AudioChunk`]s as soon as
//! enough samples have accumulated.

/// One unit of decode work: a run of mono `f32` samples in `[-1.0, 1.0)`.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioChunk {
    /// Position of this chunk within its session, starting at 0.
    pub seq: u64,
    /// Samples at the session's sample rate.
    pub samples: Vec<f32>,
    /// Last chunk of the stream (flushed on end-of-speech).
    pub is_final: bool,
}

/// Errors from chunker construction.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AudioError {
    /// Sample rate or chunk length would produce empty chunks.
    #[error("invalid chunk geometry: {sample_rate} Hz x {chunk_ms} ms")]
    InvalidGeometry {
        /// Requested sample rate.
        sample_rate: u32,
        /// Requested chunk length in milliseconds.
        chunk_ms: u32,
    },
}

/// Convert one little-endian PCM16 sample pair to `f32`.
#[inline]
fn sample_from_le(lo: u8, hi: u8) -> f32 {
    f32::from(i16::from_le_bytes([lo, hi])) / 32768.0
}

/// Ordered buffer of not-yet-decoded audio for one session.
#[derive(Debug)]
pub struct ChunkBuffer {
    sample_rate: u32,
    chunk_samples: usize,
    pending: Vec<f32>,
    odd_byte: Option<u8>,
    next_seq: u64,
    finished: bool,
}

impl ChunkBuffer {
    /// Create a chunker cutting `chunk_ms` worth of samples at `sample_rate`.
    pub fn new(sample_rate: u32, chunk_ms: u32) -> Result<Self, AudioError> {
        let chunk_samples = Self::samples_for(sample_rate, chunk_ms)?;
        Ok(Self {
            sample_rate,
            chunk_samples,
            pending: Vec::with_capacity(chunk_samples),
            odd_byte: None,
            next_seq: 0,
            finished: false,
        })
    }

    fn samples_for(sample_rate: u32, chunk_ms: u32) -> Result<usize, AudioError> {
        let samples = u64::from(sample_rate) * u64::from(chunk_ms) / 1000;
        if samples == 0 {
            return Err(AudioError::InvalidGeometry {
                sample_rate,
                chunk_ms,
            });
        }
        Ok(samples as usize)
    }

    /// Change the chunk length for audio not yet cut.
    pub fn set_chunk_ms(&mut self, chunk_ms: u32) -> Result<(), AudioError> {
        self.chunk_samples = Self::samples_for(self.sample_rate, chunk_ms)?;
        Ok(())
    }

    /// Samples per full chunk.
    pub fn chunk_samples(&self) -> usize {
        self.chunk_samples
    }

    /// Samples buffered but not yet cut into a chunk.
    pub fn buffered_samples(&self) -> usize {
        self.pending.len()
    }

    /// Append a PCM16LE frame and return every full chunk now available.
    ///
    /// Audio pushed after [`finish`](Self::finish) is dropped.
    pub fn push_pcm16(&mut self, bytes: &[u8]) -> Vec<AudioChunk> {
        if self.finished || bytes.is_empty() {
            return Vec::new();
        }

        let mut rest = bytes;
        if let Some(lo) = self.odd_byte.take() {
            self.pending.push(sample_from_le(lo, rest[0]));
            rest = &rest[1..];
        }
        let pairs = rest.chunks_exact(2);
        if let [last] = pairs.remainder() {
            self.odd_byte = Some(*last);
        }
        self.pending
            .extend(pairs.map(|pair| sample_from_le(pair[0], pair[1])));

        let mut ready = Vec::new();
        while self.pending.len() >= self.chunk_samples {
            let tail = self.pending.split_off(self.chunk_samples);
            let samples = std::mem::replace(&mut self.pending, tail);
            ready.push(self.cut(samples, false));
        }
        ready
    }

    /// Flush the residual buffer as the final chunk (possibly empty).
    ///
    /// Returns `None` if the stream was already finished.
    pub fn finish(&mut self) -> Option<AudioChunk> {
        if self.finished {
            return None;
        }
        self.finished = true;
        self.odd_byte = None;
        let samples = std::mem::take(&mut self.pending);
        Some(self.cut(samples, true))
    }

    fn cut(&mut self, samples: Vec<f32>, is_final: bool) -> AudioChunk {
        let seq = self.next_seq;
        self.next_seq += 1;
        AudioChunk {
            seq,
            samples,
            is_final,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn pcm(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn converts_full_scale_samples() {
        // 1 kHz x 3 ms = 3 samples per chunk
        let mut buf = ChunkBuffer::new(1_000, 3).unwrap();
        let chunks = buf.push_pcm16(&pcm(&[0, i16::MAX, i16::MIN]));
        let out = &chunks[0].samples;
        assert_eq!(out[0], 0.0);
        assert!((out[1] - 0.999_97).abs() < 1e-4);
        assert_eq!(out[2], -1.0);
    }

    #[test]
    fn zero_length_chunks_rejected() {
        assert_matches!(
            ChunkBuffer::new(16_000, 0),
            Err(AudioError::InvalidGeometry { chunk_ms: 0, .. })
        );
        assert!(ChunkBuffer::new(0, 600).is_err());
    }

    #[test]
    fn chunk_samples_follow_rate_and_length() {
        let buf = ChunkBuffer::new(16_000, 600).unwrap();
        assert_eq!(buf.chunk_samples(), 9_600);
    }

    #[test]
    fn cuts_full_chunks_in_order() {
        // 1 kHz x 10 ms = 10 samples per chunk
        let mut buf = ChunkBuffer::new(1_000, 10).unwrap();
        let samples: Vec<i16> = (0..25).collect();
        let chunks = buf.push_pcm16(&pcm(&samples));
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].seq, 0);
        assert_eq!(chunks[1].seq, 1);
        assert!(chunks.iter().all(|c| c.samples.len() == 10 && !c.is_final));
        assert_eq!(buf.buffered_samples(), 5);
    }

    #[test]
    fn odd_byte_carries_into_next_frame() {
        let mut buf = ChunkBuffer::new(1_000, 10).unwrap();
        let bytes = pcm(&[1000; 10]);
        let (head, tail) = bytes.split_at(7);
        assert!(buf.push_pcm16(head).is_empty());
        assert_eq!(buf.buffered_samples(), 3);
        let chunks = buf.push_pcm16(tail);
        assert_eq!(chunks.len(), 1);
        let expected = 1000.0 / 32768.0;
        assert!(chunks[0].samples.iter().all(|s| (s - expected).abs() < 1e-6));
    }

    #[test]
    fn finish_flushes_residual_as_final() {
        let mut buf = ChunkBuffer::new(1_000, 10).unwrap();
        let _ = buf.push_pcm16(&pcm(&[5; 13]));
        let last = buf.finish().unwrap();
        assert!(last.is_final);
        assert_eq!(last.seq, 1);
        assert_eq!(last.samples.len(), 3);
        assert!(buf.finish().is_none());
        assert!(buf.push_pcm16(&pcm(&[1; 20])).is_empty());
    }

    #[test]
    fn finish_on_empty_stream_yields_empty_final_chunk() {
        let mut buf = ChunkBuffer::new(16_000, 600).unwrap();
        let last = buf.finish().unwrap();
        assert!(last.is_final);
        assert!(last.samples.is_empty());
        assert_eq!(last.seq, 0);
    }

    #[test]
    fn resizing_applies_to_buffered_audio() {
        let mut buf = ChunkBuffer::new(1_000, 10).unwrap();
        assert!(buf.push_pcm16(&pcm(&[0; 8])).is_empty());
        buf.set_chunk_ms(5).unwrap();
        let chunks = buf.push_pcm16(&pcm(&[0; 2]));
        assert_eq!(chunks.len(), 2);
        assert_eq!(buf.buffered_samples(), 0);
    }
}
