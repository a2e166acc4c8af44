//! Global CMVN statistics from a Kaldi nnet text file (`am.mvn`).
//!
//! The file holds an `<AddShift>` component (negated means) and a
//! `<Rescale>` component (inverse standard deviations), each as a
//! bracketed vector:
//!
//! ```text
//! <AddShift> 560 560
//! <LearnRateCoef> 0 [ -8.31 -8.60 ... ]
//! <Rescale> 560 560
//! <LearnRateCoef> 0 [ 0.155 0.147 ... ]
//! ```

use std::path::Path;

use crate::types::{EngineError, ResultExt};

/// Per-dimension shift and scale applied as `(x + shift) * scale`.
#[derive(Debug, Clone, PartialEq)]
pub struct Cmvn {
    shift: Vec<f32>,
    scale: Vec<f32>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Shift,
    Scale,
}

impl Cmvn {
    /// Read and parse `am.mvn`.
    pub fn from_file(path: &Path) -> Result<Self, EngineError> {
        let text = std::fs::read_to_string(path).model(&format!("read {}", path.display()))?;
        Self::parse(&text)
    }

    /// Parse the nnet text format.
    pub fn parse(text: &str) -> Result<Self, EngineError> {
        let mut shift = Vec::new();
        let mut scale = Vec::new();
        let mut section = Section::None;
        let mut in_vector = false;

        for token in text.split_whitespace() {
            match token {
                "<AddShift>" => section = Section::Shift,
                "<Rescale>" => section = Section::Scale,
                "[" => in_vector = true,
                "]" => {
                    in_vector = false;
                    section = Section::None;
                }
                t if in_vector && section != Section::None => {
                    let v: f32 = t.parse().model(&format!("am.mvn value {t:?}"))?;
                    match section {
                        Section::Shift => shift.push(v),
                        Section::Scale => scale.push(v),
                        Section::None => {}
                    }
                }
                _ => {}
            }
        }

        if shift.is_empty() || shift.len() != scale.len() {
            return Err(EngineError::ModelNotAvailable(format!(
                "am.mvn: expected matching <AddShift>/<Rescale> vectors, got {} and {}",
                shift.len(),
                scale.len()
            )));
        }
        Ok(Self { shift, scale })
    }

    /// Feature dimension the statistics cover.
    pub fn dim(&self) -> usize {
        self.shift.len()
    }

    /// Normalize one feature row in place.
    pub fn apply(&self, row: &mut [f32]) {
        for ((x, shift), scale) in row.iter_mut().zip(&self.shift).zip(&self.scale) {
            *x = (*x + shift) * scale;
        }
    }
}
