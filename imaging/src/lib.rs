//! Frame containers, FITS persistence and preview statistics for astrocam.
//!
//! Everything here is synchronous and free of engine state: the capture
//! controller owns frames, this crate only reads them.

pub mod fits;
pub mod stretch;

pub use fits::{read_fits, write_fits, FitsError, FitsHeader, FitsValue};
pub use stretch::{analyze, FrameAnalysis, DEFAULT_HISTOGRAM_BINS};

/// A single-channel raw sensor readout.
///
/// Pixels are stored row-major, top row first, one `u16` per photosite
/// regardless of the sensor's native bit depth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub bit_depth: u8,
    pub pixels: Vec<u16>,
}

impl RawFrame {
    pub fn new(width: u32, height: u32, bit_depth: u8, pixels: Vec<u16>) -> Self {
        Self {
            width,
            height,
            bit_depth,
            pixels,
        }
    }

    /// A frame filled with a constant value; handy for simulators and tests.
    pub fn filled(width: u32, height: u32, bit_depth: u8, value: u16) -> Self {
        Self::new(
            width,
            height,
            bit_depth,
            vec![value; width as usize * height as usize],
        )
    }

    /// Largest value the sensor can report at its bit depth.
    pub fn max_value(&self) -> u16 {
        max_value_for_depth(self.bit_depth)
    }

    /// Number of photosites at or above the saturation threshold.
    pub fn saturated_count(&self) -> u64 {
        let max = self.max_value();
        self.pixels.iter().filter(|&&p| p >= max).count() as u64
    }

    pub fn is_consistent(&self) -> bool {
        self.pixels.len() == self.width as usize * self.height as usize
    }

    pub fn row(&self, y: u32) -> &[u16] {
        let w = self.width as usize;
        let start = y as usize * w;
        &self.pixels[start..start + w]
    }
}

pub fn max_value_for_depth(bit_depth: u8) -> u16 {
    match bit_depth {
        0 => 0,
        d if d >= 16 => u16::MAX,
        d => ((1u32 << d) - 1) as u16,
    }
}
