//! Preview statistics and display stretch
//!
//! [`analyze`] is a pure function of the raw frame: it never mutates the
//! buffer and keeps no state between calls, so the same frame always
//! yields the same histogram and preview.

use crate::{max_value_for_depth, RawFrame};
use image::{GrayImage, Luma};

/// Bins used by the on-screen histogram.
pub const DEFAULT_HISTOGRAM_BINS: usize = 64;

/// Strength of the asinh stretch. Higher values lift faint signal more.
pub const ASINH_STRENGTH: f32 = 15.0;

#[derive(Debug, Clone)]
pub struct FrameAnalysis {
    /// Bin heights in `[0, 1]`, log-compressed. The last bin holds only
    /// saturated photosites.
    pub log_histogram: Vec<f32>,
    /// Raw counts behind `log_histogram`.
    pub bin_counts: Vec<u64>,
    pub saturated_count: u64,
    pub stretched_preview: GrayImage,
}

/// Compute histogram, saturation and a stretched preview that fits inside
/// `display_width` x `display_height`.
pub fn analyze(frame: &RawFrame, display_width: u32, display_height: u32) -> FrameAnalysis {
    analyze_with_bins(frame, display_width, display_height, DEFAULT_HISTOGRAM_BINS)
}

pub fn analyze_with_bins(
    frame: &RawFrame,
    display_width: u32,
    display_height: u32,
    bins: usize,
) -> FrameAnalysis {
    let bins = bins.max(2);
    let max = max_value_for_depth(frame.bit_depth);

    let mut bin_counts = vec![0u64; bins];
    for &p in &frame.pixels {
        bin_counts[histogram_bin(p, max, bins)] += 1;
    }
    let saturated_count = bin_counts[bins - 1];

    let peak = bin_counts
        .iter()
        .map(|&c| (c as f32).ln_1p())
        .fold(0.0f32, f32::max);
    let log_histogram = bin_counts
        .iter()
        .map(|&c| if peak > 0.0 { (c as f32).ln_1p() / peak } else { 0.0 })
        .collect();

    let lut = asinh_lut(max, ASINH_STRENGTH);
    let stretched_preview = preview(frame, &lut, display_width, display_height);

    FrameAnalysis {
        log_histogram,
        bin_counts,
        saturated_count,
        stretched_preview,
    }
}

/// Map a pixel value to a histogram bin whose width grows logarithmically.
///
/// Values at or above `max` always land in the final bin; everything else
/// is spread over the remaining `bins - 1` by `log2(v + 1)`.
pub fn histogram_bin(value: u16, max: u16, bins: usize) -> usize {
    if value >= max {
        return bins - 1;
    }
    let span = ((max as f64) + 1.0).log2();
    if span <= 0.0 {
        return 0;
    }
    let pos = ((value as f64) + 1.0).log2() / span;
    ((pos * (bins - 1) as f64) as usize).min(bins - 2)
}

/// Lookup table for `asinh(k x) / asinh(k)` over `0..=max`, scaled to 8 bits.
pub fn asinh_lut(max: u16, strength: f32) -> Vec<u8> {
    let norm = strength.asinh();
    let denom = (max as f32).max(1.0);
    (0..=max as u32)
        .map(|v| {
            let x = v as f32 / denom;
            let y = (strength * x).asinh() / norm;
            (y.clamp(0.0, 1.0) * 255.0).round() as u8
        })
        .collect()
}

/// Power-of-two decimation factor so the frame fits the display.
pub fn downsample_factor(width: u32, height: u32, display_width: u32, display_height: u32) -> u32 {
    let mut factor = 1u32;
    let dw = display_width.max(1);
    let dh = display_height.max(1);
    while width / factor > dw || height / factor > dh {
        factor *= 2;
    }
    factor
}

fn preview(frame: &RawFrame, lut: &[u8], display_width: u32, display_height: u32) -> GrayImage {
    if !frame.is_consistent() || frame.width == 0 || frame.height == 0 {
        return GrayImage::new(0, 0);
    }
    let factor = downsample_factor(frame.width, frame.height, display_width, display_height);
    let out_w = (frame.width / factor).max(1);
    let out_h = (frame.height / factor).max(1);
    let last = lut.len().saturating_sub(1);

    GrayImage::from_fn(out_w, out_h, |x, y| {
        let sx = (x * factor).min(frame.width - 1) as usize;
        let sy = (y * factor).min(frame.height - 1) as usize;
        let v = frame.pixels[sy * frame.width as usize + sx] as usize;
        Luma([lut.get(v.min(last)).copied().unwrap_or(255)])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lut_is_monotonic_and_spans_range() {
        let lut = asinh_lut(4095, ASINH_STRENGTH);
        assert_eq!(lut.len(), 4096);
        assert_eq!(lut[0], 0);
        assert_eq!(lut[4095], 255);
        assert!(lut.windows(2).all(|w| w[0] <= w[1]));
        // faint signal is lifted well above linear
        assert!(lut[205] > 255 / 20 * 3);
    }

    #[test]
    fn test_saturated_pixels_land_in_last_bin() {
        let frame = RawFrame::new(4, 1, 8, vec![0, 10, 255, 255]);
        let a = analyze(&frame, 4, 1);
        assert_eq!(a.saturated_count, 2);
        assert_eq!(a.bin_counts[DEFAULT_HISTOGRAM_BINS - 1], 2);
        assert_eq!(a.bin_counts.iter().sum::<u64>(), 4);
        let top = a.log_histogram.iter().cloned().fold(0.0f32, f32::max);
        assert!((top - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_bins_are_wider_at_the_bright_end() {
        let max = 65535;
        let bins = 64;
        assert_ne!(histogram_bin(1, max, bins), histogram_bin(4, max, bins));
        assert_eq!(histogram_bin(40000, max, bins), histogram_bin(41000, max, bins));
        assert!(histogram_bin(65534, max, bins) < bins - 1);
    }

    #[test]
    fn test_preview_halves_until_it_fits() {
        assert_eq!(downsample_factor(640, 480, 640, 480), 1);
        assert_eq!(downsample_factor(1920, 1080, 320, 240), 8);
        let frame = RawFrame::filled(100, 60, 16, 1000);
        let a = analyze(&frame, 30, 30);
        assert_eq!(a.stretched_preview.dimensions(), (25, 15));
    }

    #[test]
    fn test_analyze_does_not_touch_input() {
        let frame = RawFrame::new(2, 2, 12, vec![1, 2, 3, 4095]);
        let copy = frame.clone();
        let _ = analyze(&frame, 2, 2);
        assert_eq!(frame, copy);
    }
}
