//! Frequency-domain analyser.
//!
//! Mirrors a Web Audio `AnalyserNode`: the most recent `fft_size` samples are
//! Blackman-windowed, transformed, normalised by the window length, smoothed
//! against the previous frame and mapped from decibels onto `0..=255`.

use std::f32::consts::PI;
use std::sync::Arc;

use realfft::num_complex::Complex;
use realfft::{RealFftPlanner, RealToComplex};
use ringbuf::traits::{Consumer, RingBuffer};
use ringbuf::HeapRb;

use crate::config::AnalyserConfig;

pub struct AnalyserNode {
    config: AnalyserConfig,
    fft: Arc<dyn RealToComplex<f32>>,
    window: Vec<f32>,
    /// Last `fft_size` time-domain samples
    history: HeapRb<f32>,
    input: Vec<f32>,
    spectrum: Vec<Complex<f32>>,
    smoothed: Vec<f32>,
    bytes: Vec<u8>,
}

impl AnalyserNode {
    pub fn new(config: AnalyserConfig) -> Self {
        let n = config.fft_size;
        let mut planner = RealFftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(n);

        let mut history = HeapRb::<f32>::new(n);
        history.push_slice_overwrite(&vec![0.0f32; n]);

        let input = fft.make_input_vec();
        let spectrum = fft.make_output_vec();

        Self {
            fft,
            window: blackman(n),
            history,
            input,
            spectrum,
            smoothed: vec![0.0; n / 2],
            bytes: vec![0; n / 2],
            config,
        }
    }

    /// Number of frequency bins (half the FFT size)
    pub fn frequency_bin_count(&self) -> usize {
        self.config.fft_size / 2
    }

    /// Append mono samples; older samples fall out of the window
    pub fn write_samples(&mut self, samples: &[f32]) {
        self.history.push_slice_overwrite(samples);
    }

    /// Compute the current byte spectrum
    pub fn byte_frequency_data(&mut self) -> &[u8] {
        for (slot, (sample, w)) in self
            .input
            .iter_mut()
            .zip(self.history.iter().zip(self.window.iter()))
        {
            *slot = sample * w;
        }

        if let Err(e) = self.fft.process(&mut self.input, &mut self.spectrum) {
            log::warn!("[Analyser] FFT failed: {}", e);
            return &self.bytes;
        }

        let n = self.config.fft_size as f32;
        let tau = self.config.smoothing;
        let range = self.config.max_decibels - self.config.min_decibels;

        for k in 0..self.smoothed.len() {
            let magnitude = self.spectrum[k].norm() / n;
            let value = tau * self.smoothed[k] + (1.0 - tau) * magnitude;
            self.smoothed[k] = if value.is_finite() { value } else { 0.0 };

            let db = 20.0 * self.smoothed[k].log10();
            let scaled = 255.0 * (db - self.config.min_decibels) / range;
            self.bytes[k] = if scaled.is_nan() { 0 } else { scaled.clamp(0.0, 255.0) as u8 };
        }

        &self.bytes
    }

    /// Average byte magnitude across all bins
    pub fn average_magnitude(&mut self) -> f32 {
        let bins = self.byte_frequency_data();
        if bins.is_empty() {
            return 0.0;
        }
        let sum: u32 = bins.iter().map(|b| *b as u32).sum();
        sum as f32 / bins.len() as f32
    }
}

fn blackman(n: usize) -> Vec<f32> {
    const A0: f32 = 0.42;
    const A1: f32 = 0.5;
    const A2: f32 = 0.08;
    (0..n)
        .map(|i| {
            let x = i as f32 / n as f32;
            A0 - A1 * (2.0 * PI * x).cos() + A2 * (4.0 * PI * x).cos()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic uniform noise in [-amplitude, amplitude]
    fn noise(len: usize, amplitude: f32) -> Vec<f32> {
        let mut state: u32 = 0x1234_5678;
        (0..len)
            .map(|_| {
                state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                let unit = (state >> 8) as f32 / (1u32 << 24) as f32;
                (unit * 2.0 - 1.0) * amplitude
            })
            .collect()
    }

    #[test]
    fn test_silence_is_zero() {
        let mut node = AnalyserNode::new(AnalyserConfig::default());
        node.write_samples(&[0.0; 512]);
        assert_eq!(node.average_magnitude(), 0.0);
        assert_eq!(node.frequency_bin_count(), 128);
    }

    #[test]
    fn test_noise_exceeds_speaking_threshold() {
        let mut node = AnalyserNode::new(AnalyserConfig::default());
        node.write_samples(&noise(256, 0.5));
        let level = node.average_magnitude();
        assert!(level > 100.0, "level was {}", level);
    }

    #[test]
    fn test_smoothing_decays_after_silence() {
        let mut node = AnalyserNode::new(AnalyserConfig::default());
        node.write_samples(&noise(256, 0.5));
        let loud = node.average_magnitude();

        node.write_samples(&[0.0; 256]);
        let first = node.average_magnitude();
        let mut last = first;
        for _ in 0..200 {
            last = node.average_magnitude();
        }
        assert!(first > 0.0 && first < loud);
        assert_eq!(last, 0.0);
    }

    #[test]
    fn test_window_shape() {
        let w = blackman(256);
        assert!(w[0].abs() < 1e-6);
        assert!((w[128] - 1.0).abs() < 1e-6);
    }
}
