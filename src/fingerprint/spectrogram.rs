//! Log-spaced STFT spectrogram.
//!
//! Frames the mono PCM stream, applies a Hann window, and folds FFT
//! magnitudes onto a logarithmic frequency grid between `start_frequency`
//! and `end_frequency`.

use std::f32::consts::PI;

use rustfft::{num_complex::Complex, FftPlanner};

use crate::config::FingerprintConfig;

/// Build the log-magnitude spectrogram for a mono PCM clip.
///
/// Returns one row per full STFT frame, each row holding `frequency_bins`
/// values. A clip shorter than one window produces no frames.
pub fn build(pcm: &[f32], cfg: &FingerprintConfig) -> Vec<Vec<f32>> {
    if pcm.len() < cfg.window_size {
        return Vec::new();
    }

    let window = hann_window(cfg.window_size);
    let edges = log_band_edges(cfg);

    let mut planner = FftPlanner::<f32>::new();
    let fft = planner.plan_fft_forward(cfg.window_size);

    let mut frames = Vec::with_capacity((pcm.len() - cfg.window_size) / cfg.overlap + 1);
    let mut buffer: Vec<Complex<f32>> = vec![Complex { re: 0.0, im: 0.0 }; cfg.window_size];

    let mut position = 0;
    while position + cfg.window_size <= pcm.len() {
        for (i, &sample) in pcm[position..position + cfg.window_size].iter().enumerate() {
            buffer[i] = Complex {
                re: sample * window[i],
                im: 0.0,
            };
        }
        fft.process(&mut buffer);

        frames.push(fold_bands(&buffer, &edges));
        position += cfg.overlap;
    }

    frames
}

fn hann_window(size: usize) -> Vec<f32> {
    let n = size as f32;
    (0..size)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / (n - 1.0)).cos()))
        .collect()
}

/// Mean FFT magnitude per log band, logged at emission.
fn fold_bands(spectrum: &[Complex<f32>], edges: &[usize]) -> Vec<f32> {
    let mut bands = Vec::with_capacity(edges.len() - 1);
    for pair in edges.windows(2) {
        let (lo, hi) = (pair[0], pair[1].max(pair[0] + 1));
        let mut sum = 0.0f32;
        for c in &spectrum[lo..hi] {
            sum += (c.re * c.re + c.im * c.im).sqrt();
        }
        let mean = sum / (hi - lo) as f32;
        bands.push((1.0 + mean).ln());
    }
    bands
}

/// FFT index boundaries of the logarithmic frequency grid.
///
/// Bin `i` spans `start * base^(i * delta)` to `start * base^((i + 1) * delta)`
/// with `delta = (log_base(end) - log_base(start)) / bins`.
fn log_band_edges(cfg: &FingerprintConfig) -> Vec<usize> {
    let half = cfg.window_size / 2;
    let base = cfg.log_base;
    let delta = (cfg.end_frequency.log(base) - cfg.start_frequency.log(base))
        / cfg.frequency_bins as f32;

    (0..=cfg.frequency_bins)
        .map(|i| {
            let freq = cfg.start_frequency * base.powf(i as f32 * delta);
            let idx = (freq * cfg.window_size as f32 / cfg.sample_rate as f32).round() as usize;
            idx.clamp(1, half)
        })
        .collect()
}
