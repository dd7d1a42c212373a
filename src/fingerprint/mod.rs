pub mod encoder;
pub mod haar;
pub mod spectrogram;

use crate::config::FingerprintConfig;

/// A perceptual fingerprint of one spectrogram tile.
///
/// `bits` holds one byte per bit (`0` or `1`), matching the persisted blob
/// layout, with length `2 * fingerprint_length * frequency_bins`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    /// Index of this fingerprint within its clip (0-based).
    pub song_order: usize,
    pub bits: Vec<u8>,
}

/// Number of differing bits between two fingerprint vectors.
pub fn hamming_distance(a: &[u8], b: &[u8]) -> u32 {
    a.iter().zip(b.iter()).filter(|(x, y)| x != y).count() as u32
}

/// Fingerprint a mono PCM clip.
///
/// Builds the log-spaced spectrogram, slides a non-overlapping window of
/// `fingerprint_length` frames across time, and encodes each full tile.
/// An incomplete trailing tile is discarded. A clip with fewer frames than
/// one tile returns an empty list; callers treat that as "not indexable",
/// not as an error.
pub fn create_fingerprints(
    pcm: &[f32],
    cfg: &FingerprintConfig,
) -> (Vec<Vec<f32>>, Vec<Fingerprint>) {
    let spectrogram = spectrogram::build(pcm, cfg);
    let tile_frames = cfg.fingerprint_length;
    let bins = cfg.frequency_bins;

    let mut fingerprints = Vec::with_capacity(spectrogram.len() / tile_frames);
    for (song_order, window) in spectrogram.chunks_exact(tile_frames).enumerate() {
        let mut tile = Vec::with_capacity(tile_frames * bins);
        for frame in window {
            tile.extend_from_slice(frame);
        }
        normalize(&mut tile);
        haar::transform(&mut tile, tile_frames);
        fingerprints.push(Fingerprint {
            song_order,
            bits: encoder::encode(&tile, cfg.top_wavelets),
        });
    }

    (spectrogram, fingerprints)
}

/// Min/max normalization to [0, 1]. A flat tile maps to zeros.
fn normalize(tile: &mut [f32]) {
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    for &v in tile.iter() {
        min = min.min(v);
        max = max.max(v);
    }
    let range = max - min;
    if range <= f32::EPSILON {
        tile.fill(0.0);
        return;
    }
    for v in tile.iter_mut() {
        *v = (*v - min) / range;
    }
}
