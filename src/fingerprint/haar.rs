//! Standard 2D Haar wavelet decomposition.
//!
//! Rows are decomposed to their full pyramid first, then columns, using the
//! orthonormal step `a' = (a + b) / sqrt(2)`, `d' = (a - b) / sqrt(2)`.
//! Orthonormality means the transform preserves tile energy.

use std::f32::consts::FRAC_1_SQRT_2;

/// Decompose a square `size * size` tile in place.
///
/// `tile` is row-major and `size` a power of two; both are invariants of the
/// encoder that owns the tile.
pub fn transform(tile: &mut [f32], size: usize) {
    debug_assert_eq!(tile.len(), size * size);
    debug_assert!(size.is_power_of_two());

    let mut scratch = vec![0.0f32; size];

    for row in 0..size {
        decompose(&mut tile[row * size..(row + 1) * size], &mut scratch);
    }

    let mut column = vec![0.0f32; size];
    for col in 0..size {
        for row in 0..size {
            column[row] = tile[row * size + col];
        }
        decompose(&mut column, &mut scratch);
        for row in 0..size {
            tile[row * size + col] = column[row];
        }
    }
}

/// Full pyramid decomposition of one line, halving the active length each
/// level until only the average remains.
fn decompose(data: &mut [f32], scratch: &mut [f32]) {
    let mut len = data.len();
    while len > 1 {
        let half = len / 2;
        for i in 0..half {
            let a = data[2 * i];
            let b = data[2 * i + 1];
            scratch[i] = (a + b) * FRAC_1_SQRT_2;
            scratch[half + i] = (a - b) * FRAC_1_SQRT_2;
        }
        data[..len].copy_from_slice(&scratch[..len]);
        len = half;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn energy(tile: &[f32]) -> f64 {
        tile.iter().map(|&v| (v as f64) * (v as f64)).sum()
    }

    #[test]
    fn two_by_two_known_values() {
        let mut tile = vec![1.0, 1.0, 1.0, 1.0];
        transform(&mut tile, 2);
        assert!((tile[0] - 2.0).abs() < 1e-6);
        for &v in &tile[1..] {
            assert!(v.abs() < 1e-6);
        }
    }

    #[test]
    fn constant_tile_collapses_to_dc() {
        let size = 8;
        let mut tile = vec![0.5f32; size * size];
        transform(&mut tile, size);
        // DC carries all energy: sqrt(size^2 * 0.25) = size * 0.5
        assert!((tile[0] - size as f32 * 0.5).abs() < 1e-4);
        assert!(tile[1..].iter().all(|v| v.abs() < 1e-4));
    }

    #[test]
    fn preserves_energy() {
        let size = 32;
        // Deterministic pseudo-random tile
        let mut state = 0x2545F4914F6CDD1Du64;
        let mut tile: Vec<f32> = (0..size * size)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state >> 40) as f32 / 16777216.0 - 0.5
            })
            .collect();

        let before = energy(&tile);
        transform(&mut tile, size);
        let after = energy(&tile);

        assert!(
            (before - after).abs() < before.max(1.0) * 1e-4,
            "energy drifted: {before} -> {after}"
        );
    }
}
