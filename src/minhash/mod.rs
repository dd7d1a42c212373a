//! MinHash sketching and LSH band grouping.
//!
//! A fingerprint's F-bit vector is compressed into a K-element signature via
//! pre-generated random permutations, then partitioned into L bands of B
//! elements each. Band keys are the candidate-lookup keys of the index; the
//! same grouping function must run at ingest and query time.

pub mod permutations;

use permutations::Permutations;

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01B3;

/// MinHash sketcher over a shared read-only permutation table.
pub struct Sketcher<'a> {
    permutations: &'a Permutations,
}

impl<'a> Sketcher<'a> {
    pub fn new(permutations: &'a Permutations) -> Self {
        Self { permutations }
    }

    /// Compute the K-element MinHash signature of a fingerprint bit vector.
    ///
    /// `sig[p]` is the smallest permuted position `i` with
    /// `bits[P[p][i]] == 1`; a vector with no set bit yields the sentinel
    /// `F` in every element.
    pub fn compute_signature(&self, bits: &[u8]) -> Vec<u32> {
        debug_assert_eq!(bits.len(), self.permutations.width());
        let sentinel = self.permutations.width() as u32;

        (0..self.permutations.count())
            .map(|p| {
                self.permutations
                    .row(p)
                    .iter()
                    .position(|&source| bits[source as usize] == 1)
                    .map(|i| i as u32)
                    .unwrap_or(sentinel)
            })
            .collect()
    }

    /// Partition a signature into `l` band keys of `b` elements each.
    ///
    /// Requires `sig.len() == l * b`; the caller validates the band layout
    /// at entry. The key function is stable across processes.
    pub fn group_to_bands(&self, sig: &[u32], l: usize, b: usize) -> Vec<u64> {
        debug_assert_eq!(sig.len(), l * b);
        sig.chunks(b).take(l).map(band_key).collect()
    }
}

/// Stable 64-bit key for one band of signature components.
///
/// Up to four components are packed as 16-bit fields; wider bands fall back
/// to FNV-1a over the little-endian byte image. The choice is fixed per
/// database.
fn band_key(components: &[u32]) -> u64 {
    if components.len() <= 4 {
        let mut key = 0u64;
        for &c in components {
            key = (key << 16) | u64::from(c & 0xFFFF);
        }
        key
    } else {
        let mut state = FNV_OFFSET;
        for &c in components {
            for byte in c.to_le_bytes() {
                state ^= u64::from(byte);
                state = state.wrapping_mul(FNV_PRIME);
            }
        }
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_bits(rng: &mut StdRng, len: usize, density: f64) -> Vec<u8> {
        (0..len)
            .map(|_| if rng.gen_bool(density) { 1 } else { 0 })
            .collect()
    }

    fn jaccard(a: &[u8], b: &[u8]) -> f64 {
        let mut inter = 0usize;
        let mut union = 0usize;
        for (&x, &y) in a.iter().zip(b.iter()) {
            if x == 1 || y == 1 {
                union += 1;
                if x == 1 && y == 1 {
                    inter += 1;
                }
            }
        }
        if union == 0 {
            1.0
        } else {
            inter as f64 / union as f64
        }
    }

    #[test]
    fn signature_length_and_sentinel() {
        let table = Permutations::generate(16, 64, Some(11));
        let sketcher = Sketcher::new(&table);

        let empty = vec![0u8; 64];
        let sig = sketcher.compute_signature(&empty);
        assert_eq!(sig.len(), 16);
        assert!(sig.iter().all(|&v| v == 64));
    }

    #[test]
    fn identical_inputs_produce_identical_band_keys() {
        let table = Permutations::generate(100, 2048, Some(5));
        let mut rng = StdRng::seed_from_u64(21);
        let bits = random_bits(&mut rng, 2048, 0.1);

        let a = Sketcher::new(&table);
        let b = Sketcher::new(&table);
        let keys_a = a.group_to_bands(&a.compute_signature(&bits), 25, 4);
        let keys_b = b.group_to_bands(&b.compute_signature(&bits), 25, 4);

        assert_eq!(keys_a.len(), 25);
        assert_eq!(keys_a, keys_b);
    }

    #[test]
    fn narrow_band_key_packs_16_bit_fields() {
        assert_eq!(
            band_key(&[1, 2, 3, 4]),
            (1u64 << 48) | (2u64 << 32) | (3u64 << 16) | 4
        );
        assert_eq!(band_key(&[0xFFFF]), 0xFFFF);
    }

    #[test]
    fn wide_band_key_uses_fnv_mixing() {
        let narrow = band_key(&[1, 2, 3, 4]);
        let wide = band_key(&[1, 2, 3, 4, 5]);
        assert_ne!(narrow, wide);
        assert_eq!(wide, band_key(&[1, 2, 3, 4, 5]));
    }

    #[test]
    fn signature_agreement_tracks_jaccard_similarity() {
        // MinHash property: P[sig_a[p] == sig_b[p]] equals the Jaccard
        // similarity of the two bit sets. Checked empirically over 1000
        // pairs of correlated random vectors.
        let width = 256;
        let k = 128;
        let table = Permutations::generate(k, width, Some(77));
        let sketcher = Sketcher::new(&table);
        let mut rng = StdRng::seed_from_u64(1234);

        let mut abs_dev_sum = 0.0f64;
        let mut bias_sum = 0.0f64;
        let pairs = 1000;

        for _ in 0..pairs {
            let a = random_bits(&mut rng, width, 0.3);
            // Mutate a fraction of positions to vary the overlap
            let flip = rng.gen_range(0.0..0.5);
            let b: Vec<u8> = a
                .iter()
                .map(|&bit| {
                    if rng.gen_bool(flip) {
                        1 - bit
                    } else {
                        bit
                    }
                })
                .collect();

            let expected = jaccard(&a, &b);
            let sig_a = sketcher.compute_signature(&a);
            let sig_b = sketcher.compute_signature(&b);
            let agree = sig_a
                .iter()
                .zip(sig_b.iter())
                .filter(|(x, y)| x == y)
                .count() as f64
                / k as f64;

            abs_dev_sum += (agree - expected).abs();
            bias_sum += agree - expected;
        }

        let mean_abs_dev = abs_dev_sum / pairs as f64;
        let bias = bias_sum / pairs as f64;
        assert!(mean_abs_dev < 0.06, "mean |dev| too large: {mean_abs_dev}");
        assert!(bias.abs() < 0.02, "estimator is biased: {bias}");
    }
}
