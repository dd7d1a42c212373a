//! Top-wavelet sign encoder.
//!
//! Retains the `top` largest-magnitude Haar coefficients of a decomposed
//! tile and encodes each retained sign as a 2-bit pair: `(1,0)` for
//! non-negative, `(0,1)` for negative, `(0,0)` for discarded coefficients.
//! The pairs share no set bit, which keeps the sketch compatible with
//! Jaccard-on-bits comparison while preserving sign distinction.

/// Encode a decomposed tile into a binary vector of `2 * coefficients.len()`
/// entries, one byte per bit.
pub fn encode(coefficients: &[f32], top: usize) -> Vec<u8> {
    let mut order: Vec<usize> = (0..coefficients.len()).collect();
    // Largest magnitude first; ties broken by the lower index.
    order.sort_unstable_by(|&a, &b| {
        coefficients[b]
            .abs()
            .total_cmp(&coefficients[a].abs())
            .then(a.cmp(&b))
    });

    let mut bits = vec![0u8; 2 * coefficients.len()];
    for &idx in order.iter().take(top) {
        if coefficients[idx] < 0.0 {
            bits[2 * idx + 1] = 1;
        } else {
            bits[2 * idx] = 1;
        }
    }
    bits
}
