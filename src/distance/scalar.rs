//! Scalar distance kernels for float and bit-packed vectors.
//! All kernels assume equal-length inputs; callers check dimensions once per batch.

/// Compute the squared Euclidean distance between two vectors.
///
/// Returns sum((a[i] - b[i])^2)
#[inline]
pub fn euclidean_distance_squared(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vector dimensions must match");

    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let diff = x - y;
            diff * diff
        })
        .sum()
}

/// Compute the dot product of two vectors.
///
/// Returns sum(a[i] * b[i])
#[inline]
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vector dimensions must match");

    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Number of differing bits between two packed codes.
#[inline]
pub fn hamming_distance(a: &[u8], b: &[u8]) -> u32 {
    debug_assert_eq!(a.len(), b.len(), "Code lengths must match");

    a.iter().zip(b.iter()).map(|(x, y)| (x ^ y).count_ones()).sum()
}

/// Jaccard distance between two packed codes: 1 - |a & b| / |a | b|.
///
/// Two all-zero codes are at distance 0.
#[inline]
pub fn jaccard_distance(a: &[u8], b: &[u8]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Code lengths must match");

    let mut inter = 0u32;
    let mut union = 0u32;
    for (x, y) in a.iter().zip(b.iter()) {
        inter += (x & y).count_ones();
        union += (x | y).count_ones();
    }

    if union == 0 {
        0.0
    } else {
        1.0 - inter as f32 / union as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_euclidean_distance_squared_simple() {
        let a = vec![0.0, 0.0];
        let b = vec![3.0, 4.0];
        assert!((euclidean_distance_squared(&a, &b) - 25.0).abs() < 1e-6);
    }

    #[test]
    fn test_euclidean_distance_identical() {
        let a = vec![1.0, 2.0, 3.0];
        assert!(euclidean_distance_squared(&a, &a) < 1e-6);
    }

    #[test]
    fn test_dot_product_simple() {
        let a = vec![1.0, 2.0, 3.0];
        let b = vec![4.0, 5.0, 6.0];
        assert!((dot_product(&a, &b) - 32.0).abs() < 1e-6);
    }

    #[test]
    fn test_hamming_distance() {
        assert_eq!(hamming_distance(&[0b1010_1010], &[0b0101_0101]), 8);
        assert_eq!(hamming_distance(&[0xFF, 0x00], &[0xFF, 0x01]), 1);
        assert_eq!(hamming_distance(&[0x0F], &[0x0F]), 0);
    }

    #[test]
    fn test_jaccard_distance() {
        // |a & b| = 1, |a | b| = 3
        let d = jaccard_distance(&[0b0000_0011], &[0b0000_0110]);
        assert!((d - (1.0 - 1.0 / 3.0)).abs() < 1e-6);
        assert_eq!(jaccard_distance(&[0], &[0]), 0.0);
    }
}
