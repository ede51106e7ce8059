//! K-Means clustering for IVF cell assignment and PQ codebooks.
//!
//! Lloyd's algorithm with k-means++ initialization for small k and random
//! sampling for large k. Works on row-major `f32` buffers.

use crate::constants::kmeans::{CONVERGENCE_THRESHOLD, KMEANSPP_THRESHOLD};
use crate::distance::euclidean_distance_squared;
use crate::error::{AnnexError, Result};
use crate::executor::maybe_par_map;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// K-Means clustering over flat rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KMeans {
    /// `k * dim` centroid components, row-major.
    pub centroids: Vec<f32>,
    dim: usize,
    k: usize,
    max_iters: usize,
}

impl KMeans {
    /// Create an untrained model with `k` clusters.
    pub fn new(k: usize, dim: usize, max_iters: usize) -> Self {
        Self {
            centroids: Vec::new(),
            dim,
            k,
            max_iters,
        }
    }

    /// Number of clusters.
    pub fn k(&self) -> usize {
        self.k
    }

    /// Components per centroid.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Centroid `c`.
    #[inline]
    pub fn centroid(&self, c: usize) -> &[f32] {
        &self.centroids[c * self.dim..(c + 1) * self.dim]
    }

    /// Fit the model to `data`.
    ///
    /// Needs at least `k` rows.
    pub fn fit(&mut self, data: &[f32]) -> Result<()> {
        if self.k == 0 || self.dim == 0 {
            return Err(AnnexError::invalid_parameter(
                "k-means needs k > 0 and dim > 0",
            ));
        }
        if data.len() % self.dim != 0 {
            return Err(AnnexError::invalid_parameter(format!(
                "buffer of {} floats is not a multiple of dim {}",
                data.len(),
                self.dim
            )));
        }
        let n = data.len() / self.dim;
        if n < self.k {
            return Err(AnnexError::invalid_parameter(format!(
                "need at least {} training rows, got {n}",
                self.k
            )));
        }

        self.centroids = if self.k > KMEANSPP_THRESHOLD {
            self.random_init(data, n)
        } else {
            self.kmeans_plus_plus_init(data, n)
        };

        for _ in 0..self.max_iters {
            let assignments = self.assign(data);
            let next = self.update_centroids(data, &assignments);
            let change = self.measure_change(&next);
            self.centroids = next;
            if change < CONVERGENCE_THRESHOLD {
                break;
            }
        }
        Ok(())
    }

    fn row<'d>(&self, data: &'d [f32], i: usize) -> &'d [f32] {
        &data[i * self.dim..(i + 1) * self.dim]
    }

    fn random_init(&self, data: &[f32], n: usize) -> Vec<f32> {
        let mut rng = rand::thread_rng();
        let mut indices: Vec<usize> = (0..n).collect();
        indices.shuffle(&mut rng);
        indices
            .into_iter()
            .take(self.k)
            .flat_map(|i| self.row(data, i).iter().copied())
            .collect()
    }

    /// Picks each next centroid with probability proportional to its squared
    /// distance from the nearest centroid chosen so far.
    fn kmeans_plus_plus_init(&self, data: &[f32], n: usize) -> Vec<f32> {
        let mut rng = rand::thread_rng();
        let mut centroids: Vec<f32> = Vec::with_capacity(self.k * self.dim);
        centroids.extend_from_slice(self.row(data, rng.gen_range(0..n)));

        let mut nearest = maybe_par_map(n, |i| euclidean_distance_squared(self.row(data, i), &centroids));

        for _ in 1..self.k {
            let total: f32 = nearest.iter().sum();
            let pick = if total > 0.0 {
                let mut r = rng.gen_range(0.0..total);
                nearest
                    .iter()
                    .position(|&d| {
                        r -= d;
                        r <= 0.0
                    })
                    .unwrap_or(n - 1)
            } else {
                // every row sits on a centroid already
                rng.gen_range(0..n)
            };

            let start = centroids.len();
            centroids.extend_from_slice(self.row(data, pick));
            let newest = &centroids[start..];
            let refreshed = maybe_par_map(n, |i| {
                nearest[i].min(euclidean_distance_squared(self.row(data, i), newest))
            });
            nearest = refreshed;
        }
        centroids
    }

    fn assign(&self, data: &[f32]) -> Vec<usize> {
        let n = data.len() / self.dim;
        maybe_par_map(n, |i| self.nearest(self.row(data, i)))
    }

    /// Each centroid becomes the mean of its members. Empty clusters keep
    /// their previous centroid.
    fn update_centroids(&self, data: &[f32], assignments: &[usize]) -> Vec<f32> {
        let mut sums = vec![0.0f32; self.k * self.dim];
        let mut counts = vec![0usize; self.k];
        for (i, &c) in assignments.iter().enumerate() {
            counts[c] += 1;
            let sum = &mut sums[c * self.dim..(c + 1) * self.dim];
            for (s, &v) in sum.iter_mut().zip(self.row(data, i)) {
                *s += v;
            }
        }

        for c in 0..self.k {
            let sum = &mut sums[c * self.dim..(c + 1) * self.dim];
            if counts[c] == 0 {
                sum.copy_from_slice(self.centroid(c));
            } else {
                let count = counts[c] as f32;
                sum.iter_mut().for_each(|s| *s /= count);
            }
        }
        sums
    }

    /// Average squared movement of the centroids.
    fn measure_change(&self, next: &[f32]) -> f32 {
        let total: f32 = self
            .centroids
            .chunks_exact(self.dim)
            .zip(next.chunks_exact(self.dim))
            .map(|(old, new)| euclidean_distance_squared(old, new))
            .sum();
        total / self.k as f32
    }

    /// Index of the nearest centroid.
    pub fn nearest(&self, query: &[f32]) -> usize {
        self.centroids
            .chunks_exact(self.dim)
            .enumerate()
            .map(|(idx, c)| (idx, euclidean_distance_squared(query, c)))
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal))
            .map_or(0, |(idx, _)| idx)
    }

    /// Indices of the `n` nearest centroids, nearest first.
    pub fn nearest_n(&self, query: &[f32], n: usize) -> Vec<usize> {
        let mut distances: Vec<(usize, f32)> = self
            .centroids
            .chunks_exact(self.dim)
            .enumerate()
            .map(|(idx, c)| (idx, euclidean_distance_squared(query, c)))
            .collect();
        distances.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
        distances.truncate(n);
        distances.into_iter().map(|(idx, _)| idx).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn random_rows(n: usize, dim: usize) -> Vec<f32> {
        let mut rng = rand::thread_rng();
        (0..n * dim).map(|_| rng.gen_range(-1.0..1.0)).collect()
    }

    #[test]
    fn test_kmeans_basic() {
        let data = random_rows(300, 8);
        let mut kmeans = KMeans::new(5, 8, 50);
        kmeans.fit(&data).unwrap();

        assert_eq!(kmeans.centroids.len(), 5 * 8);

        let inertia: f32 = data
            .chunks_exact(8)
            .map(|v| euclidean_distance_squared(v, kmeans.centroid(kmeans.nearest(v))))
            .sum();
        assert!(inertia.is_finite());
        assert!(inertia > 0.0);
    }

    #[test]
    fn test_separates_clusters() {
        let mut data = Vec::new();
        for i in 0..50 {
            let jitter = i as f32 * 0.001;
            data.extend_from_slice(&[jitter, 0.0]);
            data.extend_from_slice(&[100.0 + jitter, 100.0]);
        }
        let mut kmeans = KMeans::new(2, 2, 25);
        kmeans.fit(&data).unwrap();
        assert_ne!(kmeans.nearest(&[0.0, 0.0]), kmeans.nearest(&[100.0, 100.0]));
    }

    #[test]
    fn test_too_few_rows() {
        let mut kmeans = KMeans::new(10, 2, 5);
        assert!(kmeans.fit(&random_rows(5, 2)).is_err());
    }

    #[test]
    fn test_nearest_n() {
        let mut kmeans = KMeans::new(3, 2, 1);
        kmeans.centroids = vec![0.0, 0.0, 10.0, 0.0, 5.0, 10.0];

        let nearest = kmeans.nearest_n(&[0.1, 0.1], 2);
        assert_eq!(nearest, vec![0, 1]);
    }
}
