//! Range search result pipeline: band filtering and flattening of per-row
//! hit lists into one contiguous [`RangeSearchResult`].
//!
//! # Band semantics
//!
//! A range search returns every hit strictly inside `radius`. An optional
//! `range_filter` cuts an inner band edge:
//!
//! | metric kind | kept hits |
//! |-------------|-----------|
//! | distance (L2, Hamming, Jaccard) | `range_filter <= d < radius` |
//! | similarity (IP) | `radius < d <= range_filter` |
//!
//! `radius` is exclusive and `range_filter` inclusive in both orientations.
//! [`DEFAULT_RANGE_FILTER`] disables the band.

use crate::constants::result::DEFAULT_RANGE_FILTER;
use crate::dataset::{try_alloc, RangeSearchResult};
use crate::distance::MetricType;
use crate::error::{AnnexError, Result};
use std::cmp::Ordering;

/// True when `range_filter` is the "band disabled" sentinel.
#[inline]
pub fn band_disabled(range_filter: f32) -> bool {
    range_filter == DEFAULT_RANGE_FILTER
}

/// True when `dist` lies inside the radius (and band, when enabled).
#[inline]
pub fn distance_in_range(dist: f32, radius: f32, range_filter: f32, is_similarity: bool) -> bool {
    let band = band_disabled(range_filter);
    if is_similarity {
        dist > radius && (band || dist <= range_filter)
    } else {
        dist < radius && (band || dist >= range_filter)
    }
}

/// Rejects range parameters before any task is dispatched.
pub fn validate_range_params(metric: MetricType, radius: f32, range_filter: f32) -> Result<()> {
    if !radius.is_finite() || radius <= 0.0 {
        return Err(AnnexError::invalid_parameter(format!(
            "radius must be finite and greater than 0, got {radius}"
        )));
    }
    if band_disabled(range_filter) {
        return Ok(());
    }
    if !range_filter.is_finite() {
        return Err(AnnexError::invalid_parameter(format!(
            "range_filter must be finite, got {range_filter}"
        )));
    }
    if metric.is_similarity() {
        if range_filter <= radius {
            return Err(AnnexError::invalid_parameter(format!(
                "range_filter ({range_filter}) must be greater than radius ({radius}) for {metric}"
            )));
        }
    } else if range_filter >= radius {
        return Err(AnnexError::invalid_parameter(format!(
            "range_filter ({range_filter}) must be less than radius ({radius}) for {metric}"
        )));
    }
    Ok(())
}

/// Drops hits of one row that fall outside the band, keeping the order
/// of the survivors. No-op when the band is disabled.
pub fn filter_one_row(
    ids: &mut Vec<i64>,
    distances: &mut Vec<f32>,
    is_similarity: bool,
    radius: f32,
    range_filter: f32,
) {
    debug_assert_eq!(ids.len(), distances.len());
    if band_disabled(range_filter) {
        return;
    }

    let mut kept = 0;
    for i in 0..distances.len() {
        if distance_in_range(distances[i], radius, range_filter, is_similarity) {
            distances[kept] = distances[i];
            ids[kept] = ids[i];
            kept += 1;
        }
    }
    ids.truncate(kept);
    distances.truncate(kept);
}

/// Orders one row best first, ties broken by id.
fn sort_row(ids: &mut [i64], distances: &mut [f32], is_similarity: bool) {
    let mut order: Vec<usize> = (0..ids.len()).collect();
    order.sort_by(|&a, &b| {
        let ord = distances[a]
            .partial_cmp(&distances[b])
            .unwrap_or(Ordering::Equal);
        let ord = if is_similarity { ord.reverse() } else { ord };
        ord.then(ids[a].cmp(&ids[b]))
    });
    let sorted_ids: Vec<i64> = order.iter().map(|&i| ids[i]).collect();
    let sorted_dist: Vec<f32> = order.iter().map(|&i| distances[i]).collect();
    ids.copy_from_slice(&sorted_ids);
    distances.copy_from_slice(&sorted_dist);
}

/// Filters, orders and flattens per-row hit lists.
///
/// Must only be called once every row has been fully produced.
pub fn merge(
    mut per_row_ids: Vec<Vec<i64>>,
    mut per_row_dists: Vec<Vec<f32>>,
    is_similarity: bool,
    radius: f32,
    range_filter: f32,
) -> Result<RangeSearchResult> {
    if per_row_ids.len() != per_row_dists.len() {
        return Err(AnnexError::invalid_parameter(format!(
            "{} id rows but {} distance rows",
            per_row_ids.len(),
            per_row_dists.len()
        )));
    }

    let nq = per_row_ids.len();
    let mut lims = try_alloc(nq + 1, 0usize)?;
    for (i, (ids, dists)) in per_row_ids.iter_mut().zip(per_row_dists.iter_mut()).enumerate() {
        if ids.len() != dists.len() {
            return Err(AnnexError::invalid_parameter(format!(
                "row {i}: {} ids but {} distances",
                ids.len(),
                dists.len()
            )));
        }
        filter_one_row(ids, dists, is_similarity, radius, range_filter);
        sort_row(ids, dists, is_similarity);
        lims[i + 1] = lims[i] + ids.len();
    }

    let total = lims[nq];
    let mut ids = Vec::new();
    ids.try_reserve_exact(total)
        .map_err(|_| AnnexError::AllocationFailure { requested: total })?;
    let mut distances = Vec::new();
    distances
        .try_reserve_exact(total)
        .map_err(|_| AnnexError::AllocationFailure { requested: total })?;
    for (row_ids, row_dists) in per_row_ids.into_iter().zip(per_row_dists) {
        ids.extend(row_ids);
        distances.extend(row_dists);
    }

    Ok(RangeSearchResult {
        ids,
        distances,
        lims,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_l2_band_boundaries() {
        // radius exclusive, range_filter inclusive
        assert!(!distance_in_range(2.0, 2.0, 1.0, false));
        assert!(distance_in_range(1.0, 2.0, 1.0, false));
        assert!(distance_in_range(1.5, 2.0, 1.0, false));
        assert!(!distance_in_range(0.5, 2.0, 1.0, false));
    }

    #[test]
    fn test_ip_band_boundaries() {
        assert!(!distance_in_range(0.5, 0.5, 0.9, true));
        assert!(distance_in_range(0.9, 0.5, 0.9, true));
        assert!(distance_in_range(0.7, 0.5, 0.9, true));
        assert!(!distance_in_range(0.95, 0.5, 0.9, true));
    }

    #[test]
    fn test_disabled_band_keeps_radius_only() {
        assert!(distance_in_range(0.0, 2.0, DEFAULT_RANGE_FILTER, false));
        assert!(!distance_in_range(2.0, 2.0, DEFAULT_RANGE_FILTER, false));
        assert!(distance_in_range(100.0, 0.5, DEFAULT_RANGE_FILTER, true));
    }

    #[test]
    fn test_validate_range_params() {
        assert!(validate_range_params(MetricType::L2, 0.0, DEFAULT_RANGE_FILTER).is_err());
        assert!(validate_range_params(MetricType::L2, -1.0, DEFAULT_RANGE_FILTER).is_err());
        assert!(validate_range_params(MetricType::L2, f32::NAN, DEFAULT_RANGE_FILTER).is_err());
        assert!(validate_range_params(MetricType::L2, f32::INFINITY, DEFAULT_RANGE_FILTER).is_err());
        assert!(validate_range_params(MetricType::L2, 2.0, 1.0).is_ok());
        assert!(validate_range_params(MetricType::L2, 2.0, 3.0).is_err());
        assert!(validate_range_params(MetricType::IP, 0.5, 0.9).is_ok());
        assert!(validate_range_params(MetricType::IP, 0.5, 0.1).is_err());
        assert!(validate_range_params(MetricType::IP, 0.5, f32::NEG_INFINITY).is_err());
    }

    #[test]
    fn test_filter_one_row() {
        let mut ids = vec![1, 2, 3, 4];
        let mut dists = vec![0.5, 1.0, 1.5, 1.99];
        filter_one_row(&mut ids, &mut dists, false, 2.0, 1.0);
        assert_eq!(ids, vec![2, 3, 4]);
        assert_eq!(dists, vec![1.0, 1.5, 1.99]);
    }

    #[test]
    fn test_merge_offsets_and_order() {
        let ids = vec![vec![3, 1], vec![], vec![7, 8, 9]];
        let dists = vec![vec![0.9, 0.2], vec![], vec![0.3, 0.1, 0.2]];
        let res = merge(ids, dists, false, 1.0, DEFAULT_RANGE_FILTER).unwrap();
        assert_eq!(res.lims, vec![0, 2, 2, 5]);
        assert_eq!(res.ids, vec![1, 3, 8, 9, 7]);
        assert_eq!(res.distances, vec![0.2, 0.9, 0.1, 0.2, 0.3]);
    }

    #[test]
    fn test_merge_similarity_descending() {
        let res = merge(
            vec![vec![1, 2, 3]],
            vec![vec![0.6, 0.95, 0.8]],
            true,
            0.5,
            0.9,
        )
        .unwrap();
        assert_eq!(res.ids, vec![3, 1]);
        assert_eq!(res.lims, vec![0, 2]);
    }

    #[test]
    fn test_merge_empty() {
        let res = merge(vec![], vec![], false, 1.0, DEFAULT_RANGE_FILTER).unwrap();
        assert_eq!(res.lims, vec![0]);
        assert_eq!(res.nq(), 0);
        assert_eq!(res.total(), 0);
    }

    #[test]
    fn test_merge_rejects_ragged_input() {
        assert!(merge(vec![vec![1]], vec![vec![]], false, 1.0, DEFAULT_RANGE_FILTER).is_err());
        assert!(merge(vec![vec![1]], vec![], false, 1.0, DEFAULT_RANGE_FILTER).is_err());
    }
}
