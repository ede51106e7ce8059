//! Property tests for the executor, range merger, lease pool and flat search.
//!
//! Run with: cargo test --test properties

use annex::range::{distance_in_range, merge};
use annex::{
    BitsetView, Config, DataSet, DevicePool, DevicePoolConfig, ExecutorConfig, IndexContext,
    IndexFactory, MetricType, QueryExecutor,
};
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

fn executor(threads: usize) -> QueryExecutor {
    QueryExecutor::new(ExecutorConfig::with_threads(threads)).unwrap()
}

fn row_strategy() -> impl Strategy<Value = Vec<f32>> {
    prop::collection::vec(0.0_f32..10.0, 0..30)
}

proptest! {
    #[test]
    fn property_executor_returns_rows_in_order(
        n in 0_usize..200,
        threads in 1_usize..6,
        cap in prop::option::of(1_usize..16),
    ) {
        let exec = executor(threads);
        let calls = AtomicUsize::new(0);
        let out = exec
            .map_batch_limited(n, cap, |i| {
                calls.fetch_add(1, Ordering::Relaxed);
                Ok(i * 3)
            })
            .unwrap();
        prop_assert_eq!(calls.load(Ordering::Relaxed), n);
        prop_assert_eq!(out, (0..n).map(|i| i * 3).collect::<Vec<_>>());
    }

    #[test]
    fn property_merge_respects_distance_band(
        rows in prop::collection::vec(row_strategy(), 0..12),
        radius in 1.0_f32..10.0,
        filter_frac in prop::option::of(0.0_f32..0.9),
    ) {
        let range_filter = filter_frac.map_or(f32::INFINITY, |f| radius * f);
        let per_row_ids: Vec<Vec<i64>> = rows
            .iter()
            .map(|r| (0..r.len() as i64).collect())
            .collect();
        // candidates arrive pre-filtered by radius, as the backends produce them
        let per_row_dists: Vec<Vec<f32>> = rows.clone();
        let kept: Vec<Vec<(i64, f32)>> = per_row_ids
            .iter()
            .zip(&per_row_dists)
            .map(|(ids, ds)| {
                ids.iter()
                    .zip(ds)
                    .filter(|&(_, &d)| d < radius)
                    .map(|(&i, &d)| (i, d))
                    .collect()
            })
            .collect();
        let (ids_in, dists_in): (Vec<Vec<i64>>, Vec<Vec<f32>>) = kept
            .iter()
            .map(|row| row.iter().copied().unzip())
            .unzip();

        let res = merge(ids_in.clone(), dists_in.clone(), false, radius, range_filter).unwrap();
        let unbanded = merge(ids_in, dists_in, false, radius, f32::INFINITY).unwrap();
        for i in 0..rows.len() {
            prop_assert!(unbanded.row(i).0.len() >= res.row(i).0.len());
        }

        prop_assert_eq!(res.lims.len(), rows.len() + 1);
        prop_assert_eq!(res.lims[0], 0);
        prop_assert_eq!(*res.lims.last().unwrap(), res.ids.len());
        prop_assert_eq!(res.ids.len(), res.distances.len());
        for w in res.lims.windows(2) {
            prop_assert!(w[0] <= w[1]);
        }
        for (i, row) in kept.iter().enumerate() {
            let (ids, dists) = res.row(i);
            let expected = row
                .iter()
                .filter(|&&(_, d)| distance_in_range(d, radius, range_filter, false))
                .count();
            prop_assert_eq!(ids.len(), expected);
            for &d in dists {
                prop_assert!(d < radius);
                if filter_frac.is_some() {
                    prop_assert!(d >= range_filter);
                }
            }
            for pair in dists.windows(2) {
                prop_assert!(pair[0] <= pair[1]);
            }
        }
    }

    #[test]
    fn property_merge_similarity_band(
        rows in prop::collection::vec(row_strategy(), 1..8),
        radius in 0.5_f32..5.0,
        width in 0.5_f32..5.0,
    ) {
        let range_filter = radius + width;
        let per_row_ids: Vec<Vec<i64>> = rows
            .iter()
            .map(|r| (0..r.len() as i64).collect())
            .collect();
        let res = merge(per_row_ids, rows.clone(), true, radius, range_filter).unwrap();
        for i in 0..rows.len() {
            let (_, dists) = res.row(i);
            for &d in dists {
                prop_assert!(d > radius && d <= range_filter);
            }
            for pair in dists.windows(2) {
                prop_assert!(pair[0] >= pair[1]);
            }
        }
    }

    #[test]
    fn property_flat_matches_exhaustive_scan(
        vectors in prop::collection::vec(prop::collection::vec(-1.0_f32..1.0, 4), 1..40),
        query in prop::collection::vec(-1.0_f32..1.0, 4),
        k in 1_usize..12,
    ) {
        let ctx = IndexContext::new(Arc::new(executor(2)));
        let data: Vec<f32> = vectors.iter().flatten().copied().collect();
        let base = DataSet::from_f32(vectors.len(), 4, &data).unwrap();
        let cfg = Config::default().with_k(k);

        let mut index = IndexFactory::new().create("FLAT", &ctx).unwrap();
        index.build(&base, &cfg).unwrap();
        let qs = DataSet::from_f32(1, 4, &query).unwrap();
        let res = index.search(&qs, &cfg, BitsetView::Empty).unwrap();

        let mut expected: Vec<(f32, i64)> = vectors
            .iter()
            .enumerate()
            .map(|(i, v)| (MetricType::L2.compute(&query, v), i as i64))
            .collect();
        expected.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        let valid = k.min(vectors.len());
        prop_assert_eq!(res.valid_in_row(0), valid);
        let got: HashSet<i64> = res.row_ids(0)[..valid].iter().copied().collect();
        prop_assert_eq!(got.len(), valid);
        for (j, &d) in res.row_distances(0)[..valid].iter().enumerate() {
            prop_assert!((d - expected[j].0).abs() < 1e-5);
        }
        prop_assert!(res.row_ids(0)[valid..].iter().all(|&id| id == -1));
    }
}

#[test]
fn test_permuted_queries_permute_rows() {
    let ctx = IndexContext::new(Arc::new(executor(4)));
    let data: Vec<f32> = (0..200).map(|i| ((i * 37) % 101) as f32 / 10.0).collect();
    let base = DataSet::from_f32(50, 4, &data).unwrap();
    let cfg = Config::default().with_k(5);
    let mut index = IndexFactory::new().create("FLAT", &ctx).unwrap();
    index.build(&base, &cfg).unwrap();

    let order = [7usize, 3, 0, 12, 9];
    let forward: Vec<f32> = order.iter().flat_map(|&r| data[r * 4..r * 4 + 4].to_vec()).collect();
    let reversed: Vec<f32> = order
        .iter()
        .rev()
        .flat_map(|&r| data[r * 4..r * 4 + 4].to_vec())
        .collect();

    let a = index
        .search(&DataSet::from_f32(5, 4, &forward).unwrap(), &cfg, BitsetView::Empty)
        .unwrap();
    let b = index
        .search(&DataSet::from_f32(5, 4, &reversed).unwrap(), &cfg, BitsetView::Empty)
        .unwrap();
    for i in 0..5 {
        assert_eq!(a.row_ids(i), b.row_ids(4 - i));
        assert_eq!(a.row_distances(i), b.row_distances(4 - i));
    }
}

#[test]
fn test_pool_blocks_extra_acquire_until_release() {
    let pool = DevicePool::new(
        DevicePoolConfig::with_device_count(3).with_acquire_timeout_ms(10_000),
    )
    .unwrap();

    let leases: Vec<_> = (0..3).map(|_| pool.acquire().unwrap()).collect();
    let ids: HashSet<u32> = leases.iter().map(|l| l.device_id()).collect();
    assert_eq!(ids.len(), 3);
    assert_eq!(pool.available(), 0);
    assert!(pool.try_acquire().is_none());

    let (tx, rx) = mpsc::channel();
    let waiter = {
        let pool = pool.clone();
        thread::spawn(move || {
            let lease = pool.acquire().unwrap();
            tx.send(lease.device_id()).unwrap();
        })
    };

    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());

    let mut leases = leases;
    let released = leases.pop().unwrap().device_id();
    let got = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(got, released);
    waiter.join().unwrap();

    drop(leases);
    assert_eq!(pool.available(), 3);
}

#[test]
fn test_pool_times_out() {
    let pool = DevicePool::new(
        DevicePoolConfig::with_device_count(1).with_acquire_timeout_ms(20),
    )
    .unwrap();
    let _held = pool.acquire().unwrap();
    assert!(matches!(pool.acquire(), Err(annex::AnnexError::Timeout)));
}
