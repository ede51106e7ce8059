//! Query executor: fans a batch of independent row tasks out over one
//! shared, fixed-size worker pool.
//!
//! # Guarantees
//!
//! - Task `i` writes only slot `i`. Output order is the input order, no
//!   matter which task finishes first.
//! - A batch returns only after every dispatched task has finished. When
//!   one or more tasks fail, the error of the lowest failing row is
//!   reported and all outputs are discarded by the caller.
//! - Panics inside a task are caught and reported as
//!   [`AnnexError::BackendCompute`]; they never cross the pool boundary.
//! - Inside a task, nested parallelism is limited to one thread so the
//!   outer fan-out does not oversubscribe the machine. Backends consult
//!   [`nested_parallelism_allowed`] before reaching for `par_iter`.
//!
//! # Example
//!
//! ```
//! use annex::{ExecutorConfig, QueryExecutor};
//!
//! let executor = QueryExecutor::new(ExecutorConfig::with_threads(4)).unwrap();
//! let squares = executor.map_batch(8, |i| Ok(i * i)).unwrap();
//! assert_eq!(squares, vec![0, 1, 4, 9, 16, 25, 36, 49]);
//! ```

use crate::config::ExecutorConfig;
use crate::error::{AnnexError, Result};
use rayon::prelude::*;
use std::any::Any;
use std::cell::Cell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, trace, warn};

thread_local! {
    // 0 means "no limit set on this thread".
    static NESTED_THREADS: Cell<usize> = const { Cell::new(0) };
}

/// Nested parallelism budget of the current thread; `0` when unset.
pub fn nested_threads() -> usize {
    NESTED_THREADS.with(Cell::get)
}

/// True unless the current thread runs under a single-thread limit.
pub fn nested_parallelism_allowed() -> bool {
    nested_threads() != 1
}

/// Map `0..n` through `f`, in parallel only when the current thread allows it.
pub(crate) fn maybe_par_map<T, F>(n: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(usize) -> T + Sync + Send,
{
    if nested_parallelism_allowed() {
        (0..n).into_par_iter().map(f).collect()
    } else {
        (0..n).map(f).collect()
    }
}

/// Sets the nested parallelism budget of the current thread until dropped.
///
/// Guards nest: dropping restores the previous budget.
pub struct ScopedThreadLimit {
    prev: usize,
}

impl ScopedThreadLimit {
    /// Limit nested parallelism on this thread to `threads`.
    pub fn new(threads: usize) -> Self {
        let prev = NESTED_THREADS.with(|c| c.replace(threads));
        Self { prev }
    }
}

impl Drop for ScopedThreadLimit {
    fn drop(&mut self) {
        NESTED_THREADS.with(|c| c.set(self.prev));
    }
}

/// Shared worker pool for per-row query tasks.
pub struct QueryExecutor {
    pool: rayon::ThreadPool,
    num_threads: usize,
}

impl std::fmt::Debug for QueryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryExecutor")
            .field("num_threads", &self.num_threads)
            .finish()
    }
}

impl QueryExecutor {
    /// Build the worker pool. The size is fixed for the executor's lifetime.
    pub fn new(config: ExecutorConfig) -> Result<Self> {
        if config.num_threads == 0 {
            return Err(AnnexError::invalid_parameter(
                "num_threads must be greater than 0",
            ));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.num_threads)
            .thread_name(|i| format!("annex-query-{i}"))
            .build()?;
        debug!(num_threads = config.num_threads, "query executor started");
        Ok(Self {
            pool,
            num_threads: config.num_threads,
        })
    }

    /// Number of worker threads.
    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Run `unit(i)` for every `i in 0..n` and wait for all of them.
    pub fn run_batch<F>(&self, n: usize, unit: F) -> Result<()>
    where
        F: Fn(usize) -> Result<()> + Sync + Send,
    {
        self.map_batch(n, unit).map(|_| ())
    }

    /// Run `unit(i)` for every `i in 0..n`, collecting results in row order.
    pub fn map_batch<T, F>(&self, n: usize, unit: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(usize) -> Result<T> + Sync + Send,
    {
        self.map_batch_limited(n, None, unit)
    }

    /// Like [`map_batch`](Self::map_batch), but keeps at most `max_in_flight`
    /// rows dispatched at once. Once a window fails, later windows are not
    /// dispatched.
    pub fn map_batch_limited<T, F>(
        &self,
        n: usize,
        max_in_flight: Option<usize>,
        unit: F,
    ) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(usize) -> Result<T> + Sync + Send,
    {
        let window = window_size(n, max_in_flight);
        let mut values = Vec::with_capacity(n);
        let mut start = 0;
        while start < n {
            let end = (start + window).min(n);
            trace!(start, end, "dispatching query window");
            let outcomes: Vec<Result<T>> = self.pool.install(|| {
                (start..end)
                    .into_par_iter()
                    .map(|i| run_unit(|| unit(i)))
                    .collect()
            });
            values.extend(drain(start, n, outcomes)?);
            start = end;
        }
        Ok(values)
    }

    /// Fan out over fixed-width output rows.
    ///
    /// `a` and `b` are split into consecutive rows of `width` elements (the
    /// last row may be shorter); task `i` receives row `i` of both and
    /// nothing else.
    pub fn run_rows<A, B, F>(
        &self,
        width: usize,
        a: &mut [A],
        b: &mut [B],
        max_in_flight: Option<usize>,
        unit: F,
    ) -> Result<()>
    where
        A: Send,
        B: Send,
        F: Fn(usize, &mut [A], &mut [B]) -> Result<()> + Sync + Send,
    {
        if width == 0 {
            return Err(AnnexError::invalid_parameter("row width must be greater than 0"));
        }
        if a.len() != b.len() {
            return Err(AnnexError::invalid_parameter(format!(
                "output buffers differ in length: {} vs {}",
                a.len(),
                b.len()
            )));
        }
        let n = a.len().div_ceil(width);
        let window = window_size(n, max_in_flight);
        let span = window * width;

        for (w, (a_win, b_win)) in a.chunks_mut(span).zip(b.chunks_mut(span)).enumerate() {
            let base = w * window;
            trace!(start = base, rows = a_win.len().div_ceil(width), "dispatching row window");
            let outcomes: Vec<Result<()>> = self.pool.install(|| {
                a_win
                    .par_chunks_mut(width)
                    .zip(b_win.par_chunks_mut(width))
                    .enumerate()
                    .map(|(j, (ra, rb))| run_unit(|| unit(base + j, ra, rb)))
                    .collect()
            });
            drain(base, n, outcomes)?;
        }
        Ok(())
    }

    /// Run a build step with the configured nested parallelism.
    ///
    /// `None` uses the shared pool, `Some(1)` runs sequentially on the
    /// calling thread, `Some(n)` runs inside a temporary pool of `n` threads.
    pub fn run_build<R, F>(&self, threads: Option<usize>, f: F) -> Result<R>
    where
        R: Send,
        F: FnOnce() -> Result<R> + Send,
    {
        match threads {
            None => self.pool.install(|| catch_task(f)),
            Some(0) => Err(AnnexError::invalid_parameter(
                "build_thread_num must be greater than 0",
            )),
            Some(1) => {
                debug!("build runs single-threaded");
                let _limit = ScopedThreadLimit::new(1);
                catch_task(f)
            }
            Some(n) => {
                debug!(threads = n, "build runs in a dedicated pool");
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(n)
                    .thread_name(|i| format!("annex-build-{i}"))
                    .build()?;
                pool.install(|| catch_task(f))
            }
        }
    }
}

fn window_size(n: usize, max_in_flight: Option<usize>) -> usize {
    match max_in_flight {
        Some(limit) if limit > 0 => limit.min(n.max(1)),
        _ => n.max(1),
    }
}

/// Runs one query task with nested parallelism pinned to a single thread.
fn run_unit<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    let _limit = ScopedThreadLimit::new(1);
    catch_task(f)
}

/// Converts a panic inside `f` into a backend error.
fn catch_task<T>(f: impl FnOnce() -> Result<T>) -> Result<T> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(AnnexError::backend(panic_message(payload.as_ref()))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("task panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("task panicked: {s}")
    } else {
        "task panicked".to_string()
    }
}

/// Collects outcomes of a fully completed window. `base` is the row number
/// of the first outcome and `n` the batch size, for logging.
fn drain<T>(base: usize, n: usize, outcomes: Vec<Result<T>>) -> Result<Vec<T>> {
    let mut values = Vec::with_capacity(outcomes.len());
    let mut first_err: Option<(usize, AnnexError)> = None;
    let mut failed = 0usize;

    for (j, outcome) in outcomes.into_iter().enumerate() {
        match outcome {
            Ok(v) => values.push(v),
            Err(e) => {
                failed += 1;
                if first_err.is_none() {
                    first_err = Some((base + j, e));
                }
            }
        }
    }

    match first_err {
        Some((row, err)) => {
            warn!(row, failed, batch = n, error = %err, "query batch failed");
            Err(err)
        }
        None => Ok(values),
    }
}
