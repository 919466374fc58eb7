//! Fixed-size worker pool for embarrassingly parallel index ranges.
//!
//! The mapper fans per-candidate work (point activation, residual
//! evaluation) over this pool. Workers are scoped per call and hold no
//! state across calls; ranges are distributed over a channel.

use crossbeam_channel::unbounded;

/// Chunk granularity for range distribution.
const CHUNK: usize = 50;

/// Reduce-over-range primitive backed by scoped threads.
pub struct ReducePool {
    num_threads: usize,
}

impl ReducePool {
    pub fn new(num_threads: usize) -> Self {
        Self {
            num_threads: num_threads.max(1),
        }
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Apply `f` to every index in `0..n` and collect the results in
    /// order. `f` runs concurrently on the pool's workers.
    pub fn map_indexed<T, F>(&self, n: usize, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(usize) -> T + Sync,
    {
        if n == 0 {
            return Vec::new();
        }
        if self.num_threads == 1 || n <= CHUNK {
            return (0..n).map(f).collect();
        }

        let (range_tx, range_rx) = unbounded::<(usize, usize)>();
        let (result_tx, result_rx) = unbounded::<(usize, Vec<T>)>();
        let mut start = 0;
        while start < n {
            let end = (start + CHUNK).min(n);
            range_tx.send((start, end)).expect("range channel open");
            start = end;
        }
        drop(range_tx);

        std::thread::scope(|scope| {
            for _ in 0..self.num_threads {
                let range_rx = range_rx.clone();
                let result_tx = result_tx.clone();
                let f = &f;
                scope.spawn(move || {
                    while let Ok((start, end)) = range_rx.recv() {
                        let chunk: Vec<T> = (start..end).map(f).collect();
                        if result_tx.send((start, chunk)).is_err() {
                            return;
                        }
                    }
                });
            }
        });
        drop(result_tx);

        let mut chunks: Vec<(usize, Vec<T>)> = result_rx.iter().collect();
        chunks.sort_by_key(|(start, _)| *start);
        chunks.into_iter().flat_map(|(_, c)| c).collect()
    }
}
