//! Fixed-size worker pool for CPU-bound passes.
//!
//! Input is split into contiguous chunks, one scoped OS thread per chunk.
//! Workers get their chunk by value and send their result back over a
//! channel; nothing mutable is shared. Any worker error or panic fails the
//! whole pass.

use std::thread;

use crate::error::{PipelineError, PipelineResult};
use crate::models::{merge_parse_results, ParseResults};

/// Splits `items` into `min(workers, len)` contiguous chunks whose sizes
/// differ by at most one.
pub fn partition<T: Clone>(items: &[T], workers: usize) -> Vec<Vec<T>> {
    if items.is_empty() {
        return Vec::new();
    }
    let count = workers.max(1).min(items.len());
    let base = items.len() / count;
    let extra = items.len() % count;

    let mut chunks = Vec::with_capacity(count);
    let mut start = 0;
    for index in 0..count {
        let size = base + usize::from(index < extra);
        chunks.push(items[start..start + size].to_vec());
        start += size;
    }
    chunks
}

/// Runs `worker` on every chunk in parallel. Results come back in chunk
/// order.
pub fn run_chunks<T, R, F>(label: &str, chunks: Vec<Vec<T>>, worker: F) -> PipelineResult<Vec<R>>
where
    T: Send,
    R: Send,
    F: Fn(usize, Vec<T>) -> PipelineResult<R> + Sync,
{
    let total = chunks.len();
    if total == 0 {
        return Ok(Vec::new());
    }

    let (tx, rx) = crossbeam_channel::unbounded::<(usize, PipelineResult<R>)>();
    let worker = &worker;

    let panicked = thread::scope(|scope| -> PipelineResult<Option<usize>> {
        let mut handles = Vec::with_capacity(total);
        for (index, chunk) in chunks.into_iter().enumerate() {
            let tx = tx.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", label, index))
                .spawn_scoped(scope, move || {
                    let _ = tx.send((index, worker(index, chunk)));
                })
                .map_err(|e| PipelineError::WorkerFailed {
                    index,
                    message: format!("failed to spawn thread: {}", e),
                })?;
            handles.push((index, handle));
        }

        let mut first_panic = None;
        for (index, handle) in handles {
            if handle.join().is_err() && first_panic.is_none() {
                first_panic = Some(index);
            }
        }
        Ok(first_panic)
    })?;
    drop(tx);

    if let Some(index) = panicked {
        log::error!("[POOL] {} worker {} panicked", label, index);
        return Err(PipelineError::WorkerFailed {
            index,
            message: "worker panicked".to_string(),
        });
    }

    let mut slots: Vec<Option<R>> = (0..total).map(|_| None).collect();
    for (index, outcome) in rx.try_iter() {
        match outcome {
            Ok(value) => slots[index] = Some(value),
            Err(err) => {
                log::error!("[POOL] {} worker {} failed: {}", label, index, err);
                return Err(PipelineError::WorkerFailed {
                    index,
                    message: err.to_string(),
                });
            }
        }
    }

    slots
        .into_iter()
        .enumerate()
        .map(|(index, slot)| {
            slot.ok_or_else(|| PipelineError::WorkerFailed {
                index,
                message: "worker returned no result".to_string(),
            })
        })
        .collect()
}

/// Reduces per-chunk maps into one; names and stories are unioned.
pub fn reduce_parse_results(partials: Vec<ParseResults>) -> ParseResults {
    let mut merged = ParseResults::new();
    for partial in partials {
        merge_parse_results(&mut merged, partial);
    }
    merged
}
