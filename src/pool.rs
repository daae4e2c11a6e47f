//! Worker pool running map/reduce stages over chunked input.
//!
//! The coordinator feeds chunks into a shared bounded channel, follows them
//! with one stop sentinel per worker, and drains an output channel while
//! tracking progress. Workers are OS threads with no shared mutable state;
//! cancellation is cooperative and observed between chunks.

use std::cell::Cell;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, SendTimeoutError, bounded, unbounded};

use crate::error::{Error, Result};

/// Inputs below this size run inline on the coordinator: no workers, no
/// chunking.
const SERIAL_CUTOFF: usize = 1000;

/// Upper bound on chunk size regardless of input length.
const CHUNK_CAP: usize = 10_000;

/// Cancellation flag shared between the coordinator, the workers, and the
/// process signal handler.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear the flag so the next stage starts fresh (the shell reuses one
    /// token across queries).
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

enum Msg<T> {
    Chunk(Vec<T>),
    Stop,
}

/// Worker pool service. Owns the worker count policy, the progress callback,
/// and the cancel token; each `map`/`reduce` call spawns and reaps its own
/// worker set.
pub struct Pool {
    workers: Option<usize>,
    cancel: CancelToken,
    progress: Option<Box<dyn Fn(u8) + Send + Sync>>,
}

impl Default for Pool {
    fn default() -> Self {
        Self::new()
    }
}

impl Pool {
    pub fn new() -> Self {
        Self {
            workers: None,
            cancel: CancelToken::new(),
            progress: None,
        }
    }

    /// Override the worker count; `None` sizes from the host concurrency.
    pub fn with_workers(mut self, workers: Option<usize>) -> Self {
        self.workers = workers;
        self
    }

    /// Callback invoked with each newly reached integer percent of consumed
    /// input items.
    pub fn with_progress(mut self, progress: Box<dyn Fn(u8) + Send + Sync>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Map stage: `f` turns a chunk into a sequence of outputs. The result
    /// multiset equals the concatenation of `f` over a chunking of the
    /// input; order across chunk boundaries is not preserved.
    pub fn map<T, U, F>(&self, items: Vec<T>, f: F) -> Result<Vec<U>>
    where
        T: Send,
        U: Send,
        F: Fn(Vec<T>) -> Result<Vec<U>> + Sync,
    {
        self.run_stage(items, &f)
    }

    /// Reduce stage: `f` turns a chunk into one output, yielding one output
    /// per chunk.
    pub fn reduce<T, U, F>(&self, items: Vec<T>, f: F) -> Result<Vec<U>>
    where
        T: Send,
        U: Send,
        F: Fn(Vec<T>) -> Result<U> + Sync,
    {
        self.run_stage(items, &|chunk| f(chunk).map(|out| vec![out]))
    }

    fn run_stage<T, U>(
        &self,
        items: Vec<T>,
        f: &(dyn Fn(Vec<T>) -> Result<Vec<U>> + Sync),
    ) -> Result<Vec<U>>
    where
        T: Send,
        U: Send,
    {
        let total = items.len();
        if total == 0 {
            return Ok(Vec::new());
        }
        if self.cancel.is_cancelled() {
            return Err(Error::Interrupted);
        }
        if total < SERIAL_CUTOFF {
            return f(items);
        }

        let host = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let chunk_size = CHUNK_CAP.min(total.div_ceil(host)).max(1);
        let n_chunks = total.div_ceil(chunk_size);
        let workers = match self.workers {
            Some(n) if n > 0 => n.min(n_chunks),
            _ => ((host * 3).div_ceil(2)).min(n_chunks).max(1),
        };
        log::debug!(
            "spawning {} workers over {} chunks of <= {} items",
            workers,
            n_chunks,
            chunk_size
        );

        let (tx_in, rx_in) = bounded::<Msg<T>>(workers);
        let (tx_out, rx_out) = unbounded::<(usize, Result<Vec<U>>)>();
        let cancel = &self.cancel;

        let mut outputs: Vec<U> = Vec::new();
        let mut first_err: Option<Error> = None;
        let consumed = Cell::new(0usize);
        let last_pct = Cell::new(None::<u8>);
        let chunks_done = Cell::new(0usize);

        thread::scope(|scope| {
            for _ in 0..workers {
                let rx_in = rx_in.clone();
                let tx_out = tx_out.clone();
                scope.spawn(move || {
                    for msg in rx_in.iter() {
                        let chunk = match msg {
                            Msg::Chunk(chunk) => chunk,
                            Msg::Stop => break,
                        };
                        if cancel.is_cancelled() {
                            break;
                        }
                        let size = chunk.len();
                        let out = f(chunk);
                        let failed = out.is_err();
                        if tx_out.send((size, out)).is_err() || failed {
                            break;
                        }
                    }
                });
            }
            drop(tx_out);

            // The coordinator interleaves feeding and draining so a failed
            // worker set can never leave it blocked on a full input queue.
            let consume = |outputs: &mut Vec<U>,
                           first_err: &mut Option<Error>,
                           size: usize,
                           result: Result<Vec<U>>| {
                chunks_done.set(chunks_done.get() + 1);
                match result {
                    Ok(mut chunk_out) => {
                        consumed.set(consumed.get() + size);
                        let pct = (consumed.get() * 100 / total) as u8;
                        if last_pct.get() != Some(pct) {
                            last_pct.set(Some(pct));
                            if let Some(progress) = &self.progress {
                                progress(pct);
                            }
                        }
                        outputs.append(&mut chunk_out);
                    }
                    Err(e) => {
                        if first_err.is_none() {
                            *first_err = Some(e);
                        }
                        cancel.cancel();
                    }
                }
            };

            let mut chunk_iter = items.into_iter();
            let mut sent = 0usize;
            'feed: loop {
                let chunk: Vec<T> = chunk_iter.by_ref().take(chunk_size).collect();
                if chunk.is_empty() {
                    break;
                }
                let mut msg = Msg::Chunk(chunk);
                loop {
                    if first_err.is_some() || cancel.is_cancelled() {
                        break 'feed;
                    }
                    match tx_in.send_timeout(msg, Duration::from_millis(20)) {
                        Ok(()) => break,
                        Err(SendTimeoutError::Timeout(back)) => msg = back,
                        Err(SendTimeoutError::Disconnected(_)) => break 'feed,
                    }
                    while let Ok((size, result)) = rx_out.try_recv() {
                        consume(&mut outputs, &mut first_err, size, result);
                    }
                }
                sent += 1;
                while let Ok((size, result)) = rx_out.try_recv() {
                    consume(&mut outputs, &mut first_err, size, result);
                }
            }

            // One sentinel per worker; on failure the dropped channel ends
            // the workers instead.
            let mut stops = workers;
            while stops > 0 && first_err.is_none() && !cancel.is_cancelled() {
                match tx_in.send_timeout(Msg::Stop, Duration::from_millis(20)) {
                    Ok(()) => stops -= 1,
                    Err(SendTimeoutError::Timeout(_)) => {
                        while let Ok((size, result)) = rx_out.try_recv() {
                            consume(&mut outputs, &mut first_err, size, result);
                        }
                    }
                    Err(SendTimeoutError::Disconnected(_)) => break,
                }
            }
            drop(tx_in);

            while chunks_done.get() < sent && first_err.is_none() && !cancel.is_cancelled() {
                match rx_out.recv_timeout(Duration::from_millis(100)) {
                    Ok((size, result)) => consume(&mut outputs, &mut first_err, size, result),
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            // Failure or cancellation: drain whatever is left without
            // blocking so no worker can wedge on a full queue.
            while let Ok((size, result)) = rx_out.try_recv() {
                consume(&mut outputs, &mut first_err, size, result);
            }
        });

        if let Some(e) = first_err {
            return Err(e);
        }
        if self.cancel.is_cancelled() {
            return Err(Error::Interrupted);
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_map_small_input_runs_serially() {
        let pool = Pool::new();
        let out = pool
            .map((0..10i64).collect(), |chunk| {
                Ok(chunk.into_iter().map(|x| x * 2).collect())
            })
            .unwrap();
        assert_eq!(out, vec![0, 2, 4, 6, 8, 10, 12, 14, 16, 18]);
    }

    #[test]
    fn test_map_multiset_is_chunking_independent() {
        let items: Vec<i64> = (0..5000).collect();
        let pool = Pool::new();
        let mut out = pool
            .map(items.clone(), |chunk| {
                Ok(chunk.into_iter().map(|x| x * x).collect())
            })
            .unwrap();
        out.sort_unstable();
        let mut want: Vec<i64> = items.iter().map(|x| x * x).collect();
        want.sort_unstable();
        assert_eq!(out, want);
    }

    #[test]
    fn test_map_with_worker_override() {
        let pool = Pool::new().with_workers(Some(2));
        let mut out = pool
            .map((0..3000i64).collect(), |chunk| Ok(chunk))
            .unwrap();
        out.sort_unstable();
        assert_eq!(out, (0..3000i64).collect::<Vec<_>>());
    }

    #[test]
    fn test_reduce_one_output_per_chunk() {
        let items: Vec<i64> = vec![1; 4000];
        let pool = Pool::new();
        let sums = pool
            .reduce(items, |chunk| Ok(chunk.iter().sum::<i64>()))
            .unwrap();
        assert_eq!(sums.iter().sum::<i64>(), 4000);
    }

    #[test]
    fn test_worker_error_surfaces() {
        let pool = Pool::new();
        let res = pool.map((0..5000i64).collect(), |chunk| {
            if chunk.contains(&4321) {
                Err(Error::other("boom"))
            } else {
                Ok(chunk)
            }
        });
        assert!(res.is_err());
        pool.cancel_token().reset();
    }

    #[test]
    fn test_cancel_before_stage() {
        let pool = Pool::new();
        pool.cancel_token().cancel();
        let res = pool.map(vec![1, 2, 3], Ok);
        assert!(matches!(res, Err(Error::Interrupted)));
    }

    #[test]
    fn test_progress_reaches_one_hundred() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let pool = Pool::new().with_progress(Box::new(move |pct| {
            sink.lock().unwrap().push(pct);
        }));
        pool.map((0..5000i64).collect(), |chunk| Ok(chunk)).unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.last(), Some(&100));
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }
}
