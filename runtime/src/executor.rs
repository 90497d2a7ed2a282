use crate::Result;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

#[derive(Debug, Default)]
struct Inflight {
    count: Mutex<usize>,
    idle: Condvar,
}

impl Inflight {
    fn enter(&self) {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    }

    fn leave(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }
}

struct JobGuard(Arc<Inflight>);

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.0.leave();
    }
}

/// A named CPU worker pool.
///
/// Each executor owns a private thread pool and counts the jobs it has accepted
/// but not yet finished, so an owner can block until the pool has drained.
#[derive(Debug)]
pub struct Executor {
    name: String,
    pool: rayon::ThreadPool,
    inflight: Arc<Inflight>,
}

impl Executor {
    pub fn new(num_threads: usize, name: &str) -> Result<Self> {
        let prefix = name.to_string();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads.max(1))
            .thread_name(move |idx| format!("{}-{}", prefix, idx))
            .panic_handler(|_| tracing::error!("executor job panicked"))
            .build()
            .map_err(|e| crate::Error::RuntimeError(format!("Failed to build thread pool: {}", e)))?;

        tracing::debug!(name, threads = num_threads.max(1), "executor started");
        Ok(Self {
            name: name.to_string(),
            pool,
            inflight: Arc::new(Inflight::default()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Jobs spawned but not yet finished.
    pub fn load(&self) -> usize {
        *self.inflight.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` on the pool without waiting for it. A panicking job still counts
    /// as finished.
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let inflight = self.inflight.clone();
        inflight.enter();

        self.pool.spawn(move || {
            let _guard = JobGuard(inflight);
            f();
        });
    }

    /// Block until every spawned job has finished. Must not be called from a
    /// job running on this executor.
    pub fn wait_idle(&self) {
        let mut count = self.inflight.count.lock().unwrap_or_else(PoisonError::into_inner);
        while *count > 0 {
            count = self
                .inflight
                .idle
                .wait(count)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

}
