use std::fmt;
use std::num::NonZeroUsize;
use std::str::FromStr;

use rayon::prelude::*;

use crate::error::BidsError;

const WORKERS_PER_CORE: usize = 5;

/// Worker pool size; zero selects strictly sequential execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Workers(usize);

impl Workers {
    pub const SEQUENTIAL: Workers = Workers(0);

    pub fn new(count: usize) -> Self {
        Self(count)
    }

    pub fn count(self) -> usize {
        self.0
    }

    pub fn is_sequential(self) -> bool {
        self.0 == 0
    }
}

impl Default for Workers {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);
        Self(cores * WORKERS_PER_CORE)
    }
}

impl fmt::Display for Workers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_sequential() {
            write!(f, "sequential")
        } else {
            write!(f, "{} workers", self.0)
        }
    }
}

impl FromStr for Workers {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        value
            .trim()
            .parse::<usize>()
            .map(Workers)
            .map_err(|err| format!("invalid worker count '{value}': {err}"))
    }
}

/// Runs independent work items either on a bounded pool or one after another.
#[derive(Debug)]
pub struct Executor {
    workers: Workers,
    pool: Option<rayon::ThreadPool>,
}

impl Executor {
    /// Builds the worker pool up front so a pool failure surfaces before any work.
    pub fn new(workers: Workers) -> Result<Self, BidsError> {
        let pool = if workers.is_sequential() {
            None
        } else {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(workers.count())
                .thread_name(|index| format!("oxybids-worker-{index}"))
                .build()
                .map_err(|err| BidsError::WorkerPool(err.to_string()))?;
            Some(pool)
        };
        Ok(Self { workers, pool })
    }

    pub fn workers(&self) -> Workers {
        self.workers
    }

    /// Executes `task` once per item and returns results in submission order.
    ///
    /// Every item runs to completion before this returns; a failing item is
    /// just another result and never stops its siblings.
    pub fn run<T, R, F>(&self, items: Vec<T>, task: F) -> Result<Vec<R>, BidsError>
    where
        T: Send,
        R: Send,
        F: Fn(T) -> R + Sync + Send,
    {
        match &self.pool {
            Some(pool) => Ok(pool.install(|| items.into_par_iter().map(task).collect())),
            None => Ok(items.into_iter().map(task).collect()),
        }
    }

    /// Like [`Executor::run`] but pairs each result with the key of its item.
    pub fn run_keyed<T, K, R, F, KF>(
        &self,
        items: Vec<T>,
        key: KF,
        task: F,
    ) -> Result<Vec<(K, R)>, BidsError>
    where
        T: Send,
        K: Send,
        R: Send,
        KF: Fn(&T) -> K + Sync + Send,
        F: Fn(T) -> R + Sync + Send,
    {
        self.run(items, |item| {
            let item_key = key(&item);
            (item_key, task(item))
        })
    }
}
