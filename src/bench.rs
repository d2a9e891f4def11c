//! A small async measurement loop and the process-wide byte sink.
//!
//! ```no_run
//! use arity_bench::{bench::{Bench, SINK}, client::Client, Error};
//!
//! # async fn run() -> Result<(), Error> {
//! let client = &Client::new("127.0.0.1:8080".parse().unwrap());
//!
//! let measurement = Bench::new("0 handler args")
//!     .run(move || async move {
//!         SINK.add(client.get("/").await?.body().len());
//!         Ok::<_, Error>(())
//!     })
//!     .await?;
//!
//! println!("{measurement}");
//! # Ok(())
//! # }
//! ```

use std::{
    fmt,
    future::Future,
    sync::atomic::{AtomicUsize, Ordering},
    time::{Duration, Instant},
};

/// Accumulates response sizes so the measured work cannot be optimized out.
#[derive(Debug, Default)]
pub struct Sink(AtomicUsize);

impl Sink {
    pub const fn new() -> Self {
        Self(AtomicUsize::new(0))
    }

    #[inline(always)]
    pub fn add(&self, n: usize) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn total(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }
}

pub static SINK: Sink = Sink::new();

/// A named measurement, configured with builder methods and consumed by [`run`](Bench::run).
#[derive(Debug, Clone)]
pub struct Bench {
    name: String,
    warmup: usize,
    iterations: usize,
}

impl Bench {
    /// 1 000 warm-up calls and 10 000 measured ones.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            warmup: 1_000,
            iterations: 10_000,
        }
    }

    #[inline(always)]
    pub fn warmup(mut self, warmup: usize) -> Self {
        self.warmup = warmup;
        self
    }

    /// Clamped to at least one.
    #[inline(always)]
    pub fn iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations.max(1);
        self
    }

    /// Awaits `body` once per iteration and times each call on its own.
    ///
    /// The first error stops the run and is returned as is.
    pub async fn run<F, Fut, E>(self, mut body: F) -> Result<Measurement, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        for _ in 0..self.warmup {
            body().await?;
        }

        let mut samples = Vec::with_capacity(self.iterations);
        let started = Instant::now();

        for _ in 0..self.iterations {
            let t = Instant::now();
            body().await?;
            samples.push(t.elapsed());
        }

        Ok(Measurement::new(self.name, samples, started.elapsed()))
    }
}

/// Statistics of one [`Bench`] run.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub name: String,
    pub iterations: usize,
    pub mean: Duration,
    pub median: Duration,
    pub min: Duration,
    pub max: Duration,
    pub per_second: f64,
}

impl Measurement {
    fn new(name: String, mut samples: Vec<Duration>, total: Duration) -> Self {
        samples.sort_unstable();

        let iterations = samples.len();
        let sum: Duration = samples.iter().sum();
        let mid = iterations / 2;
        let median = match iterations {
            0 => Duration::ZERO,
            n if n % 2 == 0 => (samples[mid - 1] + samples[mid]) / 2,
            _ => samples[mid],
        };

        Self {
            name,
            iterations,
            mean: mean(sum, iterations),
            median,
            min: samples.first().copied().unwrap_or_default(),
            max: samples.last().copied().unwrap_or_default(),
            per_second: match total.as_secs_f64() {
                secs if secs > 0.0 => iterations as f64 / secs,
                _ => 0.0,
            },
        }
    }
}

fn mean(sum: Duration, count: usize) -> Duration {
    match u128::try_from(count) {
        Ok(0) | Err(_) => Duration::ZERO,
        Ok(count) => {
            let nanos = sum.as_nanos() / count;
            Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
        }
    }
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<16} {:>8} iter  mean {:>10.2?}  median {:>10.2?}  min {:>10.2?}  max {:>10.2?}  {:>10.0} iter/s",
            self.name, self.iterations, self.mean, self.median, self.min, self.max, self.per_second
        )
    }
}
