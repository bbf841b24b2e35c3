use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Maximum samples retained per estimator; older samples are overwritten.
const MAX_DATA_POINTS: usize = 1000;

// ---------------------------------------------------------------------------
// DataPoints — rolling latency / throughput estimator
// ---------------------------------------------------------------------------

/// Rolling estimator over a ring of samples.
///
/// `average()` and `p90()` return values computed at the last `recompute()`;
/// tracking a sample does not move them. Estimators built with a half-life
/// decay their samples toward zero on recompute, so a host that was penalized
/// with a large latency sample drifts back into contention over time.
pub struct DataPoints {
    half_life: Option<Duration>,
    inner: Mutex<Inner>,
}

struct Inner {
    samples: Vec<f64>,
    next: usize,
    average: f64,
    p90: f64,
    last_decay: Instant,
}

impl DataPoints {
    /// Estimator whose samples decay with the given half-life.
    pub fn with_half_life(half_life: Duration) -> Self {
        DataPoints {
            half_life: Some(half_life),
            inner: Mutex::new(Inner::new()),
        }
    }

    /// Estimator whose samples never decay.
    pub fn no_decay() -> Self {
        DataPoints {
            half_life: None,
            inner: Mutex::new(Inner::new()),
        }
    }

    /// Record one sample.
    pub fn track(&self, value: f64) {
        let mut inner = self.lock();
        if inner.samples.len() < MAX_DATA_POINTS {
            inner.samples.push(value);
        } else {
            let next = inner.next;
            inner.samples[next] = value;
        }
        inner.next = (inner.next + 1) % MAX_DATA_POINTS;
    }

    /// Mean of the samples as of the last recompute.
    pub fn average(&self) -> f64 {
        self.lock().average
    }

    /// 90th percentile of the samples as of the last recompute.
    pub fn p90(&self) -> f64 {
        self.lock().p90
    }

    /// Apply decay (if configured) and refresh the cached average and P90.
    /// Idempotent: recomputing twice in quick succession yields the same
    /// values, modulo the vanishing decay of the interval between calls.
    pub fn recompute(&self) {
        let mut inner = self.lock();

        if let Some(half_life) = self.half_life {
            let elapsed = inner.last_decay.elapsed();
            if elapsed > Duration::ZERO {
                let factor = 0.5f64.powf(elapsed.as_secs_f64() / half_life.as_secs_f64());
                for sample in inner.samples.iter_mut() {
                    *sample *= factor;
                }
            }
            inner.last_decay = Instant::now();
        }

        if inner.samples.is_empty() {
            inner.average = 0.0;
            inner.p90 = 0.0;
            return;
        }

        let mut sorted = inner.samples.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        inner.average = sorted.iter().sum::<f64>() / sorted.len() as f64;
        inner.p90 = percentile(&sorted, 0.9);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Inner {
    fn new() -> Self {
        Inner {
            samples: Vec::new(),
            next: 0,
            average: 0.0,
            p90: 0.0,
            last_decay: Instant::now(),
        }
    }
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p * (sorted.len() - 1) as f64).round() as usize;
    sorted[rank.min(sorted.len() - 1)]
}
