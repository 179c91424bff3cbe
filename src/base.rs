// [[file:../fleet.note::fed8a9d3][fed8a9d3]]
use crate::common::*;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
// fed8a9d3 ends here

// [[file:../fleet.note::49f269df][49f269df]]
/// Polling and retry schedule: start with `interval`, grow it by `factor`
/// up to `max_interval`, give up after `timeout`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    interval: Duration,
    factor: f64,
    max_interval: Duration,
    timeout: Duration,
}

impl Backoff {
    /// Constant `interval` polling bounded by `timeout`.
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            factor: 1.0,
            max_interval: interval,
            timeout,
        }
    }

    /// Grow the interval by `factor` after each attempt, capped at `max_interval`.
    pub fn with_growth(mut self, factor: f64, max_interval: Duration) -> Self {
        self.factor = factor.max(1.0);
        self.max_interval = max_interval.max(self.interval);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn next_interval(&self, current: Duration) -> Duration {
        current.mul_f64(self.factor).min(self.max_interval)
    }

    /// Sleep for `delay` unless `cancel` fires first.
    async fn pause(delay: Duration, cancel: &CancellationToken, what: &str) -> Result<()> {
        tokio::select! {
            _ = cancel.cancelled() => Err(ClusterError::Cancelled(format!("waiting for {what}"))),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Call `probe` until it yields `Some`, the timeout elapses, or `cancel`
    /// fires. Errors from `probe` end the wait immediately.
    pub async fn wait_until<T, F, Fut>(&self, what: &str, cancel: &CancellationToken, mut probe: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        let start = Instant::now();
        let mut interval = self.interval;
        loop {
            if cancel.is_cancelled() {
                return Err(ClusterError::Cancelled(format!("waiting for {what}")));
            }
            if let Some(x) = probe().await? {
                trace!("Elapsed time during waiting for {what}: {:.2?}", start.elapsed());
                return Ok(x);
            }
            let elapsed = start.elapsed();
            if elapsed >= self.timeout {
                return Err(ClusterError::Timeout {
                    what: what.into(),
                    elapsed,
                });
            }
            Self::pause(interval.min(self.timeout - elapsed), cancel, what).await?;
            interval = self.next_interval(interval);
        }
    }

    /// Retry `op` up to `attempts` times. Only for idempotent operations.
    pub async fn retry<T, F, Fut>(&self, what: &str, attempts: usize, cancel: &CancellationToken, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = attempts.max(1);
        let mut interval = self.interval;
        let mut i = 0;
        loop {
            i += 1;
            if cancel.is_cancelled() {
                return Err(ClusterError::Cancelled(what.into()));
            }
            match op().await {
                Ok(x) => return Ok(x),
                Err(e) if e.is_cancelled() || i >= attempts => return Err(e),
                Err(e) => {
                    warn!("{what} failed (attempt {i}/{attempts}): {e}");
                    Self::pause(interval, cancel, what).await?;
                    interval = self.next_interval(interval);
                }
            }
        }
    }
}
// 49f269df ends here

// [[file:../fleet.note::3b9e7f24][3b9e7f24]]
/// Run `f` over `items` with at most `limit` of them in flight. Results are
/// returned in the order of `items`.
pub async fn for_each_bounded<T, R, F, Fut>(items: Vec<T>, limit: usize, f: F) -> Vec<R>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = R> + Send + 'static,
    R: Send + 'static,
{
    let semaphore = Arc::new(tokio::sync::Semaphore::new(limit.max(1)));
    let mut tasks = tokio::task::JoinSet::new();
    let n = items.len();
    for (i, item) in items.into_iter().enumerate() {
        let fut = f(item);
        let semaphore = semaphore.clone();
        tasks.spawn(async move {
            // the semaphore is never closed
            let _permit = semaphore.acquire_owned().await;
            (i, fut.await)
        });
    }

    let mut results: Vec<Option<R>> = std::iter::repeat_with(|| None).take(n).collect();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((i, r)) => results[i] = Some(r),
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => error!("pooled task vanished: {e}"),
        }
    }
    results.into_iter().flatten().collect()
}
// 3b9e7f24 ends here

// [[file:../fleet.note::50e6ed5a][50e6ed5a]]
/// A random lowercase alphanumeric name of length `n`, usable in job names,
/// machine paths and object names.
pub fn random_name(n: usize) -> String {
    use rand::distributions::Alphanumeric;
    use rand::Rng;

    let mut rng = rand::thread_rng();
    std::iter::repeat(())
        .map(|()| rng.sample(Alphanumeric))
        .map(char::from)
        .map(|c| c.to_ascii_lowercase())
        .take(n)
        .collect()
}

/// Quote `s` for a POSIX shell. Safe strings are returned bare.
pub fn shell_escape(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    if s.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | '%' | ':' | '=' | ',' | '@' | '+'))
    {
        return s.to_string();
    }
    let escaped = s.replace('\'', "'\\''");
    format!("'{escaped}'")
}

/// Join `args` into one shell command line.
pub fn shell_join<S: AsRef<str>>(args: impl IntoIterator<Item = S>) -> String {
    args.into_iter().map(|s| shell_escape(s.as_ref())).join(" ")
}
// 50e6ed5a ends here

// [[file:../fleet.note::f725ca9b][f725ca9b]]
#[test]
fn test_shell_escape() {
    assert_eq!(shell_escape(""), "''");
    assert_eq!(shell_escape("gs://b/x-1.txt"), "gs://b/x-1.txt");
    assert_eq!(shell_escape("a b"), "'a b'");
    assert_eq!(shell_escape("it's"), "'it'\\''s'");
    assert_eq!(shell_join(["echo", "$HOME", "x"]), "echo '$HOME' x");
}

#[test]
fn test_random_name() {
    let name = random_name(6);
    assert_eq!(name.len(), 6);
    assert!(name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
}

#[tokio::test]
async fn test_backoff_wait() {
    let cancel = CancellationToken::new();
    let backoff = Backoff::new(Duration::from_millis(5), Duration::from_secs(5));
    let mut n = 0;
    let x = backoff
        .wait_until("counter", &cancel, || {
            n += 1;
            let n = n;
            async move { Ok((n >= 3).then_some(n)) }
        })
        .await
        .unwrap();
    assert_eq!(x, 3);

    // timeout is distinct from failure
    let backoff = Backoff::new(Duration::from_millis(5), Duration::from_millis(30));
    let e = backoff
        .wait_until("never", &cancel, || async { Ok(None::<()>) })
        .await
        .unwrap_err();
    assert!(matches!(e, ClusterError::Timeout { .. }), "{e:?}");

    cancel.cancel();
    let e = backoff
        .wait_until("cancelled", &cancel, || async { Ok(None::<()>) })
        .await
        .unwrap_err();
    assert!(e.is_cancelled());
}

#[tokio::test]
async fn test_backoff_retry() {
    let cancel = CancellationToken::new();
    let backoff = Backoff::new(Duration::from_millis(1), Duration::from_secs(1));
    let mut calls = 0;
    let r = backoff
        .retry("flaky", 3, &cancel, || {
            calls += 1;
            let ok = calls == 2;
            async move {
                if ok {
                    Ok(())
                } else {
                    Err(ClusterError::validation("x", "y"))
                }
            }
        })
        .await;
    assert!(r.is_ok());
    assert_eq!(calls, 2);

    let mut calls = 0;
    let r: Result<()> = backoff
        .retry("broken", 3, &cancel, || {
            calls += 1;
            async { Err(ClusterError::validation("x", "y")) }
        })
        .await;
    assert!(r.is_err());
    assert_eq!(calls, 3);
}

#[tokio::test]
async fn test_for_each_bounded() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let out = for_each_bounded((0..20).collect(), 3, |i: usize| {
        let running = running.clone();
        let peak = peak.clone();
        async move {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(2)).await;
            running.fetch_sub(1, Ordering::SeqCst);
            i * 2
        }
    })
    .await;
    assert_eq!(out, (0..20).map(|i| i * 2).collect_vec());
    assert!(peak.load(Ordering::SeqCst) <= 3);
}
// f725ca9b ends here
