//! Voice activity detection: engine contract, bounded instance pool, and
//! silence trimming.
//!
//! VAD engines are stateful native handles that must not be shared across
//! threads. The pool pre-initialises a fixed number of instances and hands
//! them out behind an RAII guard, so an instance returns to the pool on
//! every exit path, including panics and early errors.

mod energy;
mod silero;
mod trim;

pub use energy::EnergyVad;
pub use silero::SileroVad;
pub use trim::SilenceFilter;

use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{Error, Result};

/// Framewise speech/silence classifier.
///
/// One instance serves one borrower at a time; the pool enforces this.
pub trait VadEngine: Send {
    /// Classifies a single frame of 16-bit PCM samples.
    /// Returns true when the frame contains speech.
    fn process(&mut self, frame: &[i16]) -> Result<bool>;

    /// Clears internal state between borrowers.
    fn reset(&mut self) {}
}

/// A bounded pool of pre-initialised VAD engines.
///
/// `acquire` waits for a free instance up to the configured timeout and
/// fails afterwards; dropping the returned [`VadGuard`] resets the engine
/// and returns it to the pool.
#[derive(Clone)]
pub struct VadPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    free: Mutex<Vec<Box<dyn VadEngine>>>,
    permits: Arc<Semaphore>,
    acquire_timeout: Duration,
    size: usize,
}

impl VadPool {
    /// Builds a pool of `size` engines created by `factory`.
    pub fn new<F>(size: usize, acquire_timeout: Duration, mut factory: F) -> Result<Self>
    where
        F: FnMut() -> Result<Box<dyn VadEngine>>,
    {
        if size == 0 {
            return Err(Error::Config("vad pool size must be positive".into()));
        }
        let mut free = Vec::with_capacity(size);
        for _ in 0..size {
            free.push(factory()?);
        }
        Ok(Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(free),
                permits: Arc::new(Semaphore::new(size)),
                acquire_timeout,
                size,
            }),
        })
    }

    /// Checks out an engine, waiting up to the pool's acquire timeout.
    pub async fn acquire(&self) -> Result<VadGuard> {
        let permit = tokio::time::timeout(
            self.inner.acquire_timeout,
            self.inner.permits.clone().acquire_owned(),
        )
        .await
        .map_err(|_| Error::Vad("timed out waiting for a free VAD instance".into()))?
        .map_err(|_| Error::Vad("VAD pool is closed".into()))?;

        // A permit guarantees the free list is non-empty.
        let engine = self
            .inner
            .free
            .lock()
            .pop()
            .ok_or_else(|| Error::Vad("VAD pool free list is empty".into()))?;

        Ok(VadGuard {
            engine: Some(engine),
            pool: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Number of engines currently checked in.
    pub fn available(&self) -> usize {
        self.inner.permits.available_permits()
    }

    /// Total pool capacity.
    pub fn size(&self) -> usize {
        self.inner.size
    }
}

/// Checked-out VAD engine. Returns to the pool on drop.
pub struct VadGuard {
    engine: Option<Box<dyn VadEngine>>,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for VadGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VadGuard").finish_non_exhaustive()
    }
}

impl Deref for VadGuard {
    type Target = dyn VadEngine;

    fn deref(&self) -> &Self::Target {
        self.engine.as_deref().expect("vad engine held until drop")
    }
}

impl DerefMut for VadGuard {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.engine
            .as_deref_mut()
            .expect("vad engine held until drop")
    }
}

impl Drop for VadGuard {
    fn drop(&mut self) {
        if let Some(mut engine) = self.engine.take() {
            engine.reset();
            self.pool.free.lock().push(engine);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingVad;

    impl VadEngine for CountingVad {
        fn process(&mut self, frame: &[i16]) -> Result<bool> {
            Ok(frame.iter().any(|&s| s != 0))
        }
    }

    fn pool(size: usize, timeout_ms: u64) -> VadPool {
        VadPool::new(size, Duration::from_millis(timeout_ms), || {
            Ok(Box::new(CountingVad))
        })
        .unwrap()
    }

    #[tokio::test]
    async fn acquire_and_release() {
        let p = pool(2, 100);
        assert_eq!(p.available(), 2);
        {
            let _a = p.acquire().await.unwrap();
            let _b = p.acquire().await.unwrap();
            assert_eq!(p.available(), 0);
        }
        assert_eq!(p.available(), 2);
    }

    #[tokio::test]
    async fn acquire_times_out_when_exhausted() {
        let p = pool(1, 20);
        let _held = p.acquire().await.unwrap();
        let err = p.acquire().await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn guard_returns_on_error_path() {
        let p = pool(1, 100);
        let result: Result<()> = async {
            let mut guard = p.acquire().await?;
            guard.process(&[1, 2, 3])?;
            Err(Error::Vad("synthetic failure".into()))
        }
        .await;
        assert!(result.is_err());
        assert_eq!(p.available(), 1, "instance must return after an error");
    }

    #[tokio::test]
    async fn waiter_proceeds_after_release() {
        let p = pool(1, 500);
        let guard = p.acquire().await.unwrap();
        let p2 = p.clone();
        let waiter = tokio::spawn(async move { p2.acquire().await.map(|_| ()) });
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(guard);
        waiter.await.unwrap().unwrap();
    }

    #[test]
    fn zero_size_rejected() {
        let res = VadPool::new(0, Duration::from_secs(1), || {
            Ok(Box::new(CountingVad) as Box<dyn VadEngine>)
        });
        assert!(res.is_err());
    }
}
