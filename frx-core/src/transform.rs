//! The external transformation capability and built-in stand-ins.
//!
//! The real identity-substitution model lives outside this crate. It is
//! reached through [`Transformer`], which the worker pool calls once per
//! job. Calls are assumed non-cancellable: once started, a call runs to
//! completion and its result is discarded if nobody wants it any more.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::ProcessingError;
use crate::frame::SourceIdentity;

/// Per-frame image transformation.
#[async_trait]
pub trait Transformer: Send + Sync + 'static {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Inference backend the capability was configured with, e.g. `"cuda"`.
    fn execution_provider(&self) -> Option<&str> {
        None
    }

    /// Derive an identity from a reference image.
    ///
    /// The default keeps the image as its own descriptor. A model-backed
    /// implementation would run face detection here and reject images
    /// with [`ProcessingError::IdentityRejected`].
    async fn prepare_identity(&self, image: Bytes) -> Result<SourceIdentity, ProcessingError> {
        Ok(SourceIdentity::from_image(image))
    }

    /// Transform one compressed image.
    async fn process(
        &self,
        payload: Bytes,
        identity: Arc<SourceIdentity>,
    ) -> Result<Bytes, ProcessingError>;
}

// ── Passthrough ──────────────────────────────────────────────────

/// Returns every frame unchanged.
#[derive(Debug, Default, Clone)]
pub struct Passthrough {
    provider: Option<String>,
}

impl Passthrough {
    pub fn on_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }
}

#[async_trait]
impl Transformer for Passthrough {
    fn name(&self) -> &str {
        "passthrough"
    }

    fn execution_provider(&self) -> Option<&str> {
        self.provider.as_deref()
    }

    async fn process(
        &self,
        payload: Bytes,
        _identity: Arc<SourceIdentity>,
    ) -> Result<Bytes, ProcessingError> {
        Ok(payload)
    }
}

// ── Simulated ────────────────────────────────────────────────────

/// Echoes frames after a fixed delay, optionally failing every k-th call.
///
/// Stands in for a GPU model with a known latency when load-testing the
/// scheduler.
#[derive(Debug)]
pub struct Simulated {
    latency: Duration,
    fail_every: Option<u64>,
    provider: Option<String>,
    calls: AtomicU64,
}

impl Simulated {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            fail_every: None,
            provider: None,
            calls: AtomicU64::new(0),
        }
    }

    /// Fail calls `k, 2k, 3k, …`. `0` disables failures.
    pub fn failing_every(mut self, k: u64) -> Self {
        self.fail_every = (k > 0).then_some(k);
        self
    }

    pub fn on_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Transformer for Simulated {
    fn name(&self) -> &str {
        "simulated"
    }

    fn execution_provider(&self) -> Option<&str> {
        self.provider.as_deref()
    }

    /// Uses the image fingerprint as a fixed-size stand-in for a face
    /// embedding.
    async fn prepare_identity(&self, image: Bytes) -> Result<SourceIdentity, ProcessingError> {
        let embedding = Bytes::copy_from_slice(SourceIdentity::fingerprint_of(&image).as_bytes());
        Ok(SourceIdentity::with_descriptor(image, embedding))
    }

    async fn process(
        &self,
        payload: Bytes,
        _identity: Arc<SourceIdentity>,
    ) -> Result<Bytes, ProcessingError> {
        let n = self.calls.fetch_add(1, Ordering::Relaxed) + 1;
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        match self.fail_every {
            Some(k) if n % k == 0 => Err(ProcessingError::Failed(format!(
                "simulated failure on call {n}"
            ))),
            _ => Ok(payload),
        }
    }
}

// ── BlockingTransformer ──────────────────────────────────────────

type BlockingFn =
    dyn Fn(&[u8], &SourceIdentity) -> Result<Bytes, ProcessingError> + Send + Sync + 'static;

/// Adapts a synchronous, compute-bound function to [`Transformer`] by
/// running each call on Tokio's blocking pool.
///
/// A panic inside the function surfaces as [`ProcessingError::Aborted`]
/// and does not take the worker down.
pub struct BlockingTransformer {
    name: String,
    f: Arc<BlockingFn>,
}

impl BlockingTransformer {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&[u8], &SourceIdentity) -> Result<Bytes, ProcessingError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f: Arc::new(f),
        }
    }
}

impl std::fmt::Debug for BlockingTransformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingTransformer")
            .field("name", &self.name)
            .finish()
    }
}

#[async_trait]
impl Transformer for BlockingTransformer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn process(
        &self,
        payload: Bytes,
        identity: Arc<SourceIdentity>,
    ) -> Result<Bytes, ProcessingError> {
        let f = Arc::clone(&self.f);
        tokio::task::spawn_blocking(move || f(&payload, &identity)).await?
    }
}
