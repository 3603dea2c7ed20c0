//! Ordered release of resources acquired while setting up a sandbox.

use crate::error::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::future::Future;

type CloseFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// Runs release functions in reverse registration order.
///
/// Every closer runs even if an earlier one failed; the first error is
/// returned.
#[derive(Default)]
pub struct MultiCloser {
    closers: Vec<CloseFn>,
}

impl fmt::Debug for MultiCloser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiCloser")
            .field("pending", &self.closers.len())
            .finish()
    }
}

impl MultiCloser {
    /// Create an empty closer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a release function.
    pub fn append<F, Fut>(&mut self, close: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.closers.push(Box::new(move || close().boxed()));
    }

    /// Number of pending release functions.
    pub fn len(&self) -> usize {
        self.closers.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.closers.is_empty()
    }

    /// Run all release functions, last registered first.
    pub async fn close(&mut self) -> Result<()> {
        let mut first = None;
        while let Some(close) = self.closers.pop() {
            if let Err(e) = close().await {
                tracing::warn!(error = %e, "Release failed");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}
