//! Ordered release of run resources.
//!
//! Every resource acquired during a run (tunnel session, database connection
//! task) is pushed onto a [`ResourceStack`]. Releasing walks the stack in
//! reverse acquisition order, keeps going when one release fails, and is safe
//! to call more than once.

use async_trait::async_trait;

use crate::error::{SnapError, SnapResult};

/// A resource that must be released when a run ends.
#[async_trait]
pub trait Release: Send {
    /// Short name used in logs.
    fn label(&self) -> &str;

    /// Release the resource. Called at most once by the stack.
    async fn release(&mut self) -> SnapResult<()>;

    /// Synchronous best-effort release, used when a stack is dropped without
    /// `release_all` having run.
    fn release_now(&mut self) {}
}

/// Stack of acquired resources, released last-in first-out.
#[derive(Default)]
pub struct ResourceStack {
    entries: Vec<Box<dyn Release>>,
}

impl ResourceStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an acquired resource.
    pub fn push<R: Release + 'static>(&mut self, resource: R) {
        tracing::debug!(resource = resource.label(), depth = self.entries.len() + 1, "Resource acquired");
        self.entries.push(Box::new(resource));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Release everything in reverse order.
    ///
    /// Failures are logged and returned; they never stop later releases. The
    /// stack is empty afterwards, so a second call does nothing.
    pub async fn release_all(&mut self) -> Vec<(String, SnapError)> {
        let mut failures = Vec::new();

        while let Some(mut resource) = self.entries.pop() {
            let label = resource.label().to_string();
            match resource.release().await {
                Ok(()) => tracing::debug!(resource = %label, "Resource released"),
                Err(e) => {
                    tracing::warn!(resource = %label, error = %e, "Failed to release resource");
                    failures.push((label, e));
                }
            }
        }

        failures
    }
}

impl Drop for ResourceStack {
    fn drop(&mut self) {
        if self.entries.is_empty() {
            return;
        }

        tracing::warn!(
            remaining = self.entries.len(),
            "Resource stack dropped without release; releasing synchronously"
        );
        while let Some(mut resource) = self.entries.pop() {
            resource.release_now();
        }
    }
}
