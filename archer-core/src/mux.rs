//! Job-type router: exact match first, then the longest registered prefix.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{ArcherError, Result};
use crate::modules::ScanModule;

/// Anything the router can dispatch to.
pub trait Named: Send + Sync {
    fn name(&self) -> &str;
}

struct MuxInner<H: ?Sized> {
    handlers: HashMap<String, Arc<H>>,
    /// Registered patterns, longest first.
    patterns: Vec<String>,
}

pub struct Mux<H: ?Sized + Named = dyn ScanModule> {
    inner: RwLock<MuxInner<H>>,
}

impl<H: ?Sized + Named> fmt::Debug for Mux<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mux")
            .field("patterns", &self.inner.read().patterns)
            .finish()
    }
}

impl<H: ?Sized + Named> Default for Mux<H> {
    fn default() -> Self {
        Self {
            inner: RwLock::new(MuxInner {
                handlers: HashMap::new(),
                patterns: Vec::new(),
            }),
        }
    }
}

impl<H: ?Sized + Named> Mux<H> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, pattern: &str, handler: Arc<H>) -> Result<()> {
        if pattern.trim().is_empty() {
            return Err(ArcherError::InvalidPattern);
        }
        if handler.name().trim().is_empty() {
            return Err(ArcherError::InvalidHandler(pattern.to_string()));
        }

        let mut inner = self.inner.write();
        if inner.handlers.contains_key(pattern) {
            return Err(ArcherError::DuplicatePattern(pattern.to_string()));
        }
        inner.handlers.insert(pattern.to_string(), handler);
        inner.patterns.push(pattern.to_string());
        inner
            .patterns
            .sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        Ok(())
    }

    /// Handler for `job_type` and the pattern that matched it.
    pub fn resolve(&self, job_type: &str) -> Result<(Arc<H>, String)> {
        let inner = self.inner.read();
        if let Some(handler) = inner.handlers.get(job_type) {
            return Ok((Arc::clone(handler), job_type.to_string()));
        }
        inner
            .patterns
            .iter()
            .find(|pattern| job_type.starts_with(pattern.as_str()))
            .and_then(|pattern| {
                inner
                    .handlers
                    .get(pattern)
                    .map(|handler| (Arc::clone(handler), pattern.clone()))
            })
            .ok_or_else(|| ArcherError::NoHandlerFound(job_type.to_string()))
    }

    pub fn patterns(&self) -> Vec<String> {
        self.inner.read().patterns.clone()
    }
}
