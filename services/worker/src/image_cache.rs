//! Presence cache for container images.
//!
//! Records which image references this process has confirmed as present on
//! the host so that launching the same image twice skips the pull. The cache
//! is pessimistic and advisory:
//!
//! - it starts empty on every restart, apart from the configured
//!   pre-installed images
//! - a miss only means "not confirmed yet"; the engine pull stays the final
//!   authority, and a redundant pull is harmless
//! - an entry is only added after a pull succeeds, never before
//!
//! Two launches may miss at the same time and both pull. That race is
//! tolerated because engine pulls are idempotent.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashSet;
use tracing::debug;

/// Concurrent set of image references believed to be present locally.
#[derive(Debug, Default)]
pub struct ImageCache {
    images: DashSet<String>,
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

impl ImageCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a cache pre-seeded with images known to be installed.
    pub fn with_images<I, S>(images: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let cache = Self::new();
        for image in images {
            let image = image.into();
            debug!(image = %image, "Adding preinstalled image");
            cache.images.insert(image);
        }
        cache
    }

    /// Records an image as present. Idempotent.
    pub fn mark_present(&self, image: &str) {
        if self.images.insert(image.to_string()) {
            debug!(image = %image, "Image marked present");
        }
    }

    /// Whether the image has been confirmed present by this process.
    pub fn is_present(&self, image: &str) -> bool {
        let present = self.images.contains(image);
        let counter = if present { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        present
    }

    /// Drops an entry so the next launch pulls again.
    pub fn forget(&self, image: &str) -> bool {
        self.images.remove(image).is_some()
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.images.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// Splits a comma-delimited image list, trimming whitespace and dropping
/// empty entries.
pub fn parse_image_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|image| !image.is_empty())
        .map(str::to_string)
        .collect()
}
