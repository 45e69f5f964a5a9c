//! Per-snapshot model cache.
//!
//! A cached model is tied to the index version it was built from. Building
//! against an older snapshot than the cached one yields
//! [`SpatialError::IndexStale`] so the caller can rebind.

use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use crate::error::SpatialError;
use crate::index::{IndexSnapshot, IndexVersion};

/// Holds one model derived from an index snapshot, rebuilt lazily when the version moves.
#[derive(Debug)]
pub struct VersionedCache<T> {
    slot: RwLock<Option<(IndexVersion, Arc<T>)>>,
}

impl<T> VersionedCache<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            slot: RwLock::new(None),
        }
    }

    /// Version of the cached model, if any.
    #[must_use]
    pub fn cached_version(&self) -> Option<IndexVersion> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|(v, _)| *v)
    }

    /// Return the model for `snapshot`, building and caching it on a version change.
    ///
    /// A model is only ever replaced by one for a newer version.
    ///
    /// # Errors
    ///
    /// Returns [`SpatialError::IndexStale`] when a model for a newer version is
    /// already cached, meaning the caller's snapshot was superseded mid-call;
    /// callers retry against [`crate::SpatialIndex::snapshot`]. Errors from
    /// `build` propagate unchanged.
    pub fn get_or_build(
        &self,
        snapshot: &IndexSnapshot,
        build: impl FnOnce(&IndexSnapshot) -> Result<T, SpatialError>,
    ) -> Result<Arc<T>, SpatialError> {
        let bound = snapshot.version();
        if let Some((version, model)) = self.slot.read().unwrap_or_else(PoisonError::into_inner).as_ref() {
            if *version == bound {
                return Ok(Arc::clone(model));
            }
            if *version > bound {
                return Err(SpatialError::IndexStale {
                    bound,
                    current: *version,
                });
            }
        }

        let model = Arc::new(build(snapshot)?);
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        match slot.as_ref() {
            Some((version, existing)) if *version == bound => return Ok(Arc::clone(existing)),
            Some((version, _)) if *version > bound => {
                return Err(SpatialError::IndexStale {
                    bound,
                    current: *version,
                });
            }
            _ => {}
        }
        debug!(version = %bound, "derived spatial model rebuilt");
        *slot = Some((bound, Arc::clone(&model)));
        Ok(model)
    }

    /// Drop the cached model.
    pub fn invalidate(&self) {
        *self.slot.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl<T> Default for VersionedCache<T> {
    fn default() -> Self {
        Self::new()
    }
}
