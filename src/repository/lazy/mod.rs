//! Deferred entity collections.
//!
//! A [`LazyCollection`] wraps a storage fetch for one entity kind and walks
//! `Unloaded -> Loading -> Loaded` or `Unloaded -> Loading -> Failed`. The
//! underlying [`CollectionLoader`] runs at most once at a time: concurrent
//! first readers all wait on the same in-flight fetch. A failed collection
//! stays failed until [`LazyCollection::reset`] is called.

#[cfg(test)]
mod tests;

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::model::{EntityKind, SemanticModelEntity};
use crate::{Result, StoreError};

/// Fetches every entity of one kind for one model
#[async_trait]
pub trait CollectionLoader: Send + Sync {
    async fn load(&self) -> Result<Vec<SemanticModelEntity>>;

    /// Human-readable source for log and error context
    fn describe(&self) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Unloaded,
    Loading,
    Loaded,
    Failed,
}

impl LoadState {
    fn to_u8(self) -> u8 {
        match self {
            Self::Unloaded => 0,
            Self::Loading => 1,
            Self::Loaded => 2,
            Self::Failed => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Loading,
            2 => Self::Loaded,
            3 => Self::Failed,
            _ => Self::Unloaded,
        }
    }
}

pub struct LazyCollection {
    kind: EntityKind,
    loader: Arc<dyn CollectionLoader>,
    cell: OnceCell<Vec<SemanticModelEntity>>,
    state: AtomicU8,
}

impl LazyCollection {
    #[inline]
    pub fn new(kind: EntityKind, loader: Arc<dyn CollectionLoader>) -> Self {
        Self {
            kind,
            loader,
            cell: OnceCell::new(),
            state: AtomicU8::new(LoadState::Unloaded.to_u8()),
        }
    }

    #[inline]
    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    #[inline]
    pub fn state(&self) -> LoadState {
        LoadState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: LoadState) {
        self.state.store(state.to_u8(), Ordering::Release);
    }

    /// Returns the entities, running the loader on first access
    #[inline]
    pub async fn get(&self) -> Result<&[SemanticModelEntity]> {
        if let Some(entities) = self.cell.get() {
            return Ok(entities);
        }

        let entities = self
            .cell
            .get_or_try_init(|| async {
                // A waiter that acquires the cell after a failure must not refetch
                if self.state() == LoadState::Failed {
                    return Err(self.failed_error());
                }

                self.set_state(LoadState::Loading);
                debug!("Loading {} collection from {}", self.kind, self.loader.describe());

                match self.loader.load().await {
                    Ok(entities) => {
                        self.set_state(LoadState::Loaded);
                        debug!(
                            "Loaded {} {} entities from {}",
                            entities.len(),
                            self.kind,
                            self.loader.describe()
                        );
                        Ok(entities)
                    }
                    Err(e) => {
                        self.set_state(LoadState::Failed);
                        warn!(
                            "Failed to load {} collection from {}: {}",
                            self.kind,
                            self.loader.describe(),
                            e
                        );
                        Err(e)
                    }
                }
            })
            .await?;

        Ok(entities)
    }

    /// Moves a failed collection back to `Unloaded` so the next access retries
    #[inline]
    pub fn reset(&self) -> bool {
        self.state
            .compare_exchange(
                LoadState::Failed.to_u8(),
                LoadState::Unloaded.to_u8(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Loads if needed and hands the entities over to the caller
    #[inline]
    pub async fn take(&mut self) -> Result<Vec<SemanticModelEntity>> {
        self.get().await?;
        self.cell.take().ok_or_else(|| self.failed_error())
    }

    fn failed_error(&self) -> StoreError {
        StoreError::transient(
            "lazy load",
            self.loader.describe(),
            format!(
                "{} collection failed to load; reset the collection to retry",
                self.kind
            ),
        )
    }
}

impl Clone for LazyCollection {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            loader: Arc::clone(&self.loader),
            cell: self.cell.clone(),
            state: AtomicU8::new(self.state.load(Ordering::Acquire)),
        }
    }
}

impl std::fmt::Debug for LazyCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyCollection")
            .field("kind", &self.kind)
            .field("source", &self.loader.describe())
            .field("state", &self.state())
            .finish()
    }
}

/// An entity collection that is either materialized or behind a lazy proxy
#[derive(Debug, Clone)]
pub enum EntityCollection {
    Loaded(Vec<SemanticModelEntity>),
    Deferred(LazyCollection),
}

impl Default for EntityCollection {
    #[inline]
    fn default() -> Self {
        Self::Loaded(Vec::new())
    }
}

impl EntityCollection {
    #[inline]
    pub async fn get(&self) -> Result<&[SemanticModelEntity]> {
        match self {
            Self::Loaded(entities) => Ok(entities),
            Self::Deferred(lazy) => lazy.get().await,
        }
    }

    /// Materializes a deferred collection so it can be mutated in place
    #[inline]
    pub async fn get_mut(&mut self) -> Result<&mut Vec<SemanticModelEntity>> {
        if let Self::Deferred(lazy) = self {
            let entities = lazy.take().await?;
            *self = Self::Loaded(entities);
        }

        match self {
            Self::Loaded(entities) => Ok(entities),
            Self::Deferred(lazy) => Err(lazy.failed_error()),
        }
    }

    #[inline]
    pub fn is_loaded(&self) -> bool {
        match self {
            Self::Loaded(_) => true,
            Self::Deferred(lazy) => lazy.state() == LoadState::Loaded,
        }
    }

    #[inline]
    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred(_))
    }
}
