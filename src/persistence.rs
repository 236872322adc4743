//! Persistence interface consumed by the scheduler and the workers
//!
//! The store is the single source of truth for map and step state. The
//! scheduler re-reads it on every evaluation cycle and workers write terminal
//! step states back through it. [`crate::state::SqliteStore`] is the bundled
//! implementation.

use crate::dag::StepLookup;
use crate::error::Result;
use crate::models::{Map, MapId, Step, StepId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Durable map/step storage
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Store: Send + Sync {
    /// All maps with `is_active` set. Steps are not loaded.
    async fn list_active_maps(&self) -> Result<Vec<Map>>;

    /// Steps owned by a map, ordered by ID
    async fn get_steps_for_map(&self, map_id: MapId) -> Result<Vec<Step>>;

    /// Single step, or [`crate::error::MapflowError::StepNotFound`]
    async fn get_step_by_id(&self, step_id: StepId) -> Result<Step>;

    /// Persist state, timestamps and detail of an existing step
    async fn update_step_state(&self, step: &Step) -> Result<()>;

    async fn update_map_last_run(&self, map_id: MapId, last_run: DateTime<Utc>) -> Result<()>;

    /// Mark steps left `running` by a previous process as failed.
    ///
    /// Returns the IDs of the recovered steps.
    async fn recover_interrupted(&self) -> Result<Vec<StepId>>;
}

#[async_trait]
impl<T: Store + ?Sized> StepLookup for T {
    async fn step_by_id(&self, id: StepId) -> Result<Step> {
        self.get_step_by_id(id).await
    }
}
