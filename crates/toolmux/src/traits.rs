//! Collaborator interfaces the engine calls out to.
//!
//! The engine owns no hardware and runs no user code itself: mechanical
//! procedures, motion, heater outputs, persistence and statistics are all
//! injected behind these traits. Everything is synchronous; the engine runs
//! on one logical control thread and blocks on each call.

use std::collections::BTreeMap;

use thiserror::Error;

use toolmux_common::{AxisMask, EntityKey, RestoreMode};

use crate::coordinator::ProcedureContext;

/// Error raised by an external procedure.
#[derive(Debug, Error)]
pub enum ProcedureError {
    /// The procedure body raised an error of its own.
    #[error("procedure raised: {0}")]
    Raised(String),
}

/// Executes a user-supplied mechanical procedure.
///
/// The engine hands over the procedure body (an opaque script for the host's
/// macro engine) together with a [`ProcedureContext`] exposing status
/// snapshots and the state-setting surface. The procedure reports its own
/// completion by setting the acting entity's state through the context; a
/// procedure that returns without transitioning the state fails the
/// surrounding operation.
pub trait ProcedureRunner {
    fn run(&mut self, body: &str, ctx: &mut ProcedureContext<'_>) -> Result<(), ProcedureError>;
}

/// Motion/homing collaborator.
///
/// Homing verification gates every select and deselect; position saving and
/// fan control are fire-and-forget from the engine's perspective.
pub trait MotionController {
    /// True when every axis in `axes` is homed.
    fn axes_homed(&self, axes: AxisMask) -> bool;

    /// Save the current position, tagged with how much of it to restore
    /// after the tool change.
    fn save_position(&mut self, mode: RestoreMode);

    /// Set a named fan's speed in [0, 1].
    fn set_fan_speed(&mut self, fan: &str, speed: f64);
}

/// Heater hardware collaborator.
pub trait HeaterOutput {
    /// Command a heater's target temperature. Zero powers the heater down.
    fn set_target(&mut self, heater: &str, temp: f64);

    /// Last measured temperature of a heater.
    fn measured_temp(&self, heater: &str) -> f64;
}

/// Persistent key-value store for per-entity records (offsets).
pub trait PersistentStore {
    /// All persisted fields for an entity. Missing entities yield an empty map.
    fn get(&self, key: &EntityKey) -> BTreeMap<String, serde_json::Value>;

    /// Write one field of an entity's record.
    fn set(&mut self, key: &EntityKey, field: &str, value: serde_json::Value);
}

/// Statistics/tracking sink. All hooks default to no-ops so embedders only
/// implement what they record.
///
/// Heater hooks receive the topmost ancestor tool sharing the heater binding,
/// so shared physical heaters are not double-counted in nested setups.
#[allow(unused_variables)]
pub trait Telemetry {
    fn select_started(&mut self, tool: &str) {}
    fn select_completed(&mut self, tool: &str) {}
    fn deselect_started(&mut self, tool: &str) {}
    fn deselect_completed(&mut self, tool: &str) {}
    fn heater_active_start(&mut self, tool: &str) {}
    fn heater_active_end(&mut self, tool: &str) {}
    fn heater_standby_start(&mut self, tool: &str) {}
    fn heater_standby_end(&mut self, tool: &str) {}
    fn heater_powerdown(&mut self, tool: &str) {}
}

/// Default telemetry sink that records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTelemetry;

impl Telemetry for NullTelemetry {}

/// In-memory persistent store, useful for tests and hosts that flush
/// elsewhere.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: BTreeMap<EntityKey, BTreeMap<String, serde_json::Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistentStore for MemoryStore {
    fn get(&self, key: &EntityKey) -> BTreeMap<String, serde_json::Value> {
        self.records.get(key).cloned().unwrap_or_default()
    }

    fn set(&mut self, key: &EntityKey, field: &str, value: serde_json::Value) {
        self.records
            .entry(key.clone())
            .or_default()
            .insert(field.to_string(), value);
    }
}
