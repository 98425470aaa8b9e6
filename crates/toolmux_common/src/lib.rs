//! Shared types for the toolmux toolchanger coordination engine.
//!
//! This crate carries everything both the engine and embedding applications
//! need to agree on: the lifecycle state enumeration, arena handles and
//! sentinel references, configuration intake, and the error taxonomy.
//!
//! With the `ecs` feature enabled the state and status types derive
//! `bevy::prelude::Component` so a Bevy application can store them directly
//! on entities.

pub mod config;
pub mod error;
pub mod state;
pub mod types;

pub use config::{ConfigSection, EntityConfig};
pub use error::ToolmuxError;
pub use state::LifecycleState;
pub use types::{
    AxisMask, ChangerId, EntityKey, EntityKind, FanBinding, HeaterBinding, HeaterPowerState,
    ParamValue, RestoreMode, ToolId, ToolRef,
};

/// Default delay before an active heater drops to standby temperature, in seconds.
pub const DEFAULT_ACTIVE_TO_STANDBY_DELAY: f64 = 0.1;

/// Default delay before a standby heater powers down, in seconds.
pub const DEFAULT_STANDBY_TO_POWERDOWN_DELAY: f64 = 600.0;

/// Smallest delay a heater timer can be scheduled at. A configured delay of
/// zero disables the timer instead.
pub const MIN_TIMER_DELAY: f64 = 0.1;
