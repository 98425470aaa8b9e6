//! toolmux: multi-level toolchanger coordination for motion-control machines.
//!
//! A machine can mount one tool at a time, possibly through several nested
//! levels of mechanical toolchangers. This crate owns the safe, ordered,
//! idempotent selection and deselection of tools across that tree, the
//! configuration-parameter inheritance between entities, and the
//! energy-aware standby management of heaters that tools carry.
//!
//! The engine is deliberately hardware-free: mechanical procedures, motion
//! and homing, heater outputs, persistence and statistics are injected
//! behind the traits in [`traits`]. Everything runs on one logical control
//! thread driven by the host's event loop; [`Coordinator::tick`] advances
//! heater timers.
//!
//! Typical embedding:
//!
//! ```ignore
//! let mut coordinator = Coordinator::new(procedures, motion, heaters, store, stats);
//! coordinator.add_toolchanger(&changer_cfg)?;
//! coordinator.add_tool(&tool_cfg)?;
//! coordinator.configure()?;
//! coordinator.initialize()?;
//! coordinator.handle_select_tool(&SelectToolRequest {
//!     tool: ToolKey::Number(0),
//!     restore: None,
//! })?;
//! ```

pub mod commands;
pub mod coordinator;
pub mod heaters;
pub mod inherit;
pub mod traits;
pub mod tree;

pub use commands::{
    GetStatusRequest, SelectToolRequest, SelectToolResponse, SetStateRequest, SetStateResponse,
    StatusReport, ToolKey,
};
pub use coordinator::{Coordinator, CoordinatorStatus, ProcedureContext};
pub use heaters::{Heater, HeaterBank, HeaterRequest, StandbyTimer};
pub use traits::{
    HeaterOutput, MemoryStore, MotionController, NullTelemetry, PersistentStore, ProcedureError,
    ProcedureRunner, Telemetry,
};
pub use tree::{ChangerStatus, InheritedParams, Tool, ToolStatus, ToolTree, Toolchanger};

pub use toolmux_common::{
    AxisMask, ChangerId, ConfigSection, EntityConfig, EntityKey, EntityKind, FanBinding,
    HeaterBinding, HeaterPowerState, LifecycleState, ParamValue, RestoreMode, ToolId, ToolRef,
    ToolmuxError,
};
