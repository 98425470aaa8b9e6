//! The selection coordinator.
//!
//! Owns the tool tree, the heater bank and the injected collaborators, and
//! drives every select/deselect sequence from one logical control thread.
//! Chain operations are not transactional; a mid-chain failure leaves the
//! already-transitioned entities as they are for the operator to inspect.

use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use toolmux_common::{
    EntityConfig, HeaterPowerState, LifecycleState, RestoreMode, ToolId, ToolRef, ToolmuxError,
};

use crate::heaters::{HeaterBank, HeaterRequest};
use crate::inherit;
use crate::traits::{
    HeaterOutput, MotionController, PersistentStore, ProcedureRunner, Telemetry,
};
use crate::tree::{ToolStatus, ToolTree};

/// Which mechanical procedure hook is being run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Hook {
    Init,
    Select,
    Deselect,
}

impl Hook {
    fn label(self) -> &'static str {
        match self {
            Hook::Init => "init_gcode",
            Hook::Select => "tool_select_gcode",
            Hook::Deselect => "tool_deselect_gcode",
        }
    }

    fn transient(self) -> LifecycleState {
        match self {
            Hook::Init => LifecycleState::Initializing,
            Hook::Select => LifecycleState::Selecting,
            Hook::Deselect => LifecycleState::Deselecting,
        }
    }
}

/// Snapshot of the coordinator handed to procedures and status queries.
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub active_tool: String,
    pub saved_fan_speed: f64,
    pub global_offset: [f64; 3],
    pub tools: Vec<String>,
}

/// Context handed to an external procedure while it runs.
///
/// The procedure reads the status snapshots and reports its own completion by
/// setting the acting tool's state back through [`ProcedureContext::set_state`]
/// or [`ProcedureContext::set_state_by_name`].
pub struct ProcedureContext<'a> {
    /// Status of the acting tool, snapshotted at invocation.
    pub myself: ToolStatus,
    /// Status of the coordinator, snapshotted at invocation.
    pub coordinator: CoordinatorStatus,
    target: ToolId,
    tree: &'a mut ToolTree,
}

impl ProcedureContext<'_> {
    /// Current state of the acting tool.
    pub fn state(&self) -> LifecycleState {
        self.tree.tool(self.target).state
    }

    /// Sets the acting tool's state, with the usual propagation contract.
    pub fn set_state(&mut self, state: LifecycleState) {
        self.tree.set_tool_state(self.target, state);
    }

    /// Sets the acting tool's state from a textual state name. Both tool and
    /// toolchanger spellings are accepted.
    pub fn set_state_by_name(&mut self, name: &str) -> Result<(), ToolmuxError> {
        let state: LifecycleState = name.parse()?;
        self.tree.set_tool_state(self.target, state);
        Ok(())
    }
}

/// Orchestrates select/deselect across the tree of toolchangers.
pub struct Coordinator {
    pub tree: ToolTree,
    pub heaters: HeaterBank,
    procedures: Box<dyn ProcedureRunner>,
    motion: Box<dyn MotionController>,
    heater_out: Box<dyn HeaterOutput>,
    store: Box<dyn PersistentStore>,
    stats: Box<dyn Telemetry>,
    /// Event-loop clock, advanced by [`Coordinator::tick`]. Seconds.
    now: f64,
}

impl Coordinator {
    pub fn new(
        procedures: Box<dyn ProcedureRunner>,
        motion: Box<dyn MotionController>,
        heater_out: Box<dyn HeaterOutput>,
        store: Box<dyn PersistentStore>,
        stats: Box<dyn Telemetry>,
    ) -> Self {
        Coordinator {
            tree: ToolTree::new(),
            heaters: HeaterBank::new(),
            procedures,
            motion,
            heater_out,
            store,
            stats,
            now: 0.0,
        }
    }

    /// Applies the process-level defaults section. Fields left unset here
    /// fall back to the hard-coded defaults during configure.
    pub fn configure_root(&mut self, cfg: &EntityConfig) {
        self.tree.configure_root(cfg);
    }

    /// Adds a toolchanger section. Changers must be added before their tools.
    pub fn add_toolchanger(&mut self, cfg: &EntityConfig) -> Result<(), ToolmuxError> {
        self.tree.add_toolchanger(cfg)?;
        Ok(())
    }

    /// Adds a tool section.
    pub fn add_tool(&mut self, cfg: &EntityConfig) -> Result<ToolId, ToolmuxError> {
        self.tree.add_tool(cfg)
    }

    /// Resolves inheritance for every entity. Must run after all entities are
    /// added and before any selection activity.
    pub fn configure(&mut self) -> Result<(), ToolmuxError> {
        inherit::configure(&mut self.tree, &mut self.heaters, &mut *self.store)
    }

    /// Brings every configured entity to Ready, running the init hook where
    /// one is set. Unlike select/deselect hooks, an init hook that returns
    /// without a state transition is treated as done.
    pub fn initialize(&mut self) -> Result<(), ToolmuxError> {
        let tools: Vec<ToolId> = self.tree.tool_ids().collect();
        for id in tools {
            if self.tree.tool(id).state != LifecycleState::Configured {
                continue;
            }
            self.tree.set_tool_state(id, LifecycleState::Initializing);
            let body = self
                .tree
                .tool(id)
                .inherit
                .init_gcode
                .clone()
                .unwrap_or_default();
            if !body.is_empty() {
                self.run_tool_procedure(id, Hook::Init)?;
            }
            if self.tree.tool(id).state == LifecycleState::Initializing {
                self.tree.set_tool_state(id, LifecycleState::Ready);
            }
        }
        let changers: Vec<_> = self.tree.changer_ids().collect();
        for id in changers {
            if self.tree.changer(id).state < LifecycleState::Ready {
                self.tree.set_changer_state(id, LifecycleState::Ready);
            }
        }
        self.tree.root.state = LifecycleState::Ready;
        Ok(())
    }

    /// Advances the event-loop clock and fires any expired heater timers.
    pub fn tick(&mut self, now: f64) {
        self.now = now;
        self.heaters.tick(now, &mut *self.heater_out, &mut *self.stats);
    }

    pub fn status(&self) -> CoordinatorStatus {
        CoordinatorStatus {
            active_tool: self.tree.ref_name(self.tree.active()).to_string(),
            saved_fan_speed: self.tree.saved_fan_speed,
            global_offset: self.tree.root.global_offset,
            tools: self.tree.tool_ids().map(|id| self.tree.tool(id).name.clone()).collect(),
        }
    }

    /// Selects a tool.
    ///
    /// With `final_selected` the call is the top-level request: the current
    /// chain is retracted as needed, the target's ancestor chain is engaged
    /// root-to-leaf, and the target ends Active. Without it the call is one
    /// link of a chain engagement and leaves the tool Selected.
    pub fn select(
        &mut self,
        id: ToolId,
        restore: Option<RestoreMode>,
        final_selected: bool,
    ) -> Result<(), ToolmuxError> {
        let name = self.tree.tool(id).name.clone();
        if self.tree.tool(id).state == LifecycleState::Selecting {
            return Err(ToolmuxError::precondition(&name, "selection already in progress"));
        }

        if final_selected {
            if self.tree.active() == ToolRef::Tool(id) {
                debug!(tool = %name, "already the active tool");
                return Ok(());
            }
            if self.tree.active().is_unknown() {
                return Err(ToolmuxError::UnsafeState(name));
            }

            // Start warming up before the mechanical move so heating overlaps
            // the change.
            if !self.tree.tool(id).heater_bindings().is_empty() {
                self.set_tool_heater_state(id, HeaterPowerState::Active)?;
            }

            if let Some(mode) = restore {
                self.motion.save_position(mode);
            }

            match self.tree.active() {
                ToolRef::Tool(active)
                    if self.tree.tool(active).changer == self.tree.tool(id).changer =>
                {
                    self.deselect(active)?;
                }
                ToolRef::Tool(active) => {
                    // Retract the old chain leaf-to-root before engaging any
                    // part of the new one.
                    let unload = self
                        .tree
                        .ancestor_chain(active, |t| t.force_deselect_when_parent_deselects());
                    for tool in unload {
                        self.deselect(tool)?;
                    }
                }
                _ => {}
            }

            // Engage the target's ancestor chain root-to-leaf. This also runs
            // from a cold start with no active tool, where the whole chain
            // still needs engaging.
            let engage = self
                .tree
                .ancestor_chain(id, |t| t.state != LifecycleState::Selected);
            for tool in engage.into_iter().rev() {
                self.select(tool, None, false)?;
            }
        }

        // Covers the intermediate tools already engaged during chain
        // selection, and the target itself after the chain above ran it.
        if self.tree.tool(id).state == LifecycleState::Selected {
            if final_selected {
                self.finalize_selection(id);
            }
            return Ok(());
        }

        self.stats.select_started(&name);

        let axes = self.tree.tool(id).requires_axis_homed();
        if !self.motion.axes_homed(axes) {
            return Err(ToolmuxError::precondition(
                &name,
                format!("required axes {axes} not homed"),
            ));
        }

        self.tree.set_tool_state(id, LifecycleState::Selecting);
        self.run_tool_procedure(id, Hook::Select)?;

        // Restore bound fans to the saved speed, scaled per binding.
        let saved = self.tree.saved_fan_speed;
        for fan in self.tree.tool(id).fan_bindings().to_vec() {
            self.motion
                .set_fan_speed(&fan.fan, (fan.scale * saved).clamp(0.0, 1.0));
        }

        self.stats.select_completed(&name);
        info!(tool = %name, "tool selected");

        if final_selected {
            self.finalize_selection(id);
        }
        Ok(())
    }

    /// Deselects a tool: fans off, deselect procedure, active ref cleared.
    pub fn deselect(&mut self, id: ToolId) -> Result<(), ToolmuxError> {
        let name = self.tree.tool(id).name.clone();
        if self.tree.tool(id).state == LifecycleState::Deselecting {
            return Err(ToolmuxError::precondition(&name, "deselection already in progress"));
        }

        if self.tree.tool(id).parent_must_be_selected_on_deselect() {
            let changer = self.tree.tool(id).changer;
            if let Some(parent) = self.tree.changer(changer).parent_tool {
                if self.tree.tool(parent).state < LifecycleState::Selected {
                    return Err(ToolmuxError::precondition(
                        &name,
                        format!(
                            "parent tool {} must be selected before deselecting",
                            self.tree.tool(parent).name
                        ),
                    ));
                }
            }
        }

        let axes = self.tree.tool(id).requires_axis_homed();
        if !self.motion.axes_homed(axes) {
            return Err(ToolmuxError::precondition(
                &name,
                format!("required axes {axes} not homed"),
            ));
        }

        self.stats.deselect_started(&name);

        for fan in self.tree.tool(id).fan_bindings().to_vec() {
            self.motion.set_fan_speed(&fan.fan, 0.0);
        }

        self.tree.set_tool_state(id, LifecycleState::Deselecting);
        self.run_tool_procedure(id, Hook::Deselect)?;

        self.tree.set_active(ToolRef::None);
        self.stats.deselect_completed(&name);
        info!(tool = %name, "tool deselected");
        Ok(())
    }

    fn finalize_selection(&mut self, id: ToolId) {
        self.tree.set_active(ToolRef::Tool(id));
        self.tree.set_tool_state(id, LifecycleState::Active);
        info!(tool = %self.tree.tool(id).name, "tool active");
    }

    /// Runs one of the tool's procedure hooks with a fresh context. The
    /// select and deselect hooks must transition the tool out of its
    /// transient state; the init hook may return without one.
    fn run_tool_procedure(&mut self, id: ToolId, hook: Hook) -> Result<(), ToolmuxError> {
        let name = self.tree.tool(id).name.clone();
        let body = {
            let inherit = &self.tree.tool(id).inherit;
            match hook {
                Hook::Init => inherit.init_gcode.clone(),
                Hook::Select => inherit.tool_select_gcode.clone(),
                Hook::Deselect => inherit.tool_deselect_gcode.clone(),
            }
            .unwrap_or_default()
        };
        let myself = self.tree.tool_status(id);
        let coordinator = self.status();
        let mut ctx = ProcedureContext {
            myself,
            coordinator,
            target: id,
            tree: &mut self.tree,
        };
        self.procedures
            .run(&body, &mut ctx)
            .map_err(|e| ToolmuxError::ProcedureFailed {
                entity: name.clone(),
                procedure: hook.label(),
                message: e.to_string(),
            })?;

        let state = self.tree.tool(id).state;
        if state == LifecycleState::Error {
            return Err(ToolmuxError::ProcedureEnteredError {
                entity: name,
                procedure: hook.label(),
            });
        }
        if hook != Hook::Init && state == hook.transient() {
            return Err(ToolmuxError::ProcedureDidNotTransition {
                entity: name,
                procedure: hook.label(),
            });
        }
        Ok(())
    }

    /// Transitions every heater the tool binds to the target power state.
    /// Activity is attributed to the topmost ancestor sharing the binding.
    pub fn set_tool_heater_state(
        &mut self,
        id: ToolId,
        target: HeaterPowerState,
    ) -> Result<(), ToolmuxError> {
        let tool = self.tree.tool(id);
        let bindings = tool.heater_bindings().to_vec();
        if bindings.is_empty() {
            return Err(ToolmuxError::precondition(
                &tool.name,
                "tool has no heater bindings",
            ));
        }
        let name = tool.name.clone();
        let active_temp = tool.heater_active_temp;
        let standby_temp = tool.heater_standby_temp;
        let a2s = tool.active_to_standby_delay();
        let s2p = tool.standby_to_powerdown_delay();
        let attributed = self.tree.topmost_tool_for_heater(id);
        let attributed_name = self.tree.tool(attributed).name.clone();

        for binding in &bindings {
            let req = HeaterRequest {
                tool: &name,
                attributed_tool: &attributed_name,
                binding,
                active_temp: active_temp + binding.temp_offset,
                standby_temp: standby_temp + binding.temp_offset,
                active_to_standby_delay: binding.active_to_standby_delay.unwrap_or(a2s),
                standby_to_powerdown_delay: binding.standby_to_powerdown_delay.unwrap_or(s2p),
            };
            self.heaters.transition(
                &req,
                target,
                self.now,
                &mut *self.heater_out,
                &mut *self.stats,
            )?;
        }
        self.tree.tool_mut(id).heater_state = target;
        Ok(())
    }

    /// Updates the tool's heater temperatures. If a heater is currently in
    /// the matching power state the new temperature is commanded right away.
    pub fn set_tool_heater_temps(
        &mut self,
        id: ToolId,
        active: Option<f64>,
        standby: Option<f64>,
    ) -> Result<(), ToolmuxError> {
        if let Some(temp) = active {
            self.tree.tool_mut(id).heater_active_temp = temp;
        }
        if let Some(temp) = standby {
            self.tree.tool_mut(id).heater_standby_temp = temp;
        }
        let state = self.tree.tool(id).heater_state;
        let recommand = (active.is_some() && state == HeaterPowerState::Active)
            || (standby.is_some() && state == HeaterPowerState::Standby);
        if recommand {
            // Same-state transition re-commands the matching temperature.
            self.set_tool_heater_state(id, state)?;
        }
        Ok(())
    }

    /// Updates the tool's heater delay settings and reschedules any timers
    /// already counting down.
    pub fn set_tool_heater_delays(
        &mut self,
        id: ToolId,
        active_to_standby: Option<f64>,
        standby_to_powerdown: Option<f64>,
    ) -> Result<(), ToolmuxError> {
        {
            let inherit = &mut self.tree.tool_mut(id).inherit;
            if let Some(v) = active_to_standby {
                inherit.heater_active_to_standby_delay = Some(v);
            }
            if let Some(v) = standby_to_powerdown {
                inherit.heater_standby_to_powerdown_delay = Some(v);
            }
        }
        let tool = self.tree.tool(id);
        let a2s = tool.active_to_standby_delay();
        let s2p = tool.standby_to_powerdown_delay();
        for binding in tool.heater_bindings().to_vec() {
            // Binding-level overrides keep precedence over the tool setting.
            self.heaters.reconfigure_delays(
                &binding.heater,
                Some(binding.active_to_standby_delay.unwrap_or(a2s)),
                Some(binding.standby_to_powerdown_delay.unwrap_or(s2p)),
                self.now,
            )?;
        }
        Ok(())
    }

    /// Sets a tool's offset and writes it through to the persistent store.
    pub fn adjust_tool_offset(&mut self, id: ToolId, offset: [f64; 3]) {
        self.tree.tool_mut(id).inherit.offset = Some(offset);
        let key = self.tree.tool(id).persistence_key();
        self.store.set(&key, "offset", json!(offset));
        debug!(tool = %self.tree.tool(id).name, ?offset, "tool offset saved");
    }

    /// Sets the process-wide global offset and persists it.
    pub fn adjust_global_offset(&mut self, offset: [f64; 3]) {
        self.tree.root.global_offset = offset;
        let key = self.tree.root.persistence_key();
        self.store.set(&key, "global_offset", json!(offset));
        debug!(?offset, "global offset saved");
    }

    /// Saves the fan speed to restore on the next selected tool's fans.
    pub fn save_fan_speed(&mut self, speed: f64) {
        self.tree.saved_fan_speed = speed.clamp(0.0, 1.0);
    }

    /// Marks the mounted tool as indeterminate. Used by hosts after a failed
    /// change that needs manual inspection.
    pub fn mark_active_unknown(&mut self) {
        warn!("active tool marked unknown; manual intervention required before the next change");
        self.tree.set_active(ToolRef::Unknown);
    }
}
