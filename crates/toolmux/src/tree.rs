//! The tool tree: an arena of tools and toolchangers plus the process root.
//!
//! All entities live in two flat vectors addressed by [`ToolId`] /
//! [`ChangerId`] handles; the active tool and each changer's selected tool
//! are [`ToolRef`] fields inside the tree, so there is no hidden global
//! state and test setups are deterministic. The reserved "none" and
//! "unknown" tools are `ToolRef` variants, never arena entries.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::error;

use toolmux_common::{
    AxisMask, ChangerId, EntityConfig, EntityKey, EntityKind, FanBinding, HeaterBinding,
    HeaterPowerState, LifecycleState, ParamValue, ToolId, ToolRef, ToolmuxError,
    DEFAULT_ACTIVE_TO_STANDBY_DELAY, DEFAULT_STANDBY_TO_POWERDOWN_DELAY,
};

/// Names reserved for the sentinel tools.
pub const RESERVED_TOOL_NAMES: [&str; 2] = ["none", "unknown"];

/// The parameter set a child copies from its parent when left unset.
///
/// `None` means "unset, inherit"; after configuration every field is `Some`
/// on every entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InheritedParams {
    pub engage_gcode: Option<String>,
    pub disengage_gcode: Option<String>,
    pub init_gcode: Option<String>,
    pub tool_select_gcode: Option<String>,
    pub tool_deselect_gcode: Option<String>,
    pub heaters: Option<Vec<HeaterBinding>>,
    pub fans: Option<Vec<FanBinding>>,
    pub offset: Option<[f64; 3]>,
    pub requires_axis_homed: Option<AxisMask>,
    pub heater_active_to_standby_delay: Option<f64>,
    pub heater_standby_to_powerdown_delay: Option<f64>,
    pub force_deselect_when_parent_deselects: Option<bool>,
    pub parent_must_be_selected_on_deselect: Option<bool>,
}

macro_rules! fill_field {
    ($self:ident, $parent:ident, $($field:ident),+ $(,)?) => {
        $(
            if $self.$field.is_none() {
                $self.$field = $parent.$field.clone();
            }
        )+
    };
}

impl InheritedParams {
    fn from_config(cfg: &EntityConfig) -> Self {
        InheritedParams {
            engage_gcode: cfg.engage_gcode.clone(),
            disengage_gcode: cfg.disengage_gcode.clone(),
            init_gcode: cfg.init_gcode.clone(),
            tool_select_gcode: cfg.tool_select_gcode.clone(),
            tool_deselect_gcode: cfg.tool_deselect_gcode.clone(),
            heaters: cfg.heaters.clone(),
            fans: cfg.fans.clone(),
            offset: cfg.offset,
            requires_axis_homed: cfg.requires_axis_homed,
            heater_active_to_standby_delay: cfg.heater_active_to_standby_delay,
            heater_standby_to_powerdown_delay: cfg.heater_standby_to_powerdown_delay,
            force_deselect_when_parent_deselects: cfg.force_deselect_when_parent_deselects,
            parent_must_be_selected_on_deselect: cfg.parent_must_be_selected_on_deselect,
        }
    }

    /// Copy every unset field from the parent.
    pub fn fill_from(&mut self, parent: &InheritedParams) {
        fill_field!(
            self,
            parent,
            engage_gcode,
            disengage_gcode,
            init_gcode,
            tool_select_gcode,
            tool_deselect_gcode,
            heaters,
            fans,
            offset,
            requires_axis_homed,
            heater_active_to_standby_delay,
            heater_standby_to_powerdown_delay,
            force_deselect_when_parent_deselects,
            parent_must_be_selected_on_deselect,
        );
    }

    /// Hard-coded defaults applied to the process root.
    pub fn fill_defaults(&mut self) {
        let defaults = InheritedParams {
            engage_gcode: Some(String::new()),
            disengage_gcode: Some(String::new()),
            init_gcode: Some(String::new()),
            tool_select_gcode: Some(String::new()),
            tool_deselect_gcode: Some(String::new()),
            heaters: Some(Vec::new()),
            fans: Some(Vec::new()),
            offset: Some([0.0, 0.0, 0.0]),
            requires_axis_homed: Some(AxisMask::XYZ),
            heater_active_to_standby_delay: Some(DEFAULT_ACTIVE_TO_STANDBY_DELAY),
            heater_standby_to_powerdown_delay: Some(DEFAULT_STANDBY_TO_POWERDOWN_DELAY),
            force_deselect_when_parent_deselects: Some(true),
            parent_must_be_selected_on_deselect: Some(true),
        };
        self.fill_from(&defaults);
    }
}

/// A single tool in the tree.
#[derive(Debug, Clone)]
pub struct Tool {
    pub name: String,
    pub number: Option<i32>,
    pub changer: ChangerId,
    pub state: LifecycleState,
    pub inherit: InheritedParams,
    pub params: BTreeMap<String, ParamValue>,
    pub init_offsets: BTreeMap<String, [f64; 3]>,
    pub heater_state: HeaterPowerState,
    pub heater_active_temp: f64,
    pub heater_standby_temp: f64,
}

impl Tool {
    pub fn offset(&self) -> [f64; 3] {
        self.inherit.offset.unwrap_or([0.0, 0.0, 0.0])
    }

    pub fn requires_axis_homed(&self) -> AxisMask {
        self.inherit.requires_axis_homed.unwrap_or(AxisMask::XYZ)
    }

    pub fn heater_bindings(&self) -> &[HeaterBinding] {
        self.inherit.heaters.as_deref().unwrap_or(&[])
    }

    pub fn fan_bindings(&self) -> &[FanBinding] {
        self.inherit.fans.as_deref().unwrap_or(&[])
    }

    pub fn force_deselect_when_parent_deselects(&self) -> bool {
        self.inherit.force_deselect_when_parent_deselects.unwrap_or(true)
    }

    pub fn parent_must_be_selected_on_deselect(&self) -> bool {
        self.inherit.parent_must_be_selected_on_deselect.unwrap_or(true)
    }

    pub fn active_to_standby_delay(&self) -> f64 {
        self.inherit
            .heater_active_to_standby_delay
            .unwrap_or(DEFAULT_ACTIVE_TO_STANDBY_DELAY)
    }

    pub fn standby_to_powerdown_delay(&self) -> f64 {
        self.inherit
            .heater_standby_to_powerdown_delay
            .unwrap_or(DEFAULT_STANDBY_TO_POWERDOWN_DELAY)
    }

    pub fn persistence_key(&self) -> EntityKey {
        EntityKey::new(EntityKind::Tool, &self.name)
    }
}

/// A toolchanger holding a set of mutually exclusive tools. A changer may
/// itself be mounted on a parent tool, nesting the tree.
#[derive(Debug, Clone)]
pub struct Toolchanger {
    pub name: String,
    /// Parent tool name from configuration, resolved during configure.
    pub parent_tool_name: Option<String>,
    pub parent_tool: Option<ToolId>,
    pub tools: BTreeMap<String, ToolId>,
    pub selected: ToolRef,
    pub state: LifecycleState,
    pub inherit: InheritedParams,
    pub params: BTreeMap<String, ParamValue>,
    pub init_offsets: BTreeMap<String, [f64; 3]>,
}

impl Toolchanger {
    pub fn persistence_key(&self) -> EntityKey {
        EntityKey::new(EntityKind::Toolchanger, &self.name)
    }
}

/// Process-level defaults holder, the top of the inheritance chain.
#[derive(Debug, Clone)]
pub struct RootNode {
    pub name: String,
    pub state: LifecycleState,
    pub inherit: InheritedParams,
    pub params: BTreeMap<String, ParamValue>,
    pub init_offsets: BTreeMap<String, [f64; 3]>,
    pub global_offset: [f64; 3],
}

impl Default for RootNode {
    fn default() -> Self {
        RootNode {
            name: "toolmux".to_string(),
            state: LifecycleState::NotConfigured,
            inherit: InheritedParams::default(),
            params: BTreeMap::new(),
            init_offsets: BTreeMap::new(),
            global_offset: [0.0, 0.0, 0.0],
        }
    }
}

impl RootNode {
    pub fn persistence_key(&self) -> EntityKey {
        EntityKey::new(EntityKind::Root, &self.name)
    }
}

/// Address of any entity participating in inheritance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeId {
    Root,
    Changer(ChangerId),
    Tool(ToolId),
}

/// Status snapshot of one tool, handed to procedures and status queries.
#[derive(Debug, Clone, Serialize)]
pub struct ToolStatus {
    pub name: String,
    pub number: Option<i32>,
    pub toolchanger: String,
    pub state: String,
    pub offset: [f64; 3],
    pub fans: Vec<FanBinding>,
    pub requires_axis_homed: String,
    pub force_deselect_when_parent_deselects: bool,
    pub parent_must_be_selected_on_deselect: bool,
    pub heater_state: HeaterPowerState,
    pub heater_active_temp: f64,
    pub heater_standby_temp: f64,
    pub heater_active_to_standby_delay: f64,
    pub heater_standby_to_powerdown_delay: f64,
    pub params: BTreeMap<String, ParamValue>,
}

/// Status snapshot of one toolchanger.
#[derive(Debug, Clone, Serialize)]
pub struct ChangerStatus {
    pub name: String,
    pub parent_tool: Option<String>,
    pub selected_tool: String,
    pub state: String,
    pub tools: Vec<String>,
}

/// The whole arena. All mutation goes through this context.
#[derive(Debug, Default)]
pub struct ToolTree {
    tools: Vec<Tool>,
    changers: Vec<Toolchanger>,
    tool_names: BTreeMap<String, ToolId>,
    tool_numbers: BTreeMap<i32, ToolId>,
    changer_names: BTreeMap<String, ChangerId>,
    pub root: RootNode,
    active: ToolRef,
    /// When false, tool state changes do not mirror onto the owning changer.
    pub propagate_state: bool,
    /// Fan speed to restore on the newly selected tool's fans.
    pub saved_fan_speed: f64,
}

impl ToolTree {
    pub fn new() -> Self {
        ToolTree {
            propagate_state: true,
            ..ToolTree::default()
        }
    }

    /// Applies the process-level configuration section to the root defaults
    /// holder.
    pub fn configure_root(&mut self, cfg: &EntityConfig) {
        self.root.inherit = InheritedParams::from_config(cfg);
        self.root.params = cfg.params.clone();
        self.root.init_offsets = cfg.init_offsets.clone();
    }

    /// Adds a toolchanger from its configuration. Changers must be added
    /// before the tools they own.
    pub fn add_toolchanger(&mut self, cfg: &EntityConfig) -> Result<ChangerId, ToolmuxError> {
        if self.changer_names.contains_key(&cfg.name) {
            return Err(ToolmuxError::config(&cfg.name, "duplicate toolchanger name"));
        }
        let id = ChangerId(self.changers.len());
        self.changers.push(Toolchanger {
            name: cfg.name.clone(),
            parent_tool_name: cfg.parent_tool.clone(),
            parent_tool: None,
            tools: BTreeMap::new(),
            selected: ToolRef::None,
            state: LifecycleState::NotConfigured,
            inherit: InheritedParams::from_config(cfg),
            params: cfg.params.clone(),
            init_offsets: cfg.init_offsets.clone(),
        });
        self.changer_names.insert(cfg.name.clone(), id);
        Ok(id)
    }

    /// Adds a tool from its configuration. The owning changer is looked up
    /// by name; when unset the first changer added acts as the default.
    pub fn add_tool(&mut self, cfg: &EntityConfig) -> Result<ToolId, ToolmuxError> {
        if RESERVED_TOOL_NAMES.contains(&cfg.name.to_lowercase().as_str()) {
            return Err(ToolmuxError::config(
                &cfg.name,
                "name is reserved for internal use",
            ));
        }
        if self.tool_names.contains_key(&cfg.name) {
            return Err(ToolmuxError::config(&cfg.name, "duplicate tool name"));
        }
        let changer = match &cfg.toolchanger {
            Some(name) => *self.changer_names.get(name).ok_or_else(|| {
                ToolmuxError::config(&cfg.name, format!("unknown toolchanger: {name}"))
            })?,
            None if !self.changers.is_empty() => ChangerId(0),
            None => {
                return Err(ToolmuxError::config(
                    &cfg.name,
                    "no toolchanger configured to own this tool",
                ))
            }
        };
        if let Some(number) = cfg.number {
            if self.tool_numbers.contains_key(&number) {
                return Err(ToolmuxError::config(
                    &cfg.name,
                    format!("duplicate tool number: {number}"),
                ));
            }
        }
        let id = ToolId(self.tools.len());
        self.tools.push(Tool {
            name: cfg.name.clone(),
            number: cfg.number,
            changer,
            state: LifecycleState::NotConfigured,
            inherit: InheritedParams::from_config(cfg),
            params: cfg.params.clone(),
            init_offsets: cfg.init_offsets.clone(),
            heater_state: HeaterPowerState::Off,
            heater_active_temp: 0.0,
            heater_standby_temp: 0.0,
        });
        self.tool_names.insert(cfg.name.clone(), id);
        if let Some(number) = cfg.number {
            self.tool_numbers.insert(number, id);
        }
        self.changers[changer.0].tools.insert(cfg.name.clone(), id);
        Ok(id)
    }

    pub fn tool(&self, id: ToolId) -> &Tool {
        &self.tools[id.0]
    }

    pub fn tool_mut(&mut self, id: ToolId) -> &mut Tool {
        &mut self.tools[id.0]
    }

    pub fn changer(&self, id: ChangerId) -> &Toolchanger {
        &self.changers[id.0]
    }

    pub fn changer_mut(&mut self, id: ChangerId) -> &mut Toolchanger {
        &mut self.changers[id.0]
    }

    pub fn tool_by_name(&self, name: &str) -> Option<ToolId> {
        self.tool_names.get(name).copied()
    }

    pub fn tool_by_number(&self, number: i32) -> Option<ToolId> {
        self.tool_numbers.get(&number).copied()
    }

    pub fn changer_by_name(&self, name: &str) -> Option<ChangerId> {
        self.changer_names.get(name).copied()
    }

    pub fn tool_ids(&self) -> impl Iterator<Item = ToolId> {
        (0..self.tools.len()).map(ToolId)
    }

    pub fn changer_ids(&self) -> impl Iterator<Item = ChangerId> {
        (0..self.changers.len()).map(ChangerId)
    }

    pub fn active(&self) -> ToolRef {
        self.active
    }

    pub fn set_active(&mut self, active: ToolRef) {
        self.active = active;
    }

    /// Display name of a tool reference; sentinels report their reserved names.
    pub fn ref_name(&self, tool: ToolRef) -> &str {
        match tool {
            ToolRef::None => "none",
            ToolRef::Unknown => "unknown",
            ToolRef::Tool(id) => &self.tools[id.0].name,
        }
    }

    /// Sets a tool's state and applies the propagation contract: with
    /// propagation enabled the owning changer mirrors the state, a Selected
    /// tool becomes the changer's selected reference, and an Active tool
    /// additionally becomes the process-wide active tool.
    pub fn set_tool_state(&mut self, id: ToolId, state: LifecycleState) {
        self.tools[id.0].state = state;
        if self.propagate_state {
            let changer = self.tools[id.0].changer;
            self.changers[changer.0].state = state;
            match state {
                LifecycleState::Selected => {
                    self.changers[changer.0].selected = ToolRef::Tool(id);
                }
                LifecycleState::Active => {
                    self.changers[changer.0].selected = ToolRef::Tool(id);
                    self.active = ToolRef::Tool(id);
                }
                _ => {}
            }
        }
        if state == LifecycleState::Error {
            error!(tool = %self.tools[id.0].name, "tool is now in error state");
        }
    }

    pub fn set_changer_state(&mut self, id: ChangerId, state: LifecycleState) {
        self.changers[id.0].state = state;
        if state == LifecycleState::Error {
            error!(toolchanger = %self.changers[id.0].name, "toolchanger is now in error state");
        }
    }

    /// Parent of an entity in the inheritance chain: a tool's parent is its
    /// changer; a changer's parent is its parent tool if nested, else the
    /// process root; the root has no parent.
    pub fn parent_of(&self, node: NodeId) -> Option<NodeId> {
        match node {
            NodeId::Root => None,
            NodeId::Tool(id) => Some(NodeId::Changer(self.tools[id.0].changer)),
            NodeId::Changer(id) => Some(match self.changers[id.0].parent_tool {
                Some(tool) => NodeId::Tool(tool),
                None => NodeId::Root,
            }),
        }
    }

    pub fn node_state(&self, node: NodeId) -> LifecycleState {
        match node {
            NodeId::Root => self.root.state,
            NodeId::Tool(id) => self.tools[id.0].state,
            NodeId::Changer(id) => self.changers[id.0].state,
        }
    }

    pub fn set_node_state(&mut self, node: NodeId, state: LifecycleState) {
        match node {
            NodeId::Root => self.root.state = state,
            // Propagation stays out of configuration-time state bookkeeping.
            NodeId::Tool(id) => self.tools[id.0].state = state,
            NodeId::Changer(id) => self.changers[id.0].state = state,
        }
    }

    pub fn node_name(&self, node: NodeId) -> &str {
        match node {
            NodeId::Root => &self.root.name,
            NodeId::Tool(id) => &self.tools[id.0].name,
            NodeId::Changer(id) => &self.changers[id.0].name,
        }
    }

    pub fn node_inherit(&self, node: NodeId) -> &InheritedParams {
        match node {
            NodeId::Root => &self.root.inherit,
            NodeId::Tool(id) => &self.tools[id.0].inherit,
            NodeId::Changer(id) => &self.changers[id.0].inherit,
        }
    }

    pub fn node_inherit_mut(&mut self, node: NodeId) -> &mut InheritedParams {
        match node {
            NodeId::Root => &mut self.root.inherit,
            NodeId::Tool(id) => &mut self.tools[id.0].inherit,
            NodeId::Changer(id) => &mut self.changers[id.0].inherit,
        }
    }

    /// Walks upward from `start` through parent-toolchanger → parent-tool
    /// links, collecting each tool (self first, then ancestors) matching the
    /// predicate.
    pub fn ancestor_chain(
        &self,
        start: ToolId,
        mut predicate: impl FnMut(&Tool) -> bool,
    ) -> Vec<ToolId> {
        let mut chain = Vec::new();
        let mut current = Some(start);
        while let Some(id) = current {
            let tool = &self.tools[id.0];
            if predicate(tool) {
                chain.push(id);
            }
            current = self.changers[tool.changer.0].parent_tool;
        }
        chain
    }

    /// Topmost ancestor tool sharing the identical heater binding set,
    /// walking up parent-tool links while the binding is unchanged. Heater
    /// activity is attributed to this tool so shared heaters are not
    /// double-counted.
    pub fn topmost_tool_for_heater(&self, start: ToolId) -> ToolId {
        let mut topmost = start;
        loop {
            let tool = &self.tools[topmost.0];
            match self.changers[tool.changer.0].parent_tool {
                Some(parent)
                    if !self.tools[parent.0].heater_bindings().is_empty()
                        && self.tools[parent.0].heater_bindings() == tool.heater_bindings() =>
                {
                    topmost = parent;
                }
                _ => return topmost,
            }
        }
    }

    pub fn tool_status(&self, id: ToolId) -> ToolStatus {
        let tool = &self.tools[id.0];
        ToolStatus {
            name: tool.name.clone(),
            number: tool.number,
            toolchanger: self.changers[tool.changer.0].name.clone(),
            state: tool.state.tool_label().to_string(),
            offset: tool.offset(),
            fans: tool.fan_bindings().to_vec(),
            requires_axis_homed: tool.requires_axis_homed().to_string(),
            force_deselect_when_parent_deselects: tool.force_deselect_when_parent_deselects(),
            parent_must_be_selected_on_deselect: tool.parent_must_be_selected_on_deselect(),
            heater_state: tool.heater_state,
            heater_active_temp: tool.heater_active_temp,
            heater_standby_temp: tool.heater_standby_temp,
            heater_active_to_standby_delay: tool.active_to_standby_delay(),
            heater_standby_to_powerdown_delay: tool.standby_to_powerdown_delay(),
            params: tool.params.clone(),
        }
    }

    pub fn changer_status(&self, id: ChangerId) -> ChangerStatus {
        let changer = &self.changers[id.0];
        ChangerStatus {
            name: changer.name.clone(),
            parent_tool: changer.parent_tool.map(|t| self.tools[t.0].name.clone()),
            selected_tool: self.ref_name(changer.selected).to_string(),
            state: changer.state.changer_label().to_string(),
            tools: changer.tools.keys().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use toolmux_common::ConfigSection;

    fn tree_with_nested_changers() -> (ToolTree, ToolId, ToolId) {
        let mut tree = ToolTree::new();
        let tc1 = EntityConfig::from_section(&ConfigSection::new("tc1")).unwrap();
        tree.add_toolchanger(&tc1).unwrap();
        let a = EntityConfig::from_section(
            &ConfigSection::new("a").with("toolchanger", "tc1"),
        )
        .unwrap();
        let a = tree.add_tool(&a).unwrap();
        let tc2 = EntityConfig::from_section(
            &ConfigSection::new("tc2").with("parent_tool", "a"),
        )
        .unwrap();
        let tc2 = tree.add_toolchanger(&tc2).unwrap();
        tree.changer_mut(tc2).parent_tool = Some(a);
        let b = EntityConfig::from_section(
            &ConfigSection::new("b").with("toolchanger", "tc2"),
        )
        .unwrap();
        let b = tree.add_tool(&b).unwrap();
        (tree, a, b)
    }

    #[test]
    fn state_propagates_to_changer() {
        let (mut tree, a, _) = tree_with_nested_changers();
        tree.set_tool_state(a, LifecycleState::Selected);
        let changer = tree.tool(a).changer;
        assert_eq!(tree.changer(changer).state, LifecycleState::Selected);
        assert_eq!(tree.changer(changer).selected, ToolRef::Tool(a));
        assert_eq!(tree.active(), ToolRef::None);

        tree.set_tool_state(a, LifecycleState::Active);
        assert_eq!(tree.active(), ToolRef::Tool(a));
    }

    #[test]
    fn propagation_can_be_disabled() {
        let (mut tree, a, _) = tree_with_nested_changers();
        tree.propagate_state = false;
        tree.set_tool_state(a, LifecycleState::Selected);
        let changer = tree.tool(a).changer;
        assert_eq!(tree.changer(changer).state, LifecycleState::NotConfigured);
        assert_eq!(tree.changer(changer).selected, ToolRef::None);
    }

    #[test]
    fn ancestor_chain_walks_to_root() {
        let (tree, a, b) = tree_with_nested_changers();
        let chain = tree.ancestor_chain(b, |_| true);
        assert_eq!(chain, vec![b, a]);
        let filtered = tree.ancestor_chain(b, |t| t.name == "a");
        assert_eq!(filtered, vec![a]);
    }

    #[test]
    fn reserved_names_rejected() {
        let mut tree = ToolTree::new();
        let tc = EntityConfig::from_section(&ConfigSection::new("tc")).unwrap();
        tree.add_toolchanger(&tc).unwrap();
        let bad = EntityConfig::from_section(&ConfigSection::new("Unknown")).unwrap();
        assert!(tree.add_tool(&bad).is_err());
    }

    #[test]
    fn duplicate_numbers_rejected() {
        let mut tree = ToolTree::new();
        let tc = EntityConfig::from_section(&ConfigSection::new("tc")).unwrap();
        tree.add_toolchanger(&tc).unwrap();
        let t0 =
            EntityConfig::from_section(&ConfigSection::new("t0").with("tool_number", "0"))
                .unwrap();
        tree.add_tool(&t0).unwrap();
        let other =
            EntityConfig::from_section(&ConfigSection::new("other").with("tool_number", "0"))
                .unwrap();
        assert!(tree.add_tool(&other).is_err());
    }

    #[test]
    fn topmost_heater_attribution_follows_shared_bindings() {
        let (mut tree, a, b) = tree_with_nested_changers();
        let bindings = vec![HeaterBinding::parse("t", "extruder").unwrap()];
        tree.tool_mut(a).inherit.heaters = Some(bindings.clone());
        tree.tool_mut(b).inherit.heaters = Some(bindings);
        assert_eq!(tree.topmost_tool_for_heater(b), a);

        // A differing binding breaks the shared chain.
        tree.tool_mut(a).inherit.heaters =
            Some(vec![HeaterBinding::parse("t", "other").unwrap()]);
        assert_eq!(tree.topmost_tool_for_heater(b), b);
    }
}
