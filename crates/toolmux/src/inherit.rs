//! Configuration-time parameter inheritance.
//!
//! Runs once per entity, after all entities are constructed and before any
//! selection activity. Resolution is parent-first: a tool inherits from its
//! toolchanger, a toolchanger from its parent tool if nested or else from
//! the process root, and the root falls back to hard-coded defaults. The
//! Configuring state doubles as the re-entrancy guard: hitting an entity
//! already in Configuring means the parent links form a cycle.

use serde_json::json;
use tracing::{debug, info};

use toolmux_common::{LifecycleState, ToolmuxError};

use crate::heaters::HeaterBank;
use crate::traits::PersistentStore;
use crate::tree::{NodeId, ToolTree};

/// Resolves parent-tool links, seeds, persisted offsets and inherited
/// parameters for every entity in the tree. Leaves each entity in
/// Configured state.
pub fn configure(
    tree: &mut ToolTree,
    bank: &mut HeaterBank,
    store: &mut dyn PersistentStore,
) -> Result<(), ToolmuxError> {
    link_parent_tools(tree)?;

    resolve(tree, bank, store, NodeId::Root)?;
    let changers: Vec<NodeId> = tree.changer_ids().map(NodeId::Changer).collect();
    for node in changers {
        resolve(tree, bank, store, node)?;
    }
    let tools: Vec<NodeId> = tree.tool_ids().map(NodeId::Tool).collect();
    for node in tools {
        resolve(tree, bank, store, node)?;
    }
    info!("configuration resolved for all tools and toolchangers");
    Ok(())
}

/// Resolves the configured parent-tool names of nested changers to handles.
fn link_parent_tools(tree: &mut ToolTree) -> Result<(), ToolmuxError> {
    let links: Vec<(usize, String)> = tree
        .changer_ids()
        .filter_map(|id| {
            tree.changer(id)
                .parent_tool_name
                .clone()
                .map(|name| (id.0, name))
        })
        .collect();
    for (idx, name) in links {
        let parent = tree.tool_by_name(&name).ok_or_else(|| {
            ToolmuxError::config(
                tree.changer(toolmux_common::ChangerId(idx)).name.clone(),
                format!("unknown parent tool: {name}"),
            )
        })?;
        tree.changer_mut(toolmux_common::ChangerId(idx)).parent_tool = Some(parent);
    }
    Ok(())
}

fn resolve(
    tree: &mut ToolTree,
    bank: &mut HeaterBank,
    store: &mut dyn PersistentStore,
    node: NodeId,
) -> Result<(), ToolmuxError> {
    if tree.node_state(node) >= LifecycleState::Configured {
        return Ok(());
    }
    if tree.node_state(node) == LifecycleState::Configuring {
        return Err(ToolmuxError::CircularInheritance(
            tree.node_name(node).to_string(),
        ));
    }

    persist_init_seeds(tree, store, node)?;

    tree.set_node_state(node, LifecycleState::Configuring);

    if let Some(parent) = tree.parent_of(node) {
        resolve(tree, bank, store, parent)?;

        // Load the persisted offset before inheriting, so a stored value
        // takes precedence over the parent's.
        load_persisted_offset(tree, store, node);

        let parent_inherit = tree.node_inherit(parent).clone();
        tree.node_inherit_mut(node).fill_from(&parent_inherit);
        merge_params(tree, node, parent);
    } else {
        load_persisted_offset(tree, store, node);
        tree.node_inherit_mut(node).fill_defaults();
    }

    if let NodeId::Tool(id) = node {
        for binding in tree.tool(id).heater_bindings().to_vec() {
            bank.ensure(&binding.heater);
        }
    }

    tree.set_node_state(node, LifecycleState::Configured);
    debug!(entity = tree.node_name(node), "configured");
    Ok(())
}

/// `init_offset` / `init_global_offset` seeds are written to the persistent
/// store once, then startup aborts so the operator removes them from the
/// configuration.
fn persist_init_seeds(
    tree: &mut ToolTree,
    store: &mut dyn PersistentStore,
    node: NodeId,
) -> Result<(), ToolmuxError> {
    let (name, key, seeds) = match node {
        NodeId::Root => (
            tree.root.name.clone(),
            tree.root.persistence_key(),
            tree.root.init_offsets.clone(),
        ),
        NodeId::Tool(id) => {
            let tool = tree.tool(id);
            (tool.name.clone(), tool.persistence_key(), tool.init_offsets.clone())
        }
        NodeId::Changer(id) => {
            let changer = tree.changer(id);
            (
                changer.name.clone(),
                changer.persistence_key(),
                changer.init_offsets.clone(),
            )
        }
    };
    if seeds.is_empty() {
        return Ok(());
    }
    if seeds.contains_key("global_offset") && node != NodeId::Root {
        return Err(ToolmuxError::config(
            &name,
            "init_global_offset is only valid for the process root",
        ));
    }
    for (field, value) in &seeds {
        store.set(&key, field, json!(value));
    }
    let saved: Vec<String> = seeds
        .iter()
        .map(|(field, value)| format!("init_{field} as {value:?}"))
        .collect();
    Err(ToolmuxError::config(
        &name,
        format!(
            "successfully saved {}; remove the settings from the configuration \
             and restart to continue",
            saved.join(", ")
        ),
    ))
}

fn load_persisted_offset(tree: &mut ToolTree, store: &mut dyn PersistentStore, node: NodeId) {
    let key = match node {
        NodeId::Root => tree.root.persistence_key(),
        NodeId::Tool(id) => tree.tool(id).persistence_key(),
        NodeId::Changer(id) => tree.changer(id).persistence_key(),
    };
    let record = store.get(&key);
    if node == NodeId::Root {
        if let Some(offset) = record.get("global_offset").and_then(as_offset) {
            tree.root.global_offset = offset;
        }
        return;
    }
    if let Some(offset) = record.get("offset").and_then(as_offset) {
        tree.node_inherit_mut(node).offset = Some(offset);
    }
}

fn as_offset(value: &serde_json::Value) -> Option<[f64; 3]> {
    let list = value.as_array()?;
    if list.len() != 3 {
        return None;
    }
    Some([
        list[0].as_f64()?,
        list[1].as_f64()?,
        list[2].as_f64()?,
    ])
}

/// User-defined parameters merge parent→child without overwriting keys the
/// child defined itself.
fn merge_params(tree: &mut ToolTree, node: NodeId, parent: NodeId) {
    let parent_params = match parent {
        NodeId::Root => tree.root.params.clone(),
        NodeId::Tool(id) => tree.tool(id).params.clone(),
        NodeId::Changer(id) => tree.changer(id).params.clone(),
    };
    let params = match node {
        NodeId::Root => return,
        NodeId::Tool(id) => &mut tree.tool_mut(id).params,
        NodeId::Changer(id) => &mut tree.changer_mut(id).params,
    };
    for (key, value) in parent_params {
        params.entry(key).or_insert(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::MemoryStore;
    use toolmux_common::{AxisMask, ConfigSection, EntityConfig, EntityKey, EntityKind, ParamValue};

    fn cfg(section: ConfigSection) -> EntityConfig {
        EntityConfig::from_section(&section).unwrap()
    }

    #[test]
    fn unset_fields_inherit_and_explicit_values_stick() {
        let mut tree = ToolTree::new();
        tree.add_toolchanger(&cfg(
            ConfigSection::new("tc")
                .with("tool_select_gcode", "CHANGER_PICKUP")
                .with("requires_axis_homed", "XY")
                .with("params_family", "omg"),
        ))
        .unwrap();
        let t = tree
            .add_tool(&cfg(
                ConfigSection::new("t0")
                    .with("requires_axis_homed", "Z")
                    .with("params_purge", "7"),
            ))
            .unwrap();

        let mut bank = HeaterBank::new();
        let mut store = MemoryStore::new();
        configure(&mut tree, &mut bank, &mut store).unwrap();

        let tool = tree.tool(t);
        // Unset: copied from the changer.
        assert_eq!(tool.inherit.tool_select_gcode.as_deref(), Some("CHANGER_PICKUP"));
        // Explicit: kept despite the parent's value.
        assert_eq!(tool.requires_axis_homed(), AxisMask::parse("Z"));
        // Root defaults reach entities through the chain.
        assert_eq!(tool.force_deselect_when_parent_deselects(), true);
        assert_eq!(tool.standby_to_powerdown_delay(), 600.0);
        // Params merge without overwriting.
        assert_eq!(
            tool.params.get("params_family"),
            Some(&ParamValue::Str("omg".to_string()))
        );
        assert_eq!(tool.params.get("params_purge"), Some(&ParamValue::Int(7)));
        assert_eq!(tool.state, LifecycleState::Configured);
    }

    #[test]
    fn root_section_params_flow_to_all_entities() {
        let mut tree = ToolTree::new();
        tree.configure_root(&cfg(ConfigSection::new("root").with("params_safe_z", "4.2")));
        tree.add_toolchanger(&cfg(ConfigSection::new("tc"))).unwrap();
        let t = tree.add_tool(&cfg(ConfigSection::new("t0"))).unwrap();

        let mut bank = HeaterBank::new();
        let mut store = MemoryStore::new();
        configure(&mut tree, &mut bank, &mut store).unwrap();
        assert_eq!(
            tree.tool(t).params.get("params_safe_z"),
            Some(&ParamValue::Float(4.2))
        );
    }

    #[test]
    fn circular_nesting_is_detected() {
        let mut tree = ToolTree::new();
        tree.add_toolchanger(&cfg(ConfigSection::new("tc").with("parent_tool", "t0")))
            .unwrap();
        tree.add_tool(&cfg(ConfigSection::new("t0").with("toolchanger", "tc")))
            .unwrap();

        let mut bank = HeaterBank::new();
        let mut store = MemoryStore::new();
        let err = configure(&mut tree, &mut bank, &mut store).unwrap_err();
        assert!(matches!(err, ToolmuxError::CircularInheritance(_)));
    }

    #[test]
    fn init_offset_persists_then_aborts() {
        let mut tree = ToolTree::new();
        tree.add_toolchanger(&cfg(ConfigSection::new("tc"))).unwrap();
        tree.add_tool(&cfg(ConfigSection::new("t0").with("init_offset", "1,2,3")))
            .unwrap();

        let mut bank = HeaterBank::new();
        let mut store = MemoryStore::new();
        let err = configure(&mut tree, &mut bank, &mut store).unwrap_err();
        assert!(matches!(err, ToolmuxError::Configuration { .. }));

        let record = store.get(&EntityKey::new(EntityKind::Tool, "t0"));
        assert_eq!(record.get("offset"), Some(&json!([1.0, 2.0, 3.0])));
    }

    #[test]
    fn every_init_seed_persists_before_the_abort() {
        let mut tree = ToolTree::new();
        tree.configure_root(&cfg(
            ConfigSection::new("root")
                .with("init_offset", "1,1,1")
                .with("init_global_offset", "2,2,2"),
        ));
        tree.add_toolchanger(&cfg(ConfigSection::new("tc"))).unwrap();

        let mut bank = HeaterBank::new();
        let mut store = MemoryStore::new();
        let err = configure(&mut tree, &mut bank, &mut store).unwrap_err();
        assert!(matches!(err, ToolmuxError::Configuration { .. }));

        // One restart cycle is enough to clear both seeds.
        let record = store.get(&EntityKey::new(EntityKind::Root, "toolmux"));
        assert_eq!(record.get("offset"), Some(&json!([1.0, 1.0, 1.0])));
        assert_eq!(record.get("global_offset"), Some(&json!([2.0, 2.0, 2.0])));
    }

    #[test]
    fn global_offset_seed_is_root_only() {
        let mut tree = ToolTree::new();
        tree.add_toolchanger(&cfg(ConfigSection::new("tc"))).unwrap();
        tree.add_tool(&cfg(ConfigSection::new("t0").with("init_global_offset", "2,2,2")))
            .unwrap();

        let mut bank = HeaterBank::new();
        let mut store = MemoryStore::new();
        let err = configure(&mut tree, &mut bank, &mut store).unwrap_err();
        assert!(matches!(err, ToolmuxError::Configuration { .. }));
        // Nothing is persisted for the rejected seed.
        assert!(store.get(&EntityKey::new(EntityKind::Tool, "t0")).is_empty());
    }

    #[test]
    fn persisted_offset_wins_over_inherited() {
        let mut tree = ToolTree::new();
        tree.add_toolchanger(&cfg(ConfigSection::new("tc").with("offset", "9,9,9")))
            .unwrap();
        let t = tree.add_tool(&cfg(ConfigSection::new("t0"))).unwrap();

        let mut bank = HeaterBank::new();
        let mut store = MemoryStore::new();
        store.set(
            &EntityKey::new(EntityKind::Tool, "t0"),
            "offset",
            json!([0.5, 0.0, -0.25]),
        );
        configure(&mut tree, &mut bank, &mut store).unwrap();
        assert_eq!(tree.tool(t).offset(), [0.5, 0.0, -0.25]);
    }

    #[test]
    fn tool_heaters_register_lazily_and_share_by_name() {
        let mut tree = ToolTree::new();
        tree.add_toolchanger(&cfg(ConfigSection::new("tc"))).unwrap();
        tree.add_tool(&cfg(ConfigSection::new("t0").with("heater", "extruder")))
            .unwrap();
        tree.add_tool(&cfg(ConfigSection::new("t1").with("heater", "extruder")))
            .unwrap();

        let mut bank = HeaterBank::new();
        let mut store = MemoryStore::new();
        configure(&mut tree, &mut bank, &mut store).unwrap();
        assert!(bank.heater("extruder").is_some());
    }

    #[test]
    fn reconfigure_is_idempotent() {
        let mut tree = ToolTree::new();
        tree.add_toolchanger(&cfg(ConfigSection::new("tc"))).unwrap();
        tree.add_tool(&cfg(ConfigSection::new("t0"))).unwrap();

        let mut bank = HeaterBank::new();
        let mut store = MemoryStore::new();
        configure(&mut tree, &mut bank, &mut store).unwrap();
        // A second pass is a no-op thanks to the Configured gate.
        configure(&mut tree, &mut bank, &mut store).unwrap();
    }
}
