//! Configuration intake for tools and toolchangers.
//!
//! File parsing and value typing belong to the host; the engine receives a
//! [`ConfigSection`] of raw key/value pairs per entity and turns it into a
//! typed [`EntityConfig`]. Unset options stay `None` so the inheritance
//! resolver can tell "not configured" apart from an explicit empty value.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ToolmuxError;
use crate::types::{AxisMask, FanBinding, HeaterBinding, ParamValue};
use crate::MIN_TIMER_DELAY;

/// One named configuration section: raw option strings keyed by option name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigSection {
    name: String,
    options: BTreeMap<String, String>,
}

impl ConfigSection {
    pub fn new(name: impl Into<String>) -> Self {
        ConfigSection {
            name: name.into(),
            options: BTreeMap::new(),
        }
    }

    /// Builder-style option setter.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    /// Options whose names start with `prefix`, in sorted order.
    pub fn prefix_options<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        self.options
            .iter()
            .filter(move |(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Typed configuration of one tool or toolchanger section.
///
/// All inheritable fields are `Option`: `None` means "unset, inherit from
/// the parent", which is distinct from an explicit empty value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityConfig {
    pub name: String,

    /// Tool number (tools only).
    pub number: Option<i32>,
    /// Owning toolchanger name (tools only; the default changer when unset).
    pub toolchanger: Option<String>,
    /// Parent tool name (nested toolchangers only).
    pub parent_tool: Option<String>,

    // Inheritable procedure hooks.
    pub engage_gcode: Option<String>,
    pub disengage_gcode: Option<String>,
    pub init_gcode: Option<String>,
    pub tool_select_gcode: Option<String>,
    pub tool_deselect_gcode: Option<String>,

    // Inheritable bindings and parameters.
    pub heaters: Option<Vec<HeaterBinding>>,
    pub fans: Option<Vec<FanBinding>>,
    pub offset: Option<[f64; 3]>,
    pub requires_axis_homed: Option<AxisMask>,
    pub heater_active_to_standby_delay: Option<f64>,
    pub heater_standby_to_powerdown_delay: Option<f64>,
    pub force_deselect_when_parent_deselects: Option<bool>,
    pub parent_must_be_selected_on_deselect: Option<bool>,

    /// User-defined typed parameters (`params_*` options).
    pub params: BTreeMap<String, ParamValue>,

    /// One-time seed values (`init_offset`, `init_global_offset`). These are
    /// persisted at configure time and then abort startup so the operator
    /// removes them from the configuration.
    pub init_offsets: BTreeMap<String, [f64; 3]>,
}

impl EntityConfig {
    /// Parses a raw section into a typed config, validating every
    /// recognized option.
    pub fn from_section(section: &ConfigSection) -> Result<EntityConfig, ToolmuxError> {
        let name = section.name().to_string();
        let mut cfg = EntityConfig {
            name: name.clone(),
            ..EntityConfig::default()
        };

        cfg.number = match section.get("tool_number") {
            Some(raw) => Some(raw.trim().parse::<i32>().map_err(|_| {
                ToolmuxError::config(&name, format!("invalid tool_number: {raw}"))
            })?),
            None => None,
        };
        cfg.toolchanger = section.get("toolchanger").map(|s| s.trim().to_string());
        cfg.parent_tool = section.get("parent_tool").map(|s| s.trim().to_string());

        cfg.engage_gcode = section.get("engage_gcode").map(str::to_string);
        cfg.disengage_gcode = section.get("disengage_gcode").map(str::to_string);
        cfg.init_gcode = section.get("init_gcode").map(str::to_string);
        cfg.tool_select_gcode = section.get("tool_select_gcode").map(str::to_string);
        cfg.tool_deselect_gcode = section.get("tool_deselect_gcode").map(str::to_string);

        cfg.heaters = match section.get("heater") {
            Some(spec) => Some(HeaterBinding::parse_spec(&name, spec)?),
            None => None,
        };
        cfg.fans = match section.get("fans") {
            Some(spec) => Some(FanBinding::parse_spec(&name, spec)?),
            None => None,
        };
        cfg.offset = match section.get("offset") {
            Some(raw) => Some(parse_offset(&name, "offset", raw)?),
            None => None,
        };
        cfg.requires_axis_homed = section.get("requires_axis_homed").map(AxisMask::parse);

        cfg.heater_active_to_standby_delay =
            parse_delay(&name, section, "heater_active_to_standby_delay")?;
        cfg.heater_standby_to_powerdown_delay =
            parse_delay(&name, section, "heater_standby_to_powerdown_delay")?;

        cfg.force_deselect_when_parent_deselects =
            parse_bool(&name, section, "force_deselect_when_parent_deselects")?;
        cfg.parent_must_be_selected_on_deselect =
            parse_bool(&name, section, "parent_must_be_selected_on_deselect")?;

        for (key, value) in section.prefix_options("params_") {
            cfg.params.insert(key.to_string(), ParamValue::infer(value));
        }

        for (key, value) in section.prefix_options("init_") {
            if !key.contains("offset") {
                continue;
            }
            if key != "init_offset" && key != "init_global_offset" {
                return Err(ToolmuxError::config(
                    &name,
                    format!("invalid initializing option name {key}"),
                ));
            }
            let seed = parse_offset(&name, key, value)?;
            cfg.init_offsets
                .insert(key.trim_start_matches("init_").to_string(), seed);
        }

        Ok(cfg)
    }
}

fn parse_offset(entity: &str, key: &str, raw: &str) -> Result<[f64; 3], ToolmuxError> {
    let parts: Vec<f64> = raw
        .split(',')
        .map(|p| p.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .map_err(|_| ToolmuxError::config(entity, format!("invalid {key}: {raw}")))?;
    if parts.len() != 3 {
        return Err(ToolmuxError::config(
            entity,
            format!("{key} must be a list of 3 floats"),
        ));
    }
    Ok([parts[0], parts[1], parts[2]])
}

fn parse_delay(
    entity: &str,
    section: &ConfigSection,
    key: &str,
) -> Result<Option<f64>, ToolmuxError> {
    let Some(raw) = section.get(key) else {
        return Ok(None);
    };
    let v = raw
        .trim()
        .parse::<f64>()
        .map_err(|_| ToolmuxError::config(entity, format!("invalid {key}: {raw}")))?;
    if v != 0.0 && v < MIN_TIMER_DELAY {
        return Err(ToolmuxError::config(
            entity,
            format!("{key} must be 0 or at least {MIN_TIMER_DELAY} seconds"),
        ));
    }
    Ok(Some(v))
}

fn parse_bool(
    entity: &str,
    section: &ConfigSection,
    key: &str,
) -> Result<Option<bool>, ToolmuxError> {
    let Some(raw) = section.get(key) else {
        return Ok(None);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(Some(true)),
        "false" | "0" | "no" => Ok(Some(false)),
        other => Err(ToolmuxError::config(
            entity,
            format!("invalid boolean for {key}: {other}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_tool_section() {
        let section = ConfigSection::new("tool t0")
            .with("tool_number", "0")
            .with("toolchanger", "main")
            .with("tool_select_gcode", "PICKUP_T0")
            .with("heater", "extruder:2:300")
            .with("fans", "part_fan:0.8")
            .with("offset", "0.1, -0.2, 0.3")
            .with("requires_axis_homed", "XY")
            .with("heater_active_to_standby_delay", "5")
            .with("force_deselect_when_parent_deselects", "false")
            .with("params_purge_volume", "12.5")
            .with("params_meltzone", "10, 20");

        let cfg = EntityConfig::from_section(&section).unwrap();
        assert_eq!(cfg.number, Some(0));
        assert_eq!(cfg.toolchanger.as_deref(), Some("main"));
        assert_eq!(cfg.heaters.as_ref().unwrap()[0].heater, "extruder");
        assert_eq!(cfg.fans.as_ref().unwrap()[0].scale, 0.8);
        assert_eq!(cfg.offset, Some([0.1, -0.2, 0.3]));
        assert_eq!(cfg.requires_axis_homed, Some(AxisMask::parse("XY")));
        assert_eq!(cfg.heater_active_to_standby_delay, Some(5.0));
        assert_eq!(cfg.force_deselect_when_parent_deselects, Some(false));
        assert_eq!(
            cfg.params.get("params_purge_volume"),
            Some(&ParamValue::Float(12.5))
        );
        assert_eq!(
            cfg.params.get("params_meltzone"),
            Some(&ParamValue::IntList(vec![10, 20]))
        );
        // Unset inheritables stay unset.
        assert!(cfg.tool_deselect_gcode.is_none());
        assert!(cfg.parent_must_be_selected_on_deselect.is_none());
    }

    #[test]
    fn init_offset_seed_is_captured() {
        let section = ConfigSection::new("tool t1").with("init_offset", "1,2,3");
        let cfg = EntityConfig::from_section(&section).unwrap();
        assert_eq!(cfg.init_offsets.get("offset"), Some(&[1.0, 2.0, 3.0]));
    }

    #[test]
    fn bad_offset_rejected() {
        let section = ConfigSection::new("tool t1").with("offset", "1,2");
        assert!(EntityConfig::from_section(&section).is_err());
    }

    #[test]
    fn delay_below_minimum_rejected() {
        let section =
            ConfigSection::new("tool t1").with("heater_standby_to_powerdown_delay", "0.01");
        assert!(EntityConfig::from_section(&section).is_err());
        let ok = ConfigSection::new("tool t1").with("heater_standby_to_powerdown_delay", "0");
        assert_eq!(
            EntityConfig::from_section(&ok)
                .unwrap()
                .heater_standby_to_powerdown_delay,
            Some(0.0)
        );
    }
}
