//! Handles, sentinel references, bindings and typed user parameters.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[cfg(feature = "ecs")]
use bevy::prelude::Component;

use crate::error::ToolmuxError;

/// Arena index of a tool inside the tool tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ToolId(pub usize);

/// Arena index of a toolchanger inside the tool tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChangerId(pub usize);

/// Sentinel-aware tool reference.
///
/// The reserved "none" and "unknown" tools are plain enum variants compared
/// by value; they never appear in the arena and are excluded from traversal,
/// inheritance and persistence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ecs", derive(Component))]
pub enum ToolRef {
    /// No tool mounted.
    #[default]
    None,
    /// Indeterminate or unsafe mounted state.
    Unknown,
    /// A real tool in the arena.
    Tool(ToolId),
}

impl ToolRef {
    /// Reserved number reported for the "none" sentinel.
    pub const NONE_NUMBER: i32 = -1;
    /// Reserved number reported for the "unknown" sentinel.
    pub const UNKNOWN_NUMBER: i32 = -2;

    /// Returns the arena index if this references a real tool.
    pub fn tool(self) -> Option<ToolId> {
        match self {
            ToolRef::Tool(id) => Some(id),
            _ => None,
        }
    }

    pub fn is_none(self) -> bool {
        matches!(self, ToolRef::None)
    }

    pub fn is_unknown(self) -> bool {
        matches!(self, ToolRef::Unknown)
    }
}

/// Entity kind, used to build persistence keys and status output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Tool,
    Toolchanger,
    /// The process root that holds global defaults.
    Root,
}

impl EntityKind {
    fn prefix(self) -> &'static str {
        match self {
            EntityKind::Tool => "tool",
            EntityKind::Toolchanger => "toolchanger",
            EntityKind::Root => "toolmux",
        }
    }
}

/// Key of a persistent record: entity kind plus lowercased entity name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub kind: EntityKind,
    pub name: String,
}

impl EntityKey {
    pub fn new(kind: EntityKind, name: &str) -> Self {
        EntityKey {
            kind,
            name: name.to_lowercase(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            // The root record is keyed by the process-level name alone.
            EntityKind::Root => f.write_str(&self.name),
            kind => write!(f, "{}_{}", kind.prefix(), self.name),
        }
    }
}

/// Which axes must be homed before a tool may be selected or deselected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AxisMask {
    pub x: bool,
    pub y: bool,
    pub z: bool,
}

impl AxisMask {
    pub const NONE: AxisMask = AxisMask { x: false, y: false, z: false };
    pub const XYZ: AxisMask = AxisMask { x: true, y: true, z: true };

    /// Parses a mask from a string, ignoring any characters other than
    /// `X`, `Y`, `Z` (case-insensitive).
    pub fn parse(s: &str) -> AxisMask {
        let upper = s.to_ascii_uppercase();
        AxisMask {
            x: upper.contains('X'),
            y: upper.contains('Y'),
            z: upper.contains('Z'),
        }
    }

    pub fn is_empty(self) -> bool {
        !(self.x || self.y || self.z)
    }
}

impl fmt::Display for AxisMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.x {
            f.write_str("X")?;
        }
        if self.y {
            f.write_str("Y")?;
        }
        if self.z {
            f.write_str("Z")?;
        }
        Ok(())
    }
}

/// Power state of a heater.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ecs", derive(Component))]
pub enum HeaterPowerState {
    #[default]
    Off,
    /// Holding at reduced temperature between active use and powerdown.
    Standby,
    Active,
}

impl fmt::Display for HeaterPowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HeaterPowerState::Off => "off",
            HeaterPowerState::Standby => "standby",
            HeaterPowerState::Active => "active",
        })
    }
}

/// How much of the saved position to restore after a tool change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestoreMode {
    /// Restore XY only.
    Xy,
    /// Restore the full XYZ position.
    Xyz,
}

impl FromStr for RestoreMode {
    type Err = ToolmuxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "1" | "XY" => Ok(RestoreMode::Xy),
            "2" | "XYZ" => Ok(RestoreMode::Xyz),
            other => Err(ToolmuxError::config(
                "restore_mode",
                format!("invalid restore position type: {other}"),
            )),
        }
    }
}

/// A typed user-defined parameter, inferred from its literal syntax.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    IntList(Vec<i64>),
    FloatList(Vec<f64>),
    Str(String),
}

impl ParamValue {
    /// Infers the parameter type from its literal syntax: `true`/`false`,
    /// integer, float, comma-separated integer or float lists, quoted
    /// strings, or a bare string as the fallback.
    pub fn infer(raw: &str) -> ParamValue {
        let v = raw.trim();
        match v.to_ascii_lowercase().as_str() {
            "true" => return ParamValue::Bool(true),
            "false" => return ParamValue::Bool(false),
            _ => {}
        }
        if let Ok(i) = v.parse::<i64>() {
            return ParamValue::Int(i);
        }
        if let Ok(f) = v.parse::<f64>() {
            return ParamValue::Float(f);
        }
        if v.contains(',') {
            let parts: Vec<&str> = v.split(',').map(str::trim).collect();
            if let Ok(ints) = parts.iter().map(|p| p.parse::<i64>()).collect::<Result<Vec<_>, _>>()
            {
                return ParamValue::IntList(ints);
            }
            if let Ok(floats) =
                parts.iter().map(|p| p.parse::<f64>()).collect::<Result<Vec<_>, _>>()
            {
                return ParamValue::FloatList(floats);
            }
        }
        let unquoted = v
            .strip_prefix('"')
            .and_then(|s| s.strip_suffix('"'))
            .or_else(|| v.strip_prefix('\'').and_then(|s| s.strip_suffix('\'')))
            .unwrap_or(v);
        ParamValue::Str(unquoted.to_string())
    }
}

/// A tool's binding to a named heater.
///
/// One binding per line in the `heater` config option:
/// `name[!temp_offset][:active_to_standby_delay[:standby_to_powerdown_delay]]`.
/// The temperature offset is added to every commanded temperature; the delay
/// fields override the tool's inherited timer durations for this heater.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaterBinding {
    pub heater: String,
    /// Added to active/standby temperatures commanded through this binding.
    pub temp_offset: f64,
    pub active_to_standby_delay: Option<f64>,
    pub standby_to_powerdown_delay: Option<f64>,
}

impl HeaterBinding {
    /// Parses a single binding line. Whitespace is insignificant.
    pub fn parse(entity: &str, line: &str) -> Result<HeaterBinding, ToolmuxError> {
        let compact: String = line.chars().filter(|c| !c.is_whitespace()).collect();
        let mut fields = compact.split(':');
        let head = fields.next().unwrap_or("");
        if head.is_empty() {
            return Err(ToolmuxError::config(entity, "empty heater binding"));
        }
        let (name, temp_offset) = match head.split_once('!') {
            Some((name, off)) => {
                let off = off.parse::<f64>().map_err(|_| {
                    ToolmuxError::config(
                        entity,
                        format!("invalid heater temperature offset in '{line}'"),
                    )
                })?;
                (name, off)
            }
            None => (head, 0.0),
        };
        if name.is_empty() {
            return Err(ToolmuxError::config(entity, "heater binding has no name"));
        }
        let mut parse_delay = |field: Option<&str>| -> Result<Option<f64>, ToolmuxError> {
            match field {
                None | Some("") => Ok(None),
                Some(raw) => {
                    let v = raw.parse::<f64>().map_err(|_| {
                        ToolmuxError::config(
                            entity,
                            format!("invalid heater delay in '{line}'"),
                        )
                    })?;
                    if v != 0.0 && v < crate::MIN_TIMER_DELAY {
                        return Err(ToolmuxError::config(
                            entity,
                            format!(
                                "heater delay must be 0 or at least {} seconds",
                                crate::MIN_TIMER_DELAY
                            ),
                        ));
                    }
                    Ok(Some(v))
                }
            }
        };
        let active_to_standby_delay = parse_delay(fields.next())?;
        let standby_to_powerdown_delay = parse_delay(fields.next())?;
        if fields.next().is_some() {
            return Err(ToolmuxError::config(
                entity,
                format!("too many fields in heater binding '{line}'"),
            ));
        }
        Ok(HeaterBinding {
            heater: name.to_string(),
            temp_offset,
            active_to_standby_delay,
            standby_to_powerdown_delay,
        })
    }

    /// Parses the newline-separated `heater` option into bindings.
    pub fn parse_spec(entity: &str, spec: &str) -> Result<Vec<HeaterBinding>, ToolmuxError> {
        spec.lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|l| HeaterBinding::parse(entity, l))
            .collect()
    }

    /// True when two bindings target the same heater identically. Used for
    /// topmost-ancestor attribution of shared heaters.
    pub fn same_heater(&self, other: &HeaterBinding) -> bool {
        self.heater == other.heater
    }
}

/// A tool's binding to a named part fan with a speed scaling factor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanBinding {
    pub fan: String,
    /// Multiplied into the restored fan speed; in [0, 1].
    pub scale: f64,
}

impl FanBinding {
    /// Parses the comma-separated `fans` option. Each entry is `name` or
    /// `name:scale` with scale in [0, 1] (default 1.0).
    pub fn parse_spec(entity: &str, spec: &str) -> Result<Vec<FanBinding>, ToolmuxError> {
        let compact: String = spec.chars().filter(|c| !c.is_whitespace()).collect();
        if compact.is_empty() {
            return Ok(Vec::new());
        }
        compact
            .split(',')
            .map(|entry| {
                let (name, scale) = match entry.split_once(':') {
                    Some((name, raw)) => {
                        let scale = raw.parse::<f64>().map_err(|_| {
                            ToolmuxError::config(
                                entity,
                                format!(
                                    "invalid fan speed scaling for {name}: \
                                     fan speed must be a float between 0 and 1"
                                ),
                            )
                        })?;
                        (name, scale)
                    }
                    None => (entry, 1.0),
                };
                if name.is_empty() {
                    return Err(ToolmuxError::config(entity, "fan binding has no name"));
                }
                if !(0.0..=1.0).contains(&scale) {
                    return Err(ToolmuxError::config(
                        entity,
                        format!(
                            "invalid fan speed scaling for {name}: \
                             fan speed must be a float between 0 and 1"
                        ),
                    ));
                }
                Ok(FanBinding { fan: name.to_string(), scale })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_literal_inference() {
        assert_eq!(ParamValue::infer("true"), ParamValue::Bool(true));
        assert_eq!(ParamValue::infer("-3"), ParamValue::Int(-3));
        assert_eq!(ParamValue::infer("2.5"), ParamValue::Float(2.5));
        assert_eq!(ParamValue::infer("1, 2, 3"), ParamValue::IntList(vec![1, 2, 3]));
        assert_eq!(
            ParamValue::infer("1.5, 2.0"),
            ParamValue::FloatList(vec![1.5, 2.0])
        );
        assert_eq!(
            ParamValue::infer("\"quoted\""),
            ParamValue::Str("quoted".to_string())
        );
        assert_eq!(ParamValue::infer("bare"), ParamValue::Str("bare".to_string()));
    }

    #[test]
    fn axis_mask_parse_ignores_noise() {
        let mask = AxisMask::parse("xz, please");
        assert!(mask.x && !mask.y && mask.z);
        assert_eq!(mask.to_string(), "XZ");
        assert_eq!(AxisMask::parse(""), AxisMask::NONE);
    }

    #[test]
    fn heater_binding_full_form() {
        let b = HeaterBinding::parse("tool t0", "extruder!5:1.5:300").unwrap();
        assert_eq!(b.heater, "extruder");
        assert_eq!(b.temp_offset, 5.0);
        assert_eq!(b.active_to_standby_delay, Some(1.5));
        assert_eq!(b.standby_to_powerdown_delay, Some(300.0));
    }

    #[test]
    fn heater_binding_name_only() {
        let b = HeaterBinding::parse("tool t0", "extruder").unwrap();
        assert_eq!(b.heater, "extruder");
        assert_eq!(b.temp_offset, 0.0);
        assert_eq!(b.active_to_standby_delay, None);
    }

    #[test]
    fn heater_spec_multi_line() {
        let spec = "extruder\n\nchamber:0:900\n";
        let bindings = HeaterBinding::parse_spec("tool t0", spec).unwrap();
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[1].heater, "chamber");
        assert_eq!(bindings[1].active_to_standby_delay, Some(0.0));
    }

    #[test]
    fn heater_delay_below_minimum_rejected() {
        assert!(HeaterBinding::parse("tool t0", "e:0.05").is_err());
    }

    #[test]
    fn fan_spec_parse() {
        let fans = FanBinding::parse_spec("tool t0", "part_fan, aux_fan: 0.5").unwrap();
        assert_eq!(fans.len(), 2);
        assert_eq!(fans[0].scale, 1.0);
        assert_eq!(fans[1].fan, "aux_fan");
        assert_eq!(fans[1].scale, 0.5);
    }

    #[test]
    fn fan_scale_out_of_range_rejected() {
        assert!(FanBinding::parse_spec("tool t0", "fan:1.5").is_err());
        assert!(FanBinding::parse_spec("tool t0", "fan:nope").is_err());
    }

    #[test]
    fn entity_key_lowercases() {
        let key = EntityKey::new(EntityKind::Tool, "T0_Laser");
        assert_eq!(key.to_string(), "tool_t0_laser");
    }

    #[test]
    fn root_key_is_the_process_name_alone() {
        let key = EntityKey::new(EntityKind::Root, "Toolmux");
        assert_eq!(key.to_string(), "toolmux");
    }
}
