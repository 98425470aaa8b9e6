//! Lifecycle state shared by tools and toolchangers.
//!
//! The ordering of the variants is load-bearing: configuration and selection
//! logic compares states with `>=`, so declaration order must follow the
//! conventional ranks returned by [`LifecycleState::rank`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[cfg(feature = "ecs")]
use bevy::prelude::Component;

use crate::error::ToolmuxError;

/// Lifecycle state of a tool or toolchanger.
///
/// Tools and toolchangers share one enumeration; the changer-side spellings
/// ENGAGING / DISENGAGING / ENGAGED are parse and display aliases for
/// [`Selecting`](Self::Selecting), [`Deselecting`](Self::Deselecting) and
/// [`Selected`](Self::Selected) at the same rank.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[cfg_attr(feature = "ecs", derive(Component))]
pub enum LifecycleState {
    /// Terminal failure. Sticky: never cleared automatically.
    Error,
    /// Constructed but not configured yet.
    #[default]
    NotConfigured,
    /// Inheritance resolution in progress. Guards against circular inheritance.
    Configuring,
    /// Configured but not initialized.
    Configured,
    /// Configured, awaiting initialization.
    Uninitialized,
    /// Initialization procedure running.
    Initializing,
    /// Initialized but not ready.
    Initialized,
    /// Ready for selection activity.
    Ready,
    /// A tool change involving this entity is underway.
    Changing,
    /// Select (tool) / engage (changer) procedure running.
    Selecting,
    /// Deselect (tool) / disengage (changer) procedure running.
    Deselecting,
    /// Mechanically mounted. Tools report SELECTED, changers ENGAGED.
    Selected,
    /// Selected and designated the process-wide active tool.
    Active,
}

impl LifecycleState {
    /// Conventional numeric rank, matching the values reported in status
    /// output. Monotonic with declaration order.
    pub fn rank(self) -> i8 {
        match self {
            LifecycleState::Error => -50,
            LifecycleState::NotConfigured => -12,
            LifecycleState::Configuring => -11,
            LifecycleState::Configured => -10,
            LifecycleState::Uninitialized => -2,
            LifecycleState::Initializing => -1,
            LifecycleState::Initialized => 0,
            LifecycleState::Ready => 1,
            LifecycleState::Changing => 2,
            LifecycleState::Selecting => 3,
            LifecycleState::Deselecting => 4,
            LifecycleState::Selected => 5,
            LifecycleState::Active => 10,
        }
    }

    /// Tool-side spelling, e.g. `SELECTING`.
    pub fn tool_label(self) -> &'static str {
        match self {
            LifecycleState::Error => "ERROR",
            LifecycleState::NotConfigured => "NOT_CONFIGURED",
            LifecycleState::Configuring => "CONFIGURING",
            LifecycleState::Configured => "CONFIGURED",
            LifecycleState::Uninitialized => "UNINITIALIZED",
            LifecycleState::Initializing => "INITIALIZING",
            LifecycleState::Initialized => "INITIALIZED",
            LifecycleState::Ready => "READY",
            LifecycleState::Changing => "CHANGING",
            LifecycleState::Selecting => "SELECTING",
            LifecycleState::Deselecting => "DESELECTING",
            LifecycleState::Selected => "SELECTED",
            LifecycleState::Active => "ACTIVE",
        }
    }

    /// Changer-side spelling, e.g. `ENGAGING`.
    pub fn changer_label(self) -> &'static str {
        match self {
            LifecycleState::Selecting => "ENGAGING",
            LifecycleState::Deselecting => "DISENGAGING",
            LifecycleState::Selected => "ENGAGED",
            other => other.tool_label(),
        }
    }

    /// All state names accepted by [`FromStr`], both spellings included.
    pub fn valid_names() -> &'static [&'static str] {
        &[
            "ERROR",
            "NOT_CONFIGURED",
            "CONFIGURING",
            "CONFIGURED",
            "UNINITIALIZED",
            "INITIALIZING",
            "INITIALIZED",
            "READY",
            "CHANGING",
            "SELECTING",
            "ENGAGING",
            "DESELECTING",
            "DISENGAGING",
            "SELECTED",
            "ENGAGED",
            "ACTIVE",
        ]
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tool_label())
    }
}

impl FromStr for LifecycleState {
    type Err = ToolmuxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ERROR" => Ok(LifecycleState::Error),
            "NOT_CONFIGURED" => Ok(LifecycleState::NotConfigured),
            "CONFIGURING" => Ok(LifecycleState::Configuring),
            "CONFIGURED" => Ok(LifecycleState::Configured),
            "UNINITIALIZED" => Ok(LifecycleState::Uninitialized),
            "INITIALIZING" => Ok(LifecycleState::Initializing),
            "INITIALIZED" => Ok(LifecycleState::Initialized),
            "READY" => Ok(LifecycleState::Ready),
            "CHANGING" => Ok(LifecycleState::Changing),
            "SELECTING" | "ENGAGING" => Ok(LifecycleState::Selecting),
            "DESELECTING" | "DISENGAGING" => Ok(LifecycleState::Deselecting),
            "SELECTED" | "ENGAGED" => Ok(LifecycleState::Selected),
            "ACTIVE" => Ok(LifecycleState::Active),
            other => Err(ToolmuxError::StateName(other.to_string())),
        }
    }
}
