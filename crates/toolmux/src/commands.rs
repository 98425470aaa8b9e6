//! The text-command surface, as typed request/response pairs.
//!
//! Hosts parse their own command syntax and dispatch the resulting requests
//! here. Procedures report completion through [`SetStateRequest`] using the
//! same state names the status queries emit.

use serde::{Deserialize, Serialize};

use toolmux_common::{LifecycleState, RestoreMode, ToolId, ToolmuxError};

use crate::coordinator::{Coordinator, CoordinatorStatus};
use crate::tree::{ChangerStatus, ToolStatus};

/// Tool addressed by name or by configured number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToolKey {
    Name(String),
    Number(i32),
}

impl ToolKey {
    fn describe(&self) -> String {
        match self {
            ToolKey::Name(name) => name.clone(),
            ToolKey::Number(number) => number.to_string(),
        }
    }
}

/// Select a tool as the new active tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectToolRequest {
    pub tool: ToolKey,
    /// When set, the current position is saved before the change and tagged
    /// with how much of it to restore afterwards.
    pub restore: Option<RestoreMode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectToolResponse {
    pub active_tool: String,
}

/// Set a tool's or toolchanger's lifecycle state by name. Used by external
/// procedures to report their outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetStateRequest {
    pub entity: String,
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetStateResponse {
    pub entity: String,
    pub state: String,
}

/// Status query: the whole coordinator, or one entity by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetStatusRequest {
    pub entity: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub enum StatusReport {
    Coordinator(CoordinatorStatus),
    Tool(ToolStatus),
    Toolchanger(ChangerStatus),
}

impl Coordinator {
    /// Looks a tool up by name or number.
    pub fn resolve_tool(&self, key: &ToolKey) -> Result<ToolId, ToolmuxError> {
        let found = match key {
            ToolKey::Name(name) => self.tree.tool_by_name(name),
            ToolKey::Number(number) => self.tree.tool_by_number(*number),
        };
        found.ok_or_else(|| ToolmuxError::UnknownTool(key.describe()))
    }

    pub fn handle_select_tool(
        &mut self,
        req: &SelectToolRequest,
    ) -> Result<SelectToolResponse, ToolmuxError> {
        let id = self.resolve_tool(&req.tool)?;
        self.select(id, req.restore, true)?;
        Ok(SelectToolResponse {
            active_tool: self.tree.ref_name(self.tree.active()).to_string(),
        })
    }

    pub fn handle_set_state(
        &mut self,
        req: &SetStateRequest,
    ) -> Result<SetStateResponse, ToolmuxError> {
        let state: LifecycleState = req.state.parse()?;
        if let Some(id) = self.tree.tool_by_name(&req.entity) {
            self.tree.set_tool_state(id, state);
        } else if let Some(id) = self.tree.changer_by_name(&req.entity) {
            self.tree.set_changer_state(id, state);
        } else {
            return Err(ToolmuxError::UnknownTool(req.entity.clone()));
        }
        Ok(SetStateResponse {
            entity: req.entity.clone(),
            state: state.to_string(),
        })
    }

    pub fn handle_get_status(
        &self,
        req: &GetStatusRequest,
    ) -> Result<StatusReport, ToolmuxError> {
        match &req.entity {
            None => Ok(StatusReport::Coordinator(self.status())),
            Some(name) => {
                if let Some(id) = self.tree.tool_by_name(name) {
                    Ok(StatusReport::Tool(self.tree.tool_status(id)))
                } else if let Some(id) = self.tree.changer_by_name(name) {
                    Ok(StatusReport::Toolchanger(self.tree.changer_status(id)))
                } else {
                    Err(ToolmuxError::UnknownTool(name.clone()))
                }
            }
        }
    }
}
