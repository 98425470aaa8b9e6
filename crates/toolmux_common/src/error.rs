//! Error taxonomy for the toolmux engine.
//!
//! Every fallible operation returns one of these variants to the caller.
//! None of them are retried automatically; chain operations are not
//! transactional, so a mid-chain failure leaves already-transitioned
//! entities as they are for the operator to inspect.

use thiserror::Error;

/// Error type for configuration, selection and heater operations.
#[derive(Debug, Error)]
pub enum ToolmuxError {
    /// Malformed or missing configuration value. Fatal to startup of the
    /// entity that carries it.
    #[error("configuration error for {entity}: {message}")]
    Configuration { entity: String, message: String },

    /// An entity's inheritance resolution re-entered itself.
    #[error("circular inheritance detected while configuring {0}")]
    CircularInheritance(String),

    /// A required precondition (axis homing, parent selection) was not met.
    /// The entity's state is left at its pre-attempt value.
    #[error("precondition failed for {entity}: {message}")]
    Precondition { entity: String, message: String },

    /// Final selection was attempted while the mounted tool is indeterminate.
    #[error("unknown tool mounted; cannot automatically deselect before selecting {0}")]
    UnsafeState(String),

    /// The external procedure raised an error.
    #[error("procedure {procedure} failed for {entity}: {message}")]
    ProcedureFailed {
        entity: String,
        procedure: &'static str,
        message: String,
    },

    /// The external procedure returned without moving the entity out of its
    /// transient state.
    #[error(
        "{entity} did not change state while running {procedure}; \
         the procedure must report completion by setting the state"
    )]
    ProcedureDidNotTransition {
        entity: String,
        procedure: &'static str,
    },

    /// The external procedure transitioned the entity to ERROR.
    #[error("{entity} entered ERROR state while running {procedure}")]
    ProcedureEnteredError {
        entity: String,
        procedure: &'static str,
    },

    /// An invalid state literal was supplied.
    #[error("invalid state name: {0}")]
    StateName(String),

    /// No tool with the given name or number exists.
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    /// No heater with the given name exists.
    #[error("unknown heater: {0}")]
    UnknownHeater(String),
}

impl ToolmuxError {
    /// Shorthand for a [`ToolmuxError::Configuration`].
    pub fn config(entity: impl Into<String>, message: impl Into<String>) -> Self {
        ToolmuxError::Configuration {
            entity: entity.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a [`ToolmuxError::Precondition`].
    pub fn precondition(entity: impl Into<String>, message: impl Into<String>) -> Self {
        ToolmuxError::Precondition {
            entity: entity.into(),
            message: message.into(),
        }
    }
}
