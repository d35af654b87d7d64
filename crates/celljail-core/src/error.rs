//! Error types for celljail-core
//!
//! Every failure that can cross back into a script or a textual caller is one
//! of the variants below. [`crate::envelope`] turns them into the
//! `{"error": ...}` wire form; nothing here is ever handed to Lua as a host
//! type.

use thiserror::Error;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for celljail-core
#[derive(Error, Debug)]
pub enum Error {
    /// No cell is registered for the session and auto-creation did not apply
    #[error("cell[{0}] doesn't exist")]
    SessionNotFound(String),

    /// Bootstrap or user script failed during session setup.
    ///
    /// The partially initialized cell stays registered.
    #[error("{source}")]
    Initialization {
        session_id: String,
        #[source]
        source: CellError,
    },

    /// Cell operation errors (script failures, lookups, conversions)
    #[error(transparent)]
    Cell(#[from] CellError),

    /// Dispatch protocol errors (malformed payloads, fatal calls)
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl Error {
    /// True when the error came from a policy asking the caller to stop.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::Dispatch(DispatchError::Fatal(_)))
    }
}

/// Errors raised by a single cell
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CellError {
    /// A global or dotted path did not resolve to a value
    #[error("{0} is not defined")]
    NotFound(String),

    /// The engine threw while running or calling script code
    #[error("{0}")]
    Script(String),

    /// Host value could not be converted to or from the engine's value model
    #[error("value conversion failed: {0}")]
    Conversion(String),

    /// A previous cycle panicked while holding the cell
    #[error("cell[{0}] engine lock poisoned")]
    Poisoned(String),
}

impl CellError {
    /// Build a script error from an engine error, keeping only the message
    /// the script itself would see.
    #[must_use]
    pub fn from_lua(err: &mlua::Error) -> Self {
        match err {
            mlua::Error::FromLuaConversionError { .. }
            | mlua::Error::ToLuaConversionError { .. }
            | mlua::Error::SerializeError(_)
            | mlua::Error::DeserializeError(_) => Self::Conversion(lua_message(err)),
            _ => Self::Script(lua_message(err)),
        }
    }
}

/// Unwrap callback chains down to the message raised at the origin.
pub(crate) fn lua_message(err: &mlua::Error) -> String {
    match err {
        mlua::Error::CallbackError { cause, .. } => lua_message(cause),
        mlua::Error::RuntimeError(message) => message.clone(),
        mlua::Error::SyntaxError { message, .. } => message.clone(),
        mlua::Error::ExternalError(inner) => inner.to_string(),
        other => other.to_string(),
    }
}

/// Dispatch protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Payload was neither a call object nor an array of call objects
    #[error("can't unmarshal {raw} (batch={batch}): {reason}")]
    MalformedRequest {
        raw: String,
        batch: bool,
        reason: String,
    },

    /// The execution policy told the caller to stop; the batch was abandoned
    #[error("{0}")]
    Fatal(String),

    /// The cell failed while serializing the payload or the responses
    #[error(transparent)]
    Cell(#[from] CellError),
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}
