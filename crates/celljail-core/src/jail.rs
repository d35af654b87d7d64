//! Host entry points: session setup, script invocation and raw RPC.
//!
//! Each entry point is one cycle: it locks the session's cell once, resets
//! the cycle context and holds the cell until it returns. The `try_*` forms
//! return typed errors; the plain forms return envelope text.

use crate::bootstrap::BootstrapLoader;
use crate::cell::{Cell, CellScope};
use crate::config::Config;
use crate::dispatcher::CallDispatcher;
use crate::envelope::{make_error, make_outcome};
use crate::error::{CellError, Error, Result};
use crate::registry::SessionRegistry;
use crate::rpc::ExecutionPolicy;
use mlua::Value;
use serde_json::Value as JsonValue;
use std::sync::Arc;

/// Multi-session script sandbox.
#[derive(Debug)]
pub struct Jail {
    registry: SessionRegistry,
    dispatcher: Arc<CallDispatcher>,
    loader: BootstrapLoader,
    auto_create: bool,
}

impl Jail {
    pub fn new(policy: Arc<dyn ExecutionPolicy>) -> Self {
        Self {
            registry: SessionRegistry::new(),
            dispatcher: Arc::new(CallDispatcher::new(policy)),
            loader: BootstrapLoader::new(),
            auto_create: true,
        }
    }

    pub fn with_policy(policy: impl ExecutionPolicy) -> Self {
        Self::new(Arc::new(policy))
    }

    /// Build a jail from configuration, loading the bootstrap script if set.
    pub fn from_config(config: &Config, policy: Arc<dyn ExecutionPolicy>) -> Result<Self> {
        let jail = Self::new(policy).with_auto_create(config.sessions.auto_create);
        let bootstrap = config.bootstrap_source()?;
        if !bootstrap.is_empty() {
            jail.set_bootstrap(bootstrap);
        }
        Ok(jail)
    }

    #[must_use]
    pub fn with_loader(mut self, loader: BootstrapLoader) -> Self {
        self.loader = loader;
        self
    }

    /// Whether `send_rpc` creates cells for unknown sessions
    #[must_use]
    pub fn with_auto_create(mut self, auto_create: bool) -> Self {
        self.auto_create = auto_create;
        self
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Set the bootstrap for cells created from now on.
    pub fn set_bootstrap(&self, source: impl Into<Arc<str>>) {
        self.registry.set_bootstrap(source);
    }

    /// Initialize a session and return its serialized catalog.
    ///
    /// Creates the cell if needed. On failure the cell stays registered with
    /// whatever globals the failed run left behind.
    pub fn try_init_session(&self, session_id: &str, user_script: &str) -> Result<String> {
        let span = crate::cell_span!("init_session", session_id = session_id);
        let _guard = span.enter();

        let cell = self.registry.get_or_create(session_id)?;
        let outcome = cell.with_scope(|scope| {
            scope.begin_cycle()?;
            self.dispatcher.install_surface(scope)?;
            self.loader.load(scope, cell.bootstrap(), user_script)
        });
        match outcome {
            Ok(catalog) => {
                tracing::info!(catalog_bytes = catalog.len(), "session initialized");
                Ok(catalog)
            }
            Err(source) => {
                tracing::warn!(error = %source, "session initialization failed");
                Err(Error::Initialization {
                    session_id: session_id.to_string(),
                    source,
                })
            }
        }
    }

    /// [`Self::try_init_session`] as envelope text.
    pub fn init_session(&self, session_id: &str, user_script: &str) -> String {
        make_outcome(self.try_init_session(session_id, user_script))
    }

    /// Call a function in an existing session.
    ///
    /// `this` is optional JSON passed as the first argument (Lua's `self`).
    /// `args` is JSON: an array spreads into positional arguments, any other
    /// value is a single argument, blank text means no arguments.
    ///
    /// Returns the script's own text for string results, `null` for nil and
    /// JSON for everything else.
    pub fn try_invoke(
        &self,
        session_id: &str,
        path: &str,
        this: Option<&str>,
        args: &str,
    ) -> Result<String> {
        let span = crate::cell_span!("invoke", session_id = session_id, path = path);
        let _guard = span.enter();

        let cell = self.registry.get(session_id)?;
        cell.with_scope(|scope| {
            scope.begin_cycle()?;
            let args = invoke_args(scope, this, args)?;
            let value = scope.call(path, args)?;
            Ok(scope.display_text(value)?)
        })
    }

    /// [`Self::try_invoke`] as envelope text.
    ///
    /// The result text is embedded as-is: a function returning the Lua
    /// string `pong` yields `{"result": pong}`, which callers that need JSON
    /// avoid by returning tables or `json.encode`d text.
    pub fn invoke(&self, session_id: &str, path: &str, this: Option<&str>, args: &str) -> String {
        make_outcome(self.try_invoke(session_id, path, this, args))
    }

    /// Dispatch a raw request payload and return the serialized response.
    pub fn dispatch(&self, session_id: &str, raw: &str) -> Result<String> {
        let span = crate::cell_span!("send_rpc", session_id = session_id);
        let _guard = span.enter();

        let cell = self.resolve_for_rpc(session_id)?;
        let response = cell.with_scope(|scope| {
            scope.begin_cycle()?;
            self.dispatcher.dispatch_text(scope, raw)
        })?;
        Ok(response)
    }

    /// [`Self::dispatch`]: response text, or an error envelope.
    pub fn send_rpc(&self, session_id: &str, raw: &str) -> String {
        match self.dispatch(session_id, raw) {
            Ok(response) => response,
            Err(err) => make_error(&err.to_string()),
        }
    }

    fn resolve_for_rpc(&self, session_id: &str) -> Result<Arc<Cell>> {
        if self.auto_create {
            self.registry.get_or_create(session_id)
        } else {
            self.registry.get(session_id)
        }
    }
}

fn invoke_args<'lua>(
    scope: &CellScope<'lua>,
    this: Option<&str>,
    args: &str,
) -> std::result::Result<Vec<Value<'lua>>, CellError> {
    let mut values = Vec::new();
    if let Some(this) = this {
        values.push(scope.to_script(&parse_json(this)?)?);
    }
    match parse_json_or_empty(args)? {
        None => {}
        Some(JsonValue::Array(items)) => {
            for item in &items {
                values.push(scope.to_script(item)?);
            }
        }
        Some(other) => values.push(scope.to_script(&other)?),
    }
    Ok(values)
}

fn parse_json(text: &str) -> std::result::Result<JsonValue, CellError> {
    serde_json::from_str(text).map_err(|e| CellError::Conversion(e.to_string()))
}

fn parse_json_or_empty(text: &str) -> std::result::Result<Option<JsonValue>, CellError> {
    if text.trim().is_empty() {
        Ok(None)
    } else {
        parse_json(text).map(Some)
    }
}
