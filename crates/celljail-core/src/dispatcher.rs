//! Call dispatcher: turns a script-originated request into ordered responses.
//!
//! Script payloads are canonicalized through the cell's own serializer before
//! they are decoded, so the host sees exactly the text the engine would
//! produce. Host text is already canonical and is decoded as given.
//! Each call goes through the [`ExecutionPolicy`]; recoverable failures become
//! per-call error objects, a fatal failure abandons the rest of the request.

use crate::cell::{CellScope, host_outcome};
use crate::error::{CellError, DispatchError};
use crate::rpc::{
    CallError, ExecutionPolicy, RequestEnvelope, ResponseEnvelope, RpcCall, RpcResponse,
};
use mlua::{Table, Value};
use std::sync::Arc;

/// Global the host call surface is installed under
pub const SURFACE_GLOBAL: &str = "jeth";

// Script-facing half of the surface. `raw_send` returns `(true, response)`
// or `(false, message, fatal)`; failures are raised as plain strings.
const SURFACE_SOURCE: &str = r#"
local raw_send = ...
local surface = {}

function surface.send(payload)
  local ok, value = raw_send(payload)
  if not ok then error(value, 0) end
  return value
end

function surface.sendAsync(payload, callback)
  local ok, value, fatal = raw_send(payload)
  if ok then return callback(nil, value) end
  if fatal then return callback(value, nil) end
  error(value, 0)
end

function surface.isConnected()
  return true
end

return surface
"#;

/// Drives request envelopes through an execution policy.
#[derive(Clone)]
pub struct CallDispatcher {
    policy: Arc<dyn ExecutionPolicy>,
}

impl std::fmt::Debug for CallDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallDispatcher").finish_non_exhaustive()
    }
}

impl CallDispatcher {
    pub fn new(policy: Arc<dyn ExecutionPolicy>) -> Self {
        Self { policy }
    }

    pub fn from_policy(policy: impl ExecutionPolicy) -> Self {
        Self::new(Arc::new(policy))
    }

    /// Execute every call of a decoded envelope, in order.
    ///
    /// Returns [`DispatchError::Fatal`] as soon as the policy classifies a
    /// failure as fatal; later calls are not executed.
    pub fn execute(
        &self,
        scope: &CellScope<'_>,
        envelope: &RequestEnvelope,
    ) -> Result<ResponseEnvelope, DispatchError> {
        let span = crate::cell_span!(
            "dispatch",
            session_id = scope.session_id(),
            batch = envelope.is_batch(),
            calls = envelope.calls().len(),
        );
        let _guard = span.enter();

        match envelope {
            RequestEnvelope::Single(call) => Ok(ResponseEnvelope::Single(self.respond(scope, call)?)),
            RequestEnvelope::Batch(calls) => {
                let mut responses = Vec::with_capacity(calls.len());
                for call in calls {
                    responses.push(self.respond(scope, call)?);
                }
                Ok(ResponseEnvelope::Batch(responses))
            }
        }
    }

    fn respond(&self, scope: &CellScope<'_>, call: &RpcCall) -> Result<RpcResponse, DispatchError> {
        match self.policy.execute(call, scope) {
            Ok(result) => {
                tracing::trace!(method = %call.method, call_id = %call.id, "call succeeded");
                Ok(RpcResponse::result(call.id.clone(), result))
            }
            Err(CallError::Recoverable(message)) => {
                tracing::debug!(
                    method = %call.method,
                    call_id = %call.id,
                    error = %message,
                    "call failed"
                );
                Ok(RpcResponse::error(call.id.clone(), message))
            }
            Err(CallError::Fatal(message)) => {
                tracing::warn!(
                    method = %call.method,
                    call_id = %call.id,
                    error = %message,
                    "fatal call error, abandoning request"
                );
                Err(DispatchError::Fatal(message))
            }
        }
    }

    /// Dispatch an engine value and hand the response back as an engine value.
    pub fn dispatch_value<'lua>(
        &self,
        scope: &CellScope<'lua>,
        payload: Value<'lua>,
    ) -> Result<Value<'lua>, DispatchError> {
        let raw = scope.encode(payload)?;
        let envelope = RequestEnvelope::parse(&raw)?;
        let response = self.execute(scope, &envelope)?;
        let response = response
            .to_json()
            .map_err(|e| CellError::Conversion(e.to_string()))?;
        Ok(scope.to_script(&response)?)
    }

    /// Dispatch host-supplied text and return the serialized response.
    ///
    /// Ids and params are taken from the text unchanged; numbers outside the
    /// engine's integer range are echoed exactly.
    pub fn dispatch_text(&self, scope: &CellScope<'_>, raw: &str) -> Result<String, DispatchError> {
        let envelope = RequestEnvelope::parse(raw)?;
        let response = self.execute(scope, &envelope)?;
        serde_json::to_string(&response).map_err(|e| CellError::Conversion(e.to_string()).into())
    }

    /// Install the `jeth` call surface into the cell.
    ///
    /// - `jeth.send(payload)` returns the response or raises
    /// - `jeth.sendAsync(payload, callback)` calls `callback(err, response)`;
    ///   a fatal error arrives as `err`, a malformed payload still raises
    /// - `jeth.isConnected()` is always `true`
    pub fn install_surface(self: &Arc<Self>, scope: &CellScope<'_>) -> Result<(), CellError> {
        self.build_surface(scope)
            .map_err(|e| CellError::from_lua(&e))
            .and_then(|surface| scope.set(SURFACE_GLOBAL, Value::Table(surface)))
    }

    fn build_surface<'lua>(
        self: &Arc<Self>,
        scope: &CellScope<'lua>,
    ) -> mlua::Result<Table<'lua>> {
        let lua = scope.lua();
        let dispatcher = Arc::clone(self);
        let raw_send = lua.create_function(move |lua, payload: Value| {
            let scope = CellScope::attach(lua);
            let (fatal, outcome) = match dispatcher.dispatch_value(&scope, payload) {
                Ok(response) => (false, Ok(response)),
                Err(DispatchError::Fatal(message)) => (true, Err(message)),
                Err(err) => (false, Err(err.to_string())),
            };
            let (ok, value) = host_outcome(lua, outcome)?;
            Ok((ok, value, fatal))
        })?;
        lua.load(SURFACE_SOURCE)
            .set_name(SURFACE_GLOBAL)
            .call(raw_send)
    }
}
