//! Isolated script cells.
//!
//! A [`Cell`] owns one Lua state behind a mutex. Every host entry point locks
//! the cell once and works through a [`CellScope`]; code running inside that
//! scope (the dispatcher, host callbacks, execution policies) reuses the
//! borrowed state and never locks again.

use crate::error::{CellError, lua_message};
use mlua::{DeserializeOptions, Lua, LuaOptions, LuaSerdeExt, MultiValue, StdLib, Table, Value};
use serde_json::Value as JsonValue;
use std::sync::{Arc, Mutex};

/// Lua registry slot holding the current cycle's context table
const CONTEXT_REGISTRY_KEY: &str = "celljail.cycle_context";

/// Global that scripts read the cycle context through
pub const CONTEXT_GLOBAL: &str = "context";

/// Base-library globals that read host files
const HOST_FILE_GLOBALS: [&str; 2] = ["loadfile", "dofile"];

// `load` restricted to source text; precompiled chunks are not verified.
const TEXT_ONLY_LOAD: &str = r##"
local raw_load = load
load = function(chunk, name, _, ...)
  if select("#", ...) > 0 then
    return raw_load(chunk, name, "t", ...)
  end
  return raw_load(chunk, name, "t")
end
"##;

/// Session id stored as engine app data so callbacks can tag their logs
#[derive(Clone)]
struct SessionTag(Arc<str>);

/// One isolated script-execution context
pub struct Cell {
    id: Arc<str>,
    bootstrap: Arc<str>,
    engine: Mutex<Lua>,
}

impl std::fmt::Debug for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cell")
            .field("id", &self.id)
            .field("bootstrap_len", &self.bootstrap.len())
            .finish_non_exhaustive()
    }
}

impl Cell {
    /// Create a cell with a fresh Lua state.
    ///
    /// `bootstrap` is the process-wide bootstrap captured at creation; the
    /// cell keeps it for its whole life.
    pub fn new(id: impl Into<Arc<str>>, bootstrap: Arc<str>) -> Result<Self, CellError> {
        let id = id.into();
        let lua = sandboxed_lua().map_err(|e| CellError::from_lua(&e))?;
        lua.set_app_data(SessionTag(Arc::clone(&id)));
        install_json(&lua).map_err(|e| CellError::from_lua(&e))?;
        tracing::debug!(session_id = %id, "cell created");
        Ok(Self {
            id,
            bootstrap,
            engine: Mutex::new(lua),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Bootstrap source captured when the cell was created
    pub fn bootstrap(&self) -> &str {
        &self.bootstrap
    }

    /// Lock the cell and run `f` against it.
    ///
    /// Holds the cell for the duration of `f`; concurrent callers queue.
    pub fn with_scope<R, E>(&self, f: impl FnOnce(&CellScope<'_>) -> Result<R, E>) -> Result<R, E>
    where
        E: From<CellError>,
    {
        let lua = self
            .engine
            .lock()
            .map_err(|_| CellError::Poisoned(self.id.to_string()))?;
        let scope = CellScope {
            lua: &lua,
            session_id: Arc::clone(&self.id),
        };
        f(&scope)
    }

    /// Bind a host value to a global.
    pub fn set(&self, name: &str, value: &JsonValue) -> Result<(), CellError> {
        self.with_scope(|scope| {
            let value = scope.to_script(value)?;
            scope.set(name, value)
        })
    }

    /// Read a global as a host value.
    pub fn get(&self, name: &str) -> Result<JsonValue, CellError> {
        self.with_scope(|scope| {
            let value = scope.get(name)?;
            scope.to_host(value)
        })
    }

    /// Execute source in the cell's persistent globals.
    pub fn run(&self, source: &str) -> Result<JsonValue, CellError> {
        self.with_scope(|scope| {
            let value = scope.run(source)?;
            scope.to_host(value)
        })
    }

    /// Call the function at a dotted path with host arguments.
    pub fn call(&self, path: &str, args: &[JsonValue]) -> Result<JsonValue, CellError> {
        self.with_scope(|scope| {
            let args = args
                .iter()
                .map(|arg| scope.to_script(arg))
                .collect::<Result<Vec<_>, _>>()?;
            let value = scope.call(path, args)?;
            scope.to_host(value)
        })
    }
}

/// Borrowed view of a locked cell.
pub struct CellScope<'lua> {
    lua: &'lua Lua,
    session_id: Arc<str>,
}

impl<'lua> CellScope<'lua> {
    /// Rebuild the scope from inside a host callback, where the cell is
    /// already held by the caller that entered the engine.
    pub(crate) fn attach(lua: &'lua Lua) -> Self {
        let session_id = lua
            .app_data_ref::<SessionTag>()
            .map(|tag| Arc::clone(&tag.0))
            .unwrap_or_else(|| Arc::from(""));
        Self { lua, session_id }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The underlying Lua state, for policies that build values directly
    pub fn lua(&self) -> &'lua Lua {
        self.lua
    }

    pub fn set(&self, name: &str, value: Value<'lua>) -> Result<(), CellError> {
        self.lua
            .globals()
            .set(name, value)
            .map_err(|e| CellError::from_lua(&e))
    }

    /// Read a global; `nil` is reported as [`CellError::NotFound`].
    pub fn get(&self, name: &str) -> Result<Value<'lua>, CellError> {
        match self.lua.globals().get::<_, Value>(name) {
            Ok(Value::Nil) => Err(CellError::NotFound(name.to_string())),
            Ok(value) => Ok(value),
            Err(e) => Err(CellError::from_lua(&e)),
        }
    }

    pub fn run(&self, source: &str) -> Result<Value<'lua>, CellError> {
        self.lua
            .load(source)
            .set_name(format!("cell[{}]", self.session_id))
            .eval::<Value>()
            .map_err(|e| CellError::Script(lua_message(&e)))
    }

    /// Walk a dotted path from the globals table.
    pub fn resolve(&self, path: &str) -> Result<Value<'lua>, CellError> {
        let not_found = || CellError::NotFound(path.to_string());
        let mut current = Value::Table(self.lua.globals());
        for segment in path.split('.') {
            let Value::Table(table) = current else {
                return Err(not_found());
            };
            current = table
                .get::<_, Value>(segment)
                .map_err(|e| CellError::from_lua(&e))?;
        }
        match current {
            Value::Nil => Err(not_found()),
            value => Ok(value),
        }
    }

    /// Invoke the function at `path`; a non-function there is `NotFound`.
    pub fn call(&self, path: &str, args: Vec<Value<'lua>>) -> Result<Value<'lua>, CellError> {
        let Value::Function(function) = self.resolve(path)? else {
            return Err(CellError::NotFound(path.to_string()));
        };
        function
            .call::<_, Value>(MultiValue::from_vec(args))
            .map_err(|e| CellError::Script(lua_message(&e)))
    }

    /// Serialize an engine value to canonical JSON text.
    pub fn encode(&self, value: Value<'lua>) -> Result<String, CellError> {
        encode_value(self.lua, value)
    }

    /// Parse JSON text into an engine value.
    pub fn decode(&self, text: &str) -> Result<Value<'lua>, CellError> {
        decode_value(self.lua, text)
    }

    pub fn to_host(&self, value: Value<'lua>) -> Result<JsonValue, CellError> {
        to_host(self.lua, value)
    }

    pub fn to_script(&self, value: &JsonValue) -> Result<Value<'lua>, CellError> {
        self.lua
            .to_value(value)
            .map_err(|e| CellError::from_lua(&e))
    }

    /// Text form of a call result: strings verbatim, `nil` as `null`,
    /// everything else as JSON.
    pub fn display_text(&self, value: Value<'lua>) -> Result<String, CellError> {
        match value {
            Value::Nil => Ok("null".to_string()),
            Value::String(s) => Ok(s.to_string_lossy().into_owned()),
            other => self.encode(other),
        }
    }

    /// Start a dispatch cycle: replace the context table with a fresh one.
    pub fn begin_cycle(&self) -> Result<(), CellError> {
        let fresh = self.lua.create_table().map_err(|e| CellError::from_lua(&e))?;
        self.lua
            .set_named_registry_value(CONTEXT_REGISTRY_KEY, fresh.clone())
            .map_err(|e| CellError::from_lua(&e))?;
        self.set(CONTEXT_GLOBAL, Value::Table(fresh))
    }

    fn context_table(&self) -> Result<Table<'lua>, CellError> {
        match self
            .lua
            .named_registry_value::<Option<Table>>(CONTEXT_REGISTRY_KEY)
            .map_err(|e| CellError::from_lua(&e))?
        {
            Some(table) => Ok(table),
            None => {
                self.begin_cycle()?;
                self.lua
                    .named_registry_value::<Table>(CONTEXT_REGISTRY_KEY)
                    .map_err(|e| CellError::from_lua(&e))
            }
        }
    }

    /// Attach `key = value` to the current cycle, namespaced by call id.
    pub fn add_context(&self, call_id: &str, key: &str, value: &JsonValue) -> Result<(), CellError> {
        let context = self.context_table()?;
        let namespace = match context
            .get::<_, Option<Table>>(call_id)
            .map_err(|e| CellError::from_lua(&e))?
        {
            Some(table) => table,
            None => {
                let table = self.lua.create_table().map_err(|e| CellError::from_lua(&e))?;
                context
                    .set(call_id, table.clone())
                    .map_err(|e| CellError::from_lua(&e))?;
                table
            }
        };
        let value = self.to_script(value)?;
        namespace
            .set(key, value)
            .map_err(|e| CellError::from_lua(&e))
    }

    /// Snapshot of the current cycle's context.
    pub fn cycle_context(&self) -> Result<JsonValue, CellError> {
        let context = self.context_table()?;
        to_host(self.lua, Value::Table(context))
    }
}

fn deserialize_options() -> DeserializeOptions {
    DeserializeOptions::new().deny_unsupported_types(false)
}

fn to_host<'lua>(lua: &'lua Lua, value: Value<'lua>) -> Result<JsonValue, CellError> {
    lua.from_value_with(value, deserialize_options())
        .map_err(|e| CellError::Conversion(lua_message(&e)))
}

pub(crate) fn encode_value<'lua>(lua: &'lua Lua, value: Value<'lua>) -> Result<String, CellError> {
    let json = to_host(lua, value)?;
    serde_json::to_string(&json).map_err(|e| CellError::Conversion(e.to_string()))
}

pub(crate) fn decode_value<'lua>(lua: &'lua Lua, text: &str) -> Result<Value<'lua>, CellError> {
    let json: JsonValue =
        serde_json::from_str(text).map_err(|e| CellError::Conversion(e.to_string()))?;
    lua.to_value(&json).map_err(|e| CellError::from_lua(&e))
}

// Base library plus pure-computation libraries. No `os`, `io`, `package` or
// `debug`: a cell must not reach the host process.
fn sandboxed_lua() -> mlua::Result<Lua> {
    let libs =
        StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8 | StdLib::COROUTINE;
    let lua = Lua::new_with(libs, LuaOptions::default())?;
    let globals = lua.globals();
    for name in HOST_FILE_GLOBALS {
        globals.set(name, Value::Nil)?;
    }
    drop(globals);
    lua.load(TEXT_ONLY_LOAD).set_name("sandbox").exec()?;
    Ok(lua)
}

/// Return shape of host functions that scripts see through a Lua wrapper:
/// `(true, value)` on success, `(false, message)` on failure. The wrapper
/// raises the message as a plain string, never as a host error object.
pub(crate) fn host_outcome<'lua>(
    lua: &'lua Lua,
    result: Result<Value<'lua>, String>,
) -> mlua::Result<(bool, Value<'lua>)> {
    match result {
        Ok(value) => Ok((true, value)),
        Err(message) => Ok((false, Value::String(lua.create_string(&message)?))),
    }
}

const JSON_SOURCE: &str = r#"
local raw_encode, raw_decode, array_mt = ...
local function unwrap(ok, value)
  if not ok then error(value, 0) end
  return value
end
return {
  encode = function(value) return unwrap(raw_encode(value)) end,
  decode = function(text) return unwrap(raw_decode(text)) end,
  array_mt = array_mt,
}
"#;

// `json.encode` / `json.decode` / `json.array_mt`, available to every script
// before any bootstrap runs. Tables carrying `array_mt` encode as arrays even
// when empty.
fn install_json(lua: &Lua) -> mlua::Result<()> {
    let raw_encode = lua.create_function(|lua, value: Value| {
        let text = encode_value(lua, value).map_err(|e| e.to_string());
        let text = match text {
            Ok(text) => Ok(Value::String(lua.create_string(&text)?)),
            Err(message) => Err(message),
        };
        host_outcome(lua, text)
    })?;
    let raw_decode = lua.create_function(|lua, text: Value| {
        let decoded = match text {
            Value::String(text) => match text.to_str() {
                Ok(text) => decode_value(lua, text).map_err(|e| e.to_string()),
                Err(_) => Err("json.decode expects UTF-8 text".to_string()),
            },
            other => Err(format!("json.decode expects a string, got {}", other.type_name())),
        };
        host_outcome(lua, decoded)
    })?;
    let json: Table = lua
        .load(JSON_SOURCE)
        .set_name("json")
        .call((raw_encode, raw_decode, lua.array_metatable()))?;
    lua.globals().set("json", json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cell() -> Cell {
        Cell::new("test", Arc::from("")).unwrap()
    }

    #[test]
    fn globals_persist_between_runs() {
        let cell = cell();
        cell.run("counter = 1").unwrap();
        cell.run("counter = counter + 1").unwrap();
        assert_eq!(cell.get("counter").unwrap(), json!(2));
    }

    #[test]
    fn run_returns_expression_value() {
        let cell = cell();
        assert_eq!(cell.run("1 + 2").unwrap(), json!(3));
        assert_eq!(cell.run("return { a = 'x' }").unwrap(), json!({ "a": "x" }));
    }

    #[test]
    fn set_then_get_roundtrips_host_values() {
        let cell = cell();
        cell.set("payload", &json!({ "list": [1, 2, 3], "name": "n" }))
            .unwrap();
        assert_eq!(cell.run("return payload.list[2]").unwrap(), json!(2));
        assert_eq!(cell.get("payload").unwrap()["name"], json!("n"));
    }

    #[test]
    fn missing_global_is_not_found() {
        let err = cell().get("nope").unwrap_err();
        assert_eq!(err, CellError::NotFound("nope".to_string()));
        assert_eq!(err.to_string(), "nope is not defined");
    }

    #[test]
    fn script_error_keeps_cell_usable() {
        let cell = cell();
        let err = cell.run("error('kaboom', 0)").unwrap_err();
        assert_eq!(err, CellError::Script("kaboom".to_string()));
        assert_eq!(cell.run("return 7").unwrap(), json!(7));
    }

    #[test]
    fn syntax_error_is_a_script_error() {
        assert!(matches!(
            cell().run("this is not lua").unwrap_err(),
            CellError::Script(_)
        ));
    }

    #[test]
    fn call_resolves_dotted_paths() {
        let cell = cell();
        cell.run("math2 = { ops = { add = function(a, b) return a + b end } }")
            .unwrap();
        assert_eq!(
            cell.call("math2.ops.add", &[json!(2), json!(5)]).unwrap(),
            json!(7)
        );
    }

    #[test]
    fn call_on_unresolved_or_non_function_path_is_not_found() {
        let cell = cell();
        cell.run("value = 3").unwrap();
        assert_eq!(
            cell.call("missing.fn", &[]).unwrap_err(),
            CellError::NotFound("missing.fn".to_string())
        );
        assert_eq!(
            cell.call("value", &[]).unwrap_err(),
            CellError::NotFound("value".to_string())
        );
        assert_eq!(
            cell.call("value.deeper", &[]).unwrap_err(),
            CellError::NotFound("value.deeper".to_string())
        );
    }

    #[test]
    fn call_surfaces_raised_errors() {
        let cell = cell();
        cell.run("function fail() error('bad input', 0) end").unwrap();
        assert_eq!(
            cell.call("fail", &[]).unwrap_err(),
            CellError::Script("bad input".to_string())
        );
    }

    #[test]
    fn json_namespace_is_preinstalled() {
        let cell = cell();
        assert_eq!(
            cell.run(r#"return json.encode({ ok = true })"#).unwrap(),
            json!(r#"{"ok":true}"#)
        );
        assert_eq!(
            cell.run(r#"return json.decode('[1,2,3]')[3]"#).unwrap(),
            json!(3)
        );
        assert!(matches!(
            cell.run(r#"return json.decode('{oops')"#).unwrap_err(),
            CellError::Script(_)
        ));
    }

    #[test]
    fn display_text_forms() {
        let cell = cell();
        cell.with_scope(|scope| {
            assert_eq!(scope.display_text(Value::Nil)?, "null");
            let text = scope.run("return 'plain'")?;
            assert_eq!(scope.display_text(text)?, "plain");
            let table = scope.run("return { 1, 2 }")?;
            assert_eq!(scope.display_text(table)?, "[1,2]");
            let flag = scope.run("return true")?;
            assert_eq!(scope.display_text(flag)?, "true");
            Ok::<_, CellError>(())
        })
        .unwrap();
    }

    #[test]
    fn encode_canonicalizes_through_engine() {
        let cell = cell();
        cell.with_scope(|scope| {
            let value = scope.decode(r#"{ "method" : "m", "id" : 1 }"#)?;
            let text = scope.encode(value)?;
            let parsed: JsonValue = serde_json::from_str(&text).unwrap();
            assert_eq!(parsed, json!({ "method": "m", "id": 1 }));
            Ok::<_, CellError>(())
        })
        .unwrap();
    }

    #[test]
    fn begin_cycle_resets_context() {
        let cell = cell();
        cell.with_scope(|scope| {
            scope.begin_cycle()?;
            scope.add_context("7", "note", &json!("first"))?;
            assert_eq!(
                scope.cycle_context()?,
                json!({ "7": { "note": "first" } })
            );
            scope.begin_cycle()?;
            assert_eq!(scope.cycle_context()?, json!({}));
            Ok::<_, CellError>(())
        })
        .unwrap();
    }

    #[test]
    fn context_global_is_bridged_to_cycle_table() {
        let cell = cell();
        cell.with_scope(|scope| {
            scope.begin_cycle()?;
            scope.add_context("1", "k", &json!(5))?;
            let seen = scope.run("return context['1'].k")?;
            assert_eq!(scope.to_host(seen)?, json!(5));
            scope.run("context['2'] = { from_script = true }")?;
            assert_eq!(
                scope.cycle_context()?["2"],
                json!({ "from_script": true })
            );
            Ok::<_, CellError>(())
        })
        .unwrap();
    }

    #[test]
    fn scope_reports_session_id() {
        let cell = Cell::new("chat-9", Arc::from("x = 1")).unwrap();
        assert_eq!(cell.id(), "chat-9");
        assert_eq!(cell.bootstrap(), "x = 1");
        cell.with_scope(|scope| {
            assert_eq!(scope.session_id(), "chat-9");
            assert_eq!(CellScope::attach(scope.lua()).session_id(), "chat-9");
            Ok::<_, CellError>(())
        })
        .unwrap();
    }

    #[test]
    fn cells_do_not_share_globals() {
        let a = Cell::new("a", Arc::from("")).unwrap();
        let b = Cell::new("b", Arc::from("")).unwrap();
        a.run("shared = 'a'").unwrap();
        assert!(matches!(b.get("shared"), Err(CellError::NotFound(_))));
    }

    #[test]
    fn cells_cannot_reach_the_host() {
        let cell = cell();
        let seen = cell
            .run(
                r#"return {
  os = type(os), io = type(io), package = type(package), debug = type(debug),
  loadfile = type(loadfile), dofile = type(dofile), require = type(require),
  string = type(string), table = type(table), math = type(math),
  utf8 = type(utf8), coroutine = type(coroutine),
}"#,
            )
            .unwrap();
        for name in ["os", "io", "package", "debug", "loadfile", "dofile", "require"] {
            assert_eq!(seen[name], json!("nil"), "{name} should be absent");
        }
        for name in ["string", "table", "math", "utf8", "coroutine"] {
            assert_eq!(seen[name], json!("table"), "{name} should be loaded");
        }
    }

    #[test]
    fn load_accepts_text_but_not_bytecode() {
        let cell = cell();
        let seen = cell
            .run(
                r#"
local from_text = load("return 1 + 1")()
local env_text = load("return x", "chunk", "t", { x = 9 })()
local f, err = load(string.dump(function() return 1 end))
return { from_text = from_text, env_text = env_text, rejected = f == nil, err = type(err) }
"#,
            )
            .unwrap();
        assert_eq!(
            seen,
            json!({ "from_text": 2, "env_text": 9, "rejected": true, "err": "string" })
        );
    }

    #[test]
    fn json_errors_reach_scripts_as_plain_strings() {
        let cell = cell();
        let seen = cell
            .run(
                r#"
local ok, err = pcall(json.decode, "{oops")
local _, typed = pcall(json.decode, {})
return { ok = ok, kind = type(err), prefixed = "x: " .. err, typed = typed }
"#,
            )
            .unwrap();
        assert_eq!(seen["ok"], json!(false));
        assert_eq!(seen["kind"], json!("string"));
        assert!(seen["prefixed"].as_str().unwrap().starts_with("x: value conversion failed"));
        assert_eq!(seen["typed"], json!("json.decode expects a string, got table"));
    }

    #[test]
    fn array_metatable_encodes_empty_tables_as_arrays() {
        let cell = cell();
        assert_eq!(cell.run("return json.encode({})").unwrap(), json!("{}"));
        assert_eq!(
            cell.run("return json.encode(setmetatable({}, json.array_mt))")
                .unwrap(),
            json!("[]")
        );
        assert_eq!(cell.run("return json.decode('null')").unwrap(), json!(null));
    }
}
