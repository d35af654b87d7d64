//! Shared test infrastructure for celljail-core integration tests.
//!
//! Import from integration test files with:
//! ```ignore
//! mod common;
//! use common::CountingPolicy;
//! ```

#![allow(dead_code)]

use celljail_core::{CallError, CellScope, ExecutionPolicy, RpcCall};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Path of a Lua fixture under `tests/fixtures`.
pub fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name)
}

pub fn fixture(name: &str) -> String {
    std::fs::read_to_string(fixture_path(name)).expect("fixture readable")
}

/// Records every executed call.
///
/// - `sum`: adds integer params
/// - `fail`: recoverable error
/// - `fatal`: fatal error
/// - `note`: attaches `params[0]` to the cycle context under the call id
/// - anything else: returns the call's params
#[derive(Default)]
pub struct CountingPolicy {
    executed: Mutex<Vec<(String, String)>>,
}

impl CountingPolicy {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn count(&self) -> usize {
        self.executed.lock().unwrap().len()
    }

    /// `(method, id)` pairs in execution order
    pub fn executed(&self) -> Vec<(String, String)> {
        self.executed.lock().unwrap().clone()
    }
}

impl ExecutionPolicy for CountingPolicy {
    fn execute(&self, call: &RpcCall, cell: &CellScope<'_>) -> Result<Value, CallError> {
        self.executed
            .lock()
            .unwrap()
            .push((call.method.clone(), call.id.to_string()));
        match call.method.as_str() {
            "sum" => Ok(json!(
                call.params.iter().filter_map(Value::as_i64).sum::<i64>()
            )),
            "fail" => Err(CallError::recoverable(format!("{} failed", call.method))),
            "fatal" => Err(CallError::fatal("backend says stop")),
            "note" => {
                let note = call.params.first().cloned().unwrap_or(Value::Null);
                cell.add_context(&call.id.to_string(), "note", &note)
                    .map_err(|e| CallError::recoverable(e.to_string()))?;
                cell.cycle_context()
                    .map_err(|e| CallError::recoverable(e.to_string()))
            }
            _ => Ok(Value::Array(call.params.clone())),
        }
    }
}

/// Sleeps inside every call and tracks how many calls overlap.
pub struct SleepingPolicy {
    delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl SleepingPolicy {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        })
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl ExecutionPolicy for SleepingPolicy {
    fn execute(&self, call: &RpcCall, cell: &CellScope<'_>) -> Result<Value, CallError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        // Write a per-call marker, sleep, then read it back. Interleaved
        // cycles on one cell would overwrite each other's marker.
        let marker = call.id.to_string();
        let lua_marker = cell
            .to_script(&json!(marker))
            .map_err(|e| CallError::fatal(e.to_string()))?;
        cell.set("marker", lua_marker)
            .map_err(|e| CallError::fatal(e.to_string()))?;
        std::thread::sleep(self.delay);
        let seen = cell
            .get("marker")
            .and_then(|value| cell.to_host(value))
            .map_err(|e| CallError::fatal(e.to_string()))?;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(json!({ "expected": marker, "seen": seen }))
    }
}
