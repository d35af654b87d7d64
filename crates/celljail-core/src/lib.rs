//! celljail-core: multi-session Lua script sandbox
//!
//! Each session owns an isolated Lua cell. Scripts in a cell issue JSON-RPC
//! calls through the host call surface (`jeth`); the dispatcher runs every
//! call through a pluggable execution policy and hands ordered responses back.
//!
//! # Architecture
//!
//! ```text
//! caller → Jail → SessionRegistry → Cell ─ BootstrapLoader (prelude + user + epilogue)
//!                                    ↓
//!                            jeth.send(payload)
//!                                    ↓
//!                 CallDispatcher → ExecutionPolicy (per call)
//!                                    ↓
//!                      ordered responses → back into the cell
//! ```
//!
//! # Modules
//!
//! - `jail`: Host entry points (`init_session`, `invoke`, `send_rpc`)
//! - `registry`: Session id → cell mapping
//! - `cell`: Isolated Lua state and the scoped view used while it is held
//! - `bootstrap`: Init script composition and the binding layer
//! - `dispatcher`: Request decoding, per-call execution, response assembly
//! - `rpc`: JSON-RPC call model and the `ExecutionPolicy` trait
//! - `envelope`: `{"result": ...}` / `{"error": ...}` text helpers
//! - `config`: Configuration management
//! - `logging`: Structured logging setup
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod bootstrap;
pub mod cell;
pub mod config;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod jail;
pub mod logging;
pub mod registry;
pub mod rpc;

pub use bootstrap::BootstrapLoader;
pub use cell::{Cell, CellScope};
pub use config::Config;
pub use dispatcher::CallDispatcher;
pub use envelope::{make_error, make_result};
pub use error::{CellError, DispatchError, Error, Result};
pub use jail::Jail;
pub use registry::SessionRegistry;
pub use rpc::{CallError, ExecutionPolicy, MethodRouter, RpcCall, RpcId};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
