//! Lua 5.4 scripting backend.
//!
//! Scripts are compiled once to bytecode and every run gets its own Lua
//! state with the execution context installed as globals.

pub mod api;
pub mod engine;

pub use engine::{LuaArtifact, LuaCompiler, ResourceLimits};
