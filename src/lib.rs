//! wod-runtime – an interpreter for declarative workout scripts
//!
//! A parsed script is executed as a stack of live blocks compiled lazily
//! from its statements:
//! - Blocks are composed from small behaviors driven through a fixed lifecycle
//! - Children are compiled only when a container's cursor reaches them
//! - Scoped memory and event handlers live exactly as long as their owner block
//! - Events flow through a priority- and scope-filtered bus
//! - Hooks return declarative actions executed in ordered phases

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

/// Parsed script model (parser boundary)
pub mod script;

/// Execution core
pub mod runtime;

/// Reference behavior library
pub mod behaviors;

/// Reference compilation strategies
pub mod strategies;

pub use runtime::{RuntimeConfig, RuntimeError, ScriptRuntime};
pub use script::{Statement, WodScript};
pub use strategies::default_compiler;

/// Current version of the runtime
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
