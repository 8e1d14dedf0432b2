//! Error types for the workout runtime
//!
//! Each subsystem has its own thiserror enum with a result alias; the
//! top-level [`RuntimeError`] wraps them for callers of the runtime facade.

use std::io;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::block::LifecyclePhase;
use super::ids::{BlockKey, MemoryId};
use crate::script::StatementId;

/// Top-level runtime error
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Stack validation errors
    #[error("Stack error: {0}")]
    Stack(#[from] StackError),

    /// Memory store errors
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    /// Compilation errors
    #[error("Compile error: {0}")]
    Compile(#[from] CompileError),

    /// Behavior hook errors raised outside a block lifecycle call
    #[error("Behavior error: {0}")]
    Behavior(#[from] BehaviorError),

    /// Script loading errors
    #[error("Script error: {0}")]
    Script(#[from] ScriptError),

    /// A block lifecycle hook failed
    #[error("Block {key} failed during {phase}: {source}")]
    Lifecycle {
        /// Block whose hook failed
        key: BlockKey,
        /// Lifecycle phase
        phase: LifecyclePhase,
        /// Underlying failure
        #[source]
        source: BehaviorError,
    },

    /// Nested action batches exceeded the configured limit
    #[error("Action nesting exceeded {max} levels")]
    ActionDepthExceeded {
        /// Configured limit
        max: usize,
    },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Stack validation errors, raised before any mutation
#[derive(Debug, Error)]
pub enum StackError {
    /// Push would exceed the configured depth
    #[error("Stack depth {depth} would exceed maximum of {max}")]
    DepthExceeded {
        /// Configured maximum
        max: usize,
        /// Depth the push would reach
        depth: usize,
    },

    /// Block key already on the stack
    #[error("Block {0} is already on the stack")]
    DuplicateKey(BlockKey),

    /// Block cannot be pushed in its current state
    #[error("Block {key} cannot be pushed: {reason}")]
    InvalidBlock {
        /// Offending block
        key: BlockKey,
        /// Why it was rejected
        reason: String,
    },

    /// Push or pop requested from inside an event dispatch
    #[error("Cannot {operation} while an event is being dispatched")]
    Reentrant {
        /// Rejected operation
        operation: &'static str,
    },

    /// The top of the stack changed while a pop was in progress
    #[error("Expected block {expected} on top of the stack, found {found:?}")]
    TopChanged {
        /// Block being popped
        expected: BlockKey,
        /// Block actually on top
        found: Option<BlockKey>,
    },
}

/// Convenience result alias for stack operations
pub type StackResult<T> = std::result::Result<T, StackError>;

/// Memory store errors
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Reference was released or never allocated
    #[error("Memory reference {0} is not allocated")]
    UnknownReference(MemoryId),

    /// Stored value has a different shape than requested
    #[error("Memory reference {id} does not hold a {expected} value")]
    TypeMismatch {
        /// Reference
        id: MemoryId,
        /// Expected value kind
        expected: &'static str,
    },
}

/// Convenience result alias for memory operations
pub type MemoryResult<T> = std::result::Result<T, MemoryError>;

/// Compilation errors
#[derive(Debug, Error)]
pub enum CompileError {
    /// No registered strategy matched
    #[error("No strategy matched statements {statement_ids:?}")]
    NoStrategy {
        /// Statements that failed to match
        statement_ids: Vec<StatementId>,
    },

    /// Asked to compile an empty statement group
    #[error("Cannot compile an empty statement group")]
    EmptyGroup,

    /// Referenced statement could not be resolved
    #[error("Script error: {0}")]
    Script(#[from] ScriptError),
}

/// Convenience result alias for compile operations
pub type CompileResult<T> = std::result::Result<T, CompileError>;

/// Errors raised by behavior hooks
#[derive(Debug, Error)]
pub enum BehaviorError {
    /// Generic hook failure
    #[error("Behavior '{behavior}' failed: {detail}")]
    Failed {
        /// Behavior name
        behavior: &'static str,
        /// Failure details
        detail: String,
    },

    /// Memory access failed
    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    /// Child compilation failed
    #[error("Compile error: {0}")]
    Compile(#[from] CompileError),
}

impl BehaviorError {
    /// Shorthand for [`BehaviorError::Failed`]
    pub fn failed(behavior: &'static str, detail: impl Into<String>) -> Self {
        BehaviorError::Failed {
            behavior,
            detail: detail.into(),
        }
    }
}

/// Convenience result alias for behavior hooks
pub type BehaviorResult<T> = std::result::Result<T, BehaviorError>;

/// Errors returned by event handlers; isolated per handler during dispatch
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Handler-specific failure
    #[error("Handler failed: {0}")]
    Failed(String),

    /// Routed block is no longer on the stack
    #[error("Block {0} is not on the stack")]
    BlockNotFound(BlockKey),

    /// Behavior hook failed while handling the event
    #[error("Behavior error: {0}")]
    Behavior(#[from] BehaviorError),
}

/// Convenience result alias for event handlers
pub type HandlerResult<T> = std::result::Result<T, HandlerError>;

/// Script loading and validation errors
#[derive(Debug, Error)]
pub enum ScriptError {
    /// Two statements share an id
    #[error("Duplicate statement id {0}")]
    DuplicateId(StatementId),

    /// A child reference points nowhere
    #[error("Statement {parent} references unknown child {child}")]
    UnknownChild {
        /// Referencing statement
        parent: StatementId,
        /// Missing child id
        child: StatementId,
    },

    /// Lookup of an unknown statement
    #[error("Statement {0} not found")]
    UnknownStatement(StatementId),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Convenience result alias for script operations
pub type ScriptResult<T> = std::result::Result<T, ScriptError>;

/// Result type using RuntimeError
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Entry in the runtime's append-only error list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeErrorRecord {
    /// When the error was recorded
    pub timestamp: DateTime<Utc>,
    /// Component or action that raised it
    pub source: String,
    /// Rendered error message
    pub message: String,
}
