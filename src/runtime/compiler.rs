//! Strategy registry and just-in-time block compilation
//!
//! Strategies pair a matcher with a block factory. The registry keeps them
//! ordered by descending priority (stable for equal priorities) and compiles
//! a statement group with the first strategy that matches and builds
//! successfully. Compilation happens lazily, once, when a container's cursor
//! first reaches a child group.

use std::sync::Arc;

use super::block::RuntimeBlock;
use super::error::{CompileError, CompileResult};
use super::ids::BlockKey;
use crate::script::{Statement, StatementId, WodScript};

/// Lookahead context available to strategies
#[derive(Clone, Copy)]
pub struct CompileContext<'a> {
    /// Whole script, for resolving children
    pub script: &'a WodScript,
    /// Block that requested the compilation
    pub parent: Option<BlockKey>,
    /// Stack depth at compile time
    pub depth: usize,
}

impl<'a> CompileContext<'a> {
    /// Context for compiling a top-level group
    pub fn root(script: &'a WodScript) -> Self {
        Self {
            script,
            parent: None,
            depth: 0,
        }
    }
}

/// A matcher + block factory for one kind of statement group
pub trait Strategy: Send + Sync {
    /// Strategy name, used in logs and inspection
    fn name(&self) -> &'static str;

    /// Higher priorities are tried first
    fn priority(&self) -> i32;

    /// Whether this strategy can compile `statements`
    fn matches(&self, statements: &[&Statement], ctx: &CompileContext<'_>) -> bool;

    /// Build the block for `statements`
    fn compile(
        &self,
        statements: &[&Statement],
        ctx: &CompileContext<'_>,
    ) -> CompileResult<RuntimeBlock>;
}

/// Priority-ordered strategy registry
#[derive(Clone, Default)]
pub struct JitCompiler {
    strategies: Vec<Arc<dyn Strategy>>,
}

impl JitCompiler {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a strategy, keeping descending priority order.
    ///
    /// Strategies with equal priority keep their registration order.
    pub fn register(&mut self, strategy: Arc<dyn Strategy>) {
        let position = self
            .strategies
            .iter()
            .position(|existing| existing.priority() < strategy.priority())
            .unwrap_or(self.strategies.len());
        tracing::trace!(strategy = strategy.name(), priority = strategy.priority(), position, "register strategy");
        self.strategies.insert(position, strategy);
    }

    /// Builder-style registration
    pub fn with(mut self, strategy: impl Strategy + 'static) -> Self {
        self.register(Arc::new(strategy));
        self
    }

    /// Whether a strategy with this name is registered
    pub fn has_strategy(&self, name: &str) -> bool {
        self.strategies.iter().any(|s| s.name() == name)
    }

    /// Strategy names in evaluation order
    pub fn list_strategies(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Name of the first strategy that matches `statements`
    pub fn select(&self, statements: &[&Statement], ctx: &CompileContext<'_>) -> Option<&'static str> {
        self.strategies
            .iter()
            .find(|s| s.matches(statements, ctx))
            .map(|s| s.name())
    }

    /// Compile already-resolved statements
    pub fn compile_statements(
        &self,
        statements: &[&Statement],
        ctx: &CompileContext<'_>,
    ) -> CompileResult<RuntimeBlock> {
        if statements.is_empty() {
            return Err(CompileError::EmptyGroup);
        }

        for strategy in &self.strategies {
            if !strategy.matches(statements, ctx) {
                continue;
            }
            match strategy.compile(statements, ctx) {
                Ok(block) => {
                    tracing::debug!(
                        strategy = strategy.name(),
                        block = %block.key(),
                        statements = ?block.source_ids(),
                        "compiled block"
                    );
                    return Ok(block);
                }
                Err(err) => {
                    tracing::debug!(strategy = strategy.name(), error = %err, "strategy failed, trying next");
                }
            }
        }

        Err(CompileError::NoStrategy {
            statement_ids: statements.iter().map(|s| s.id).collect(),
        })
    }

    /// Resolve `statement_ids` against the script and compile them
    pub fn compile(
        &self,
        statement_ids: &[StatementId],
        ctx: &CompileContext<'_>,
    ) -> CompileResult<RuntimeBlock> {
        let statements = ctx.script.resolve(statement_ids)?;
        self.compile_statements(&statements, ctx)
    }
}
