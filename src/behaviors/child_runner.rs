//! Lazy child advancement for container blocks

use crate::runtime::actions::{AdvanceBlockAction, BoxedAction, PushBlockAction, SetMemoryAction};
use crate::runtime::behavior::{Behavior, BehaviorContext};
use crate::runtime::error::{BehaviorResult, CompileError};
use crate::runtime::memory::{MemoryRef, MemoryValue, Visibility};
use crate::script::{Fragment, FragmentValue, StatementId};

/// Memory type under which the current round is published
pub const ROUNDS_MEMORY: &str = "rounds";

/// Completion reason when a full pass over the groups compiled nothing
pub const NO_COMPILABLE_CHILDREN: &str = "no-compilable-children";

/// Compiles and pushes one child group per `next`, in order.
///
/// Mounting asks for one advance so the container enters its first child
/// as part of being pushed. Children stay uncompiled statement references
/// until the cursor reaches them. Groups without a matching strategy are
/// skipped; a full pass that compiles nothing completes the block. With rounds, the group list is repeated; the cursor walks the
/// flattened `groups x rounds` positions and only ever moves forward.
#[derive(Debug, Clone)]
pub struct ChildRunnerBehavior {
    groups: Vec<Vec<StatementId>>,
    rounds: u32,
    rep_scheme: Vec<u32>,
    cursor: usize,
    rounds_ref: Option<MemoryRef>,
}

impl ChildRunnerBehavior {
    /// Run `groups` once
    pub fn new(groups: Vec<Vec<StatementId>>) -> Self {
        Self {
            groups,
            rounds: 1,
            rep_scheme: Vec::new(),
            cursor: 0,
            rounds_ref: None,
        }
    }

    /// Repeat the groups `rounds` times
    pub fn with_rounds(mut self, rounds: u32) -> Self {
        self.rounds = rounds;
        self
    }

    /// Assign per-round rep counts to pushed children ("21-15-9").
    ///
    /// Rounds past the end of the scheme reuse its last entry.
    pub fn with_rep_scheme(mut self, scheme: Vec<u32>) -> Self {
        self.rep_scheme = scheme;
        self
    }

    /// Position of the next child to compile
    pub fn current_child_index(&self) -> usize {
        self.cursor
    }

    /// Total positions (`groups x rounds`)
    pub fn child_count(&self) -> usize {
        self.groups.len().saturating_mul(self.rounds as usize)
    }

    /// Configured rounds
    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    /// 1-based round of the most recently pushed child (0 before the first)
    pub fn current_round(&self) -> u32 {
        match (self.cursor, self.groups.len()) {
            (0, _) | (_, 0) => 0,
            (cursor, groups) => ((cursor - 1) / groups) as u32 + 1,
        }
    }

    fn reps_for_round(&self, round: usize) -> Option<u32> {
        self.rep_scheme
            .get(round)
            .or_else(|| self.rep_scheme.last())
            .copied()
    }
}

impl Behavior for ChildRunnerBehavior {
    fn name(&self) -> &'static str {
        "child-runner"
    }

    fn on_mount(&mut self, ctx: &mut BehaviorContext<'_>) -> BehaviorResult<Vec<BoxedAction>> {
        if self.child_count() == 0 {
            ctx.mark_complete("no-children");
            return Ok(Vec::new());
        }
        if self.rounds > 1 {
            self.rounds_ref = Some(ctx.allocate(
                ROUNDS_MEMORY,
                MemoryValue::Integer(0),
                Visibility::Public,
            ));
        }
        Ok(vec![Box::new(AdvanceBlockAction::new(ctx.key()))])
    }

    fn on_next(&mut self, ctx: &mut BehaviorContext<'_>) -> BehaviorResult<Vec<BoxedAction>> {
        if ctx.is_complete() {
            return Ok(Vec::new());
        }

        let total = self.child_count();
        let mut skipped = 0;
        while self.cursor < total {
            let group_count = self.groups.len();
            let position = self.cursor;
            let round = position / group_count;
            let group = &self.groups[position % group_count];
            self.cursor += 1;

            match ctx.compile(group) {
                Ok(mut block) => {
                    if let Some(count) = self.reps_for_round(round) {
                        block.add_fragment(Fragment::compiled(FragmentValue::Rep { count }));
                    }

                    tracing::debug!(
                        parent = %ctx.key(),
                        child = %block.key(),
                        position,
                        round = round + 1,
                        "advance to child"
                    );

                    let mut actions: Vec<BoxedAction> = Vec::new();
                    if let Some(reference) = &self.rounds_ref {
                        actions.push(Box::new(SetMemoryAction::new(
                            reference.clone(),
                            MemoryValue::Integer(round as i64 + 1),
                        )));
                    }
                    actions.push(Box::new(PushBlockAction::at(block, ctx.now())));
                    return Ok(actions);
                }
                Err(CompileError::NoStrategy { statement_ids }) => {
                    tracing::warn!(
                        parent = %ctx.key(),
                        statements = ?statement_ids,
                        "no strategy for child group, skipping"
                    );
                    skipped += 1;
                    if skipped >= group_count {
                        tracing::warn!(parent = %ctx.key(), "no child group compiles, completing");
                        ctx.mark_complete(NO_COMPILABLE_CHILDREN);
                        return Ok(Vec::new());
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }

        ctx.mark_complete("children-complete");
        Ok(Vec::new())
    }
}
