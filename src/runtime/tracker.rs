//! Execution tracking and host-facing output
//!
//! Every push opens an execution record linked to its parent block; every
//! pop closes it and emits a segment [`OutputStatement`]. Sounds and other
//! notices flow through the same output channel.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::block::RuntimeBlock;
use super::clock::{TimeSpan, Timestamp};
use super::ids::{BlockKey, IdSequence, SubscriptionId};
use crate::script::{Fragment, StatementId};

/// What an output statement describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    /// A block's completed time on the stack
    Segment,
    /// A sound cue request
    Sound,
    /// A notable point inside a block (round change, timer expiry)
    Milestone,
}

/// Output record delivered to host listeners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputStatement {
    /// Sequence number, assigned on emission
    pub id: u64,
    /// Record kind
    pub kind: OutputKind,
    /// Block the record is about
    pub block_key: BlockKey,
    /// Parent at push time
    pub parent_key: Option<BlockKey>,
    /// Stack depth at push time (root = 0)
    pub depth: usize,
    /// Originating statements
    pub source_ids: Vec<StatementId>,
    /// Block type
    pub block_type: String,
    /// Label or cue name
    pub label: String,
    /// Time on the stack, for segments
    pub span: Option<TimeSpan>,
    /// Block fragments at unmount
    pub fragments: Vec<Fragment>,
    /// Why the block finished
    pub completion_reason: Option<String>,
    /// When the record was produced
    pub timestamp: Timestamp,
}

impl OutputStatement {
    /// A non-segment record about `block`
    pub fn notice(kind: OutputKind, block: BlockKey, label: impl Into<String>, at: Timestamp) -> Self {
        Self {
            id: 0,
            kind,
            block_key: block,
            parent_key: None,
            depth: 0,
            source_ids: Vec::new(),
            block_type: String::new(),
            label: label.into(),
            span: None,
            fragments: Vec::new(),
            completion_reason: None,
            timestamp: at,
        }
    }
}

/// Listener for output statements
pub type OutputListener = Box<dyn FnMut(&OutputStatement) + Send>;

/// Tracking data for one block's time on the stack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Block
    pub key: BlockKey,
    /// Block below it when pushed
    pub parent: Option<BlockKey>,
    /// Stack depth when pushed
    pub depth: usize,
    /// Block type
    pub block_type: String,
    /// Label
    pub label: String,
    /// Originating statements
    pub source_ids: Vec<StatementId>,
    /// Push instant
    pub started: Timestamp,
    /// Pop instant
    pub ended: Option<Timestamp>,
}

impl ExecutionRecord {
    /// Span covered by the record
    pub fn span(&self) -> TimeSpan {
        TimeSpan {
            started: self.started,
            ended: self.ended,
        }
    }
}

/// Records block execution and fans output out to listeners
#[derive(Default)]
pub struct ExecutionTracker {
    active: HashMap<BlockKey, ExecutionRecord>,
    completed: Vec<ExecutionRecord>,
    outputs: Vec<OutputStatement>,
    listeners: Vec<(SubscriptionId, OutputListener)>,
    output_ids: IdSequence,
    subscription_ids: IdSequence,
}

impl ExecutionTracker {
    /// Empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a record for a freshly pushed block
    pub fn start(&mut self, block: &RuntimeBlock, parent: Option<BlockKey>, depth: usize, at: Timestamp) {
        self.active.insert(
            block.key(),
            ExecutionRecord {
                key: block.key(),
                parent,
                depth,
                block_type: block.block_type().to_string(),
                label: block.label().to_string(),
                source_ids: block.source_ids().to_vec(),
                started: block.timing().start_time.unwrap_or(at),
                ended: None,
            },
        );
    }

    /// Close the record for a popped block and emit its segment
    pub fn finish(&mut self, block: &RuntimeBlock, at: Timestamp) -> Option<OutputStatement> {
        let mut record = self.active.remove(&block.key())?;
        record.ended = Some(block.timing().end_time.unwrap_or(at));

        let statement = OutputStatement {
            id: 0,
            kind: OutputKind::Segment,
            block_key: record.key,
            parent_key: record.parent,
            depth: record.depth,
            source_ids: record.source_ids.clone(),
            block_type: record.block_type.clone(),
            label: record.label.clone(),
            span: Some(record.span()),
            fragments: block.fragments().to_vec(),
            completion_reason: block.completion_reason().map(str::to_string),
            timestamp: at,
        };
        self.completed.push(record);
        Some(self.emit(statement))
    }

    /// Assign an id, store and broadcast an output statement
    pub fn emit(&mut self, mut statement: OutputStatement) -> OutputStatement {
        statement.id = self.output_ids.next();
        tracing::debug!(
            id = statement.id,
            kind = ?statement.kind,
            block = %statement.block_key,
            label = %statement.label,
            "output"
        );
        for (_, listener) in self.listeners.iter_mut() {
            listener(&statement);
        }
        self.outputs.push(statement.clone());
        statement
    }

    /// Add an output listener
    pub fn subscribe(&mut self, listener: OutputListener) -> SubscriptionId {
        let id = SubscriptionId(self.subscription_ids.next());
        self.listeners.push((id, listener));
        id
    }

    /// Remove an output listener; unknown ids are ignored
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(existing, _)| *existing != id);
        self.listeners.len() != before
    }

    /// Every output emitted so far
    pub fn outputs(&self) -> &[OutputStatement] {
        &self.outputs
    }

    /// Open record for a block on the stack
    pub fn active_record(&self, key: BlockKey) -> Option<&ExecutionRecord> {
        self.active.get(&key)
    }

    /// Closed records in pop order
    pub fn completed(&self) -> &[ExecutionRecord] {
        &self.completed
    }
}
