//! Parsed workout scripts
//!
//! The tokenizer/parser lives outside this crate. Its output is a flat list
//! of [`Statement`]s with stable numeric ids, which the runtime consumes
//! read-only. Scripts can be loaded from the parser's JSON output.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

pub mod fragment;

pub use fragment::{
    Fragment, FragmentOrigin, FragmentType, FragmentValue, LapKind, TimerDirection,
};

use crate::runtime::error::{ScriptError, ScriptResult};

/// Stable statement identifier assigned by the parser
pub type StatementId = u32;

/// One parsed unit of the workout script
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    /// Stable id
    pub id: StatementId,

    /// Ordered typed fragments
    #[serde(default)]
    pub fragments: Vec<Fragment>,

    /// Child statement ids, grouped; each group advances together
    #[serde(default)]
    pub children: Vec<Vec<StatementId>>,

    /// Parent statement, if nested
    #[serde(default)]
    pub parent: Option<StatementId>,

    /// Source line, for diagnostics
    #[serde(default)]
    pub line: Option<u32>,
}

impl Statement {
    /// Create a statement with no children
    pub fn new(id: StatementId, fragments: Vec<Fragment>) -> Self {
        Self {
            id,
            fragments,
            children: Vec::new(),
            parent: None,
            line: None,
        }
    }

    /// Builder-style helper to set child groups
    pub fn with_children(mut self, children: Vec<Vec<StatementId>>) -> Self {
        self.children = children;
        self
    }

    /// First fragment of the given type
    pub fn fragment(&self, kind: FragmentType) -> Option<&Fragment> {
        self.fragments.iter().find(|f| f.fragment_type() == kind)
    }

    /// Whether any fragment of the given type is present
    pub fn has_fragment(&self, kind: FragmentType) -> bool {
        self.fragment(kind).is_some()
    }

    /// Whether this statement has any children
    pub fn has_children(&self) -> bool {
        self.children.iter().any(|group| !group.is_empty())
    }

    /// Human readable label built from the fragments
    pub fn label(&self) -> String {
        let parts: Vec<String> = self
            .fragments
            .iter()
            .map(|f| f.to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if parts.is_empty() {
            format!("statement {}", self.id)
        } else {
            parts.join(" ")
        }
    }
}

/// An immutable parsed script
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "ScriptFile", into = "ScriptFile")]
pub struct WodScript {
    statements: Vec<Statement>,
    index: HashMap<StatementId, usize>,
}

#[derive(Serialize, Deserialize)]
struct ScriptFile {
    statements: Vec<Statement>,
}

impl From<ScriptFile> for WodScript {
    fn from(file: ScriptFile) -> Self {
        let index = file
            .statements
            .iter()
            .enumerate()
            .map(|(pos, s)| (s.id, pos))
            .collect();
        Self {
            statements: file.statements,
            index,
        }
    }
}

impl From<WodScript> for ScriptFile {
    fn from(script: WodScript) -> Self {
        Self {
            statements: script.statements,
        }
    }
}

impl WodScript {
    /// Build a script from parsed statements, validating ids and child references
    pub fn new(statements: Vec<Statement>) -> ScriptResult<Self> {
        let mut index = HashMap::with_capacity(statements.len());
        for (pos, statement) in statements.iter().enumerate() {
            if index.insert(statement.id, pos).is_some() {
                return Err(ScriptError::DuplicateId(statement.id));
            }
        }

        for statement in &statements {
            for child in statement.children.iter().flatten() {
                if !index.contains_key(child) {
                    return Err(ScriptError::UnknownChild {
                        parent: statement.id,
                        child: *child,
                    });
                }
            }
        }

        Ok(Self { statements, index })
    }

    /// Parse the parser's JSON output (`{"statements": [...]}`)
    pub fn from_json(json: &str) -> ScriptResult<Self> {
        let file: ScriptFile = serde_json::from_str(json)?;
        Self::new(file.statements)
    }

    /// Load a script from a JSON file
    pub fn load(path: &Path) -> ScriptResult<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json(&data)
    }

    /// Look up a statement by id
    pub fn get(&self, id: StatementId) -> Option<&Statement> {
        self.index.get(&id).map(|pos| &self.statements[*pos])
    }

    /// Resolve a group of ids, in order, skipping none
    pub fn resolve(&self, ids: &[StatementId]) -> ScriptResult<Vec<&Statement>> {
        ids.iter()
            .map(|id| self.get(*id).ok_or(ScriptError::UnknownStatement(*id)))
            .collect()
    }

    /// All statements in parse order
    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    /// Top-level statements (not referenced as anyone's child), in parse order
    pub fn roots(&self) -> Vec<&Statement> {
        let nested: HashSet<StatementId> = self
            .statements
            .iter()
            .flat_map(|s| s.children.iter().flatten().copied())
            .collect();
        self.statements
            .iter()
            .filter(|s| s.parent.is_none() && !nested.contains(&s.id))
            .collect()
    }

    /// Number of statements
    pub fn len(&self) -> usize {
        self.statements.len()
    }

    /// Whether the script has no statements
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }
}
