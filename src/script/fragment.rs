//! Typed statement fragments and origin precedence
//!
//! A fragment is one typed attribute of a statement or block (duration, reps,
//! label). Several fragments of the same type may coexist; the origin tag
//! decides which one wins.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a fragment value came from.
///
/// Ordering is precedence: `Runtime > Compiler > Parser`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum FragmentOrigin {
    /// Declared in the script text
    #[default]
    Parser,
    /// Inferred while compiling a block
    Compiler,
    /// Observed while the block was running
    Runtime,
}

/// Direction a timer counts in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerDirection {
    /// Counts up from zero
    #[default]
    Up,
    /// Counts down from a duration
    Down,
}

/// Discriminant of [`FragmentValue`], used for lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentType {
    /// Timer duration / direction
    Timer,
    /// Repetition count
    Rep,
    /// Rounds count, optionally with a rep scheme
    Rounds,
    /// Exercise / effort label
    Effort,
    /// Distance
    Distance,
    /// Load
    Resistance,
    /// Named action (e.g. "rest")
    Action,
    /// Counter increment
    Increment,
    /// Lap / group marker
    Lap,
    /// Free text
    Text,
}

/// How a statement groups with its siblings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LapKind {
    /// `+` compose with the previous sibling
    Compose,
    /// `-` start a new round
    Round,
    /// Plain repeat
    Repeat,
}

/// Typed fragment payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FragmentValue {
    /// Timer, bound when `duration_ms` is present
    Timer {
        /// Duration in milliseconds
        #[serde(default)]
        duration_ms: Option<u64>,
        /// Count direction
        #[serde(default)]
        direction: TimerDirection,
    },
    /// Repetitions
    Rep {
        /// Count
        count: u32,
    },
    /// Rounds, with an optional per-round rep scheme ("21-15-9")
    Rounds {
        /// Number of rounds
        count: u32,
        /// Reps assigned to each round
        #[serde(default)]
        scheme: Vec<u32>,
    },
    /// Effort / exercise label
    Effort {
        /// Label text
        label: String,
    },
    /// Distance
    Distance {
        /// Amount
        value: f64,
        /// Unit label (m, km, mi)
        unit: String,
    },
    /// Load
    Resistance {
        /// Amount
        value: f64,
        /// Unit label (kg, lb)
        unit: String,
    },
    /// Named action
    Action {
        /// Action name
        name: String,
    },
    /// Counter increment
    Increment {
        /// Signed step
        step: i32,
    },
    /// Lap marker
    Lap {
        /// Grouping kind
        kind: LapKind,
    },
    /// Free text
    Text {
        /// Text content
        text: String,
    },
}

impl FragmentValue {
    /// The discriminant of this value
    pub fn fragment_type(&self) -> FragmentType {
        match self {
            FragmentValue::Timer { .. } => FragmentType::Timer,
            FragmentValue::Rep { .. } => FragmentType::Rep,
            FragmentValue::Rounds { .. } => FragmentType::Rounds,
            FragmentValue::Effort { .. } => FragmentType::Effort,
            FragmentValue::Distance { .. } => FragmentType::Distance,
            FragmentValue::Resistance { .. } => FragmentType::Resistance,
            FragmentValue::Action { .. } => FragmentType::Action,
            FragmentValue::Increment { .. } => FragmentType::Increment,
            FragmentValue::Lap { .. } => FragmentType::Lap,
            FragmentValue::Text { .. } => FragmentType::Text,
        }
    }
}

/// A typed value with an origin tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    /// Payload
    #[serde(flatten)]
    pub value: FragmentValue,
    /// Origin used for precedence
    #[serde(default)]
    pub origin: FragmentOrigin,
}

impl Fragment {
    /// A parser-declared fragment
    pub fn parsed(value: FragmentValue) -> Self {
        Self {
            value,
            origin: FragmentOrigin::Parser,
        }
    }

    /// A compiler-inferred fragment
    pub fn compiled(value: FragmentValue) -> Self {
        Self {
            value,
            origin: FragmentOrigin::Compiler,
        }
    }

    /// A runtime-observed fragment
    pub fn observed(value: FragmentValue) -> Self {
        Self {
            value,
            origin: FragmentOrigin::Runtime,
        }
    }

    /// Shorthand for the payload type
    pub fn fragment_type(&self) -> FragmentType {
        self.value.fragment_type()
    }
}

impl fmt::Display for Fragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            FragmentValue::Timer { duration_ms, direction } => match duration_ms {
                Some(ms) => {
                    let secs = ms / 1000;
                    let arrow = match direction {
                        TimerDirection::Up => "^",
                        TimerDirection::Down => "",
                    };
                    write!(f, "{}{}:{:02}", arrow, secs / 60, secs % 60)
                }
                None => write!(f, ":?"),
            },
            FragmentValue::Rep { count } => write!(f, "{}", count),
            FragmentValue::Rounds { count, scheme } if scheme.is_empty() => {
                write!(f, "({})", count)
            }
            FragmentValue::Rounds { scheme, .. } => {
                let parts: Vec<String> = scheme.iter().map(|r| r.to_string()).collect();
                write!(f, "({})", parts.join("-"))
            }
            FragmentValue::Effort { label } => write!(f, "{}", label),
            FragmentValue::Distance { value, unit } => write!(f, "{}{}", value, unit),
            FragmentValue::Resistance { value, unit } => write!(f, "{}{}", value, unit),
            FragmentValue::Action { name } => write!(f, "[:{}]", name),
            FragmentValue::Increment { step } if *step >= 0 => write!(f, "^"),
            FragmentValue::Increment { .. } => write!(f, "v"),
            FragmentValue::Lap { kind } => match kind {
                LapKind::Compose => write!(f, "+"),
                LapKind::Round => write!(f, "-"),
                LapKind::Repeat => Ok(()),
            },
            FragmentValue::Text { text } => write!(f, "{}", text),
        }
    }
}
