//! Error taxonomy and control-flow signals for the evaluator.
//!
//! `WandelscriptError` is the single typed-fault enum the whole crate threads
//! through `Result`, with `Display`/`Error` derived via `thiserror`. `Signal`
//! is deliberately a separate, non-`Error` type: it carries
//! `break`/`return`/program-termination out of block evaluation and must
//! never be caught by a `?` that only expects faults.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::value::Value;

/// A half-open `[start, end)` region of source text, in 1-based line/column.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRange {
    pub start_line: usize,
    pub start_column: usize,
    pub end_line: usize,
    pub end_column: usize,
}

impl SourceRange {
    pub fn at(line: usize, column: usize) -> Self {
        SourceRange { start_line: line, start_column: column, end_line: line, end_column: column }
    }
}

fn location_prefix(location: &Option<SourceRange>) -> String {
    match location {
        Some(range) => format!("at line {} column {}: ", range.start_line, range.start_column),
        None => String::new(),
    }
}

/// The error taxonomy of §7: every variant carries an optional source range.
#[derive(Debug, Clone, Error)]
pub enum WandelscriptError {
    #[error("{}{message}", location_prefix(location))]
    Syntax { location: Option<SourceRange>, message: String },
    #[error("{}Variable or function not defined: {name}", location_prefix(location))]
    Name { location: Option<SourceRange>, name: String },
    #[error("{}{message}", location_prefix(location))]
    Type { location: Option<SourceRange>, message: String },
    #[error("{}{message}", location_prefix(location))]
    Motion { location: Option<SourceRange>, message: String },
    #[error("{}{message}", location_prefix(location))]
    NotPlannable { location: Option<SourceRange>, message: String },
    #[error("{}{message}", location_prefix(location))]
    WrongRobot { location: Option<SourceRange>, message: String },
    #[error("{}Explicit and implicit sync within the robot context is not supported yet", location_prefix(location))]
    NestedSync { location: Option<SourceRange> },
    #[error("{}{message}", location_prefix(location))]
    Configuration { location: Option<SourceRange>, message: String },
    #[error("{}User defined error: '{message}'", location_prefix(location))]
    User { location: Option<SourceRange>, message: String },
    #[error("{}{message}", location_prefix(location))]
    Generic { location: Option<SourceRange>, message: String },
}

impl WandelscriptError {
    pub fn location(&self) -> Option<SourceRange> {
        match self {
            WandelscriptError::Syntax { location, .. }
            | WandelscriptError::Name { location, .. }
            | WandelscriptError::Type { location, .. }
            | WandelscriptError::Motion { location, .. }
            | WandelscriptError::NotPlannable { location, .. }
            | WandelscriptError::WrongRobot { location, .. }
            | WandelscriptError::NestedSync { location }
            | WandelscriptError::Configuration { location, .. }
            | WandelscriptError::User { location, .. }
            | WandelscriptError::Generic { location, .. } => *location,
        }
    }

    pub fn syntax(location: SourceRange, message: impl ToString) -> Self {
        WandelscriptError::Syntax { location: Some(location), message: message.to_string() }
    }

    pub fn name(location: SourceRange, name: impl ToString) -> Self {
        WandelscriptError::Name { location: Some(location), name: name.to_string() }
    }

    pub fn ty(location: SourceRange, message: impl ToString) -> Self {
        WandelscriptError::Type { location: Some(location), message: message.to_string() }
    }

    pub fn motion(location: Option<SourceRange>, message: impl ToString) -> Self {
        WandelscriptError::Motion { location, message: message.to_string() }
    }

    pub fn not_plannable(location: Option<SourceRange>, message: impl ToString) -> Self {
        WandelscriptError::NotPlannable { location, message: message.to_string() }
    }

    pub fn wrong_robot(location: Option<SourceRange>, message: impl ToString) -> Self {
        WandelscriptError::WrongRobot { location, message: message.to_string() }
    }

    pub fn nested_sync(location: SourceRange) -> Self {
        WandelscriptError::NestedSync { location: Some(location) }
    }

    pub fn configuration(message: impl ToString) -> Self {
        WandelscriptError::Configuration { location: None, message: message.to_string() }
    }

    pub fn user(location: Option<SourceRange>, message: impl ToString) -> Self {
        WandelscriptError::User { location, message: message.to_string() }
    }

    pub fn generic(location: Option<SourceRange>, message: impl ToString) -> Self {
        WandelscriptError::Generic { location, message: message.to_string() }
    }

    /// Only `sync do:/except:` blocks are allowed to catch these (§7).
    pub fn is_catchable_in_sync_except(&self) -> bool {
        matches!(self, WandelscriptError::Motion { .. } | WandelscriptError::User { .. })
    }
}

/// Control-flow signals. These are not faults and must never surface to a
/// `ProgramRun` as an error; the evaluator strips them at block/loop/function
/// boundaries.
#[derive(Debug, Clone)]
pub enum Signal {
    Break,
    Return(Value),
    Termination,
}

/// What a statement/expression evaluation can produce: a value, a fault, or a
/// control-flow signal unwinding through the current scope.
pub type EvalResult<T> = Result<T, Unwind>;

#[derive(Debug, Clone)]
pub enum Unwind {
    Error(WandelscriptError),
    Signal(Signal),
}

impl From<WandelscriptError> for Unwind {
    fn from(err: WandelscriptError) -> Self {
        Unwind::Error(err)
    }
}

impl From<Signal> for Unwind {
    fn from(signal: Signal) -> Self {
        Unwind::Signal(signal)
    }
}
