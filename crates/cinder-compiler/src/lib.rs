//! Pipeline compiler.
//!
//! Turns raw pipeline text into one [`JobSpec`] per matrix axis. Only the
//! branch filter and the matrix are read from the raw text, in that order.
//! Each axis then gets its own substitution, typed parse, lint and rendering.

pub mod compiler;
pub mod constraint;
pub mod envsubst;
pub mod linter;
pub mod matrix;
pub mod metadata;
pub mod plan;
pub mod yaml;

pub use compiler::{CompileOutcome, CompileRequest, Compiler, CompilerOptions, JobSpec};
pub use constraint::Constraint;
pub use matrix::{Matrix, MatrixLimits};
pub use plan::{ExecutionPlan, PlanSecret, StepPlan};
pub use yaml::{Container, Document, Outline};
