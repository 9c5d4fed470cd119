//! etch-vm — the Etch register virtual machine.
//!
//! Executes an immutable [`etch_core::Program`] over a reference-counted
//! heap. The pieces:
//!
//! - [`heap`]   : objects, refcounts, weak refs, the EdgeBuffer
//! - [`cycles`] : reachability + Tarjan SCC cycle reclamation
//! - [`verify`] : heap self-verification, recovery, quick health check
//! - [`frame`]  : call frames and result routing
//! - [`vm`]     : the dispatch loop and the instruction callback
//! - [`display`]: canonical value rendering
//!
//! A VM instance is strictly single-threaded; the only suspension point is
//! the instruction callback, which is also the only coupling with the
//! debugger.

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]

use std::fmt;

use thiserror::Error;

pub mod cycles;
pub mod display;
pub mod frame;
pub mod heap;
pub mod verify;
pub mod vm;

pub use cycles::Cycle;
pub use frame::{Caller, Frame};
pub use heap::{EdgeKind, Heap, HeapObject, ObjKind, Slots};
pub use verify::{HeapIssue, HeapReport, IssueKind, Severity};
pub use vm::{Captured, HostFn, InstrCallback, RunOutcome, Tick, Vm, VmState};

/// What went wrong, independent of where.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VmErrorKind {
    /// Integer division or remainder by zero. The prover should have made
    /// this impossible; the VM guards anyway.
    #[error("integer division by zero")]
    DivByZero,
    /// Checked integer overflow (`i64::MIN / -1`).
    #[error("integer overflow")]
    Overflow,
    /// Array access outside `0..len`.
    #[error("index {index} out of bounds (length {len})")]
    IndexOutOfBounds {
        /// The offending index.
        index: i64,
        /// The container length.
        len: usize,
    },
    /// Dereference of nil.
    #[error("nil dereference")]
    NilDeref,
    /// Dereference of an invalidated weak reference.
    #[error("dereference of invalidated weak reference")]
    InvalidWeak,
    /// The heap broke an invariant that recovery could not fix.
    #[error("heap corruption: {0}")]
    HeapCorruption(String),
    /// Should-not-happen class: runtime type confusion, arity drift,
    /// unknown globals. These are compiler bugs surfacing at runtime.
    #[error("internal error: {0}")]
    Internal(String),
}

impl VmErrorKind {
    /// Standard message for a read through a dead id.
    pub fn dangling(id: etch_core::HeapId) -> Self {
        VmErrorKind::HeapCorruption(format!("dangling reference to object #{id}"))
    }
}

/// Source position attached to a fatal error, resolved from debug info at
/// the failing pc.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLoc {
    /// Source file path.
    pub file: String,
    /// 1-based line.
    pub line: u32,
    /// 1-based column.
    pub col: u32,
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.col)
    }
}

/// A fatal VM error: kind + pc + source position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmError {
    /// What went wrong.
    pub kind: VmErrorKind,
    /// Instruction index of the failing instruction.
    pub pc: u32,
    /// Source position, when debug info covers the pc.
    pub location: Option<SourceLoc>,
}

impl VmError {
    /// Error without a position (failures outside instruction dispatch).
    pub fn bare(kind: VmErrorKind) -> Self { Self { kind, pc: 0, location: None } }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(loc) => write!(f, "{} at {} (pc {})", self.kind, loc, self.pc),
            None => write!(f, "{} (pc {})", self.kind, self.pc),
        }
    }
}

impl std::error::Error for VmError {}
