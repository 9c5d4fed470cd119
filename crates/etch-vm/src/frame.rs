//! Call frames.

use etch_core::{Reg, Value};

/// Who receives a frame's results when it returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caller {
    /// An ordinary bytecode caller: results are written into its register
    /// file starting at `result_base`.
    Frame {
        /// First receiving register in the caller.
        result_base: Reg,
        /// Result count fixed by the callee's signature.
        expected: u8,
    },
    /// The embedding host (or the synthetic entry invocation): results are
    /// captured on the VM for pickup.
    Host {
        /// Result count the host expects.
        expected: u8,
    },
}

/// One entry of the call stack.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Function table index this frame executes.
    pub func: u32,
    /// Fixed-size register file, length per the function's `reg_count`.
    pub regs: Vec<Value>,
    /// Where execution resumes in the caller.
    pub return_pc: u32,
    /// Result routing.
    pub caller: Caller,
    /// Dynamic source line, refreshed from debug info on every step.
    pub line: u32,
}

impl Frame {
    /// Fresh frame with nil-initialized registers.
    pub fn new(func: u32, reg_count: u16, return_pc: u32, caller: Caller) -> Self {
        Self { func, regs: vec![Value::Nil; reg_count as usize], return_pc, caller, line: 0 }
    }
}
