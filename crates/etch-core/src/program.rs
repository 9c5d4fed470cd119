//! The immutable bytecode artifact the VM executes.
//!
//! A `Program` is instructions + constant pool + function table + per-pc
//! debug info + source file table + entry point. It never changes after
//! loading. `ProgramBuilder` is the write-side used by the compiler bridge
//! and by tests.

use crate::instr::{Instr, Reg};
use crate::value::Value;
use crate::{mangle, CoreError, CoreResult};

/// Name of the synthetic function that runs top-level initializers before
/// any user-declared `main` executes.
pub const GLOBAL_FUNCTION: &str = "<global>";

/* ─────────────────────────── Constant pool ─────────────────────────── */

/// Constant pool with stable 0-based indices. Only scalar value kinds are
/// admissible (nil, bool, int, float, char, string).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConstPool {
    values: Vec<Value>,
}

impl ConstPool {
    /// Create an empty pool.
    pub fn new() -> Self { Self { values: Vec::new() } }

    /// Number of stored constants.
    pub fn len(&self) -> usize { self.values.len() }

    /// Whether the pool is empty.
    pub fn is_empty(&self) -> bool { self.values.is_empty() }

    /// Pushes a value and returns its index. Re-uses an existing slot when
    /// an equal constant is already present.
    pub fn add(&mut self, value: Value) -> u32 {
        if let Some(pos) = self.values.iter().position(|v| *v == value) {
            return pos as u32;
        }
        let idx = self.values.len() as u32;
        self.values.push(value);
        idx
    }

    /// Pushes a value without deduplication. Loaders use this so decoded
    /// indices survive as-is.
    pub fn push_unchecked(&mut self, value: Value) -> u32 {
        let idx = self.values.len() as u32;
        self.values.push(value);
        idx
    }

    /// Lookup a constant by index.
    pub fn get(&self, idx: u32) -> Option<&Value> { self.values.get(idx as usize) }

    /// Iterate over `(index, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &Value)> {
        self.values.iter().enumerate().map(|(i, v)| (i as u32, v))
    }

    /// True when `value` is admissible as a pool entry.
    pub fn admissible(value: &Value) -> bool {
        matches!(
            value,
            Value::Nil | Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::Char(_) | Value::Str(_)
        )
    }
}

/* ─────────────────────────── Function table ─────────────────────────── */

/// One named local slot of a function (debugger display).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LocalSlot {
    /// Source-level name.
    pub name: String,
    /// Register the local lives in.
    pub reg: Reg,
}

/// Function table entry. `name` is the mangled form; display goes through
/// [`mangle::display_name`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FunctionInfo {
    /// Mangled name (external identity).
    pub name: String,
    /// First instruction index.
    pub start_pc: u32,
    /// One past the last instruction index.
    pub end_pc: u32,
    /// Register file size for a frame of this function.
    pub reg_count: u16,
    /// Named locals (name → register), for the debugger.
    pub locals: Vec<LocalSlot>,
}

impl FunctionInfo {
    /// Demangled base name for display; `<global>` stays as-is.
    pub fn display_name(&self) -> &str { mangle::display_name(&self.name) }

    /// True when `pc` falls inside this function's body.
    pub fn contains(&self, pc: u32) -> bool { pc >= self.start_pc && pc < self.end_pc }
}

/* ─────────────────────────── Debug info ─────────────────────────── */

/// Per-instruction source annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DebugEntry {
    /// Index into the source file table.
    pub file: u32,
    /// 1-based source line.
    pub line: u32,
    /// 1-based source column.
    pub col: u32,
    /// Compiler-assigned statement id. Two instructions with the same
    /// (file, line) but different stmt ids are distinct step targets.
    pub stmt: u32,
}

/* ─────────────────────────── Program ─────────────────────────── */

/// Compiled program, immutable once loaded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Program {
    /// Instruction stream.
    pub instrs: Vec<Instr>,
    /// Constant pool.
    pub consts: ConstPool,
    /// Function table.
    pub funcs: Vec<FunctionInfo>,
    /// One entry per instruction.
    pub debug: Vec<DebugEntry>,
    /// Source file paths, indexed by `DebugEntry::file`.
    pub files: Vec<String>,
    /// Instruction index execution starts at (inside `<global>`).
    pub entry_point: u32,
}

impl Program {
    /// Function table index of the function containing `pc`.
    pub fn function_at(&self, pc: u32) -> Option<(u32, &FunctionInfo)> {
        self.funcs
            .iter()
            .enumerate()
            .find(|(_, f)| f.contains(pc))
            .map(|(i, f)| (i as u32, f))
    }

    /// Function table index for a mangled name.
    pub fn function_named(&self, mangled: &str) -> Option<u32> {
        self.funcs.iter().position(|f| f.name == mangled).map(|i| i as u32)
    }

    /// Debug annotation at `pc`.
    pub fn debug_at(&self, pc: u32) -> Option<&DebugEntry> { self.debug.get(pc as usize) }

    /// Source file path for a file id.
    pub fn file_path(&self, id: u32) -> Option<&str> {
        self.files.get(id as usize).map(String::as_str)
    }

    /// Pool string at `idx`, when the entry is a string constant.
    pub fn const_str(&self, idx: u32) -> Option<&str> {
        match self.consts.get(idx) {
            Some(Value::Str(s)) => Some(s),
            _ => None,
        }
    }

    /// Structural validation: section lengths agree, pc references stay in
    /// range, pool/function indices resolve. Loaders call this after
    /// decoding; the builder calls it in `finish`.
    pub fn validate(&self) -> CoreResult<()> {
        let len = self.instrs.len() as u32;
        if self.debug.len() != self.instrs.len() {
            return Err(CoreError::invalid("debug info length differs from instruction count"));
        }
        if self.entry_point >= len && len > 0 {
            return Err(CoreError::invalid("entry point out of range"));
        }
        for f in &self.funcs {
            if f.start_pc > f.end_pc || f.end_pc > len {
                return Err(CoreError::invalid(format!("function `{}` has bad pc bounds", f.name)));
            }
            for l in &f.locals {
                if l.reg >= f.reg_count {
                    return Err(CoreError::invalid(format!(
                        "function `{}`: local `{}` outside register file",
                        f.name, l.name
                    )));
                }
            }
        }
        for d in &self.debug {
            if d.file as usize >= self.files.len() && !self.files.is_empty() {
                return Err(CoreError::invalid("debug entry references unknown source file"));
            }
        }
        for (pc, instr) in self.instrs.iter().enumerate() {
            self.validate_instr(pc as u32, instr, len)?;
        }
        Ok(())
    }

    fn validate_instr(&self, pc: u32, instr: &Instr, len: u32) -> CoreResult<()> {
        let check_const = |idx: u32| -> CoreResult<()> {
            if self.consts.get(idx).is_none() {
                return Err(CoreError::invalid(format!("pc {pc}: constant index {idx} out of range")));
            }
            Ok(())
        };
        let check_name = |idx: u32| -> CoreResult<()> {
            match self.consts.get(idx) {
                Some(Value::Str(_)) => Ok(()),
                _ => Err(CoreError::invalid(format!("pc {pc}: name index {idx} is not a string constant"))),
            }
        };
        let check_jump = |offset: i32| -> CoreResult<()> {
            let target = pc as i64 + 1 + offset as i64;
            if target < 0 || target > len as i64 {
                return Err(CoreError::invalid(format!("pc {pc}: jump target {target} out of range")));
            }
            Ok(())
        };
        match *instr {
            Instr::LoadConst { idx, .. } => check_const(idx),
            Instr::LoadGlobal { name, .. } | Instr::InitGlobal { name, .. } => check_name(name),
            Instr::GetField { name, .. } | Instr::SetField { name, .. } => check_name(name),
            Instr::Jump { offset }
            | Instr::JumpIf { offset, .. }
            | Instr::JumpIfNot { offset, .. }
            | Instr::JumpIfNone { offset, .. }
            | Instr::JumpIfErr { offset, .. } => check_jump(offset),
            Instr::Call { func, .. } => {
                if func as usize >= self.funcs.len() {
                    return Err(CoreError::invalid(format!("pc {pc}: call to unknown function {func}")));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/* ─────────────────────────── Builder ─────────────────────────── */

/// Write-side for `Program`: the compiler bridge emits through this, and
/// tests assemble programs by hand with it.
#[derive(Debug, Default)]
pub struct ProgramBuilder {
    instrs: Vec<Instr>,
    consts: ConstPool,
    funcs: Vec<FunctionInfo>,
    debug: Vec<DebugEntry>,
    files: Vec<String>,
    open: Option<usize>,
    entry_override: Option<u32>,
}

impl ProgramBuilder {
    /// Fresh, empty builder.
    pub fn new() -> Self { Self::default() }

    /// Registers a source file and returns its id (re-used when known).
    pub fn file(&mut self, path: impl Into<String>) -> u32 {
        let path = path.into();
        if let Some(pos) = self.files.iter().position(|f| *f == path) {
            return pos as u32;
        }
        self.files.push(path);
        (self.files.len() - 1) as u32
    }

    /// Adds a constant, returning its pool index.
    pub fn constant(&mut self, value: Value) -> u32 { self.consts.add(value) }

    /// Opens a function; instructions emitted until `end_function` belong
    /// to it. Panics if a function is already open (builder misuse, not a
    /// runtime condition).
    pub fn begin_function(&mut self, mangled: impl Into<String>, reg_count: u16) -> u32 {
        assert!(self.open.is_none(), "begin_function while a function is open");
        let idx = self.funcs.len();
        self.funcs.push(FunctionInfo {
            name: mangled.into(),
            start_pc: self.instrs.len() as u32,
            end_pc: self.instrs.len() as u32,
            reg_count,
            locals: Vec::new(),
        });
        self.open = Some(idx);
        idx as u32
    }

    /// Names a local register of the open function.
    pub fn local(&mut self, name: impl Into<String>, reg: Reg) {
        let idx = self.open.expect("local outside a function");
        self.funcs[idx].locals.push(LocalSlot { name: name.into(), reg });
    }

    /// Emits one instruction with its debug annotation; returns its pc.
    pub fn emit(&mut self, instr: Instr, at: DebugEntry) -> u32 {
        let pc = self.instrs.len() as u32;
        self.instrs.push(instr);
        self.debug.push(at);
        pc
    }

    /// Rewrites the instruction at `pc` (jump back-patching).
    pub fn patch(&mut self, pc: u32, instr: Instr) {
        self.instrs[pc as usize] = instr;
    }

    /// Next pc to be emitted.
    pub fn here(&self) -> u32 { self.instrs.len() as u32 }

    /// Closes the open function.
    pub fn end_function(&mut self) {
        let idx = self.open.take().expect("end_function without begin_function");
        self.funcs[idx].end_pc = self.instrs.len() as u32;
    }

    /// Overrides the entry point (defaults to the start of `<global>`).
    pub fn set_entry(&mut self, pc: u32) { self.entry_override = Some(pc); }

    /// Validates and seals the program.
    pub fn finish(self) -> CoreResult<Program> {
        if self.open.is_some() {
            return Err(CoreError::invalid("finish with an open function"));
        }
        let entry_point = match self.entry_override {
            Some(pc) => pc,
            None => self
                .funcs
                .iter()
                .find(|f| f.name == GLOBAL_FUNCTION)
                .map(|f| f.start_pc)
                .unwrap_or(0),
        };
        let program = Program {
            instrs: self.instrs,
            consts: self.consts,
            funcs: self.funcs,
            debug: self.debug,
            files: self.files,
            entry_point,
        };
        program.validate()?;
        Ok(program)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(file: u32, line: u32, stmt: u32) -> DebugEntry {
        DebugEntry { file, line, col: 1, stmt }
    }

    #[test]
    fn pool_dedups() {
        let mut pool = ConstPool::new();
        let a = pool.add(Value::Int(1));
        let b = pool.add(Value::str("x"));
        let c = pool.add(Value::Int(1));
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn build_and_lookup() {
        let mut b = ProgramBuilder::new();
        let f = b.file("main.etch");
        let k = b.constant(Value::Int(30));
        b.begin_function(GLOBAL_FUNCTION, 1);
        b.emit(Instr::Call { func: 1, num_args: 0, num_results: 0, first_arg: 0, first_result: 0 }, at(f, 1, 0));
        b.emit(Instr::Return { first: 0, count: 0 }, at(f, 1, 0));
        b.end_function();
        b.begin_function("main$_v", 2);
        b.local("a", 0);
        b.emit(Instr::LoadConst { dst: 0, idx: k }, at(f, 2, 1));
        b.emit(Instr::Print { src: 0 }, at(f, 3, 2));
        b.emit(Instr::Return { first: 0, count: 0 }, at(f, 3, 2));
        b.end_function();
        let p = b.finish().unwrap();

        assert_eq!(p.entry_point, 0);
        assert_eq!(p.function_named("main$_v"), Some(1));
        let (idx, func) = p.function_at(3).unwrap();
        assert_eq!(idx, 1);
        assert_eq!(func.display_name(), "main");
        assert_eq!(p.debug_at(3).unwrap().line, 3);
    }

    #[test]
    fn validation_catches_bad_jump() {
        let mut b = ProgramBuilder::new();
        let f = b.file("a.etch");
        b.begin_function(GLOBAL_FUNCTION, 1);
        b.emit(Instr::Jump { offset: 100 }, at(f, 1, 0));
        b.end_function();
        assert!(b.finish().is_err());
    }

    #[test]
    fn validation_catches_bad_name_index() {
        let mut b = ProgramBuilder::new();
        let f = b.file("a.etch");
        let k = b.constant(Value::Int(3));
        b.begin_function(GLOBAL_FUNCTION, 1);
        b.emit(Instr::InitGlobal { src: 0, name: k }, at(f, 1, 0));
        b.emit(Instr::Return { first: 0, count: 0 }, at(f, 1, 0));
        b.end_function();
        assert!(b.finish().is_err());
    }

    #[test]
    fn validation_catches_local_outside_registers() {
        let mut b = ProgramBuilder::new();
        let f = b.file("a.etch");
        b.begin_function(GLOBAL_FUNCTION, 1);
        b.local("x", 5);
        b.emit(Instr::Return { first: 0, count: 0 }, at(f, 1, 0));
        b.end_function();
        assert!(b.finish().is_err());
    }
}
