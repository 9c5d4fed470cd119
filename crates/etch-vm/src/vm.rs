//! The dispatch loop.
//!
//! One instruction at a time: check termination, invoke the instruction
//! callback (the sole coupling point with the debugger — a `Pause` return
//! yields without advancing the pc), bump the counter, execute. Registers
//! hold strong references, so every register write goes through the
//! refcount-adjusting helpers here.

use std::collections::HashSet;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;

use etch_core::program::GLOBAL_FUNCTION;
use etch_core::{HeapId, Instr, Program, Reg, Value};

use crate::cycles::Cycle;
use crate::display;
use crate::frame::{Caller, Frame};
use crate::heap::{Heap, ObjKind, Slots};
use crate::{SourceLoc, VmError, VmErrorKind};

/// Lifecycle of a VM instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    /// Created, nothing pushed yet.
    Initialized,
    /// Executing.
    Running,
    /// Yielded by the instruction callback.
    Paused,
    /// Entry frame returned or a fatal error occurred.
    Terminated,
}

/// Decision of the instruction callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// Keep executing.
    Continue,
    /// Yield before this instruction; the pc does not advance.
    Pause,
}

/// Why `run` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The callback paused the VM; re-enter `run` to continue.
    Paused,
    /// The call stack drained past the entry frame.
    Terminated,
}

/// Instruction callback: invoked before every step with read access to
/// the whole VM.
pub type InstrCallback = Box<dyn FnMut(&Vm) -> Tick>;

/// Host-registered native function reachable through `CallHost`.
pub type HostFn = Box<dyn FnMut(&[Value]) -> Result<Vec<Value>, String>>;

/// The virtual machine.
pub struct Vm {
    program: Arc<Program>,
    heap: Heap,
    frames: Vec<Frame>,
    globals: IndexMap<String, Value>,
    pc: u32,
    instr_count: u64,
    state: VmState,
    callback: Option<InstrCallback>,
    stdout: Box<dyn Write + Send>,
    host_fns: Vec<HostFn>,
    host_results: Vec<Value>,
}

impl Vm {
    /// Creates a VM over an immutable program.
    pub fn new(program: Arc<Program>) -> Self {
        Self {
            program,
            heap: Heap::new(),
            frames: Vec::new(),
            globals: IndexMap::new(),
            pc: 0,
            instr_count: 0,
            state: VmState::Initialized,
            callback: None,
            stdout: Box::new(io::stdout()),
            host_fns: Vec::new(),
            host_results: Vec::new(),
        }
    }

    /* ── Introspection ── */

    /// The program under execution.
    pub fn program(&self) -> &Arc<Program> { &self.program }
    /// Current instruction index.
    pub fn pc(&self) -> u32 { self.pc }
    /// Lifecycle state.
    pub fn state(&self) -> VmState { self.state }
    /// Instructions executed so far.
    pub fn instr_count(&self) -> u64 { self.instr_count }
    /// Call stack, bottom first.
    pub fn frames(&self) -> &[Frame] { &self.frames }
    /// Call depth.
    pub fn depth(&self) -> usize { self.frames.len() }
    /// Globals, in initialization order.
    pub fn globals(&self) -> &IndexMap<String, Value> { &self.globals }
    /// The heap.
    pub fn heap(&self) -> &Heap { &self.heap }
    /// Mutable heap access (verification, recovery, explicit collection).
    pub fn heap_mut(&mut self) -> &mut Heap { &mut self.heap }

    /// Register `reg` of frame `frame_idx` (bottom-first indexing).
    pub fn register(&self, frame_idx: usize, reg: Reg) -> Option<&Value> {
        self.frames.get(frame_idx).and_then(|f| f.regs.get(reg as usize))
    }

    /// Overwrites a register, keeping refcounts straight. Used by the
    /// debugger's `setVariable`.
    pub fn set_register(&mut self, frame_idx: usize, reg: Reg, value: Value) -> Result<(), VmError> {
        self.heap.inc_value(&value);
        let old = {
            let frame = self.frames.get_mut(frame_idx).ok_or_else(|| VmError::bare(
                VmErrorKind::Internal(format!("no frame {frame_idx}")),
            ))?;
            let slot = frame.regs.get_mut(reg as usize).ok_or_else(|| VmError::bare(
                VmErrorKind::Internal(format!("register {reg} out of range")),
            ))?;
            std::mem::replace(slot, value)
        };
        self.heap.dec_value(&old);
        Ok(())
    }

    /// Reads a global by name.
    pub fn global(&self, name: &str) -> Option<&Value> { self.globals.get(name) }

    /// Binds a global by name, keeping refcounts straight.
    pub fn set_global(&mut self, name: &str, value: Value) {
        self.heap.inc_value(&value);
        if let Some(old) = self.globals.insert(name.to_string(), value) {
            self.heap.dec_value(&old);
        }
    }

    /// Mangled name of the function the pc currently sits in.
    pub fn current_function(&self) -> Option<&str> {
        self.program.function_at(self.pc).map(|(_, f)| f.name.as_str())
    }

    /// Debugger-style rendering of a value against this VM's heap.
    pub fn render_value(&self, value: &Value) -> String {
        display::render_value(&self.heap, value)
    }

    /* ── Configuration ── */

    /// Installs the instruction callback.
    pub fn set_instr_callback(&mut self, cb: InstrCallback) { self.callback = Some(cb); }

    /// Removes the instruction callback.
    pub fn clear_instr_callback(&mut self) { self.callback = None; }

    /// Redirects `Print` output.
    pub fn set_stdout(&mut self, sink: Box<dyn Write + Send>) { self.stdout = sink; }

    /// Registers a host function; returns its `CallHost` index.
    pub fn register_host_fn(&mut self, f: HostFn) -> u32 {
        self.host_fns.push(f);
        (self.host_fns.len() - 1) as u32
    }

    /* ── Entry ── */

    /// Pushes the entry frame (`<global>`) and arms execution.
    pub fn start_entry(&mut self) -> Result<(), VmError> {
        let entry = self.program.entry_point;
        let (func_idx, func) = self
            .program
            .function_at(entry)
            .ok_or_else(|| VmError::bare(VmErrorKind::Internal(
                format!("entry point {entry} is outside every function"),
            )))?;
        debug_assert_eq!(func.name, GLOBAL_FUNCTION);
        let reg_count = func.reg_count;
        self.frames.push(Frame::new(func_idx, reg_count, 0, Caller::Host { expected: 0 }));
        self.pc = entry;
        self.state = VmState::Running;
        Ok(())
    }

    /// Pushes a frame for a host-initiated call of a mangled function.
    /// Only valid between invocations (empty call stack); `run` then
    /// executes it and results land in [`Vm::take_results`].
    pub fn start_call(&mut self, mangled: &str, args: &[Value]) -> Result<(), VmError> {
        if !self.frames.is_empty() {
            return Err(VmError::bare(VmErrorKind::Internal(
                "call_function while the VM is mid-execution".into(),
            )));
        }
        let func_idx = self.program.function_named(mangled).ok_or_else(|| {
            VmError::bare(VmErrorKind::Internal(format!("no function named `{mangled}`")))
        })?;
        let func = &self.program.funcs[func_idx as usize];
        if args.len() > func.reg_count as usize {
            return Err(VmError::bare(VmErrorKind::Internal(format!(
                "`{mangled}` takes at most {} arguments, got {}",
                func.reg_count,
                args.len()
            ))));
        }
        let mut frame = Frame::new(func_idx, func.reg_count, 0, Caller::Host { expected: u8::MAX });
        let start = func.start_pc;
        for (i, arg) in args.iter().enumerate() {
            self.heap.inc_value(arg);
            frame.regs[i] = arg.clone();
        }
        self.frames.push(frame);
        self.pc = start;
        self.state = VmState::Running;
        Ok(())
    }

    /// Takes the results of the last host-initiated call (or of the entry
    /// invocation, which produces none).
    pub fn take_results(&mut self) -> Vec<Value> { std::mem::take(&mut self.host_results) }

    /* ── The loop ── */

    /// Runs until the callback pauses or the call stack drains. A fatal
    /// error terminates the VM and carries the failing source position.
    pub fn run(&mut self) -> Result<RunOutcome, VmError> {
        if self.state == VmState::Terminated {
            return Ok(RunOutcome::Terminated);
        }
        self.state = VmState::Running;
        loop {
            if self.frames.is_empty() {
                self.state = VmState::Terminated;
                return Ok(RunOutcome::Terminated);
            }
            if let Some(mut cb) = self.callback.take() {
                let tick = cb(self);
                self.callback = Some(cb);
                if tick == Tick::Pause {
                    self.state = VmState::Paused;
                    return Ok(RunOutcome::Paused);
                }
            }
            self.instr_count += 1;
            if let Err(e) = self.step_instr() {
                self.state = VmState::Terminated;
                return Err(e);
            }
        }
    }

    /// Root ids for cycle detection: everything referenced from live
    /// registers, pending host results and globals.
    pub fn root_ids(&self) -> Vec<HeapId> {
        let mut out = Vec::new();
        for frame in &self.frames {
            for v in &frame.regs {
                v.collect_strong_ids(&mut out);
            }
        }
        for v in self.globals.values() {
            v.collect_strong_ids(&mut out);
        }
        for v in &self.host_results {
            v.collect_strong_ids(&mut out);
        }
        out
    }

    /// Explicit cycle collection. This is also the safepoint where a
    /// failed quick health check escalates to `HeapCorruption`.
    pub fn collect_cycles(&mut self, force_full: bool) -> Result<Vec<Cycle>, VmError> {
        let roots = self.root_ids();
        let cycles = self.heap.detect_cycles(&roots, force_full);
        if !self.heap.quick_health_check() {
            return Err(self.error_at(
                self.pc,
                VmErrorKind::HeapCorruption("quick health check failed after cycle collection".into()),
            ));
        }
        Ok(cycles)
    }

    /* ── Execution ── */

    fn step_instr(&mut self) -> Result<(), VmError> {
        let pc = self.pc;
        let instr = *self
            .program
            .instrs
            .get(pc as usize)
            .ok_or_else(|| self.error_at(pc, VmErrorKind::Internal("pc out of range".into())))?;
        if let Some(d) = self.program.debug_at(pc) {
            let line = d.line;
            if let Some(frame) = self.frames.last_mut() {
                frame.line = line;
            }
        }
        self.pc = pc + 1;
        self.execute(instr).map_err(|kind| self.error_at(pc, kind))?;
        if self.heap.collection_due() {
            self.collect_cycles(false)?;
        }
        Ok(())
    }

    fn error_at(&self, pc: u32, kind: VmErrorKind) -> VmError {
        let location = self.program.debug_at(pc).map(|d| SourceLoc {
            file: self.program.file_path(d.file).unwrap_or("<unknown>").to_string(),
            line: d.line,
            col: d.col,
        });
        VmError { kind, pc, location }
    }

    fn reg(&self, r: Reg) -> Result<&Value, VmErrorKind> {
        let frame = self
            .frames
            .last()
            .ok_or_else(|| VmErrorKind::Internal("no active frame".into()))?;
        frame
            .regs
            .get(r as usize)
            .ok_or_else(|| VmErrorKind::Internal(format!("register {r} out of range")))
    }

    fn take(&self, r: Reg) -> Result<Value, VmErrorKind> { self.reg(r).cloned() }

    /// Writes a register. `owned` values already account for the register
    /// hold (fresh allocations); copies get their ids incremented here.
    fn write_reg(&mut self, r: Reg, value: Value, owned: bool) -> Result<(), VmErrorKind> {
        if !owned {
            self.heap.inc_value(&value);
        }
        let old = {
            let frame = self
                .frames
                .last_mut()
                .ok_or_else(|| VmErrorKind::Internal("no active frame".into()))?;
            let slot = frame
                .regs
                .get_mut(r as usize)
                .ok_or_else(|| VmErrorKind::Internal(format!("register {r} out of range")))?;
            std::mem::replace(slot, value)
        };
        self.heap.dec_value(&old);
        Ok(())
    }

    fn int(&self, r: Reg) -> Result<i64, VmErrorKind> {
        self.reg(r)?
            .as_int()
            .ok_or_else(|| VmErrorKind::Internal(format!("expected int, found {}", self.type_of(r))))
    }

    fn float(&self, r: Reg) -> Result<f64, VmErrorKind> {
        self.reg(r)?
            .as_float()
            .ok_or_else(|| VmErrorKind::Internal(format!("expected float, found {}", self.type_of(r))))
    }

    fn bool(&self, r: Reg) -> Result<bool, VmErrorKind> {
        self.reg(r)?
            .as_bool()
            .ok_or_else(|| VmErrorKind::Internal(format!("expected bool, found {}", self.type_of(r))))
    }

    fn type_of(&self, r: Reg) -> &'static str {
        self.reg(r).map(Value::type_name).unwrap_or("<none>")
    }

    fn jump(&mut self, offset: i32) {
        self.pc = (i64::from(self.pc) + i64::from(offset)) as u32;
    }

    fn resolve_table(&self, r: Reg) -> Result<HeapId, VmErrorKind> {
        match self.reg(r)? {
            Value::Table(id) => Ok(*id),
            Value::Ref(id) => match self.heap.get(*id) {
                Some(obj) if obj.kind == ObjKind::Table => Ok(*id),
                Some(_) => Err(VmErrorKind::Internal(format!("ref #{id} is not a table"))),
                None => Err(VmErrorKind::dangling(*id)),
            },
            Value::Nil => Err(VmErrorKind::NilDeref),
            other => Err(VmErrorKind::Internal(format!("expected table, found {}", other.type_name()))),
        }
    }

    fn resolve_array(&self, r: Reg) -> Result<HeapId, VmErrorKind> {
        match self.reg(r)? {
            Value::Array(id) => Ok(*id),
            Value::Ref(id) => match self.heap.get(*id) {
                Some(obj) if obj.kind == ObjKind::Array => Ok(*id),
                Some(_) => Err(VmErrorKind::Internal(format!("ref #{id} is not an array"))),
                None => Err(VmErrorKind::dangling(*id)),
            },
            Value::Nil => Err(VmErrorKind::NilDeref),
            other => Err(VmErrorKind::Internal(format!("expected array, found {}", other.type_name()))),
        }
    }

    #[allow(clippy::too_many_lines)]
    fn execute(&mut self, instr: Instr) -> Result<(), VmErrorKind> {
        match instr {
            Instr::Move { dst, src } => {
                let v = self.take(src)?;
                self.write_reg(dst, v, false)
            }
            Instr::LoadConst { dst, idx } => {
                let v = self
                    .program
                    .consts
                    .get(idx)
                    .cloned()
                    .ok_or_else(|| VmErrorKind::Internal(format!("constant {idx} out of range")))?;
                self.write_reg(dst, v, false)
            }
            Instr::LoadGlobal { dst, name } => {
                let name = self.const_name(name)?;
                let v = self
                    .globals
                    .get(&name)
                    .cloned()
                    .ok_or_else(|| VmErrorKind::Internal(format!("global `{name}` used before initialization")))?;
                self.write_reg(dst, v, false)
            }
            Instr::InitGlobal { src, name } => {
                let name = self.const_name(name)?;
                let v = self.take(src)?;
                self.set_global(&name, v);
                Ok(())
            }

            Instr::AddInt { dst, lhs, rhs } => {
                let v = self.int(lhs)?.wrapping_add(self.int(rhs)?);
                self.write_reg(dst, Value::Int(v), true)
            }
            Instr::SubInt { dst, lhs, rhs } => {
                let v = self.int(lhs)?.wrapping_sub(self.int(rhs)?);
                self.write_reg(dst, Value::Int(v), true)
            }
            Instr::MulInt { dst, lhs, rhs } => {
                let v = self.int(lhs)?.wrapping_mul(self.int(rhs)?);
                self.write_reg(dst, Value::Int(v), true)
            }
            Instr::DivInt { dst, lhs, rhs } => {
                let (a, b) = (self.int(lhs)?, self.int(rhs)?);
                if b == 0 {
                    return Err(VmErrorKind::DivByZero);
                }
                if a == i64::MIN && b == -1 {
                    return Err(VmErrorKind::Overflow);
                }
                self.write_reg(dst, Value::Int(a / b), true)
            }
            Instr::RemInt { dst, lhs, rhs } => {
                let (a, b) = (self.int(lhs)?, self.int(rhs)?);
                if b == 0 {
                    return Err(VmErrorKind::DivByZero);
                }
                self.write_reg(dst, Value::Int(a.wrapping_rem(b)), true)
            }
            Instr::NegInt { dst, src } => {
                let v = self.int(src)?.wrapping_neg();
                self.write_reg(dst, Value::Int(v), true)
            }
            Instr::AddFloat { dst, lhs, rhs } => {
                let v = self.float(lhs)? + self.float(rhs)?;
                self.write_reg(dst, Value::Float(v), true)
            }
            Instr::SubFloat { dst, lhs, rhs } => {
                let v = self.float(lhs)? - self.float(rhs)?;
                self.write_reg(dst, Value::Float(v), true)
            }
            Instr::MulFloat { dst, lhs, rhs } => {
                let v = self.float(lhs)? * self.float(rhs)?;
                self.write_reg(dst, Value::Float(v), true)
            }
            Instr::DivFloat { dst, lhs, rhs } => {
                let v = self.float(lhs)? / self.float(rhs)?;
                self.write_reg(dst, Value::Float(v), true)
            }
            Instr::NegFloat { dst, src } => {
                let v = -self.float(src)?;
                self.write_reg(dst, Value::Float(v), true)
            }
            Instr::And { dst, lhs, rhs } => {
                let v = self.bool(lhs)? && self.bool(rhs)?;
                self.write_reg(dst, Value::Bool(v), true)
            }
            Instr::Or { dst, lhs, rhs } => {
                let v = self.bool(lhs)? || self.bool(rhs)?;
                self.write_reg(dst, Value::Bool(v), true)
            }
            Instr::Not { dst, src } => {
                let v = !self.bool(src)?;
                self.write_reg(dst, Value::Bool(v), true)
            }
            Instr::Concat { dst, lhs, rhs } => {
                let mut s = self.text_of(lhs)?;
                s.push_str(&self.text_of(rhs)?);
                self.write_reg(dst, Value::str(s), true)
            }

            Instr::Eq { dst, lhs, rhs } => {
                let eq = self.values_equal(lhs, rhs)?;
                self.write_reg(dst, Value::Bool(eq), true)
            }
            Instr::Ne { dst, lhs, rhs } => {
                let eq = self.values_equal(lhs, rhs)?;
                self.write_reg(dst, Value::Bool(!eq), true)
            }
            Instr::Lt { dst, lhs, rhs } => self.ordered(dst, lhs, rhs, |o| o.is_lt()),
            Instr::Le { dst, lhs, rhs } => self.ordered(dst, lhs, rhs, |o| o.is_le()),
            Instr::Gt { dst, lhs, rhs } => self.ordered(dst, lhs, rhs, |o| o.is_gt()),
            Instr::Ge { dst, lhs, rhs } => self.ordered(dst, lhs, rhs, |o| o.is_ge()),

            Instr::Jump { offset } => {
                self.jump(offset);
                Ok(())
            }
            Instr::JumpIf { cond, offset } => {
                if self.bool(cond)? {
                    self.jump(offset);
                }
                Ok(())
            }
            Instr::JumpIfNot { cond, offset } => {
                if !self.bool(cond)? {
                    self.jump(offset);
                }
                Ok(())
            }
            Instr::Call { func, num_args, num_results, first_arg, first_result } => {
                let info = self
                    .program
                    .funcs
                    .get(func as usize)
                    .ok_or_else(|| VmErrorKind::Internal(format!("call to unknown function {func}")))?;
                if usize::from(num_args) > usize::from(info.reg_count) {
                    return Err(VmErrorKind::Internal(format!(
                        "`{}` called with more arguments than registers",
                        info.name
                    )));
                }
                let (start, reg_count) = (info.start_pc, info.reg_count);
                let mut frame = Frame::new(
                    func,
                    reg_count,
                    self.pc,
                    Caller::Frame { result_base: first_result, expected: num_results },
                );
                for i in 0..num_args {
                    let v = self.take(first_arg + Reg::from(i))?;
                    self.heap.inc_value(&v);
                    frame.regs[usize::from(i)] = v;
                }
                self.frames.push(frame);
                self.pc = start;
                Ok(())
            }
            Instr::CallHost { host, num_args, num_results, first_arg, first_result } => {
                let mut args = Vec::with_capacity(usize::from(num_args));
                for i in 0..num_args {
                    args.push(self.take(first_arg + Reg::from(i))?);
                }
                let results = {
                    let f = self
                        .host_fns
                        .get_mut(host as usize)
                        .ok_or_else(|| VmErrorKind::Internal(format!("unknown host function {host}")))?;
                    f(&args).map_err(VmErrorKind::Internal)?
                };
                if results.len() != usize::from(num_results) {
                    return Err(VmErrorKind::Internal(format!(
                        "host function {host} returned {} values, expected {num_results}",
                        results.len()
                    )));
                }
                for (i, v) in results.into_iter().enumerate() {
                    self.write_reg(first_result + i as Reg, v, false)?;
                }
                Ok(())
            }
            Instr::Return { first, count } => self.do_return(first, count),

            Instr::NewTable { dst } => {
                let id = self.heap.alloc_table();
                self.write_reg(dst, Value::Table(id), true)
            }
            Instr::NewArray { dst, len_hint } => {
                let id = self.heap.alloc_array(len_hint as usize);
                self.write_reg(dst, Value::Array(id), true)
            }
            Instr::NewRef { dst, src } => {
                let id = self
                    .reg(src)?
                    .strong_id()
                    .ok_or_else(|| VmErrorKind::Internal(format!("cannot take a ref of {}", self.type_of(src))))?;
                self.write_reg(dst, Value::Ref(id), false)
            }
            Instr::NewWeak { dst, src } => {
                let id = self
                    .reg(src)?
                    .strong_id()
                    .ok_or_else(|| VmErrorKind::Internal(format!("cannot take a weak ref of {}", self.type_of(src))))?;
                let kind = self.heap.get(id).map(|o| o.kind).ok_or_else(|| VmErrorKind::dangling(id))?;
                let weak = self.heap.alloc_weak(id, kind);
                self.write_reg(dst, Value::Weak(weak), true)
            }
            Instr::Deref { dst, src } => {
                let v = match self.reg(src)? {
                    Value::Nil => return Err(VmErrorKind::NilDeref),
                    Value::Ref(id) => self.object_value(*id)?,
                    Value::Weak(wid) => match self.heap.weak_target(*wid)? {
                        Some((target, _)) => self.object_value(target)?,
                        None => return Err(VmErrorKind::InvalidWeak),
                    },
                    other => {
                        return Err(VmErrorKind::Internal(format!(
                            "cannot dereference {}",
                            other.type_name()
                        )))
                    }
                };
                self.write_reg(dst, v, false)
            }
            Instr::GetField { dst, obj, name } => {
                let id = self.resolve_table(obj)?;
                let name = self.const_name(name)?;
                let v = self
                    .heap
                    .field(id, &name)?
                    .ok_or_else(|| VmErrorKind::Internal(format!("table #{id} has no field `{name}`")))?;
                self.write_reg(dst, v, false)
            }
            Instr::SetField { obj, name, src } => {
                let id = self.resolve_table(obj)?;
                let name = self.const_name(name)?;
                let v = self.take(src)?;
                self.heap.set_field(id, &name, v)
            }
            Instr::GetIndex { dst, arr, idx } => {
                let id = self.resolve_array(arr)?;
                let i = self.int(idx)?;
                let v = self.heap.element(id, i)?;
                self.write_reg(dst, v, false)
            }
            Instr::SetIndex { arr, idx, src } => {
                let id = self.resolve_array(arr)?;
                let i = self.int(idx)?;
                let v = self.take(src)?;
                self.heap.set_element(id, i, v)
            }
            Instr::ArrayPush { arr, src } => {
                let id = self.resolve_array(arr)?;
                let v = self.take(src)?;
                self.heap.push_element(id, v)
            }
            Instr::Len { dst, src } => {
                let len = match self.reg(src)? {
                    Value::Str(s) => s.chars().count() as i64,
                    Value::Array(id) | Value::Ref(id) => self.heap.array_len(*id)? as i64,
                    other => {
                        return Err(VmErrorKind::Internal(format!(
                            "len of {} is undefined",
                            other.type_name()
                        )))
                    }
                };
                self.write_reg(dst, Value::Int(len), true)
            }

            Instr::MakeSome { dst, src } => {
                let v = self.take(src)?;
                self.write_reg(dst, Value::Some(Box::new(v)), false)
            }
            Instr::MakeNone { dst } => self.write_reg(dst, Value::None, true),
            Instr::MakeOk { dst, src } => {
                let v = self.take(src)?;
                self.write_reg(dst, Value::Ok(Box::new(v)), false)
            }
            Instr::MakeErr { dst, src } => {
                let v = self.take(src)?;
                self.write_reg(dst, Value::Err(Box::new(v)), false)
            }
            Instr::JumpIfNone { src, offset } => {
                match self.reg(src)? {
                    Value::None => self.jump(offset),
                    Value::Some(_) => {}
                    other => {
                        return Err(VmErrorKind::Internal(format!(
                            "expected option, found {}",
                            other.type_name()
                        )))
                    }
                }
                Ok(())
            }
            Instr::JumpIfErr { src, offset } => {
                match self.reg(src)? {
                    Value::Err(_) => self.jump(offset),
                    Value::Ok(_) => {}
                    other => {
                        return Err(VmErrorKind::Internal(format!(
                            "expected result, found {}",
                            other.type_name()
                        )))
                    }
                }
                Ok(())
            }
            Instr::Unwrap { dst, src } => {
                let v = match self.reg(src)? {
                    Value::Some(inner) | Value::Ok(inner) => (**inner).clone(),
                    other => {
                        return Err(VmErrorKind::Internal(format!(
                            "unwrap of {}",
                            self.render_short(other)
                        )))
                    }
                };
                self.write_reg(dst, v, false)
            }
            Instr::UnwrapErr { dst, src } => {
                let v = match self.reg(src)? {
                    Value::Err(inner) => (**inner).clone(),
                    other => {
                        return Err(VmErrorKind::Internal(format!(
                            "unwrap_err of {}",
                            self.render_short(other)
                        )))
                    }
                };
                self.write_reg(dst, v, false)
            }

            Instr::Print { src } => {
                let text = display::render_plain(&self.heap, self.reg(src)?);
                writeln!(self.stdout, "{text}")
                    .map_err(|e| VmErrorKind::Internal(format!("stdout write failed: {e}")))?;
                Ok(())
            }
        }
    }

    fn do_return(&mut self, first: Reg, count: u8) -> Result<(), VmErrorKind> {
        let frame = self
            .frames
            .pop()
            .ok_or_else(|| VmErrorKind::Internal("return without a frame".into()))?;
        let mut results = Vec::with_capacity(usize::from(count));
        for i in 0..usize::from(count) {
            let v = frame
                .regs
                .get(usize::from(first) + i)
                .cloned()
                .ok_or_else(|| VmErrorKind::Internal("result register out of range".into()))?;
            self.heap.inc_value(&v);
            results.push(v);
        }
        match frame.caller {
            Caller::Frame { result_base, expected } => {
                if results.len() != usize::from(expected) {
                    return Err(VmErrorKind::Internal(format!(
                        "returned {} values, caller expects {expected}",
                        results.len()
                    )));
                }
                self.pc = frame.return_pc;
                for (i, v) in results.into_iter().enumerate() {
                    self.write_reg(result_base + i as Reg, v, true)?;
                }
            }
            Caller::Host { .. } => {
                for old in std::mem::replace(&mut self.host_results, results) {
                    self.heap.dec_value(&old);
                }
                if self.frames.is_empty() {
                    self.state = VmState::Terminated;
                }
            }
        }
        for v in &frame.regs {
            self.heap.dec_value(v);
        }
        Ok(())
    }

    fn const_name(&self, idx: u32) -> Result<String, VmErrorKind> {
        self.program
            .const_str(idx)
            .map(str::to_string)
            .ok_or_else(|| VmErrorKind::Internal(format!("constant {idx} is not a name")))
    }

    fn text_of(&self, r: Reg) -> Result<String, VmErrorKind> {
        match self.reg(r)? {
            Value::Str(s) => Ok(s.to_string()),
            Value::Char(c) => Ok(c.to_string()),
            other => Err(VmErrorKind::Internal(format!(
                "cannot concatenate {}",
                other.type_name()
            ))),
        }
    }

    fn render_short(&self, v: &Value) -> String { display::render_value(&self.heap, v) }

    fn ordered(
        &mut self,
        dst: Reg,
        lhs: Reg,
        rhs: Reg,
        test: fn(std::cmp::Ordering) -> bool,
    ) -> Result<(), VmErrorKind> {
        let ord = self.reg(lhs)?.compare(self.reg(rhs)?).ok_or_else(|| {
            VmErrorKind::Internal(format!(
                "no ordering between {} and {}",
                self.type_of(lhs),
                self.type_of(rhs)
            ))
        })?;
        self.write_reg(dst, Value::Bool(test(ord)), true)
    }

    fn values_equal(&self, lhs: Reg, rhs: Reg) -> Result<bool, VmErrorKind> {
        let mut seen = HashSet::new();
        Ok(deep_equals(&self.heap, self.reg(lhs)?, self.reg(rhs)?, &mut seen))
    }

    fn object_value(&self, id: HeapId) -> Result<Value, VmErrorKind> {
        match self.heap.get(id).map(|o| o.kind) {
            Some(ObjKind::Table) => Ok(Value::Table(id)),
            Some(ObjKind::Array) => Ok(Value::Array(id)),
            Some(ObjKind::Weak) => Ok(Value::Weak(id)),
            None => Err(VmErrorKind::dangling(id)),
        }
    }
}

/// Structural equality, resolved through the heap. Id pairs already under
/// comparison count as equal, which terminates cyclic structures.
fn deep_equals(heap: &Heap, a: &Value, b: &Value, seen: &mut HashSet<(HeapId, HeapId)>) -> bool {
    match (a, b) {
        (Value::Array(x), Value::Array(y)) | (Value::Table(x), Value::Table(y)) => {
            if x == y || !seen.insert((*x, *y)) {
                return true;
            }
            match (heap.get(*x).map(|o| &o.slots), heap.get(*y).map(|o| &o.slots)) {
                (Some(Slots::Array(xs)), Some(Slots::Array(ys))) => {
                    xs.len() == ys.len()
                        && xs.iter().zip(ys).all(|(va, vb)| deep_equals(heap, va, vb, seen))
                }
                (Some(Slots::Table(xs)), Some(Slots::Table(ys))) => {
                    xs.len() == ys.len()
                        && xs.iter().all(|(k, va)| {
                            ys.get(k).is_some_and(|vb| deep_equals(heap, va, vb, seen))
                        })
                }
                _ => false,
            }
        }
        (Value::Some(x), Value::Some(y))
        | (Value::Ok(x), Value::Ok(y))
        | (Value::Err(x), Value::Err(y)) => deep_equals(heap, x, y, seen),
        _ => a == b,
    }
}

/* ─────────────────────────── Captured stdout ─────────────────────────── */

/// Writer that captures `Print` output into a shared string, for tests and
/// for forwarding program output as debug events.
#[derive(Default, Clone)]
pub struct Captured(Arc<Mutex<String>>);

impl Captured {
    /// Current buffer contents (copy).
    pub fn get(&self) -> String { self.0.lock().expect("captured stdout poisoned").clone() }

    /// Takes and clears the buffer.
    pub fn drain(&self) -> String {
        std::mem::take(&mut *self.0.lock().expect("captured stdout poisoned"))
    }

    /// Clears the buffer.
    pub fn clear(&self) { self.0.lock().expect("captured stdout poisoned").clear(); }
}

impl Write for Captured {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let s = String::from_utf8_lossy(buf);
        self.0.lock().expect("captured stdout poisoned").push_str(&s);
        Ok(buf.len())
    }
    fn flush(&mut self) -> io::Result<()> { Ok(()) }
}
