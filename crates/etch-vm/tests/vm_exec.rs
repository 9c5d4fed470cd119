//! End-to-end execution tests over hand-assembled programs.

use std::sync::Arc;

use etch_core::program::GLOBAL_FUNCTION;
use etch_core::{DebugEntry, Instr, Program, ProgramBuilder, Value};
use etch_vm::{Captured, RunOutcome, Tick, Vm, VmErrorKind, VmState};

fn at(line: u32, stmt: u32) -> DebugEntry {
    DebugEntry { file: 0, line, col: 1, stmt }
}

fn boot(program: Program) -> (Vm, Captured) {
    let mut vm = Vm::new(Arc::new(program));
    let cap = Captured::default();
    vm.set_stdout(Box::new(cap.clone()));
    vm.start_entry().unwrap();
    (vm, cap)
}

/// `fn main() { let a=10; let b=20; print(a+b); }`
fn arith_program() -> Program {
    let mut b = ProgramBuilder::new();
    b.file("main.etch");
    let ka = b.constant(Value::Int(10));
    let kb = b.constant(Value::Int(20));
    b.begin_function(GLOBAL_FUNCTION, 1);
    b.emit(Instr::Call { func: 1, num_args: 0, num_results: 0, first_arg: 0, first_result: 0 }, at(1, 0));
    b.emit(Instr::Return { first: 0, count: 0 }, at(1, 0));
    b.end_function();
    b.begin_function("main$_v", 3);
    b.local("a", 0);
    b.local("b", 1);
    b.emit(Instr::LoadConst { dst: 0, idx: ka }, at(2, 1));
    b.emit(Instr::LoadConst { dst: 1, idx: kb }, at(3, 2));
    b.emit(Instr::AddInt { dst: 2, lhs: 0, rhs: 1 }, at(4, 3));
    b.emit(Instr::Print { src: 2 }, at(4, 3));
    b.emit(Instr::Return { first: 0, count: 0 }, at(5, 4));
    b.end_function();
    b.finish().unwrap()
}

#[test]
fn arithmetic_and_print() {
    let (mut vm, cap) = boot(arith_program());
    assert_eq!(vm.run().unwrap(), RunOutcome::Terminated);
    assert_eq!(cap.get(), "30\n");
    assert_eq!(vm.state(), VmState::Terminated);
    assert_eq!(vm.depth(), 0);
}

#[test]
fn call_with_args_and_result() {
    // add(a, b) -> a + b ; main prints add(2, 40)
    let mut b = ProgramBuilder::new();
    b.file("call.etch");
    let k2 = b.constant(Value::Int(2));
    let k40 = b.constant(Value::Int(40));
    b.begin_function(GLOBAL_FUNCTION, 4);
    b.emit(Instr::LoadConst { dst: 1, idx: k2 }, at(1, 0));
    b.emit(Instr::LoadConst { dst: 2, idx: k40 }, at(1, 0));
    b.emit(Instr::Call { func: 1, num_args: 2, num_results: 1, first_arg: 1, first_result: 0 }, at(2, 1));
    b.emit(Instr::Print { src: 0 }, at(2, 1));
    b.emit(Instr::Return { first: 0, count: 0 }, at(3, 2));
    b.end_function();
    b.begin_function("add$ii_i", 3);
    b.local("a", 0);
    b.local("b", 1);
    b.emit(Instr::AddInt { dst: 2, lhs: 0, rhs: 1 }, at(10, 5));
    b.emit(Instr::Return { first: 2, count: 1 }, at(10, 5));
    b.end_function();
    let (mut vm, cap) = boot(b.finish().unwrap());
    vm.run().unwrap();
    assert_eq!(cap.get(), "42\n");
}

#[test]
fn loop_counts_down() {
    // i = 3; while i > 0 { print(i); i = i - 1 }
    let mut b = ProgramBuilder::new();
    b.file("loop.etch");
    let k3 = b.constant(Value::Int(3));
    let k0 = b.constant(Value::Int(0));
    let k1 = b.constant(Value::Int(1));
    b.begin_function(GLOBAL_FUNCTION, 4);
    b.local("i", 0);
    b.emit(Instr::LoadConst { dst: 0, idx: k3 }, at(1, 0));
    b.emit(Instr::LoadConst { dst: 1, idx: k0 }, at(1, 0));
    b.emit(Instr::LoadConst { dst: 2, idx: k1 }, at(1, 0));
    // header at pc 3
    b.emit(Instr::Gt { dst: 3, lhs: 0, rhs: 1 }, at(2, 1));
    let exit_jump = b.emit(Instr::JumpIfNot { cond: 3, offset: 0 }, at(2, 1));
    b.emit(Instr::Print { src: 0 }, at(3, 2));
    b.emit(Instr::SubInt { dst: 0, lhs: 0, rhs: 2 }, at(4, 3));
    let back = b.here();
    b.emit(Instr::Jump { offset: 3i32.wrapping_sub(back as i32) - 1 }, at(4, 3));
    let end = b.here();
    b.patch(exit_jump, Instr::JumpIfNot { cond: 3, offset: (end - exit_jump - 1) as i32 });
    b.emit(Instr::Return { first: 0, count: 0 }, at(5, 4));
    b.end_function();
    let (mut vm, cap) = boot(b.finish().unwrap());
    vm.run().unwrap();
    assert_eq!(cap.get(), "3\n2\n1\n");
}

#[test]
fn tables_arrays_and_bounds_guard() {
    let mut b = ProgramBuilder::new();
    b.file("agg.etch");
    let kname = b.constant(Value::str("x"));
    let k0 = b.constant(Value::Int(0));
    let k9 = b.constant(Value::Int(9));
    b.begin_function(GLOBAL_FUNCTION, 5);
    b.emit(Instr::NewTable { dst: 0 }, at(1, 0));
    b.emit(Instr::NewArray { dst: 1, len_hint: 2 }, at(2, 1));
    b.emit(Instr::LoadConst { dst: 2, idx: k9 }, at(3, 2));
    b.emit(Instr::ArrayPush { arr: 1, src: 2 }, at(3, 2));
    b.emit(Instr::SetField { obj: 0, name: kname, src: 1 }, at(4, 3));
    b.emit(Instr::GetField { dst: 3, obj: 0, name: kname }, at(5, 4));
    b.emit(Instr::LoadConst { dst: 2, idx: k0 }, at(5, 4));
    b.emit(Instr::GetIndex { dst: 4, arr: 3, idx: 2 }, at(5, 4));
    b.emit(Instr::Print { src: 4 }, at(5, 4));
    // out-of-bounds read: arr[9]
    b.emit(Instr::LoadConst { dst: 2, idx: k9 }, at(6, 5));
    b.emit(Instr::GetIndex { dst: 4, arr: 3, idx: 2 }, at(6, 5));
    b.emit(Instr::Return { first: 0, count: 0 }, at(7, 6));
    b.end_function();
    let (mut vm, cap) = boot(b.finish().unwrap());

    let err = vm.run().unwrap_err();
    assert_eq!(cap.get(), "9\n");
    assert_eq!(err.kind, VmErrorKind::IndexOutOfBounds { index: 9, len: 1 });
    let loc = err.location.expect("position attached");
    assert_eq!((loc.file.as_str(), loc.line), ("agg.etch", 6));
    assert_eq!(vm.state(), VmState::Terminated);
}

#[test]
fn division_by_zero_reports_position() {
    let mut b = ProgramBuilder::new();
    b.file("div.etch");
    let k1 = b.constant(Value::Int(1));
    let k0 = b.constant(Value::Int(0));
    b.begin_function(GLOBAL_FUNCTION, 3);
    b.emit(Instr::LoadConst { dst: 0, idx: k1 }, at(1, 0));
    b.emit(Instr::LoadConst { dst: 1, idx: k0 }, at(2, 1));
    b.emit(Instr::DivInt { dst: 2, lhs: 0, rhs: 1 }, at(3, 2));
    b.emit(Instr::Return { first: 0, count: 0 }, at(4, 3));
    b.end_function();
    let (mut vm, _cap) = boot(b.finish().unwrap());

    let err = vm.run().unwrap_err();
    assert_eq!(err.kind, VmErrorKind::DivByZero);
    let rendered = err.to_string();
    assert!(rendered.contains("div.etch:3"), "got: {rendered}");
}

#[test]
fn option_destructuring() {
    // x = some(5); if none -> print(0) else print(unwrap(x))
    let mut b = ProgramBuilder::new();
    b.file("opt.etch");
    let k5 = b.constant(Value::Int(5));
    let k0 = b.constant(Value::Int(0));
    b.begin_function(GLOBAL_FUNCTION, 3);
    b.emit(Instr::LoadConst { dst: 0, idx: k5 }, at(1, 0));
    b.emit(Instr::MakeSome { dst: 1, src: 0 }, at(1, 0));
    b.emit(Instr::JumpIfNone { src: 1, offset: 3 }, at(2, 1));
    b.emit(Instr::Unwrap { dst: 2, src: 1 }, at(3, 2));
    b.emit(Instr::Print { src: 2 }, at(3, 2));
    b.emit(Instr::Jump { offset: 2 }, at(3, 2));
    b.emit(Instr::LoadConst { dst: 2, idx: k0 }, at(4, 3));
    b.emit(Instr::Print { src: 2 }, at(4, 3));
    b.emit(Instr::Return { first: 0, count: 0 }, at(5, 4));
    b.end_function();
    let (mut vm, cap) = boot(b.finish().unwrap());
    vm.run().unwrap();
    assert_eq!(cap.get(), "5\n");
}

#[test]
fn weak_ref_invalidation_is_fatal_on_deref() {
    let mut b = ProgramBuilder::new();
    b.file("weak.etch");
    b.begin_function(GLOBAL_FUNCTION, 3);
    b.emit(Instr::NewTable { dst: 0 }, at(1, 0));
    b.emit(Instr::NewWeak { dst: 1, src: 0 }, at(2, 1));
    // drop the only strong handle
    b.emit(Instr::MakeNone { dst: 0 }, at(3, 2));
    b.emit(Instr::Deref { dst: 2, src: 1 }, at(4, 3));
    b.emit(Instr::Return { first: 0, count: 0 }, at(5, 4));
    b.end_function();
    let (mut vm, _cap) = boot(b.finish().unwrap());

    let err = vm.run().unwrap_err();
    assert_eq!(err.kind, VmErrorKind::InvalidWeak);
}

#[test]
fn frame_teardown_releases_heap_objects() {
    // helper() allocates a table it never returns
    let mut b = ProgramBuilder::new();
    b.file("drop.etch");
    b.begin_function(GLOBAL_FUNCTION, 1);
    b.emit(Instr::Call { func: 1, num_args: 0, num_results: 0, first_arg: 0, first_result: 0 }, at(1, 0));
    b.emit(Instr::Return { first: 0, count: 0 }, at(2, 1));
    b.end_function();
    b.begin_function("helper$_v", 1);
    b.emit(Instr::NewTable { dst: 0 }, at(10, 5));
    b.emit(Instr::Return { first: 0, count: 0 }, at(11, 6));
    b.end_function();
    let (mut vm, _cap) = boot(b.finish().unwrap());
    vm.run().unwrap();
    assert_eq!(vm.heap().live_count(), 0, "callee-local allocations freed on return");
}

/// Scenario: A.next = B, B.next = A, drop externals, force a full pass.
#[test]
fn cycle_collection_through_vm_roots() {
    let mut b = ProgramBuilder::new();
    b.file("cycle.etch");
    let knext = b.constant(Value::str("next"));
    b.begin_function(GLOBAL_FUNCTION, 2);
    b.emit(Instr::NewTable { dst: 0 }, at(1, 0));
    b.emit(Instr::NewTable { dst: 1 }, at(2, 1));
    b.emit(Instr::SetField { obj: 0, name: knext, src: 1 }, at(3, 2));
    b.emit(Instr::SetField { obj: 1, name: knext, src: 0 }, at(4, 3));
    b.emit(Instr::MakeNone { dst: 0 }, at(5, 4));
    b.emit(Instr::MakeNone { dst: 1 }, at(6, 5));
    b.emit(Instr::Return { first: 0, count: 0 }, at(7, 6));
    b.end_function();
    let (mut vm, _cap) = boot(b.finish().unwrap());

    // pause just before the Return: registers are nil'd, the cycle holds
    // itself alive with no external references
    vm.set_instr_callback(Box::new(|vm| if vm.pc() == 6 { Tick::Pause } else { Tick::Continue }));
    assert_eq!(vm.run().unwrap(), RunOutcome::Paused);
    assert_eq!(vm.heap().live_count(), 2, "cycle keeps A and B alive");

    let cycles = vm.collect_cycles(true).unwrap();
    assert_eq!(cycles.len(), 1);
    assert_eq!(cycles[0].members.len(), 2);
    assert_eq!(vm.heap().live_count(), 0);
    assert_eq!(vm.heap().free_list().len(), 2);
}

/// A heap that went through real execution verifies clean.
#[test]
fn executed_heap_verifies_clean() {
    let mut b = ProgramBuilder::new();
    b.file("verify.etch");
    let kname = b.constant(Value::str("items"));
    b.begin_function(GLOBAL_FUNCTION, 3);
    b.emit(Instr::NewTable { dst: 0 }, at(1, 0));
    b.emit(Instr::NewArray { dst: 1, len_hint: 0 }, at(2, 1));
    b.emit(Instr::SetField { obj: 0, name: kname, src: 1 }, at(3, 2));
    b.emit(Instr::NewWeak { dst: 2, src: 0 }, at(4, 3));
    b.emit(Instr::Return { first: 0, count: 0 }, at(5, 4));
    b.end_function();
    let (mut vm, _cap) = boot(b.finish().unwrap());

    // pause before the Return so the objects are still rooted
    vm.set_instr_callback(Box::new(|vm| if vm.pc() == 4 { Tick::Pause } else { Tick::Continue }));
    vm.run().unwrap();

    let report = vm.heap().verify_heap(true);
    assert!(report.healthy(), "issues: {:?}", report.issues);
    assert_eq!(report.health_score, 1.0);
    assert!(vm.heap().quick_health_check());
}

#[test]
fn callback_pause_preserves_pc() {
    let (mut vm, cap) = boot(arith_program());
    vm.set_instr_callback(Box::new(|_vm| Tick::Pause));
    assert_eq!(vm.run().unwrap(), RunOutcome::Paused);
    assert_eq!(vm.state(), VmState::Paused);
    let pc_at_pause = vm.pc();

    // pausing again does not advance
    assert_eq!(vm.run().unwrap(), RunOutcome::Paused);
    assert_eq!(vm.pc(), pc_at_pause);

    // release and finish
    vm.clear_instr_callback();
    assert_eq!(vm.run().unwrap(), RunOutcome::Terminated);
    assert_eq!(cap.get(), "30\n");
}

#[test]
fn callback_sees_every_instruction() {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc as StdArc;

    let (mut vm, _cap) = boot(arith_program());
    let hits = StdArc::new(AtomicU64::new(0));
    let hits2 = hits.clone();
    vm.set_instr_callback(Box::new(move |_vm| {
        hits2.fetch_add(1, Ordering::Relaxed);
        Tick::Continue
    }));
    vm.run().unwrap();
    assert_eq!(hits.load(Ordering::Relaxed), vm.instr_count());
    assert!(vm.instr_count() >= 7);
}

#[test]
fn host_call_reentry() {
    // add(a, b) with no <global> work needed after first run
    let mut b = ProgramBuilder::new();
    b.file("host.etch");
    b.begin_function(GLOBAL_FUNCTION, 1);
    b.emit(Instr::Return { first: 0, count: 0 }, at(1, 0));
    b.end_function();
    b.begin_function("add$ii_i", 3);
    b.emit(Instr::AddInt { dst: 2, lhs: 0, rhs: 1 }, at(2, 1));
    b.emit(Instr::Return { first: 2, count: 1 }, at(2, 1));
    b.end_function();
    let (mut vm, _cap) = boot(b.finish().unwrap());
    vm.run().unwrap();
    assert_eq!(vm.state(), VmState::Terminated);

    vm.start_call("add$ii_i", &[Value::Int(40), Value::Int(2)]).unwrap();
    vm.run().unwrap();
    assert_eq!(vm.take_results(), vec![Value::Int(42)]);

    // and again — the VM state machine supports repeated re-entry
    vm.start_call("add$ii_i", &[Value::Int(1), Value::Int(2)]).unwrap();
    vm.run().unwrap();
    assert_eq!(vm.take_results(), vec![Value::Int(3)]);
}
