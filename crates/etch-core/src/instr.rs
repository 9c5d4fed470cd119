//! Register instruction set plus its compact binary encoding.
//!
//! Operand shapes (byte layout of the CODE section):
//! - `ABC`  : three register indices (u16 LE each)
//! - `AB`   : two register indices
//! - `ABx`  : one register + one 32-bit operand (pool index or jump offset)
//! - `Call` : function index, arg/result counts, first arg/result registers
//! - `InitGlobal` : source register + name index in the constant pool
//!
//! Jump offsets are relative to the instruction *after* the jump.

use crate::{ByteReader, ByteWriter, CoreError, CoreResult};

/// Register index inside a frame.
pub type Reg = u16;

const OP_MOVE: u8 = 0x01;
const OP_LOAD_CONST: u8 = 0x02;
const OP_LOAD_GLOBAL: u8 = 0x03;
const OP_INIT_GLOBAL: u8 = 0x04;

const OP_ADD_INT: u8 = 0x10;
const OP_SUB_INT: u8 = 0x11;
const OP_MUL_INT: u8 = 0x12;
const OP_DIV_INT: u8 = 0x13;
const OP_REM_INT: u8 = 0x14;
const OP_NEG_INT: u8 = 0x15;
const OP_ADD_FLOAT: u8 = 0x16;
const OP_SUB_FLOAT: u8 = 0x17;
const OP_MUL_FLOAT: u8 = 0x18;
const OP_DIV_FLOAT: u8 = 0x19;
const OP_NEG_FLOAT: u8 = 0x1A;
const OP_AND: u8 = 0x1B;
const OP_OR: u8 = 0x1C;
const OP_NOT: u8 = 0x1D;
const OP_CONCAT: u8 = 0x1E;

const OP_EQ: u8 = 0x20;
const OP_NE: u8 = 0x21;
const OP_LT: u8 = 0x22;
const OP_LE: u8 = 0x23;
const OP_GT: u8 = 0x24;
const OP_GE: u8 = 0x25;

const OP_JUMP: u8 = 0x30;
const OP_JUMP_IF: u8 = 0x31;
const OP_JUMP_IF_NOT: u8 = 0x32;
const OP_CALL: u8 = 0x33;
const OP_CALL_HOST: u8 = 0x34;
const OP_RETURN: u8 = 0x35;

const OP_NEW_TABLE: u8 = 0x40;
const OP_NEW_ARRAY: u8 = 0x41;
const OP_NEW_REF: u8 = 0x42;
const OP_NEW_WEAK: u8 = 0x43;
const OP_DEREF: u8 = 0x44;
const OP_GET_FIELD: u8 = 0x45;
const OP_SET_FIELD: u8 = 0x46;
const OP_GET_INDEX: u8 = 0x47;
const OP_SET_INDEX: u8 = 0x48;
const OP_ARRAY_PUSH: u8 = 0x49;
const OP_LEN: u8 = 0x4A;

const OP_MAKE_SOME: u8 = 0x50;
const OP_MAKE_NONE: u8 = 0x51;
const OP_MAKE_OK: u8 = 0x52;
const OP_MAKE_ERR: u8 = 0x53;
const OP_JUMP_IF_NONE: u8 = 0x54;
const OP_JUMP_IF_ERR: u8 = 0x55;
const OP_UNWRAP: u8 = 0x56;
const OP_UNWRAP_ERR: u8 = 0x57;

const OP_PRINT: u8 = 0x60;

/// One VM instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instr {
    /// Copy `src` into `dst`.
    Move {
        /// Destination register.
        dst: Reg,
        /// Source register.
        src: Reg,
    },
    /// Load constant-pool entry `idx` into `dst`.
    LoadConst {
        /// Destination register.
        dst: Reg,
        /// Constant pool index.
        idx: u32,
    },
    /// Load the global named by pool entry `name` into `dst`.
    LoadGlobal {
        /// Destination register.
        dst: Reg,
        /// Pool index of the global's name.
        name: u32,
    },
    /// Bind `src` to the global named by pool entry `name`.
    InitGlobal {
        /// Source register.
        src: Reg,
        /// Pool index of the global's name.
        name: u32,
    },

    /// `dst = lhs + rhs` (int, two's-complement wrap).
    AddInt {
        /// Destination register.
        dst: Reg,
        /// Left operand.
        lhs: Reg,
        /// Right operand.
        rhs: Reg,
    },
    /// `dst = lhs - rhs` (int, wrap).
    SubInt {
        /// Destination register.
        dst: Reg,
        /// Left operand.
        lhs: Reg,
        /// Right operand.
        rhs: Reg,
    },
    /// `dst = lhs * rhs` (int, wrap).
    MulInt {
        /// Destination register.
        dst: Reg,
        /// Left operand.
        lhs: Reg,
        /// Right operand.
        rhs: Reg,
    },
    /// `dst = lhs / rhs` (int; zero divisor fails).
    DivInt {
        /// Destination register.
        dst: Reg,
        /// Left operand.
        lhs: Reg,
        /// Right operand.
        rhs: Reg,
    },
    /// `dst = lhs % rhs` (int; zero divisor fails).
    RemInt {
        /// Destination register.
        dst: Reg,
        /// Left operand.
        lhs: Reg,
        /// Right operand.
        rhs: Reg,
    },
    /// `dst = -src` (int, wrap).
    NegInt {
        /// Destination register.
        dst: Reg,
        /// Source register.
        src: Reg,
    },
    /// `dst = lhs + rhs` (float).
    AddFloat {
        /// Destination register.
        dst: Reg,
        /// Left operand.
        lhs: Reg,
        /// Right operand.
        rhs: Reg,
    },
    /// `dst = lhs - rhs` (float).
    SubFloat {
        /// Destination register.
        dst: Reg,
        /// Left operand.
        lhs: Reg,
        /// Right operand.
        rhs: Reg,
    },
    /// `dst = lhs * rhs` (float).
    MulFloat {
        /// Destination register.
        dst: Reg,
        /// Left operand.
        lhs: Reg,
        /// Right operand.
        rhs: Reg,
    },
    /// `dst = lhs / rhs` (float, IEEE-754 — may produce inf/nan).
    DivFloat {
        /// Destination register.
        dst: Reg,
        /// Left operand.
        lhs: Reg,
        /// Right operand.
        rhs: Reg,
    },
    /// `dst = -src` (float).
    NegFloat {
        /// Destination register.
        dst: Reg,
        /// Source register.
        src: Reg,
    },
    /// `dst = lhs && rhs` (bool).
    And {
        /// Destination register.
        dst: Reg,
        /// Left operand.
        lhs: Reg,
        /// Right operand.
        rhs: Reg,
    },
    /// `dst = lhs || rhs` (bool).
    Or {
        /// Destination register.
        dst: Reg,
        /// Left operand.
        lhs: Reg,
        /// Right operand.
        rhs: Reg,
    },
    /// `dst = !src` (bool).
    Not {
        /// Destination register.
        dst: Reg,
        /// Source register.
        src: Reg,
    },
    /// `dst = lhs ++ rhs` (string concatenation; chars concatenate too).
    Concat {
        /// Destination register.
        dst: Reg,
        /// Left operand.
        lhs: Reg,
        /// Right operand.
        rhs: Reg,
    },

    /// `dst = lhs == rhs` (structural).
    Eq {
        /// Destination register.
        dst: Reg,
        /// Left operand.
        lhs: Reg,
        /// Right operand.
        rhs: Reg,
    },
    /// `dst = lhs != rhs` (structural).
    Ne {
        /// Destination register.
        dst: Reg,
        /// Left operand.
        lhs: Reg,
        /// Right operand.
        rhs: Reg,
    },
    /// `dst = lhs < rhs` (numeric/char/string).
    Lt {
        /// Destination register.
        dst: Reg,
        /// Left operand.
        lhs: Reg,
        /// Right operand.
        rhs: Reg,
    },
    /// `dst = lhs <= rhs`.
    Le {
        /// Destination register.
        dst: Reg,
        /// Left operand.
        lhs: Reg,
        /// Right operand.
        rhs: Reg,
    },
    /// `dst = lhs > rhs`.
    Gt {
        /// Destination register.
        dst: Reg,
        /// Left operand.
        lhs: Reg,
        /// Right operand.
        rhs: Reg,
    },
    /// `dst = lhs >= rhs`.
    Ge {
        /// Destination register.
        dst: Reg,
        /// Left operand.
        lhs: Reg,
        /// Right operand.
        rhs: Reg,
    },

    /// Unconditional relative jump.
    Jump {
        /// Offset relative to the next instruction.
        offset: i32,
    },
    /// Jump when `cond` holds true.
    JumpIf {
        /// Condition register (bool).
        cond: Reg,
        /// Offset relative to the next instruction.
        offset: i32,
    },
    /// Jump when `cond` holds false.
    JumpIfNot {
        /// Condition register (bool).
        cond: Reg,
        /// Offset relative to the next instruction.
        offset: i32,
    },
    /// Call function-table entry `func`. Arguments live in
    /// `first_arg..first_arg+num_args` and are copied into the callee's
    /// register prefix; results land in `first_result..`.
    Call {
        /// Function table index.
        func: u32,
        /// Argument count (fixed by the callee's signature).
        num_args: u8,
        /// Result count (fixed by the callee's signature).
        num_results: u8,
        /// First argument register in the caller.
        first_arg: Reg,
        /// First result register in the caller.
        first_result: Reg,
    },
    /// Call a host-registered callback (embedding API).
    CallHost {
        /// Host registry index.
        host: u32,
        /// Argument count.
        num_args: u8,
        /// Result count.
        num_results: u8,
        /// First argument register in the caller.
        first_arg: Reg,
        /// First result register in the caller.
        first_result: Reg,
    },
    /// Unwind one frame; results are `first..first+count` of the callee.
    Return {
        /// First result register.
        first: Reg,
        /// Result count.
        count: u8,
    },

    /// Allocate an empty table into `dst`.
    NewTable {
        /// Destination register.
        dst: Reg,
    },
    /// Allocate an empty array into `dst`.
    NewArray {
        /// Destination register.
        dst: Reg,
        /// Capacity hint.
        len_hint: u32,
    },
    /// Build a strong reference to the heap object held in `src`.
    NewRef {
        /// Destination register.
        dst: Reg,
        /// Register holding an array/table/ref value.
        src: Reg,
    },
    /// Build a weak reference to the heap object held in `src`.
    NewWeak {
        /// Destination register.
        dst: Reg,
        /// Register holding an array/table/ref value.
        src: Reg,
    },
    /// Resolve a ref/weak value to its target.
    Deref {
        /// Destination register.
        dst: Reg,
        /// Register holding a ref or weak value.
        src: Reg,
    },
    /// `dst = obj.field` where the field name is pool entry `name`.
    GetField {
        /// Destination register.
        dst: Reg,
        /// Table (or ref-to-table) register.
        obj: Reg,
        /// Pool index of the field name.
        name: u32,
    },
    /// `obj.field = src`.
    SetField {
        /// Table (or ref-to-table) register.
        obj: Reg,
        /// Pool index of the field name.
        name: u32,
        /// Source register.
        src: Reg,
    },
    /// `dst = arr[idx]` (0-based; bounds-checked at runtime).
    GetIndex {
        /// Destination register.
        dst: Reg,
        /// Array (or ref-to-array) register.
        arr: Reg,
        /// Index register (int).
        idx: Reg,
    },
    /// `arr[idx] = src`.
    SetIndex {
        /// Array (or ref-to-array) register.
        arr: Reg,
        /// Index register (int).
        idx: Reg,
        /// Source register.
        src: Reg,
    },
    /// Append `src` to the array in `arr` (array literal lowering).
    ArrayPush {
        /// Array register.
        arr: Reg,
        /// Source register.
        src: Reg,
    },
    /// `dst = len(src)` for arrays and strings.
    Len {
        /// Destination register.
        dst: Reg,
        /// Array/string register.
        src: Reg,
    },

    /// `dst = some(src)`.
    MakeSome {
        /// Destination register.
        dst: Reg,
        /// Payload register.
        src: Reg,
    },
    /// `dst = none`.
    MakeNone {
        /// Destination register.
        dst: Reg,
    },
    /// `dst = ok(src)`.
    MakeOk {
        /// Destination register.
        dst: Reg,
        /// Payload register.
        src: Reg,
    },
    /// `dst = error(src)`.
    MakeErr {
        /// Destination register.
        dst: Reg,
        /// Payload register.
        src: Reg,
    },
    /// Jump when `src` holds `none` (match lowering).
    JumpIfNone {
        /// Option register.
        src: Reg,
        /// Offset relative to the next instruction.
        offset: i32,
    },
    /// Jump when `src` holds `error(_)` (match and `?` lowering).
    JumpIfErr {
        /// Result register.
        src: Reg,
        /// Offset relative to the next instruction.
        offset: i32,
    },
    /// Extract the payload of `some(v)` / `ok(v)` into `dst`.
    Unwrap {
        /// Destination register.
        dst: Reg,
        /// Option/result register.
        src: Reg,
    },
    /// Extract the payload of `error(v)` into `dst`.
    UnwrapErr {
        /// Destination register.
        dst: Reg,
        /// Result register.
        src: Reg,
    },

    /// Write `src` in canonical form, plus a newline, to the VM's stdout.
    Print {
        /// Source register.
        src: Reg,
    },
}

macro_rules! abc {
    ($w:ident, $op:expr, $a:expr, $b:expr, $c:expr) => {{
        $w.write_u8($op);
        $w.write_u16_le($a);
        $w.write_u16_le($b);
        $w.write_u16_le($c);
    }};
}

macro_rules! ab {
    ($w:ident, $op:expr, $a:expr, $b:expr) => {{
        $w.write_u8($op);
        $w.write_u16_le($a);
        $w.write_u16_le($b);
    }};
}

macro_rules! abx {
    ($w:ident, $op:expr, $a:expr, $x:expr) => {{
        $w.write_u8($op);
        $w.write_u16_le($a);
        $w.write_u32_le($x);
    }};
}

impl Instr {
    /// Appends the encoded form to `w`.
    pub fn encode(&self, w: &mut ByteWriter) {
        match *self {
            Instr::Move { dst, src } => ab!(w, OP_MOVE, dst, src),
            Instr::LoadConst { dst, idx } => abx!(w, OP_LOAD_CONST, dst, idx),
            Instr::LoadGlobal { dst, name } => abx!(w, OP_LOAD_GLOBAL, dst, name),
            Instr::InitGlobal { src, name } => abx!(w, OP_INIT_GLOBAL, src, name),

            Instr::AddInt { dst, lhs, rhs } => abc!(w, OP_ADD_INT, dst, lhs, rhs),
            Instr::SubInt { dst, lhs, rhs } => abc!(w, OP_SUB_INT, dst, lhs, rhs),
            Instr::MulInt { dst, lhs, rhs } => abc!(w, OP_MUL_INT, dst, lhs, rhs),
            Instr::DivInt { dst, lhs, rhs } => abc!(w, OP_DIV_INT, dst, lhs, rhs),
            Instr::RemInt { dst, lhs, rhs } => abc!(w, OP_REM_INT, dst, lhs, rhs),
            Instr::NegInt { dst, src } => ab!(w, OP_NEG_INT, dst, src),
            Instr::AddFloat { dst, lhs, rhs } => abc!(w, OP_ADD_FLOAT, dst, lhs, rhs),
            Instr::SubFloat { dst, lhs, rhs } => abc!(w, OP_SUB_FLOAT, dst, lhs, rhs),
            Instr::MulFloat { dst, lhs, rhs } => abc!(w, OP_MUL_FLOAT, dst, lhs, rhs),
            Instr::DivFloat { dst, lhs, rhs } => abc!(w, OP_DIV_FLOAT, dst, lhs, rhs),
            Instr::NegFloat { dst, src } => ab!(w, OP_NEG_FLOAT, dst, src),
            Instr::And { dst, lhs, rhs } => abc!(w, OP_AND, dst, lhs, rhs),
            Instr::Or { dst, lhs, rhs } => abc!(w, OP_OR, dst, lhs, rhs),
            Instr::Not { dst, src } => ab!(w, OP_NOT, dst, src),
            Instr::Concat { dst, lhs, rhs } => abc!(w, OP_CONCAT, dst, lhs, rhs),

            Instr::Eq { dst, lhs, rhs } => abc!(w, OP_EQ, dst, lhs, rhs),
            Instr::Ne { dst, lhs, rhs } => abc!(w, OP_NE, dst, lhs, rhs),
            Instr::Lt { dst, lhs, rhs } => abc!(w, OP_LT, dst, lhs, rhs),
            Instr::Le { dst, lhs, rhs } => abc!(w, OP_LE, dst, lhs, rhs),
            Instr::Gt { dst, lhs, rhs } => abc!(w, OP_GT, dst, lhs, rhs),
            Instr::Ge { dst, lhs, rhs } => abc!(w, OP_GE, dst, lhs, rhs),

            Instr::Jump { offset } => {
                w.write_u8(OP_JUMP);
                w.write_i32_le(offset);
            }
            Instr::JumpIf { cond, offset } => {
                w.write_u8(OP_JUMP_IF);
                w.write_u16_le(cond);
                w.write_i32_le(offset);
            }
            Instr::JumpIfNot { cond, offset } => {
                w.write_u8(OP_JUMP_IF_NOT);
                w.write_u16_le(cond);
                w.write_i32_le(offset);
            }
            Instr::Call { func, num_args, num_results, first_arg, first_result } => {
                w.write_u8(OP_CALL);
                w.write_u32_le(func);
                w.write_u8(num_args);
                w.write_u8(num_results);
                w.write_u16_le(first_arg);
                w.write_u16_le(first_result);
            }
            Instr::CallHost { host, num_args, num_results, first_arg, first_result } => {
                w.write_u8(OP_CALL_HOST);
                w.write_u32_le(host);
                w.write_u8(num_args);
                w.write_u8(num_results);
                w.write_u16_le(first_arg);
                w.write_u16_le(first_result);
            }
            Instr::Return { first, count } => {
                w.write_u8(OP_RETURN);
                w.write_u16_le(first);
                w.write_u8(count);
            }

            Instr::NewTable { dst } => {
                w.write_u8(OP_NEW_TABLE);
                w.write_u16_le(dst);
            }
            Instr::NewArray { dst, len_hint } => abx!(w, OP_NEW_ARRAY, dst, len_hint),
            Instr::NewRef { dst, src } => ab!(w, OP_NEW_REF, dst, src),
            Instr::NewWeak { dst, src } => ab!(w, OP_NEW_WEAK, dst, src),
            Instr::Deref { dst, src } => ab!(w, OP_DEREF, dst, src),
            Instr::GetField { dst, obj, name } => {
                w.write_u8(OP_GET_FIELD);
                w.write_u16_le(dst);
                w.write_u16_le(obj);
                w.write_u32_le(name);
            }
            Instr::SetField { obj, name, src } => {
                w.write_u8(OP_SET_FIELD);
                w.write_u16_le(obj);
                w.write_u32_le(name);
                w.write_u16_le(src);
            }
            Instr::GetIndex { dst, arr, idx } => abc!(w, OP_GET_INDEX, dst, arr, idx),
            Instr::SetIndex { arr, idx, src } => abc!(w, OP_SET_INDEX, arr, idx, src),
            Instr::ArrayPush { arr, src } => ab!(w, OP_ARRAY_PUSH, arr, src),
            Instr::Len { dst, src } => ab!(w, OP_LEN, dst, src),

            Instr::MakeSome { dst, src } => ab!(w, OP_MAKE_SOME, dst, src),
            Instr::MakeNone { dst } => {
                w.write_u8(OP_MAKE_NONE);
                w.write_u16_le(dst);
            }
            Instr::MakeOk { dst, src } => ab!(w, OP_MAKE_OK, dst, src),
            Instr::MakeErr { dst, src } => ab!(w, OP_MAKE_ERR, dst, src),
            Instr::JumpIfNone { src, offset } => {
                w.write_u8(OP_JUMP_IF_NONE);
                w.write_u16_le(src);
                w.write_i32_le(offset);
            }
            Instr::JumpIfErr { src, offset } => {
                w.write_u8(OP_JUMP_IF_ERR);
                w.write_u16_le(src);
                w.write_i32_le(offset);
            }
            Instr::Unwrap { dst, src } => ab!(w, OP_UNWRAP, dst, src),
            Instr::UnwrapErr { dst, src } => ab!(w, OP_UNWRAP_ERR, dst, src),

            Instr::Print { src } => {
                w.write_u8(OP_PRINT);
                w.write_u16_le(src);
            }
        }
    }

    /// Decodes one instruction from `r`.
    pub fn decode(r: &mut ByteReader<'_>) -> CoreResult<Self> {
        let op = r.read_u8()?;
        let instr = match op {
            OP_MOVE => Instr::Move { dst: r.read_u16_le()?, src: r.read_u16_le()? },
            OP_LOAD_CONST => Instr::LoadConst { dst: r.read_u16_le()?, idx: r.read_u32_le()? },
            OP_LOAD_GLOBAL => Instr::LoadGlobal { dst: r.read_u16_le()?, name: r.read_u32_le()? },
            OP_INIT_GLOBAL => Instr::InitGlobal { src: r.read_u16_le()?, name: r.read_u32_le()? },

            OP_ADD_INT => Instr::AddInt { dst: r.read_u16_le()?, lhs: r.read_u16_le()?, rhs: r.read_u16_le()? },
            OP_SUB_INT => Instr::SubInt { dst: r.read_u16_le()?, lhs: r.read_u16_le()?, rhs: r.read_u16_le()? },
            OP_MUL_INT => Instr::MulInt { dst: r.read_u16_le()?, lhs: r.read_u16_le()?, rhs: r.read_u16_le()? },
            OP_DIV_INT => Instr::DivInt { dst: r.read_u16_le()?, lhs: r.read_u16_le()?, rhs: r.read_u16_le()? },
            OP_REM_INT => Instr::RemInt { dst: r.read_u16_le()?, lhs: r.read_u16_le()?, rhs: r.read_u16_le()? },
            OP_NEG_INT => Instr::NegInt { dst: r.read_u16_le()?, src: r.read_u16_le()? },
            OP_ADD_FLOAT => Instr::AddFloat { dst: r.read_u16_le()?, lhs: r.read_u16_le()?, rhs: r.read_u16_le()? },
            OP_SUB_FLOAT => Instr::SubFloat { dst: r.read_u16_le()?, lhs: r.read_u16_le()?, rhs: r.read_u16_le()? },
            OP_MUL_FLOAT => Instr::MulFloat { dst: r.read_u16_le()?, lhs: r.read_u16_le()?, rhs: r.read_u16_le()? },
            OP_DIV_FLOAT => Instr::DivFloat { dst: r.read_u16_le()?, lhs: r.read_u16_le()?, rhs: r.read_u16_le()? },
            OP_NEG_FLOAT => Instr::NegFloat { dst: r.read_u16_le()?, src: r.read_u16_le()? },
            OP_AND => Instr::And { dst: r.read_u16_le()?, lhs: r.read_u16_le()?, rhs: r.read_u16_le()? },
            OP_OR => Instr::Or { dst: r.read_u16_le()?, lhs: r.read_u16_le()?, rhs: r.read_u16_le()? },
            OP_NOT => Instr::Not { dst: r.read_u16_le()?, src: r.read_u16_le()? },
            OP_CONCAT => Instr::Concat { dst: r.read_u16_le()?, lhs: r.read_u16_le()?, rhs: r.read_u16_le()? },

            OP_EQ => Instr::Eq { dst: r.read_u16_le()?, lhs: r.read_u16_le()?, rhs: r.read_u16_le()? },
            OP_NE => Instr::Ne { dst: r.read_u16_le()?, lhs: r.read_u16_le()?, rhs: r.read_u16_le()? },
            OP_LT => Instr::Lt { dst: r.read_u16_le()?, lhs: r.read_u16_le()?, rhs: r.read_u16_le()? },
            OP_LE => Instr::Le { dst: r.read_u16_le()?, lhs: r.read_u16_le()?, rhs: r.read_u16_le()? },
            OP_GT => Instr::Gt { dst: r.read_u16_le()?, lhs: r.read_u16_le()?, rhs: r.read_u16_le()? },
            OP_GE => Instr::Ge { dst: r.read_u16_le()?, lhs: r.read_u16_le()?, rhs: r.read_u16_le()? },

            OP_JUMP => Instr::Jump { offset: r.read_i32_le()? },
            OP_JUMP_IF => Instr::JumpIf { cond: r.read_u16_le()?, offset: r.read_i32_le()? },
            OP_JUMP_IF_NOT => Instr::JumpIfNot { cond: r.read_u16_le()?, offset: r.read_i32_le()? },
            OP_CALL => Instr::Call {
                func: r.read_u32_le()?,
                num_args: r.read_u8()?,
                num_results: r.read_u8()?,
                first_arg: r.read_u16_le()?,
                first_result: r.read_u16_le()?,
            },
            OP_CALL_HOST => Instr::CallHost {
                host: r.read_u32_le()?,
                num_args: r.read_u8()?,
                num_results: r.read_u8()?,
                first_arg: r.read_u16_le()?,
                first_result: r.read_u16_le()?,
            },
            OP_RETURN => Instr::Return { first: r.read_u16_le()?, count: r.read_u8()? },

            OP_NEW_TABLE => Instr::NewTable { dst: r.read_u16_le()? },
            OP_NEW_ARRAY => Instr::NewArray { dst: r.read_u16_le()?, len_hint: r.read_u32_le()? },
            OP_NEW_REF => Instr::NewRef { dst: r.read_u16_le()?, src: r.read_u16_le()? },
            OP_NEW_WEAK => Instr::NewWeak { dst: r.read_u16_le()?, src: r.read_u16_le()? },
            OP_DEREF => Instr::Deref { dst: r.read_u16_le()?, src: r.read_u16_le()? },
            OP_GET_FIELD => Instr::GetField {
                dst: r.read_u16_le()?,
                obj: r.read_u16_le()?,
                name: r.read_u32_le()?,
            },
            OP_SET_FIELD => Instr::SetField {
                obj: r.read_u16_le()?,
                name: r.read_u32_le()?,
                src: r.read_u16_le()?,
            },
            OP_GET_INDEX => Instr::GetIndex { dst: r.read_u16_le()?, arr: r.read_u16_le()?, idx: r.read_u16_le()? },
            OP_SET_INDEX => Instr::SetIndex { arr: r.read_u16_le()?, idx: r.read_u16_le()?, src: r.read_u16_le()? },
            OP_ARRAY_PUSH => Instr::ArrayPush { arr: r.read_u16_le()?, src: r.read_u16_le()? },
            OP_LEN => Instr::Len { dst: r.read_u16_le()?, src: r.read_u16_le()? },

            OP_MAKE_SOME => Instr::MakeSome { dst: r.read_u16_le()?, src: r.read_u16_le()? },
            OP_MAKE_NONE => Instr::MakeNone { dst: r.read_u16_le()? },
            OP_MAKE_OK => Instr::MakeOk { dst: r.read_u16_le()?, src: r.read_u16_le()? },
            OP_MAKE_ERR => Instr::MakeErr { dst: r.read_u16_le()?, src: r.read_u16_le()? },
            OP_JUMP_IF_NONE => Instr::JumpIfNone { src: r.read_u16_le()?, offset: r.read_i32_le()? },
            OP_JUMP_IF_ERR => Instr::JumpIfErr { src: r.read_u16_le()?, offset: r.read_i32_le()? },
            OP_UNWRAP => Instr::Unwrap { dst: r.read_u16_le()?, src: r.read_u16_le()? },
            OP_UNWRAP_ERR => Instr::UnwrapErr { dst: r.read_u16_le()?, src: r.read_u16_le()? },

            OP_PRINT => Instr::Print { src: r.read_u16_le()? },

            other => return Err(CoreError::corrupted(format!("unknown opcode 0x{other:02X}"))),
        };
        Ok(instr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<Instr> {
        vec![
            Instr::Move { dst: 0, src: 1 },
            Instr::LoadConst { dst: 2, idx: 7 },
            Instr::LoadGlobal { dst: 3, name: 1 },
            Instr::InitGlobal { src: 3, name: 1 },
            Instr::AddInt { dst: 0, lhs: 1, rhs: 2 },
            Instr::DivFloat { dst: 5, lhs: 6, rhs: 7 },
            Instr::NegInt { dst: 1, src: 1 },
            Instr::Not { dst: 4, src: 4 },
            Instr::Concat { dst: 0, lhs: 1, rhs: 2 },
            Instr::Le { dst: 0, lhs: 1, rhs: 2 },
            Instr::Jump { offset: -3 },
            Instr::JumpIfNot { cond: 2, offset: 12 },
            Instr::Call { func: 4, num_args: 2, num_results: 1, first_arg: 5, first_result: 3 },
            Instr::CallHost { host: 0, num_args: 0, num_results: 1, first_arg: 0, first_result: 0 },
            Instr::Return { first: 0, count: 1 },
            Instr::NewTable { dst: 9 },
            Instr::NewArray { dst: 8, len_hint: 16 },
            Instr::NewWeak { dst: 1, src: 9 },
            Instr::Deref { dst: 2, src: 1 },
            Instr::GetField { dst: 0, obj: 9, name: 3 },
            Instr::SetField { obj: 9, name: 3, src: 0 },
            Instr::GetIndex { dst: 0, arr: 8, idx: 1 },
            Instr::SetIndex { arr: 8, idx: 1, src: 0 },
            Instr::ArrayPush { arr: 8, src: 0 },
            Instr::Len { dst: 0, src: 8 },
            Instr::MakeSome { dst: 0, src: 1 },
            Instr::MakeNone { dst: 0 },
            Instr::JumpIfErr { src: 2, offset: 5 },
            Instr::Unwrap { dst: 0, src: 2 },
            Instr::UnwrapErr { dst: 0, src: 2 },
            Instr::Print { src: 0 },
        ]
    }

    #[test]
    fn encode_decode_roundtrip() {
        let mut w = ByteWriter::new();
        for i in sample() {
            i.encode(&mut w);
        }
        let mut r = ByteReader::new(w.as_slice());
        for expected in sample() {
            assert_eq!(Instr::decode(&mut r).unwrap(), expected);
        }
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn unknown_opcode_rejected() {
        let mut r = ByteReader::new(&[0xFF]);
        assert!(Instr::decode(&mut r).is_err());
    }
}
