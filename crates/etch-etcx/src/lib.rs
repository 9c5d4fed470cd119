//! etch-etcx — Spécification & IO du format binaire ETCX
//!
//! Format :
//! ```text
//! Header: "ETCX\0" (5 bytes) + version u8
//! [Section*]
//!   section = TAG[4] + len u32 LE + payload
//! Dernière section: "CRCC" + u32 (CRC32 sur tout après le header)
//! ```
//!
//! Sections, toujours écrites dans cet ordre (le roundtrip est garanti
//! octet-à-octet) :
//! - "CNST" : constant pool (tag byte + payload par entrée)
//! - "FUNC" : table des fonctions {nom manglé, start/end pc, registres, locals}
//! - "CODE" : instructions encodées
//! - "DBUG" : une entrée (file, line, col, stmt) par instruction
//! - "SRCS" : chemins des fichiers source
//! - "ENTR" : pc du point d'entrée
//!
//! Seule la version courante ([`etch_core::ETCX_VERSION`]) est chargée ;
//! toute autre est rejetée avec une erreur claire.
//!
//! API :
//! - `encode_program()` / `decode_program()`
//! - `write_file()`, `read_file()`
//! - module [`replay`] : fichiers `.replay` (programme + snapshots)
//! - module [`cache`] : répertoire `__etch__/` adjacent aux sources

#![deny(missing_docs)]
#![forbid(unsafe_code)]

use std::{fs, io::Read, path::Path};

use etch_core::{
    crc32_ieee, ByteReader, ByteWriter, CoreError, CoreResult, DebugEntry, FunctionInfo, Instr,
    LocalSlot, Program, SectionTag, Value, ETCX_VERSION, MAGIC_ETCX,
};

/// Fichiers `.replay` : image du programme + snapshots par statement.
pub mod replay;

/// Cache bytecode `__etch__/` adjacent aux sources.
pub mod cache;

const CONST_TAG_NIL: u8 = 0x00;
const CONST_TAG_BOOL: u8 = 0x01;
const CONST_TAG_INT: u8 = 0x02;
const CONST_TAG_FLOAT: u8 = 0x03;
const CONST_TAG_CHAR: u8 = 0x04;
const CONST_TAG_STR: u8 = 0x05;

/// Encode un programme complet en binaire ETCX (avec CRC32).
pub fn encode_program(program: &Program) -> Vec<u8> {
    let mut w = ByteWriter::new();
    w.write_bytes(MAGIC_ETCX);
    w.write_u8(ETCX_VERSION);

    // CNST
    let mut buf = ByteWriter::new();
    buf.write_u32_le(program.consts.len() as u32);
    for (_, value) in program.consts.iter() {
        match value {
            Value::Nil => buf.write_u8(CONST_TAG_NIL),
            Value::Bool(b) => {
                buf.write_u8(CONST_TAG_BOOL);
                buf.write_u8(u8::from(*b));
            }
            Value::Int(v) => {
                buf.write_u8(CONST_TAG_INT);
                buf.write_i64_le(*v);
            }
            Value::Float(v) => {
                buf.write_u8(CONST_TAG_FLOAT);
                buf.write_f64_le(*v);
            }
            Value::Char(c) => {
                buf.write_u8(CONST_TAG_CHAR);
                buf.write_u32_le(*c as u32);
            }
            Value::Str(s) => {
                buf.write_u8(CONST_TAG_STR);
                buf.write_str(s);
            }
            // ProgramBuilder/validate only admit scalar pool entries.
            other => unreachable!("non-scalar constant in pool: {other:?}"),
        }
    }
    write_section(&mut w, SectionTag::CNST, buf);

    // FUNC
    let mut buf = ByteWriter::new();
    buf.write_u32_le(program.funcs.len() as u32);
    for f in &program.funcs {
        buf.write_str(&f.name);
        buf.write_u32_le(f.start_pc);
        buf.write_u32_le(f.end_pc);
        buf.write_u16_le(f.reg_count);
        buf.write_u32_le(f.locals.len() as u32);
        for l in &f.locals {
            buf.write_str(&l.name);
            buf.write_u16_le(l.reg);
        }
    }
    write_section(&mut w, SectionTag::FUNC, buf);

    // CODE
    let mut buf = ByteWriter::new();
    buf.write_u32_le(program.instrs.len() as u32);
    for instr in &program.instrs {
        instr.encode(&mut buf);
    }
    write_section(&mut w, SectionTag::CODE, buf);

    // DBUG
    let mut buf = ByteWriter::new();
    buf.write_u32_le(program.debug.len() as u32);
    for d in &program.debug {
        buf.write_u32_le(d.file);
        buf.write_u32_le(d.line);
        buf.write_u32_le(d.col);
        buf.write_u32_le(d.stmt);
    }
    write_section(&mut w, SectionTag::DBUG, buf);

    // SRCS
    let mut buf = ByteWriter::new();
    buf.write_u32_le(program.files.len() as u32);
    for f in &program.files {
        buf.write_str(f);
    }
    write_section(&mut w, SectionTag::SRCS, buf);

    // ENTR
    let mut buf = ByteWriter::new();
    buf.write_u32_le(program.entry_point);
    write_section(&mut w, SectionTag::ENTR, buf);

    // CRC32 sur tout sauf magic/version
    let bytes = w.into_vec();
    let crc = crc32_ieee(&bytes[MAGIC_ETCX.len() + 1..]);
    let mut out = bytes;
    out.extend_from_slice(&SectionTag::CRCC.to_be_bytes());
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

fn write_section(w: &mut ByteWriter, tag: SectionTag, payload: ByteWriter) {
    w.write_tag(tag);
    w.write_u32_le(payload.as_slice().len() as u32);
    w.write_bytes(payload.as_slice());
}

/// Décode (et valide) un programme depuis la sortie de [`encode_program`].
pub fn decode_program(data: &[u8]) -> CoreResult<Program> {
    let header = MAGIC_ETCX.len() + 1;
    let mut r = ByteReader::new(data);
    let magic = r.read_bytes(MAGIC_ETCX.len())?;
    if magic != MAGIC_ETCX {
        return Err(CoreError::InvalidMagic);
    }
    let version = r.read_u8()?;
    if version != ETCX_VERSION {
        return Err(CoreError::UnsupportedVersion { found: version, expected: ETCX_VERSION });
    }

    let mut program = Program::default();
    let mut crc_seen = false;

    while r.remaining() > 0 {
        let tag = r.read_tag()?;
        if tag == SectionTag::CRCC {
            let expected = r.read_u32_le()?;
            let crc = crc32_ieee(&data[header..data.len() - 8]); // 8 = "CRCC" + u32
            if expected != crc {
                return Err(CoreError::corrupted("CRC32 mismatch"));
            }
            crc_seen = true;
            break;
        }
        let len = r.read_u32_le()? as usize;
        let payload = r.read_bytes(len)?;
        let mut rr = ByteReader::new(payload);
        match tag {
            SectionTag::CNST => {
                let count = rr.read_u32_le()?;
                for _ in 0..count {
                    let value = match rr.read_u8()? {
                        CONST_TAG_NIL => Value::Nil,
                        CONST_TAG_BOOL => match rr.read_u8()? {
                            0 => Value::Bool(false),
                            1 => Value::Bool(true),
                            _ => return Err(CoreError::corrupted("invalid bool constant")),
                        },
                        CONST_TAG_INT => Value::Int(rr.read_i64_le()?),
                        CONST_TAG_FLOAT => Value::Float(rr.read_f64_le()?),
                        CONST_TAG_CHAR => {
                            let raw = rr.read_u32_le()?;
                            let c = char::from_u32(raw)
                                .ok_or_else(|| CoreError::corrupted("invalid char constant"))?;
                            Value::Char(c)
                        }
                        CONST_TAG_STR => Value::str(rr.read_str()?),
                        other => {
                            return Err(CoreError::corrupted(format!(
                                "unknown constant tag 0x{other:02X}"
                            )))
                        }
                    };
                    // Direct push, bypassing dedup: indices must survive as-is.
                    program.consts.push_unchecked(value);
                }
            }
            SectionTag::FUNC => {
                let count = rr.read_u32_le()?;
                for _ in 0..count {
                    let name = rr.read_str()?;
                    let start_pc = rr.read_u32_le()?;
                    let end_pc = rr.read_u32_le()?;
                    let reg_count = rr.read_u16_le()?;
                    let local_count = rr.read_u32_le()?;
                    let mut locals = Vec::with_capacity(local_count as usize);
                    for _ in 0..local_count {
                        let lname = rr.read_str()?;
                        let reg = rr.read_u16_le()?;
                        locals.push(LocalSlot { name: lname, reg });
                    }
                    program.funcs.push(FunctionInfo { name, start_pc, end_pc, reg_count, locals });
                }
            }
            SectionTag::CODE => {
                let count = rr.read_u32_le()?;
                for _ in 0..count {
                    program.instrs.push(Instr::decode(&mut rr)?);
                }
            }
            SectionTag::DBUG => {
                let count = rr.read_u32_le()?;
                for _ in 0..count {
                    program.debug.push(DebugEntry {
                        file: rr.read_u32_le()?,
                        line: rr.read_u32_le()?,
                        col: rr.read_u32_le()?,
                        stmt: rr.read_u32_le()?,
                    });
                }
            }
            SectionTag::SRCS => {
                let count = rr.read_u32_le()?;
                for _ in 0..count {
                    program.files.push(rr.read_str()?);
                }
            }
            SectionTag::ENTR => {
                program.entry_point = rr.read_u32_le()?;
            }
            SectionTag::CRCC => unreachable!(),
        }
        if rr.remaining() != 0 {
            return Err(CoreError::corrupted("trailing bytes in section"));
        }
    }

    if !crc_seen {
        return Err(CoreError::corrupted("missing CRC trailer"));
    }
    program.validate()?;
    Ok(program)
}

/// Écrit un programme dans un fichier.
pub fn write_file<P: AsRef<Path>>(program: &Program, path: P) -> CoreResult<()> {
    let bytes = encode_program(program);
    fs::write(path, bytes).map_err(|e| CoreError::corrupted(format!("io write error: {e}")))
}

/// Lit un programme depuis un fichier.
pub fn read_file<P: AsRef<Path>>(path: P) -> CoreResult<Program> {
    let mut buf = Vec::new();
    let mut file =
        fs::File::open(path).map_err(|e| CoreError::corrupted(format!("io open error: {e}")))?;
    file.read_to_end(&mut buf)
        .map_err(|e| CoreError::corrupted(format!("io read error: {e}")))?;
    decode_program(&buf)
}

/* ─────────────────────────── Tests ─────────────────────────── */

#[cfg(test)]
mod tests {
    use super::*;
    use etch_core::program::GLOBAL_FUNCTION;
    use etch_core::ProgramBuilder;

    fn sample_program() -> Program {
        let mut b = ProgramBuilder::new();
        let f = b.file("main.etch");
        let ka = b.constant(Value::Int(10));
        let kb = b.constant(Value::Int(20));
        let kc = b.constant(Value::str("done"));
        b.begin_function(GLOBAL_FUNCTION, 1);
        b.emit(
            Instr::Call { func: 1, num_args: 0, num_results: 0, first_arg: 0, first_result: 0 },
            DebugEntry { file: f, line: 1, col: 1, stmt: 0 },
        );
        b.emit(Instr::Return { first: 0, count: 0 }, DebugEntry { file: f, line: 1, col: 1, stmt: 0 });
        b.end_function();
        b.begin_function("main$_v", 4);
        b.local("a", 0);
        b.local("b", 1);
        b.emit(Instr::LoadConst { dst: 0, idx: ka }, DebugEntry { file: f, line: 2, col: 5, stmt: 1 });
        b.emit(Instr::LoadConst { dst: 1, idx: kb }, DebugEntry { file: f, line: 3, col: 5, stmt: 2 });
        b.emit(Instr::AddInt { dst: 2, lhs: 0, rhs: 1 }, DebugEntry { file: f, line: 4, col: 5, stmt: 3 });
        b.emit(Instr::Print { src: 2 }, DebugEntry { file: f, line: 4, col: 5, stmt: 3 });
        b.emit(Instr::LoadConst { dst: 3, idx: kc }, DebugEntry { file: f, line: 5, col: 5, stmt: 4 });
        b.emit(Instr::Print { src: 3 }, DebugEntry { file: f, line: 5, col: 5, stmt: 4 });
        b.emit(Instr::Return { first: 0, count: 0 }, DebugEntry { file: f, line: 6, col: 1, stmt: 5 });
        b.end_function();
        b.finish().unwrap()
    }

    #[test]
    fn roundtrip_program() {
        let p = sample_program();
        let bytes = encode_program(&p);
        let p2 = decode_program(&bytes).unwrap();
        assert_eq!(p, p2);
    }

    #[test]
    fn roundtrip_byte_equal() {
        // serialize → load → serialize must be byte-equal
        let p = sample_program();
        let bytes = encode_program(&p);
        let p2 = decode_program(&bytes).unwrap();
        assert_eq!(bytes, encode_program(&p2));
    }

    #[test]
    fn wrong_version_rejected() {
        let p = sample_program();
        let mut bytes = encode_program(&p);
        bytes[MAGIC_ETCX.len()] = ETCX_VERSION + 1;
        match decode_program(&bytes) {
            Err(CoreError::UnsupportedVersion { found, expected }) => {
                assert_eq!(found, ETCX_VERSION + 1);
                assert_eq!(expected, ETCX_VERSION);
            }
            other => panic!("expected UnsupportedVersion, got {other:?}"),
        }
    }

    #[test]
    fn bad_magic_rejected() {
        let p = sample_program();
        let mut bytes = encode_program(&p);
        bytes[0] = b'X';
        assert!(matches!(decode_program(&bytes), Err(CoreError::InvalidMagic)));
    }

    #[test]
    fn corruption_detected_by_crc() {
        let p = sample_program();
        let mut bytes = encode_program(&p);
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0x5A;
        assert!(decode_program(&bytes).is_err());
    }

    #[test]
    fn file_io() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.etcx");
        let p = sample_program();
        write_file(&p, &path).unwrap();
        let p2 = read_file(&path).unwrap();
        assert_eq!(p, p2);
    }
}
