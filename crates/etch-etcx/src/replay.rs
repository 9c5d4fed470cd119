//! `.replay` files — recorded executions.
//!
//! A replay is the program image plus one snapshot per executed statement:
//! the pc, owning function, source line and the rendered contents of the
//! top frame's registers. Values are stored in canonical display form
//! (heap-flattened at record time), so replay needs no live heap.
//!
//! ```text
//! Header: "ETCHRPLY" (8 bytes) + version u8
//! program image: len u32 + ETCX bytes
//! snapshots: count u32 + entries
//!   entry = ordinal u32, pc u32, func u32, line u32,
//!           regs count u32 + { reg u16, type str, rendered str }*
//! Trailer: CRC32 u32 (sur tout après le header)
//! ```

use std::{fs, io::Read, path::Path};

use etch_core::{crc32_ieee, ByteReader, ByteWriter, CoreError, CoreResult, Program};

/// Magic d'un fichier replay.
pub const MAGIC_REPLAY: &[u8; 8] = b"ETCHRPLY";

/// Version du format replay.
pub const REPLAY_VERSION: u8 = 1;

/// Rendered state of one register at a statement boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegSnapshot {
    /// Register index.
    pub reg: u16,
    /// Source-language type name.
    pub type_name: String,
    /// Canonical display form.
    pub rendered: String,
}

/// State captured when a statement began executing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StmtSnapshot {
    /// 1-based statement ordinal in execution order.
    pub ordinal: u32,
    /// Instruction index the statement started at.
    pub pc: u32,
    /// Function table index of the owning frame.
    pub func: u32,
    /// Source line.
    pub line: u32,
    /// Top frame registers, in index order.
    pub regs: Vec<RegSnapshot>,
}

/// A recorded execution: program + per-statement snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct Replay {
    /// The program that was executed.
    pub program: Program,
    /// Snapshots in execution order.
    pub snapshots: Vec<StmtSnapshot>,
}

impl Replay {
    /// Encode to the binary replay format.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        w.write_bytes(MAGIC_REPLAY);
        w.write_u8(REPLAY_VERSION);

        let image = crate::encode_program(&self.program);
        w.write_u32_le(image.len() as u32);
        w.write_bytes(&image);

        w.write_u32_le(self.snapshots.len() as u32);
        for s in &self.snapshots {
            w.write_u32_le(s.ordinal);
            w.write_u32_le(s.pc);
            w.write_u32_le(s.func);
            w.write_u32_le(s.line);
            w.write_u32_le(s.regs.len() as u32);
            for r in &s.regs {
                w.write_u16_le(r.reg);
                w.write_str(&r.type_name);
                w.write_str(&r.rendered);
            }
        }

        let bytes = w.into_vec();
        let crc = crc32_ieee(&bytes[MAGIC_REPLAY.len() + 1..]);
        let mut out = bytes;
        out.extend_from_slice(&crc.to_le_bytes());
        out
    }

    /// Decode from [`Replay::to_bytes`] output.
    pub fn from_bytes(data: &[u8]) -> CoreResult<Self> {
        let header = MAGIC_REPLAY.len() + 1;
        if data.len() < header + 4 {
            return Err(CoreError::corrupted("replay too short"));
        }
        let (payload, crc_bytes) = data.split_at(data.len() - 4);
        let expected = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        let actual = crc32_ieee(&payload[header..]);
        if expected != actual {
            return Err(CoreError::corrupted("replay CRC32 mismatch"));
        }

        let mut r = ByteReader::new(payload);
        let magic = r.read_bytes(MAGIC_REPLAY.len())?;
        if magic != MAGIC_REPLAY {
            return Err(CoreError::corrupted("invalid replay magic"));
        }
        let version = r.read_u8()?;
        if version != REPLAY_VERSION {
            return Err(CoreError::UnsupportedVersion { found: version, expected: REPLAY_VERSION });
        }

        let image_len = r.read_u32_le()? as usize;
        let image = r.read_bytes(image_len)?;
        let program = crate::decode_program(image)?;

        let count = r.read_u32_le()?;
        let mut snapshots = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let ordinal = r.read_u32_le()?;
            let pc = r.read_u32_le()?;
            let func = r.read_u32_le()?;
            let line = r.read_u32_le()?;
            let reg_count = r.read_u32_le()?;
            let mut regs = Vec::with_capacity(reg_count as usize);
            for _ in 0..reg_count {
                let reg = r.read_u16_le()?;
                let type_name = r.read_str()?;
                let rendered = r.read_str()?;
                regs.push(RegSnapshot { reg, type_name, rendered });
            }
            snapshots.push(StmtSnapshot { ordinal, pc, func, line, regs });
        }

        if r.remaining() != 0 {
            return Err(CoreError::corrupted("trailing bytes in replay"));
        }
        Ok(Replay { program, snapshots })
    }

    /// Écrit dans un fichier.
    pub fn write_file<P: AsRef<Path>>(&self, path: P) -> CoreResult<()> {
        fs::write(path, self.to_bytes())
            .map_err(|e| CoreError::corrupted(format!("io write error: {e}")))
    }

    /// Lit depuis un fichier.
    pub fn read_file<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let mut buf = Vec::new();
        let mut file = fs::File::open(path)
            .map_err(|e| CoreError::corrupted(format!("io open error: {e}")))?;
        file.read_to_end(&mut buf)
            .map_err(|e| CoreError::corrupted(format!("io read error: {e}")))?;
        Self::from_bytes(&buf)
    }
}

/* ─────────────────────────── Step specs ─────────────────────────── */

/// One element of a `--step` spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPoint {
    /// `S` — the first recorded statement.
    Start,
    /// `E` — the last recorded statement.
    End,
    /// A 1-based statement ordinal.
    Ordinal(u32),
}

/// Parses a comma-separated step spec, e.g. `S,3,7,E`.
pub fn parse_step_spec(spec: &str) -> CoreResult<Vec<StepPoint>> {
    let mut out = Vec::new();
    for part in spec.split(',') {
        let part = part.trim();
        match part {
            "" => continue,
            "S" | "s" => out.push(StepPoint::Start),
            "E" | "e" => out.push(StepPoint::End),
            n => {
                let ordinal: u32 = n
                    .parse()
                    .map_err(|_| CoreError::corrupted(format!("bad step spec element `{n}`")))?;
                out.push(StepPoint::Ordinal(ordinal));
            }
        }
    }
    if out.is_empty() {
        return Err(CoreError::corrupted("empty step spec"));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use etch_core::program::GLOBAL_FUNCTION;
    use etch_core::{DebugEntry, Instr, ProgramBuilder, Value};

    fn tiny_program() -> Program {
        let mut b = ProgramBuilder::new();
        let f = b.file("t.etch");
        let k = b.constant(Value::Int(1));
        b.begin_function(GLOBAL_FUNCTION, 1);
        b.emit(Instr::LoadConst { dst: 0, idx: k }, DebugEntry { file: f, line: 1, col: 1, stmt: 0 });
        b.emit(Instr::Return { first: 0, count: 0 }, DebugEntry { file: f, line: 1, col: 1, stmt: 0 });
        b.end_function();
        b.finish().unwrap()
    }

    #[test]
    fn roundtrip() {
        let replay = Replay {
            program: tiny_program(),
            snapshots: vec![StmtSnapshot {
                ordinal: 1,
                pc: 0,
                func: 0,
                line: 1,
                regs: vec![RegSnapshot { reg: 0, type_name: "int".into(), rendered: "1".into() }],
            }],
        };
        let bytes = replay.to_bytes();
        assert_eq!(Replay::from_bytes(&bytes).unwrap(), replay);
    }

    #[test]
    fn crc_detects_flip() {
        let replay = Replay { program: tiny_program(), snapshots: vec![] };
        let mut bytes = replay.to_bytes();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 1;
        assert!(Replay::from_bytes(&bytes).is_err());
    }

    #[test]
    fn step_spec_parsing() {
        assert_eq!(
            parse_step_spec("S,2,5,E").unwrap(),
            vec![StepPoint::Start, StepPoint::Ordinal(2), StepPoint::Ordinal(5), StepPoint::End]
        );
        assert!(parse_step_spec("S,x").is_err());
        assert!(parse_step_spec("").is_err());
    }
}
