//! linemap.rs — Projection bytecode ↔ source
//!
//! Construit une fois par programme : pour chaque (fichier, ligne),
//! l'ensemble trié des indices d'instructions annotés avec cette
//! position. Sert à vérifier les breakpoints (la ligne porte-t-elle du
//! code ?) et à les repositionner sur la prochaine ligne exécutable.

use std::collections::HashMap;
use std::path::Path;

use etch_core::Program;

/// Index (fichier, ligne) → pcs.
#[derive(Debug, Default)]
pub struct LineMap {
    by_line: HashMap<(u32, u32), Vec<u32>>,
    max_line: HashMap<u32, u32>,
}

impl LineMap {
    /// Construit l'index depuis les infos de debug du programme.
    pub fn build(program: &Program) -> Self {
        let mut map = LineMap::default();
        for (pc, d) in program.debug.iter().enumerate() {
            map.by_line.entry((d.file, d.line)).or_default().push(pc as u32);
            let max = map.max_line.entry(d.file).or_insert(0);
            *max = (*max).max(d.line);
        }
        map
    }

    /// Les instructions annotées (fichier, ligne), en ordre croissant de pc.
    pub fn pcs_for(&self, file: u32, line: u32) -> &[u32] {
        self.by_line.get(&(file, line)).map(Vec::as_slice).unwrap_or(&[])
    }

    /// La ligne porte-t-elle du code ?
    pub fn has_line(&self, file: u32, line: u32) -> bool {
        self.by_line.contains_key(&(file, line))
    }

    /// Repositionne une ligne demandée : elle-même si elle porte du code,
    /// sinon la prochaine ligne exécutable du fichier.
    pub fn resolve_line(&self, file: u32, requested: u32) -> Option<u32> {
        if self.has_line(file, requested) {
            return Some(requested);
        }
        let max = *self.max_line.get(&file)?;
        (requested..=max).find(|&l| self.has_line(file, l))
    }
}

/// Identifie le fichier du programme correspondant à un chemin client
/// (chemin exact, ou même nom de fichier).
pub fn resolve_file(program: &Program, path: &str) -> Option<u32> {
    if let Some(pos) = program.files.iter().position(|f| f == path) {
        return Some(pos as u32);
    }
    let wanted = Path::new(path).file_name()?;
    program
        .files
        .iter()
        .position(|f| Path::new(f).file_name() == Some(wanted))
        .map(|pos| pos as u32)
}

/// Vrai si deux chemins désignent plausiblement le même fichier source.
pub fn paths_match(a: &str, b: &str) -> bool {
    a == b || Path::new(a).file_name().is_some() && Path::new(a).file_name() == Path::new(b).file_name()
}
