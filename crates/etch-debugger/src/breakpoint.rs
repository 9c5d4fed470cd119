//! breakpoint.rs — Gestion des points d'arrêt (fichier/ligne, conditions)
//!
//! - `BreakpointManager` : remplacement par fichier (style DAP
//!   `setBreakpoints`), décision d'arrêt, ids stables.
//! - Conditions : expression string évaluée via un callback fourni par
//!   l'appelant ; toute erreur d'évaluation compte comme `false`.
//! - Suppression « justStepped » : après un arrêt de step sur une ligne,
//!   le breakpoint de cette même ligne ne re-déclenche pas tant qu'on ne
//!   l'a pas quittée.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Identifiant interne d'un breakpoint.
pub type BreakpointId = u64;

/// Requête côté client (DAP).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BreakpointSpec {
    /// Ligne demandée.
    pub line: u32,
    /// Condition optionnelle (ex: `x > 3`).
    pub condition: Option<String>,
}

/// État résolu côté VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedBreakpoint {
    /// Id stable.
    pub id: BreakpointId,
    /// Ligne effective (repositionnée sur du code exécutable).
    pub line: u32,
    /// Ligne demandée par le client.
    pub requested_line: u32,
    /// Armé avec succès ?
    pub verified: bool,
    /// Condition optionnelle.
    pub condition: Option<String>,
}

/// Points d'arrêt par fichier, avec le token de suppression de re-déclenchement.
#[derive(Debug, Default)]
pub struct BreakpointManager {
    next_id: BreakpointId,
    files: HashMap<String, Vec<ResolvedBreakpoint>>,
    just_stepped: Option<(String, u32)>,
}

impl BreakpointManager {
    /// Nouveau manager vide.
    pub fn new() -> Self { Self { next_id: 1, ..Self::default() } }

    /// Remplace la liste complète des breakpoints d'un fichier (style DAP).
    /// `resolve` repositionne une ligne demandée sur la prochaine ligne
    /// exécutable (None = ligne invérifiable).
    pub fn set_for_file<F>(
        &mut self,
        path: &str,
        specs: &[BreakpointSpec],
        mut resolve: F,
    ) -> Vec<ResolvedBreakpoint>
    where
        F: FnMut(u32) -> Option<u32>,
    {
        let mut resolved = Vec::with_capacity(specs.len());
        for spec in specs {
            let effective = resolve(spec.line);
            let id = self.next_id;
            self.next_id += 1;
            resolved.push(ResolvedBreakpoint {
                id,
                line: effective.unwrap_or(spec.line),
                requested_line: spec.line,
                verified: effective.is_some(),
                condition: spec.condition.clone(),
            });
        }
        self.files.insert(path.to_string(), resolved.clone());
        resolved
    }

    /// Tous les breakpoints d'un fichier.
    pub fn for_file(&self, path: &str) -> &[ResolvedBreakpoint] {
        self.files.get(path).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Y a-t-il au moins un breakpoint armé ?
    pub fn any(&self) -> bool { self.files.values().any(|v| !v.is_empty()) }

    /// Décide si (path, line) doit arrêter. `eval_cond` évalue une
    /// condition string dans le frame courant ; les erreurs y valent
    /// `false`. Le token justStepped supprime le re-déclenchement sur la
    /// ligne qu'on vient d'atteindre en steppant.
    pub fn should_break<F>(&mut self, path: &str, line: u32, mut eval_cond: F) -> Option<BreakpointId>
    where
        F: FnMut(&str) -> bool,
    {
        if let Some((f, l)) = &self.just_stepped {
            if crate::linemap::paths_match(f, path) && *l == line {
                return None;
            }
        }
        let list = self
            .files
            .iter()
            .find(|(p, _)| crate::linemap::paths_match(p, path))
            .map(|(_, v)| v)?;
        for bp in list {
            if bp.verified && bp.line == line {
                match &bp.condition {
                    Some(cond) if !eval_cond(cond) => continue,
                    _ => return Some(bp.id),
                }
            }
        }
        None
    }

    /// Pose le token de suppression après un arrêt de step sur (path, line).
    pub fn set_just_stepped(&mut self, path: &str, line: u32) {
        self.just_stepped = Some((path.to_string(), line));
    }

    /// Lève le token dès la première instruction qui quitte la ligne.
    pub fn clear_just_stepped_if_left(&mut self, path: &str, line: u32) {
        if let Some((f, l)) = &self.just_stepped {
            if !(crate::linemap::paths_match(f, path) && *l == line) {
                self.just_stepped = None;
            }
        }
    }
}
