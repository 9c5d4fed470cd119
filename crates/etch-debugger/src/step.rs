//! step.rs — Contrôleur de pas-à-pas au niveau ligne-source
//!
//! Un plan capture la position de départ (profondeur de pile, fichier,
//! ligne, stmt id) ; `should_stop` est interrogé avant chaque
//! instruction. « Nouvelle ligne » = (fichier, ligne) différents de
//! l'origine **et** stmt id différent : deux instructions de même ligne
//! mais de stmt ids distincts sont des cibles de step distinctes (l'en-tête
//! d'une boucle s'arrête donc à chaque itération), tandis qu'une
//! expression multi-lignes partageant un stmt id n'en est pas une.

use serde::{Deserialize, Serialize};

/// Mode de step demandé par le client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepMode {
    /// Reprendre ; seuls les breakpoints arrêtent.
    Continue,
    /// Prochaine ligne à profondeur ≤ départ (les appels ne stoppent pas).
    Over,
    /// Prochaine ligne, quelle que soit la profondeur.
    In,
    /// Retour à l'appelant (profondeur < départ).
    Out,
    /// Pause asynchrone : le prochain callback s'arrête.
    Pause,
}

/// Position d'exécution logique, dérivée des infos de debug au pc courant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecPoint {
    /// Id du fichier source.
    pub file: u32,
    /// Ligne source.
    pub line: u32,
    /// Stmt id du compilateur.
    pub stmt: u32,
    /// Profondeur de pile (frames.len()).
    pub depth: usize,
}

/// Instantané de départ d'un plan de step.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StepPlan {
    /// Mode demandé.
    pub mode: StepMode,
    /// Profondeur au départ.
    pub start_depth: usize,
    /// Fichier au départ.
    pub start_file: u32,
    /// Ligne au départ.
    pub start_line: u32,
    /// Stmt id au départ.
    pub start_stmt: u32,
}

/// Un plan actif à la fois (mono-thread).
#[derive(Debug, Default)]
pub struct StepController {
    plan: Option<StepPlan>,
}

impl StepController {
    /// (Ré)initialise un plan depuis la position capturée au stop.
    pub fn begin(&mut self, mode: StepMode, origin: ExecPoint) {
        self.plan = Some(StepPlan {
            mode,
            start_depth: origin.depth,
            start_file: origin.file,
            start_line: origin.line,
            start_stmt: origin.stmt,
        });
    }

    /// Désactive le plan (à appeler quand on a décidé de s'arrêter).
    pub fn finish(&mut self) { self.plan = None; }

    /// Un plan est-il actif ?
    pub fn is_active(&self) -> bool { self.plan.is_some() }

    /// Le mode du plan actif.
    pub fn mode(&self) -> Option<StepMode> { self.plan.map(|p| p.mode) }

    /// Faut-il s'arrêter **maintenant**, juste avant l'instruction à `cur` ?
    pub fn should_stop(&self, cur: ExecPoint) -> bool {
        let Some(plan) = &self.plan else { return false };

        let moved = (cur.file != plan.start_file || cur.line != plan.start_line)
            && cur.stmt != plan.start_stmt;

        match plan.mode {
            StepMode::In => moved,
            StepMode::Over => cur.depth <= plan.start_depth && moved,
            StepMode::Out => cur.depth < plan.start_depth,
            StepMode::Pause => true,
            StepMode::Continue => false,
        }
    }
}
