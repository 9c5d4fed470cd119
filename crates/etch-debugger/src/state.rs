//! state.rs — État adaptateur : handles de variables et raisons d'arrêt
//!
//! L'état ici est *miroir* côté débogueur ; la VM reste la source de
//! vérité. Les `variablesReference` sont alloués de façon monotone à
//! chaque requête `scopes` (jamais réutilisés à numéro fixe) et la table
//! est vidée à chaque reprise pour éviter le stale.

use std::collections::HashMap;

use etch_core::{HeapId, Value};
use serde::{Deserialize, Serialize};

/// Raison du dernier arrêt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// Arrêt à l'entrée (`stopAtEntry`).
    Entry,
    /// Breakpoint atteint.
    Breakpoint,
    /// Fin d'un pas.
    Step,
    /// Pause demandée par le client.
    Pause,
    /// Erreur fatale de la VM.
    Exception,
}

impl StopReason {
    /// Forme wire DAP (`stopped.reason`).
    pub fn as_dap(self) -> &'static str {
        match self {
            StopReason::Entry => "entry",
            StopReason::Breakpoint => "breakpoint",
            StopReason::Step => "step",
            StopReason::Pause => "pause",
            StopReason::Exception => "exception",
        }
    }
}

/// Les trois scopes exposés par frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScopeKind {
    /// Variables locales nommées.
    Locals,
    /// Globals du programme.
    Globals,
    /// Fichier de registres brut (introspection VM).
    Registers,
}

impl ScopeKind {
    /// Nom affiché.
    pub fn display(self) -> &'static str {
        match self {
            ScopeKind::Locals => "Local Variables",
            ScopeKind::Globals => "Globals",
            ScopeKind::Registers => "Registers",
        }
    }
}

/// Ce vers quoi un `variablesReference` résout.
#[derive(Debug, Clone)]
pub enum VarSlot {
    /// Un scope d'un frame (index bottom-first dans la pile VM).
    Scope {
        /// Index du frame.
        frame: usize,
        /// Quel scope.
        kind: ScopeKind,
    },
    /// Les enfants d'un objet du tas (array, table, weak).
    Object(HeapId),
    /// Les enfants d'une valeur enveloppée (`some`/`ok`/`error`).
    Wrapped(Value),
}

/// Table handle → slot, ids monotones (≥ 1).
#[derive(Debug, Default)]
pub struct VarTable {
    next: i64,
    slots: HashMap<i64, VarSlot>,
}

impl VarTable {
    /// Table vide.
    pub fn new() -> Self { Self { next: 1, slots: HashMap::new() } }

    /// Alloue un handle frais.
    pub fn alloc(&mut self, slot: VarSlot) -> i64 {
        let id = self.next.max(1);
        self.next = id + 1;
        self.slots.insert(id, slot);
        id
    }

    /// Résout un handle.
    pub fn get(&self, varref: i64) -> Option<&VarSlot> { self.slots.get(&varref) }

    /// Vide la table (à chaque reprise d'exécution). Les ids continuent de
    /// croître : un handle périmé ne résout jamais vers autre chose.
    pub fn clear(&mut self) { self.slots.clear(); }
}
