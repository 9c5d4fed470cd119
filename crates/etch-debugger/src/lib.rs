//! etch-debugger — cœur du débogueur Etch
//!
//! Traduit l'exécution bytecode en observations et contrôle *niveau
//! source* :
//! - [`linemap`]    : projection (fichier, ligne) ↔ indices d'instructions
//! - [`breakpoint`] : points d'arrêt par fichier/ligne, conditions,
//!   suppression « justStepped »
//! - [`step`]       : plans de pas-à-pas (over/in/out) sur la granularité
//!   ligne + stmt id
//! - [`state`]      : handles `variablesReference` et raisons d'arrêt
//! - [`eval`]       : mini-évaluateur d'expressions (conditions de BP) et
//!   parsing typé des entrées `setVariable`
//! - [`api`]        : la façade [`api::DebuggerCore`] branchée sur le
//!   callback d'instruction de la VM
//!
//! La VM reste la source de vérité ; tout l'état ici est dérivé et se
//! rafraîchit à chaque arrêt.

#![forbid(unsafe_code)]

pub mod api;
pub mod breakpoint;
pub mod eval;
pub mod linemap;
pub mod state;
pub mod step;

pub use api::{DebugEvent, DebuggerCore, FrameInfo, Scope, Variable};
pub use breakpoint::{BreakpointManager, BreakpointSpec, ResolvedBreakpoint};
pub use state::{ScopeKind, StopReason, VarSlot, VarTable};
pub use step::{ExecPoint, StepController, StepMode};
