//! api.rs — Façade du débogueur
//!
//! `DebuggerCore` est branché sur le callback d'instruction de la VM
//! (l'unique point de couplage) : avant chaque instruction il évalue
//! breakpoints puis plan de step et décide `Continue`/`Pause`. Les
//! événements (stopped, continued, terminated, output) partent sur un
//! canal crossbeam non-bloquant ; l'adaptateur DAP les draine et les
//! reformule en events wire.

use std::sync::Arc;

use color_eyre::eyre::{bail, eyre, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};

use etch_core::{mangle, Program, Reg, Value};
use etch_vm::{Slots, Tick, Vm};

use crate::breakpoint::{BreakpointManager, BreakpointSpec, ResolvedBreakpoint};
use crate::eval::{self, SetInput};
use crate::linemap::{self, LineMap};
use crate::state::{ScopeKind, StopReason, VarSlot, VarTable};
use crate::step::{ExecPoint, StepController, StepMode};

/* ------------------------------ Types DAP-friendly ------------------------ */

/// Un frame de pile, prêt pour `stackTrace`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameInfo {
    /// Id du frame (index bottom-first dans la pile VM).
    pub id: i64,
    /// Nom démanglé.
    pub name: String,
    /// Chemin source.
    pub source_path: String,
    /// Ligne courante.
    pub line: u32,
    /// Colonne courante.
    pub column: u32,
}

/// Une portée exposée par `scopes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scope {
    /// Nom affiché.
    pub name: String,
    /// Handle pour `variables`.
    pub variables_reference: i64,
    /// Coûteux à énumérer ?
    pub expensive: bool,
}

/// Une variable affichable/expandable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variable {
    /// Nom.
    pub name: String,
    /// Valeur rendue (format typé).
    pub value: String,
    /// Type source.
    #[serde(default)]
    pub r#type: Option<String>,
    /// > 0 si expansible.
    #[serde(default)]
    pub variables_reference: i64,
}

/// Événements poussés par le débogueur (non bloquants).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DebugEvent {
    /// La VM vient de s'arrêter.
    Stopped {
        /// Pourquoi.
        reason: StopReason,
        /// Chemin source de l'arrêt.
        source_path: String,
        /// Ligne de l'arrêt.
        line: u32,
        /// Profondeur de pile au moment de l'arrêt.
        depth: usize,
    },
    /// L'exécution reprend.
    Continued,
    /// La VM a terminé.
    Terminated {
        /// Code de sortie.
        exit_code: i32,
    },
    /// Sortie du programme (stdout) ou log.
    Output {
        /// Catégorie DAP (`stdout`, `console`…).
        category: String,
        /// Texte.
        text: String,
    },
}

/* ---------------------------------- Core ---------------------------------- */

/// Le cœur du débogueur. Un par session ; persiste entre plusieurs
/// exécutions du même programme (mode embedded).
pub struct DebuggerCore {
    program: Arc<Program>,
    linemap: LineMap,
    breakpoints: BreakpointManager,
    step: StepController,
    vars: VarTable,
    stop_reason: Option<StopReason>,
    stop_at_entry: bool,
    entry_pending: bool,
    events_tx: Sender<DebugEvent>,
}

impl DebuggerCore {
    /// Construit le cœur et le récepteur d'événements.
    pub fn new(program: Arc<Program>) -> (Self, Receiver<DebugEvent>) {
        let (tx, rx) = unbounded();
        let linemap = LineMap::build(&program);
        (
            Self {
                program,
                linemap,
                breakpoints: BreakpointManager::new(),
                step: StepController::default(),
                vars: VarTable::new(),
                stop_reason: None,
                stop_at_entry: false,
                entry_pending: false,
                events_tx: tx,
            },
            rx,
        )
    }

    /// Armer (ou non) l'arrêt à l'entrée. À appeler avant de lancer la VM.
    pub fn set_stop_at_entry(&mut self, stop: bool) {
        self.stop_at_entry = stop;
        self.entry_pending = true;
    }

    /// Raison du dernier arrêt, si la VM est arrêtée.
    pub fn stop_reason(&self) -> Option<StopReason> { self.stop_reason }

    /// Émet un événement `Output`.
    pub fn emit_output(&self, category: impl Into<String>, text: impl Into<String>) {
        let _ = self
            .events_tx
            .send(DebugEvent::Output { category: category.into(), text: text.into() });
    }

    /// Signale la fin de la VM.
    pub fn notify_terminated(&mut self, exit_code: i32) {
        self.stop_reason = None;
        self.step.finish();
        let _ = self.events_tx.send(DebugEvent::Terminated { exit_code });
    }

    /* ------------------------- Callback d'instruction ---------------------- */

    /// Décision avant chaque instruction. Breakpoints d'abord, plan de
    /// step ensuite (si le BP ne déclenche pas, le step peut décider).
    pub fn before_instruction(&mut self, vm: &Vm) -> Tick {
        let pc = vm.pc();
        let Some(d) = self.program.debug_at(pc).copied() else { return Tick::Continue };
        let path = self.program.file_path(d.file).unwrap_or("<unknown>").to_string();
        let depth = vm.depth();

        if self.entry_pending {
            self.entry_pending = false;
            if self.stop_at_entry {
                self.stop(StopReason::Entry, &path, d.line, depth);
                return Tick::Pause;
            }
        }

        self.breakpoints.clear_just_stepped_if_left(&path, d.line);

        let program = Arc::clone(&self.program);
        let hit = self.breakpoints.should_break(&path, d.line, |cond| {
            eval::eval_condition(cond, |name| lookup_in_frame(&program, vm, name)).unwrap_or(false)
        });
        if hit.is_some() {
            self.stop(StopReason::Breakpoint, &path, d.line, depth);
            return Tick::Pause;
        }

        let point = ExecPoint { file: d.file, line: d.line, stmt: d.stmt, depth };
        if self.step.should_stop(point) {
            let reason = match self.step.mode() {
                Some(StepMode::Pause) => StopReason::Pause,
                _ => StopReason::Step,
            };
            self.step.finish();
            self.stop(reason, &path, d.line, depth);
            return Tick::Pause;
        }

        Tick::Continue
    }

    /// Registers a stop. The suppression token covers the stopped-on line,
    /// so resuming does not re-trigger its breakpoint until execution
    /// leaves the line (one hit per loop iteration, not per instruction).
    fn stop(&mut self, reason: StopReason, path: &str, line: u32, depth: usize) {
        self.stop_reason = Some(reason);
        self.vars.clear();
        self.breakpoints.set_just_stepped(path, line);
        let _ = self.events_tx.send(DebugEvent::Stopped {
            reason,
            source_path: path.to_string(),
            line,
            depth,
        });
    }

    /* ------------------------------ Contrôle ------------------------------- */

    /// Arme une reprise : `Continue` (breakpoints seuls), `Over`/`In`/`Out`
    /// (plans de step depuis la position courante) ou `Pause` (le prochain
    /// callback s'arrête). Vide la table de variables — les handles du
    /// stop précédent deviennent périmés.
    pub fn request(&mut self, mode: StepMode, vm: &Vm) {
        log::debug!("resume request {mode:?} at pc {}", vm.pc());
        self.stop_reason = None;
        self.vars.clear();
        match mode {
            StepMode::Continue => self.step.finish(),
            StepMode::Pause => {
                let origin = self
                    .current_point(vm)
                    .unwrap_or(ExecPoint { file: 0, line: 0, stmt: 0, depth: vm.depth() });
                self.step.begin(StepMode::Pause, origin);
            }
            mode => match self.current_point(vm) {
                Some(origin) => self.step.begin(mode, origin),
                None => self.step.finish(),
            },
        }
        if mode != StepMode::Pause {
            let _ = self.events_tx.send(DebugEvent::Continued);
        }
    }

    fn current_point(&self, vm: &Vm) -> Option<ExecPoint> {
        let d = self.program.debug_at(vm.pc())?;
        Some(ExecPoint { file: d.file, line: d.line, stmt: d.stmt, depth: vm.depth() })
    }

    /* ----------------------------- Breakpoints ----------------------------- */

    /// Remplace les breakpoints d'un fichier (style DAP `setBreakpoints`).
    pub fn set_breakpoints(&mut self, path: &str, specs: &[BreakpointSpec]) -> Vec<ResolvedBreakpoint> {
        let file = linemap::resolve_file(&self.program, path);
        let lm = &self.linemap;
        self.breakpoints
            .set_for_file(path, specs, |line| file.and_then(|f| lm.resolve_line(f, line)))
    }

    /* ------------------------------- Pile ---------------------------------- */

    /// Frames pour `stackTrace`, du plus récent au plus ancien. Les frames
    /// appelants sont localisés sur leur site d'appel.
    pub fn stack_frames(&self, vm: &Vm) -> Vec<FrameInfo> {
        let frames = vm.frames();
        let mut out = Vec::with_capacity(frames.len());
        for (idx, frame) in frames.iter().enumerate().rev() {
            let is_top = idx == frames.len() - 1;
            let site_pc = if is_top {
                vm.pc()
            } else {
                frames[idx + 1].return_pc.saturating_sub(1)
            };
            let (path, line, column) = match self.program.debug_at(site_pc) {
                Some(d) => (
                    self.program.file_path(d.file).unwrap_or("<unknown>").to_string(),
                    d.line,
                    d.col,
                ),
                None => ("<unknown>".to_string(), frame.line, 1),
            };
            let name = self
                .program
                .funcs
                .get(frame.func as usize)
                .map(|f| mangle::display_name(&f.name).to_string())
                .unwrap_or_else(|| "<unknown>".to_string());
            out.push(FrameInfo { id: idx as i64, name, source_path: path, line, column });
        }
        out
    }

    /* --------------------------- Scopes & variables ------------------------ */

    /// Alloue les trois scopes d'un frame. Chaque requête produit des
    /// handles frais (jamais de numéros fixes réutilisés).
    pub fn scopes(&mut self, frame_id: i64) -> Vec<Scope> {
        let frame = frame_id.max(0) as usize;
        [
            (ScopeKind::Locals, false),
            (ScopeKind::Globals, false),
            (ScopeKind::Registers, true),
        ]
        .into_iter()
        .map(|(kind, expensive)| Scope {
            name: kind.display().to_string(),
            variables_reference: self.vars.alloc(VarSlot::Scope { frame, kind }),
            expensive,
        })
        .collect()
    }

    /// Résout un handle `variablesReference`.
    pub fn variables(&mut self, vm: &Vm, varref: i64) -> Result<Vec<Variable>> {
        let slot = self
            .vars
            .get(varref)
            .cloned()
            .ok_or_else(|| eyre!("unknown variablesReference {varref}"))?;
        match slot {
            VarSlot::Scope { frame, kind } => self.scope_variables(vm, frame, kind),
            VarSlot::Object(id) => self.object_variables(vm, id),
            VarSlot::Wrapped(value) => {
                let var = self.make_variable(vm, "value", &value);
                Ok(vec![var])
            }
        }
    }

    fn scope_variables(&mut self, vm: &Vm, frame: usize, kind: ScopeKind) -> Result<Vec<Variable>> {
        let frame_ref = vm
            .frames()
            .get(frame)
            .ok_or_else(|| eyre!("frame {frame} is gone"))?;
        match kind {
            ScopeKind::Locals => {
                let func = self
                    .program
                    .funcs
                    .get(frame_ref.func as usize)
                    .ok_or_else(|| eyre!("unknown function {}", frame_ref.func))?;
                let locals = func.locals.clone();
                Ok(locals
                    .iter()
                    .filter_map(|l| {
                        vm.register(frame, l.reg)
                            .map(|v| (l.name.clone(), v.clone()))
                    })
                    .map(|(name, v)| self.make_variable(vm, &name, &v))
                    .collect())
            }
            ScopeKind::Globals => {
                let globals: Vec<(String, Value)> =
                    vm.globals().iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                Ok(globals
                    .iter()
                    .map(|(name, v)| self.make_variable(vm, name, v))
                    .collect())
            }
            ScopeKind::Registers => {
                let regs: Vec<Value> = frame_ref.regs.clone();
                Ok(regs
                    .iter()
                    .enumerate()
                    .map(|(i, v)| self.make_variable(vm, &format!("r{i}"), v))
                    .collect())
            }
        }
    }

    fn object_variables(&mut self, vm: &Vm, id: etch_core::HeapId) -> Result<Vec<Variable>> {
        let Some(obj) = vm.heap().get(id) else {
            return Ok(vec![Variable {
                name: "<dead>".into(),
                value: format!("<dead #{id}>"),
                r#type: None,
                variables_reference: 0,
            }]);
        };
        match &obj.slots {
            Slots::Array(elems) => {
                let elems: Vec<Value> = elems.clone();
                Ok(elems
                    .iter()
                    .enumerate()
                    .map(|(i, v)| self.make_variable(vm, &format!("[{i}]"), v))
                    .collect())
            }
            Slots::Table(fields) => {
                let fields: Vec<(String, Value)> =
                    fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                Ok(fields
                    .iter()
                    .map(|(name, v)| self.make_variable(vm, name, v))
                    .collect())
            }
            Slots::Weak { target, kind: _ } => {
                let target = *target;
                if target < 0 {
                    return Ok(vec![Variable {
                        name: "target".into(),
                        value: "<invalidated>".into(),
                        r#type: None,
                        variables_reference: 0,
                    }]);
                }
                let v = match vm.heap().get(target as u64).map(|o| o.kind) {
                    Some(etch_vm::ObjKind::Array) => Value::Array(target as u64),
                    _ => Value::Table(target as u64),
                };
                let var = self.make_variable(vm, "target", &v);
                Ok(vec![var])
            }
        }
    }

    fn make_variable(&mut self, vm: &Vm, name: &str, value: &Value) -> Variable {
        Variable {
            name: name.to_string(),
            value: vm.render_value(value),
            r#type: Some(value.type_name().to_string()),
            variables_reference: self.child_ref(value),
        }
    }

    /// Handle enfant : aggregates seulement, les primitives n'en ont pas.
    fn child_ref(&mut self, value: &Value) -> i64 {
        match value {
            Value::Array(id) | Value::Table(id) | Value::Ref(id) | Value::Weak(id) => {
                self.vars.alloc(VarSlot::Object(*id))
            }
            Value::Some(inner) | Value::Ok(inner) | Value::Err(inner) => {
                if inner.strong_id().is_some() || matches!(**inner, Value::Weak(_)) {
                    self.vars.alloc(VarSlot::Wrapped((**inner).clone()))
                } else {
                    0
                }
            }
            _ => 0,
        }
    }

    /* ------------------------------ setVariable ---------------------------- */

    /// Mutation d'une variable nommée d'un scope. L'entrée est parsée
    /// selon le type déclaré de la variable ; un mismatch laisse la
    /// valeur inchangée et remonte une erreur claire.
    pub fn set_variable(
        &mut self,
        vm: &mut Vm,
        varref: i64,
        name: &str,
        input: &str,
    ) -> Result<Variable> {
        let slot = self
            .vars
            .get(varref)
            .cloned()
            .ok_or_else(|| eyre!("unknown variablesReference {varref}"))?;
        let VarSlot::Scope { frame, kind } = slot else {
            bail!("only scope variables can be set");
        };

        match kind {
            ScopeKind::Globals => {
                let current = vm
                    .global(name)
                    .cloned()
                    .ok_or_else(|| eyre!("unknown variable `{name}`"))?;
                let parsed = eval::parse_typed_input(input, current.type_name())?;
                let value = materialize(vm, parsed);
                vm.set_global(name, value.clone());
                if let Some(id) = fresh_id(&value) {
                    vm.heap_mut().dec_ref(id);
                }
                Ok(self.make_variable(vm, name, &value))
            }
            ScopeKind::Locals | ScopeKind::Registers => {
                let reg = self.named_register(vm, frame, kind, name)?;
                let current = vm
                    .register(frame, reg)
                    .cloned()
                    .ok_or_else(|| eyre!("register {reg} is gone"))?;
                let parsed = eval::parse_typed_input(input, current.type_name())?;
                let value = materialize(vm, parsed);
                vm.set_register(frame, reg, value.clone())
                    .map_err(|e| eyre!("{e}"))?;
                if let Some(id) = fresh_id(&value) {
                    vm.heap_mut().dec_ref(id);
                }
                Ok(self.make_variable(vm, name, &value))
            }
        }
    }

    fn named_register(&self, vm: &Vm, frame: usize, kind: ScopeKind, name: &str) -> Result<Reg> {
        match kind {
            ScopeKind::Registers => name
                .strip_prefix('r')
                .and_then(|n| n.parse::<Reg>().ok())
                .ok_or_else(|| eyre!("unknown register `{name}`")),
            _ => {
                let frame_ref = vm
                    .frames()
                    .get(frame)
                    .ok_or_else(|| eyre!("frame {frame} is gone"))?;
                let func = self
                    .program
                    .funcs
                    .get(frame_ref.func as usize)
                    .ok_or_else(|| eyre!("unknown function {}", frame_ref.func))?;
                func.locals
                    .iter()
                    .find(|l| l.name == name)
                    .map(|l| l.reg)
                    .ok_or_else(|| eyre!("unknown variable `{name}`"))
            }
        }
    }
}

/// Ce que voit l'évaluateur de conditions : les locals du frame courant,
/// puis les globals.
fn lookup_in_frame(program: &Program, vm: &Vm, name: &str) -> Option<Value> {
    let frame_idx = vm.depth().checked_sub(1)?;
    let frame = vm.frames().get(frame_idx)?;
    if let Some(func) = program.funcs.get(frame.func as usize) {
        if let Some(local) = func.locals.iter().find(|l| l.name == name) {
            return vm.register(frame_idx, local.reg).cloned();
        }
    }
    vm.global(name).cloned()
}

/// Matérialise une entrée parsée ; un tableau devient un objet du tas
/// (éléments trackés).
fn materialize(vm: &mut Vm, parsed: SetInput) -> Value {
    match parsed {
        SetInput::Scalar(v) => v,
        SetInput::Array(items) => {
            let heap = vm.heap_mut();
            let id = heap.alloc_array(items.len());
            for item in items {
                // only scalar literals reach here, push cannot fail on a
                // fresh array
                let _ = heap.push_element(id, item);
            }
            Value::Array(id)
        }
    }
}

/// Id d'une allocation fraîche dont le handle « registre » est doublement
/// compté après `set_register`/`set_global` (copie + allocation).
fn fresh_id(value: &Value) -> Option<etch_core::HeapId> {
    match value {
        Value::Array(id) => Some(*id),
        _ => None,
    }
}

/* --------------------------------- Tests ---------------------------------- */

#[cfg(test)]
mod tests {
    use super::*;
    use etch_core::program::GLOBAL_FUNCTION;
    use etch_core::{DebugEntry, Instr, ProgramBuilder};
    use etch_vm::{RunOutcome, VmState};

    fn at(line: u32, stmt: u32) -> DebugEntry {
        DebugEntry { file: 0, line, col: 1, stmt }
    }

    /// `g = 7` at top level (lines 1-3 in `<global>`), then
    /// `fn main() { let a=10; let b=20; print(a+b); }` on lines 10-13.
    fn program() -> Arc<Program> {
        let mut b = ProgramBuilder::new();
        b.file("main.etch");
        let kg = b.constant(Value::Int(7));
        let kname = b.constant(Value::str("g"));
        let ka = b.constant(Value::Int(10));
        let kb = b.constant(Value::Int(20));
        b.begin_function(GLOBAL_FUNCTION, 1);
        b.emit(Instr::LoadConst { dst: 0, idx: kg }, at(1, 0));
        b.emit(Instr::InitGlobal { src: 0, name: kname }, at(1, 0));
        b.emit(Instr::Call { func: 1, num_args: 0, num_results: 0, first_arg: 0, first_result: 0 }, at(2, 1));
        b.emit(Instr::Return { first: 0, count: 0 }, at(3, 2));
        b.end_function();
        b.begin_function("main$_v", 3);
        b.local("a", 0);
        b.local("b", 1);
        b.emit(Instr::LoadConst { dst: 0, idx: ka }, at(10, 10));
        b.emit(Instr::LoadConst { dst: 1, idx: kb }, at(11, 11));
        b.emit(Instr::AddInt { dst: 2, lhs: 0, rhs: 1 }, at(12, 12));
        b.emit(Instr::Print { src: 2 }, at(12, 12));
        b.emit(Instr::Return { first: 0, count: 0 }, at(13, 13));
        b.end_function();
        Arc::new(b.finish().unwrap())
    }

    fn attach(vm: &mut Vm, dbg: &std::rc::Rc<std::cell::RefCell<DebuggerCore>>) {
        let shared = dbg.clone();
        vm.set_instr_callback(Box::new(move |vm| shared.borrow_mut().before_instruction(vm)));
    }

    #[test]
    fn breakpoint_pauses_and_frames_are_demangled() {
        let program = program();
        let mut vm = Vm::new(program.clone());
        vm.set_stdout(Box::new(etch_vm::Captured::default()));
        let (core, events) = DebuggerCore::new(program);
        let dbg = std::rc::Rc::new(std::cell::RefCell::new(core));

        dbg.borrow_mut().set_breakpoints(
            "main.etch",
            &[BreakpointSpec { line: 11, condition: None }],
        );
        attach(&mut vm, &dbg);
        vm.start_entry().unwrap();

        assert_eq!(vm.run().unwrap(), RunOutcome::Paused);
        assert_eq!(dbg.borrow().stop_reason(), Some(StopReason::Breakpoint));
        assert!(matches!(
            events.try_recv().unwrap(),
            DebugEvent::Stopped { reason: StopReason::Breakpoint, line: 11, .. }
        ));

        let frames = dbg.borrow().stack_frames(&vm);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].name, "main");
        assert_eq!(frames[0].line, 11);
        assert_eq!(frames[1].name, "<global>");
        assert_eq!(frames[1].line, 2, "caller shown at its call site");

        // resume to completion
        dbg.borrow_mut().request(StepMode::Continue, &vm);
        assert_eq!(vm.run().unwrap(), RunOutcome::Terminated);
        assert_eq!(vm.state(), VmState::Terminated);
    }

    #[test]
    fn conditional_breakpoint_consults_locals() {
        let program = program();
        let mut vm = Vm::new(program.clone());
        vm.set_stdout(Box::new(etch_vm::Captured::default()));
        let (core, _events) = DebuggerCore::new(program);
        let dbg = std::rc::Rc::new(std::cell::RefCell::new(core));

        // line 12: a == 10 holds, so the breakpoint fires there
        dbg.borrow_mut().set_breakpoints(
            "main.etch",
            &[BreakpointSpec { line: 12, condition: Some("a == 10".into()) }],
        );
        attach(&mut vm, &dbg);
        vm.start_entry().unwrap();
        assert_eq!(vm.run().unwrap(), RunOutcome::Paused);
        assert_eq!(dbg.borrow().stop_reason(), Some(StopReason::Breakpoint));

        // a broken condition evaluates to false: no stop, run to the end
        dbg.borrow_mut().set_breakpoints(
            "main.etch",
            &[BreakpointSpec { line: 12, condition: Some("nonsense >!<".into()) }],
        );
        dbg.borrow_mut().request(StepMode::Continue, &vm);
        assert_eq!(vm.run().unwrap(), RunOutcome::Terminated);
    }

    #[test]
    fn scopes_variables_and_set_variable() {
        let program = program();
        let mut vm = Vm::new(program.clone());
        vm.set_stdout(Box::new(etch_vm::Captured::default()));
        let (core, _events) = DebuggerCore::new(program);
        let dbg = std::rc::Rc::new(std::cell::RefCell::new(core));

        dbg.borrow_mut().set_breakpoints(
            "main.etch",
            &[BreakpointSpec { line: 12, condition: None }],
        );
        attach(&mut vm, &dbg);
        vm.start_entry().unwrap();
        vm.run().unwrap();

        let mut core = dbg.borrow_mut();
        let frames = core.stack_frames(&vm);
        let top = frames[0].id;
        let scopes = core.scopes(top);
        assert_eq!(scopes.len(), 3);
        assert_eq!(scopes[0].name, "Local Variables");
        assert!(scopes.iter().all(|s| s.variables_reference > 0));

        let locals = core.variables(&vm, scopes[0].variables_reference).unwrap();
        let a = locals.iter().find(|v| v.name == "a").unwrap();
        assert_eq!(a.value, "10");
        assert_eq!(a.r#type.as_deref(), Some("int"));
        assert_eq!(a.variables_reference, 0, "primitives have no children");

        // setVariable: type checked against the declared type
        let err = core
            .set_variable(&mut vm, scopes[0].variables_reference, "a", "\"oops\"")
            .unwrap_err();
        assert!(err.to_string().contains("type mismatch"));
        assert_eq!(vm.register(1, 0), Some(&Value::Int(10)), "unchanged on error");

        let updated = core
            .set_variable(&mut vm, scopes[0].variables_reference, "a", "99")
            .unwrap();
        assert_eq!(updated.value, "99");
        assert_eq!(vm.register(1, 0), Some(&Value::Int(99)));

        // unknown names error cleanly
        assert!(core
            .set_variable(&mut vm, scopes[0].variables_reference, "zz", "1")
            .is_err());
    }

    #[test]
    fn step_over_walks_lines() {
        let program = program();
        let mut vm = Vm::new(program.clone());
        vm.set_stdout(Box::new(etch_vm::Captured::default()));
        let (mut core, events) = DebuggerCore::new(program);
        core.set_stop_at_entry(true);
        let dbg = std::rc::Rc::new(std::cell::RefCell::new(core));
        attach(&mut vm, &dbg);
        vm.start_entry().unwrap();

        // entry stop at line 1
        assert_eq!(vm.run().unwrap(), RunOutcome::Paused);
        assert_eq!(dbg.borrow().stop_reason(), Some(StopReason::Entry));
        let _ = events.try_recv();

        // next: line 1 → line 2 (the call line), still depth 1
        dbg.borrow_mut().request(StepMode::Over, &vm);
        let _ = events.try_recv(); // continued
        assert_eq!(vm.run().unwrap(), RunOutcome::Paused);
        match events.try_recv().unwrap() {
            DebugEvent::Stopped { reason: StopReason::Step, line, depth, .. } => {
                assert_eq!(line, 2);
                assert_eq!(depth, 1);
            }
            other => panic!("expected step stop, got {other:?}"),
        }

        // next over the call: main runs wholly, we land on line 3
        dbg.borrow_mut().request(StepMode::Over, &vm);
        let _ = events.try_recv();
        assert_eq!(vm.run().unwrap(), RunOutcome::Paused);
        match events.try_recv().unwrap() {
            DebugEvent::Stopped { reason: StopReason::Step, line, depth, .. } => {
                assert_eq!(line, 3, "entering the callee did not stop; returning did");
                assert_eq!(depth, 1);
            }
            other => panic!("expected step stop, got {other:?}"),
        }

        dbg.borrow_mut().request(StepMode::Continue, &vm);
        assert_eq!(vm.run().unwrap(), RunOutcome::Terminated);
    }

    #[test]
    fn step_in_enters_the_callee() {
        let program = program();
        let mut vm = Vm::new(program.clone());
        vm.set_stdout(Box::new(etch_vm::Captured::default()));
        let (mut core, _events) = DebuggerCore::new(program);
        core.set_stop_at_entry(true);
        let dbg = std::rc::Rc::new(std::cell::RefCell::new(core));
        attach(&mut vm, &dbg);
        vm.start_entry().unwrap();
        vm.run().unwrap(); // entry stop at line 1, depth 1

        // stepIn from line 1 stops on line 2 (first differing line, same depth)
        dbg.borrow_mut().request(StepMode::In, &vm);
        assert_eq!(vm.run().unwrap(), RunOutcome::Paused);
        assert_eq!(dbg.borrow().stack_frames(&vm)[0].line, 2);
        assert_eq!(vm.depth(), 1);

        // stepIn from the call line lands inside main
        dbg.borrow_mut().request(StepMode::In, &vm);
        assert_eq!(vm.run().unwrap(), RunOutcome::Paused);
        let frames = dbg.borrow().stack_frames(&vm);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].name, "main");
        assert_eq!(frames[0].line, 10);

        // step out brings us back to <global>, depth 1
        dbg.borrow_mut().request(StepMode::Out, &vm);
        assert_eq!(vm.run().unwrap(), RunOutcome::Paused);
        assert_eq!(vm.depth(), 1);

        dbg.borrow_mut().request(StepMode::Continue, &vm);
        vm.run().unwrap();
    }
}
