//! etch-runtime — Contexte d'embedding de la VM Etch
//!
//! Offre à un hôte la surface que l'ABI C enveloppe :
//! - `Context` : create → compile/load → (execute | call_function)* → drop
//! - globals nommés (get/set), fonctions hôte appelables depuis le
//!   bytecode, callback d'instruction, introspection (pc, profondeur,
//!   fonction courante, registres)
//! - la dernière erreur est conservée sur le contexte (`last_error`)
//! - serveur de debug distant **persistant** : quand `ETCH_DEBUG_PORT`
//!   est posé (ou `enable_remote_debug` appelé), une socket TCP loopback
//!   est liée au chargement du bytecode et survit aux reconnexions et aux
//!   ré-entrées (`execute` puis `call_function` à répétition) ; un client
//!   peut s'attacher en pleine exécution
//! - `record_execution` : capture un `.replay` (état des registres par
//!   statement)
//!
//! Le compilateur source→bytecode est un collaborateur externe, branché
//! via [`CompileFn`].

#![forbid(unsafe_code)]
#![deny(rust_2018_idioms, unused_must_use)]

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info};
use thiserror::Error;

use etch_core::{CoreError, Program, Reg, Value};
use etch_dap::{DapServer, Directive, TcpTransport};
use etch_debugger::BreakpointSpec;
use etch_etcx::replay::{RegSnapshot, Replay, StmtSnapshot};
use etch_vm::{HostFn, RunOutcome, Tick, Vm, VmError, VmState};

/// Variable d'environnement : port TCP loopback du serveur de debug.
pub const ENV_DEBUG_PORT: &str = "ETCH_DEBUG_PORT";

/// Variable d'environnement : attente initiale d'attachement (ms).
pub const ENV_DEBUG_TIMEOUT: &str = "ETCH_DEBUG_TIMEOUT";

/// Signature du pont compilateur : source → octets `.etcx`.
pub type CompileFn = fn(source: &str, opts: &CompileOptions) -> Result<Vec<u8>, String>;

/// Options passées au pont compilateur.
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// Émettre les infos de debug et baisser l'optimisation.
    pub debug: bool,
    /// Chemin logique de la source (diagnostics).
    pub source_path: Option<String>,
}

/// Erreurs du runtime hôte.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// Le pont compilateur a refusé la source.
    #[error("compile error: {0}")]
    Compile(String),
    /// Aucun pont compilateur n'est branché.
    #[error("no compiler bridge configured")]
    NoCompiler,
    /// Artefact bytecode illisible.
    #[error("load error: {0}")]
    Load(#[from] CoreError),
    /// Erreur fatale de la VM (position source incluse).
    #[error("{0}")]
    Vm(#[from] VmError),
    /// Aucun programme chargé.
    #[error("no program loaded")]
    NoProgram,
    /// Transport de debug.
    #[error("debug transport: {0}")]
    Debug(String),
    /// Fonction inconnue du programme.
    #[error("unknown function `{0}`")]
    UnknownFunction(String),
}

/// Le contexte d'embedding. Un par VM ; chaque instance doit avoir son
/// propre port de debug.
pub struct Context {
    compile: Option<CompileFn>,
    program: Option<Arc<Program>>,
    vm: Option<Vm>,
    server: Option<DapServer<TcpTransport>>,
    debug_port: Option<u16>,
    stop_at_entry: bool,
    /// `None` = défaut (infini si stop-at-entry armé, immédiat sinon) ;
    /// `Some` = borne posée par `ETCH_DEBUG_TIMEOUT`.
    attach_timeout: Option<Duration>,
    waited_for_attach: bool,
    last_error: Option<String>,
    stdout: Option<Box<dyn Write + Send>>,
}

impl Default for Context {
    fn default() -> Self { Self::new() }
}

impl Context {
    /// Contexte vide ; l'attente d'attachement lit `ETCH_DEBUG_TIMEOUT`.
    pub fn new() -> Self {
        let attach_timeout = std::env::var(ENV_DEBUG_TIMEOUT)
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis);
        Self {
            compile: None,
            program: None,
            vm: None,
            server: None,
            debug_port: None,
            stop_at_entry: false,
            attach_timeout,
            waited_for_attach: false,
            last_error: None,
            stdout: None,
        }
    }

    /// Branche le pont compilateur.
    pub fn set_compile_hook(&mut self, hook: CompileFn) { self.compile = Some(hook); }

    /// Dernière erreur formatée, conservée sur le contexte.
    pub fn last_error(&self) -> Option<&str> { self.last_error.as_deref() }

    /// Redirige le stdout du programme (tests, capture hôte). Sans effet
    /// quand le serveur de debug est actif (il capture déjà).
    pub fn set_stdout(&mut self, sink: Box<dyn Write + Send>) {
        self.stdout = Some(sink);
        if let (Some(vm), None) = (self.vm.as_mut(), self.server.as_ref()) {
            if let Some(sink) = self.stdout.take() {
                vm.set_stdout(sink);
            }
        }
    }

    fn fail<T>(&mut self, e: RuntimeError) -> Result<T, RuntimeError> {
        self.last_error = Some(e.to_string());
        Err(e)
    }

    /* ------------------------------ Chargement ------------------------------ */

    /// Compile une source via le pont et charge le programme.
    pub fn compile_str(&mut self, source: &str, opts: &CompileOptions) -> Result<(), RuntimeError> {
        let Some(hook) = self.compile else {
            return self.fail(RuntimeError::NoCompiler);
        };
        let bytes = match hook(source, opts) {
            Ok(b) => b,
            Err(e) => return self.fail(RuntimeError::Compile(e)),
        };
        match etch_etcx::decode_program(&bytes) {
            Ok(p) => self.load_program(p),
            Err(e) => self.fail(RuntimeError::Load(e)),
        }
    }

    /// Compile un fichier source via le pont et charge le programme.
    pub fn compile_file(&mut self, path: &str, opts: &CompileOptions) -> Result<(), RuntimeError> {
        let source = match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) => return self.fail(RuntimeError::Compile(format!("cannot read {path}: {e}"))),
        };
        let mut opts = opts.clone();
        opts.source_path = Some(path.to_string());
        self.compile_str(&source, &opts)
    }

    /// Charge un artefact `.etcx` depuis le disque.
    pub fn load_file(&mut self, path: &str) -> Result<(), RuntimeError> {
        match etch_etcx::read_file(path) {
            Ok(p) => self.load_program(p),
            Err(e) => self.fail(RuntimeError::Load(e)),
        }
    }

    /// Charge un programme décodé. Lie la socket de debug si
    /// `ETCH_DEBUG_PORT` est posé (ou si `enable_remote_debug` a été
    /// appelé avant le chargement).
    pub fn load_program(&mut self, program: Program) -> Result<(), RuntimeError> {
        let program = Arc::new(program);
        let mut vm = Vm::new(program.clone());
        if let Some(sink) = self.stdout.take() {
            vm.set_stdout(sink);
        }
        self.program = Some(program.clone());

        let port = self.debug_port.or_else(|| {
            std::env::var(ENV_DEBUG_PORT).ok().and_then(|v| v.parse::<u16>().ok())
        });
        if let Some(port) = port {
            let transport = match TcpTransport::bind(port) {
                Ok(t) => t,
                Err(e) => return self.fail(RuntimeError::Debug(e.to_string())),
            };
            self.debug_port = Some(transport.port());
            info!("debug server listening on 127.0.0.1:{}", transport.port());
            let mut server = DapServer::new(program, transport);
            server.install(&mut vm);
            if self.stop_at_entry {
                server.debugger().borrow_mut().set_stop_at_entry(true);
            }
            self.server = Some(server);
        }

        self.vm = Some(vm);
        self.waited_for_attach = false;
        Ok(())
    }

    /// Active le serveur de debug distant avant chargement. Port 0 = port
    /// éphémère, relisible via [`Context::debug_port`].
    pub fn enable_remote_debug(&mut self, port: u16) { self.debug_port = Some(port); }

    /// Port de debug effectivement lié.
    pub fn debug_port(&self) -> Option<u16> { self.debug_port }

    /// Arme (ou non) l'arrêt à l'entrée pour la prochaine exécution. Quand
    /// il est armé et que `ETCH_DEBUG_TIMEOUT` n'est pas posé, l'attente
    /// initiale d'attachement devient **infinie** : la VM ne démarre pas
    /// tant qu'un client ne s'est pas configuré (sinon l'arrêt d'entrée
    /// n'aurait personne à notifier). Sans arrêt d'entrée, le défaut reste
    /// immédiat.
    pub fn set_stop_at_entry(&mut self, stop: bool) {
        self.stop_at_entry = stop;
        if let Some(server) = self.server.as_ref() {
            server.debugger().borrow_mut().set_stop_at_entry(stop);
        }
    }

    /// Pose les breakpoints d'un fichier hors-bande (aucun client DAP
    /// requis) : le callback d'instruction les honore, et un client qui
    /// s'attache plus tard voit la VM arrêtée dessus.
    pub fn set_breakpoints(&mut self, path: &str, lines: &[u32]) -> Result<(), RuntimeError> {
        if self.server.is_none() {
            return self.fail(RuntimeError::Debug("remote debug is not enabled".into()));
        }
        let specs: Vec<BreakpointSpec> =
            lines.iter().map(|&line| BreakpointSpec { line, condition: None }).collect();
        if let Some(server) = self.server.as_ref() {
            server.debugger().borrow_mut().set_breakpoints(path, &specs);
        }
        Ok(())
    }

    /* ------------------------------ Exécution ------------------------------- */

    /// Exécute le programme depuis son point d'entrée (`<global>` puis
    /// `main`). Ré-entrant : le serveur de debug persiste entre les
    /// appels.
    pub fn execute(&mut self) -> Result<(), RuntimeError> {
        if self.program.is_none() {
            return self.fail(RuntimeError::NoProgram);
        }
        self.initial_attach_wait();
        let mut vm = match self.vm.take() {
            Some(vm) => vm,
            None => return self.fail(RuntimeError::NoProgram),
        };
        let started = vm.start_entry();
        let outcome = match started {
            Ok(()) => self.drive(&mut vm),
            Err(e) => Err(e),
        };
        self.settle(vm, outcome)
    }

    /// Appelle une fonction par nom manglé ; les résultats remontent en
    /// valeurs hôte. Même persistance du serveur de debug.
    pub fn call_function(&mut self, mangled: &str, args: &[Value]) -> Result<Vec<Value>, RuntimeError> {
        if self.program.is_none() {
            return self.fail(RuntimeError::NoProgram);
        }
        self.initial_attach_wait();
        let mut vm = match self.vm.take() {
            Some(vm) => vm,
            None => return self.fail(RuntimeError::NoProgram),
        };
        if vm.program().function_named(mangled).is_none() {
            self.vm = Some(vm);
            return self.fail(RuntimeError::UnknownFunction(mangled.to_string()));
        }
        let started = vm.start_call(mangled, args);
        let outcome = match started {
            Ok(()) => self.drive(&mut vm),
            Err(e) => Err(e),
        };
        let results = vm.take_results();
        self.settle(vm, outcome).map(|()| results)
    }

    /// Attente initiale d'attachement, au premier run avec serveur. Par
    /// défaut : infinie quand l'arrêt à l'entrée est armé, immédiate
    /// sinon ; `ETCH_DEBUG_TIMEOUT` impose une borne. Accepter la socket
    /// ne suffit pas : on sert les requêtes jusqu'à ce que le client ait
    /// terminé sa configuration (`launch`/`attach` + `configurationDone`,
    /// même critère que la phase de configuration de la session console),
    /// sans quoi un `stopAtEntry` arrivé trop tard s'arrêterait sur un pc
    /// arbitraire — ou jamais.
    fn initial_attach_wait(&mut self) {
        if self.waited_for_attach {
            return;
        }
        self.waited_for_attach = true;
        let (Some(server), Some(vm)) = (self.server.as_mut(), self.vm.as_mut()) else { return };
        let deadline = match self.attach_timeout {
            Some(timeout) if timeout.is_zero() => return,
            Some(timeout) => Some(Instant::now() + timeout),
            None if self.stop_at_entry => None,
            None => return,
        };
        while !server.client_configured() {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                break;
            }
            let _ = server.poll_requests(vm, Duration::from_millis(50));
        }
        debug!(
            "initial attach wait over (client: {}, configured: {})",
            server.has_client(),
            server.client_configured()
        );
    }

    fn drive(&mut self, vm: &mut Vm) -> Result<(), VmError> {
        loop {
            match vm.run()? {
                RunOutcome::Terminated => {
                    if let Some(server) = self.server.as_mut() {
                        server.finish(0);
                    }
                    return Ok(());
                }
                RunOutcome::Paused => match self.server.as_mut() {
                    Some(server) => match server.service_pause(vm) {
                        // Detach = le client est parti ; on continue sans lui
                        Ok(Directive::Resume | Directive::Detach | Directive::Stay) => {}
                        Err(e) => {
                            log::warn!("debug transport failed: {e}");
                            self.server = None;
                        }
                    },
                    // pause d'un callback hôte : on rend la main
                    None => return Ok(()),
                },
            }
        }
    }

    fn settle(&mut self, vm: Vm, outcome: Result<(), VmError>) -> Result<(), RuntimeError> {
        match outcome {
            Ok(()) => {
                self.vm = Some(vm);
                Ok(())
            }
            Err(e) => {
                // la VM fatale est jetée ; un prochain execute repart d'une
                // VM neuve (les globals ne survivent pas à une erreur fatale)
                if let Some(server) = self.server.as_mut() {
                    server.finish(1);
                }
                if let Some(program) = &self.program {
                    let mut fresh = Vm::new(program.clone());
                    if let Some(server) = self.server.as_mut() {
                        server.install(&mut fresh);
                    }
                    self.vm = Some(fresh);
                }
                self.fail(RuntimeError::Vm(e))
            }
        }
    }

    /* ---------------------------- Globals & hôtes --------------------------- */

    /// Lit un global par nom.
    pub fn global(&self, name: &str) -> Option<Value> {
        self.vm.as_ref().and_then(|vm| vm.global(name).cloned())
    }

    /// Pose un global par nom.
    pub fn set_global(&mut self, name: &str, value: Value) -> Result<(), RuntimeError> {
        match self.vm.as_mut() {
            Some(vm) => {
                vm.set_global(name, value);
                Ok(())
            }
            None => self.fail(RuntimeError::NoProgram),
        }
    }

    /// Enregistre une fonction hôte (`CallHost`) ; retourne son index.
    pub fn register_host_fn(&mut self, f: HostFn) -> Result<u32, RuntimeError> {
        match self.vm.as_mut() {
            Some(vm) => Ok(vm.register_host_fn(f)),
            None => self.fail(RuntimeError::NoProgram),
        }
    }

    /// Installe un callback d'instruction hôte (exclusif avec le serveur
    /// de debug, qui possède déjà le callback).
    pub fn set_instr_callback(&mut self, cb: Box<dyn FnMut(&Vm) -> Tick>) -> Result<(), RuntimeError> {
        if self.server.is_some() {
            return self.fail(RuntimeError::Debug(
                "instruction callback is owned by the debug server".into(),
            ));
        }
        match self.vm.as_mut() {
            Some(vm) => {
                vm.set_instr_callback(cb);
                Ok(())
            }
            None => self.fail(RuntimeError::NoProgram),
        }
    }

    /* ----------------------------- Introspection ---------------------------- */

    /// pc courant.
    pub fn pc(&self) -> Option<u32> { self.vm.as_ref().map(Vm::pc) }

    /// Profondeur de pile.
    pub fn call_depth(&self) -> Option<usize> { self.vm.as_ref().map(Vm::depth) }

    /// Nom (manglé) de la fonction au pc courant.
    pub fn current_function(&self) -> Option<String> {
        self.vm.as_ref().and_then(|vm| vm.current_function().map(str::to_string))
    }

    /// Nombre de registres du frame sommet.
    pub fn register_count(&self) -> Option<usize> {
        self.vm.as_ref().and_then(|vm| vm.frames().last().map(|f| f.regs.len()))
    }

    /// Valeur d'un registre du frame sommet.
    pub fn register(&self, reg: Reg) -> Option<Value> {
        let vm = self.vm.as_ref()?;
        let top = vm.depth().checked_sub(1)?;
        vm.register(top, reg).cloned()
    }

    /// État de la VM.
    pub fn vm_state(&self) -> Option<VmState> { self.vm.as_ref().map(Vm::state) }
}

/* ─────────────────────────── Enregistrement replay ─────────────────────────── */

/// Exécute un programme en capturant l'état des registres du frame sommet
/// au début de chaque statement. Retourne le replay complet.
pub fn record_execution(program: Program) -> Result<Replay, RuntimeError> {
    let program = Arc::new(program);
    let mut vm = Vm::new(program.clone());
    let snapshots: Rc<RefCell<Vec<StmtSnapshot>>> = Rc::new(RefCell::new(Vec::new()));
    let last_stmt: Rc<RefCell<Option<u32>>> = Rc::new(RefCell::new(None));

    let sink = snapshots.clone();
    let last = last_stmt.clone();
    let prog = program.clone();
    vm.set_instr_callback(Box::new(move |vm| {
        let pc = vm.pc();
        if let Some(d) = prog.debug_at(pc) {
            let mut last = last.borrow_mut();
            if *last != Some(d.stmt) {
                *last = Some(d.stmt);
                let func = prog.function_at(pc).map(|(idx, _)| idx).unwrap_or(0);
                let regs = vm
                    .frames()
                    .last()
                    .map(|frame| {
                        frame
                            .regs
                            .iter()
                            .enumerate()
                            .map(|(i, v)| RegSnapshot {
                                reg: i as u16,
                                type_name: v.type_name().to_string(),
                                rendered: vm.render_value(v),
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                let mut snaps = sink.borrow_mut();
                let ordinal = snaps.len() as u32 + 1;
                snaps.push(StmtSnapshot { ordinal, pc, func, line: d.line, regs });
            }
        }
        Tick::Continue
    }));

    vm.start_entry()?;
    loop {
        match vm.run()? {
            RunOutcome::Terminated => break,
            RunOutcome::Paused => unreachable!("recording callback never pauses"),
        }
    }
    vm.clear_instr_callback();

    let snapshots = Rc::try_unwrap(snapshots)
        .map(RefCell::into_inner)
        .unwrap_or_else(|rc| rc.borrow().clone());
    Ok(Replay { program: (*program).clone(), snapshots })
}

/* ─────────────────────────── Tests ─────────────────────────── */

#[cfg(test)]
mod tests {
    use super::*;
    use etch_core::program::GLOBAL_FUNCTION;
    use etch_core::{DebugEntry, Instr, ProgramBuilder};
    use etch_vm::Captured;

    fn at(line: u32, stmt: u32) -> DebugEntry {
        DebugEntry { file: 0, line, col: 1, stmt }
    }

    fn program() -> Program {
        let mut b = ProgramBuilder::new();
        b.file("host.etch");
        let k1 = b.constant(Value::Int(1));
        let kname = b.constant(Value::str("counter"));
        b.begin_function(GLOBAL_FUNCTION, 1);
        b.emit(Instr::LoadConst { dst: 0, idx: k1 }, at(1, 0));
        b.emit(Instr::InitGlobal { src: 0, name: kname }, at(1, 0));
        b.emit(Instr::Print { src: 0 }, at(2, 1));
        b.emit(Instr::Return { first: 0, count: 0 }, at(3, 2));
        b.end_function();
        b.begin_function("bump$i_i", 2);
        b.local("n", 0);
        b.emit(Instr::LoadConst { dst: 1, idx: k1 }, at(10, 10));
        b.emit(Instr::AddInt { dst: 1, lhs: 0, rhs: 1 }, at(10, 10));
        b.emit(Instr::Return { first: 1, count: 1 }, at(11, 11));
        b.end_function();
        b.finish().unwrap()
    }

    #[test]
    fn execute_then_call_repeatedly() {
        let mut ctx = Context::new();
        let cap = Captured::default();
        ctx.set_stdout(Box::new(cap.clone()));
        ctx.load_program(program()).unwrap();

        ctx.execute().unwrap();
        assert_eq!(cap.get(), "1\n");
        assert_eq!(ctx.global("counter"), Some(Value::Int(1)));

        let out = ctx.call_function("bump$i_i", &[Value::Int(41)]).unwrap();
        assert_eq!(out, vec![Value::Int(42)]);
        let out = ctx.call_function("bump$i_i", &[Value::Int(1)]).unwrap();
        assert_eq!(out, vec![Value::Int(2)]);

        // globals survive re-entry
        assert_eq!(ctx.global("counter"), Some(Value::Int(1)));
    }

    #[test]
    fn errors_are_retained_on_the_context() {
        let mut ctx = Context::new();
        assert!(ctx.execute().is_err());
        assert!(ctx.last_error().unwrap().contains("no program"));

        ctx.load_program(program()).unwrap();
        assert!(ctx.call_function("nope$_v", &[]).is_err());
        assert!(ctx.last_error().unwrap().contains("nope"));
    }

    #[test]
    fn globals_and_introspection() {
        let mut ctx = Context::new();
        ctx.set_stdout(Box::new(Captured::default()));
        ctx.load_program(program()).unwrap();
        ctx.execute().unwrap();

        ctx.set_global("flag", Value::Bool(true)).unwrap();
        assert_eq!(ctx.global("flag"), Some(Value::Bool(true)));
        assert_eq!(ctx.vm_state(), Some(VmState::Terminated));
        assert_eq!(ctx.call_depth(), Some(0));
    }

    #[test]
    fn recording_captures_statement_states() {
        let replay = record_execution(program()).unwrap();
        // three statements in <global>
        assert_eq!(replay.snapshots.len(), 3);
        assert_eq!(replay.snapshots[0].ordinal, 1);
        assert_eq!(replay.snapshots[0].line, 1);
        assert_eq!(replay.snapshots[1].line, 2);
        // by statement 2 the register holds the loaded constant
        let regs = &replay.snapshots[1].regs;
        assert_eq!(regs[0].rendered, "1");
        assert_eq!(regs[0].type_name, "int");

        // the replay file round-trips
        let bytes = replay.to_bytes();
        assert_eq!(Replay::from_bytes(&bytes).unwrap(), replay);
    }
}
