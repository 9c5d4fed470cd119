//! server.rs — Boucle de session DAP
//!
//! Le serveur possède le transport et le cœur du débogueur ; la VM lui
//! est prêtée par l'appelant (binaire `debug-server` ou hôte embarqué).
//! Deux régimes :
//! - [`DapServer::run_session`] : cycle de vie console complet
//!   (configuration → exécution → terminated), code de sortie inclus ;
//! - [`DapServer::service_pause`] : un arrêt de VM à servir, utilisé par
//!   l'hôte embarqué qui conduit lui-même `vm.run()` — le serveur
//!   persiste entre plusieurs exécutions et un client peut s'attacher en
//!   cours de route.
//!
//! Garanties d'ordre : réponses dans l'ordre d'arrivée des requêtes sur
//! une connexion ; un événement `stopped` précède toujours les réponses
//! de la séquence d'inspection qui suit l'arrêt.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::time::Duration;

use crossbeam_channel::Receiver;
use log::{debug, warn};
use serde_json::{json, Value as Json};

use etch_core::Program;
use etch_debugger::{BreakpointSpec, DebugEvent, DebuggerCore, StepMode};
use etch_vm::{Captured, RunOutcome, Tick, Vm};

use crate::transport::Transport;
use crate::{event, response, DapResult, Request};

const SERVICE_POLL: Duration = Duration::from_millis(20);

/// Suite à donner après une requête.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// Rester arrêté, continuer à servir des requêtes.
    Stay,
    /// Reprendre l'exécution (verbes `continue`/`next`/`stepIn`/`stepOut`
    /// et `pause`, qui repart pour s'arrêter au callback suivant).
    Resume,
    /// Le client s'est déconnecté.
    Detach,
}

/// Le serveur DAP, générique sur le transport.
pub struct DapServer<T: Transport> {
    transport: Rc<RefCell<T>>,
    dbg: Rc<RefCell<DebuggerCore>>,
    events: Receiver<DebugEvent>,
    pending: Rc<RefCell<VecDeque<Request>>>,
    stdout_cap: Captured,
    seq: i64,
    launched: bool,
    configured: bool,
}

impl<T: Transport + 'static> DapServer<T> {
    /// Construit un serveur pour un programme donné.
    pub fn new(program: std::sync::Arc<Program>, transport: T) -> Self {
        let (core, events) = DebuggerCore::new(program);
        Self {
            transport: Rc::new(RefCell::new(transport)),
            dbg: Rc::new(RefCell::new(core)),
            events,
            pending: Rc::new(RefCell::new(VecDeque::new())),
            stdout_cap: Captured::default(),
            seq: 0,
            launched: false,
            configured: false,
        }
    }

    /// Accès au cœur du débogueur (hôte embarqué : breakpoints hors-bande).
    pub fn debugger(&self) -> Rc<RefCell<DebuggerCore>> { self.dbg.clone() }

    /// Branche le serveur sur la VM : capture du stdout et callback
    /// d'instruction (sonde transport + décision du débogueur). Le
    /// callback tourne même sans client attaché, ce qui honore les
    /// breakpoints posés hors-bande.
    pub fn install(&mut self, vm: &mut Vm) {
        vm.set_stdout(Box::new(self.stdout_cap.clone()));
        let dbg = self.dbg.clone();
        let pending = self.pending.clone();
        let transport = self.transport.clone();
        vm.set_instr_callback(Box::new(move |vm| {
            // sonde non bloquante : une requête arrivée pause la VM
            if let Ok(Some(req)) = transport.borrow_mut().poll(Duration::ZERO) {
                pending.borrow_mut().push_back(req);
            }
            if !pending.borrow().is_empty() {
                return Tick::Pause;
            }
            dbg.borrow_mut().before_instruction(vm)
        }));
    }

    /* ------------------------------ Session console ------------------------ */

    /// Cycle de vie complet en mode console : sert la configuration
    /// (`initialize`/`launch`/`setBreakpoints`/`configurationDone`), lance
    /// la VM, sert les arrêts, et retourne le code de sortie reflétant le
    /// statut final de la VM.
    pub fn run_session(&mut self, vm: &mut Vm) -> DapResult<i32> {
        self.install(vm);

        // phase de configuration : rien ne s'exécute avant
        // launch + configurationDone
        while !self.client_configured() {
            match self.next_request(SERVICE_POLL)? {
                Some(req) => {
                    if self.handle_request(vm, req)? == Directive::Detach {
                        return Ok(0);
                    }
                }
                None => {
                    if !self.transport.borrow().client_connected() {
                        return Ok(0);
                    }
                }
            }
        }

        vm.start_entry().map_err(|e| crate::DapError::Protocol(e.to_string()))?;

        loop {
            match vm.run() {
                Ok(RunOutcome::Paused) => match self.service_pause(vm)? {
                    Directive::Resume | Directive::Stay => {}
                    Directive::Detach => {
                        if !self.transport.borrow().supports_reattach() {
                            return Ok(0);
                        }
                    }
                },
                Ok(RunOutcome::Terminated) => {
                    self.finish(0);
                    return Ok(0);
                }
                Err(e) => {
                    eprintln!("etch: {e}");
                    self.dbg.borrow().emit_output("stderr", format!("{e}\n"));
                    self.finish(1);
                    return Ok(1);
                }
            }
        }
    }

    /// Sert un arrêt de la VM : pousse les événements en attente, traite
    /// les requêtes jusqu'à un verbe de reprise. Les requêtes
    /// non-reprises laissent le débogueur en pause.
    pub fn service_pause(&mut self, vm: &mut Vm) -> DapResult<Directive> {
        self.flush_stdout();
        self.pump_events();

        loop {
            match self.next_request(SERVICE_POLL)? {
                Some(req) => {
                    let directive = self.handle_request(vm, req)?;
                    self.pump_events();
                    match directive {
                        Directive::Stay => {}
                        other => return Ok(other),
                    }
                }
                None => {
                    let connected = self.transport.borrow().client_connected();
                    if !connected {
                        // personne pour nous relancer : on repart plutôt que
                        // de geler l'hôte. Un client qui (re)vient pourra
                        // interrompre au callback suivant.
                        return if self.transport.borrow().supports_reattach() {
                            Ok(Directive::Resume)
                        } else {
                            Ok(Directive::Detach)
                        };
                    }
                }
            }
        }
    }

    /// Sert au plus une requête (attente initiale d'attachement côté hôte
    /// embarqué, avant de lancer la VM).
    pub fn poll_requests(&mut self, vm: &mut Vm, timeout: Duration) -> DapResult<()> {
        if let Some(req) = self.next_request(timeout)? {
            let _ = self.handle_request(vm, req)?;
            self.pump_events();
        }
        Ok(())
    }

    /// Un client est-il attaché en ce moment ?
    pub fn has_client(&self) -> bool { self.transport.borrow().client_connected() }

    /// Le client a-t-il terminé sa configuration (`launch`/`attach` puis
    /// `configurationDone`) ? Même critère que la phase de configuration
    /// de [`DapServer::run_session`] ; l'hôte embarqué ne démarre pas la
    /// VM avant.
    pub fn client_configured(&self) -> bool { self.launched && self.configured }

    /// Clôture : draine stdout, signale `terminated`.
    pub fn finish(&mut self, exit_code: i32) {
        self.flush_stdout();
        self.dbg.borrow_mut().notify_terminated(exit_code);
        self.pump_events();
    }

    /* ------------------------------- Dispatch ------------------------------ */

    fn next_request(&mut self, timeout: Duration) -> DapResult<Option<Request>> {
        if let Some(req) = self.pending.borrow_mut().pop_front() {
            return Ok(Some(req));
        }
        self.transport.borrow_mut().poll(timeout)
    }

    fn handle_request(&mut self, vm: &mut Vm, req: Request) -> DapResult<Directive> {
        debug!("dap ← {} (seq {})", req.command, req.seq);
        let args = &req.arguments;
        match req.command.as_str() {
            "initialize" => {
                let body = json!({
                    "supportsConfigurationDoneRequest": true,
                    "supportsStepInRequest": true,
                    "supportsContinueRequest": true,
                    "supportsConditionalBreakpoints": true,
                    "supportsSetVariable": true,
                });
                self.respond_ok(&req, Some(body))?;
                self.send_event("initialized", json!({}))?;
                Ok(Directive::Stay)
            }
            "launch" => {
                let stop_at_entry =
                    args.get("stopAtEntry").and_then(Json::as_bool).unwrap_or(false);
                self.dbg.borrow_mut().set_stop_at_entry(stop_at_entry);
                self.launched = true;
                self.respond_ok(&req, None)?;
                Ok(Directive::Stay)
            }
            "attach" => {
                // transport distant uniquement : pas de rechargement, la VM
                // vit déjà
                self.launched = true;
                self.configured = true;
                self.respond_ok(&req, None)?;
                Ok(Directive::Stay)
            }
            "setBreakpoints" => {
                let path = args
                    .pointer("/source/path")
                    .and_then(Json::as_str)
                    .unwrap_or("<unknown>")
                    .to_string();
                let specs: Vec<BreakpointSpec> = args
                    .get("breakpoints")
                    .and_then(Json::as_array)
                    .map(|bps| {
                        bps.iter()
                            .filter_map(|bp| {
                                bp.get("line").and_then(Json::as_u64).map(|line| BreakpointSpec {
                                    line: line as u32,
                                    condition: bp
                                        .get("condition")
                                        .and_then(Json::as_str)
                                        .map(str::to_string),
                                })
                            })
                            .collect()
                    })
                    .unwrap_or_default();
                let resolved = self.dbg.borrow_mut().set_breakpoints(&path, &specs);
                let body: Vec<Json> = resolved
                    .into_iter()
                    .map(|bp| {
                        json!({
                            "id": bp.id,
                            "verified": bp.verified,
                            "line": bp.line,
                            "source": { "path": path.clone() },
                        })
                    })
                    .collect();
                self.respond_ok(&req, Some(json!({ "breakpoints": body })))?;
                Ok(Directive::Stay)
            }
            "configurationDone" => {
                self.configured = true;
                self.respond_ok(&req, None)?;
                Ok(Directive::Stay)
            }
            "threads" => {
                self.respond_ok(&req, Some(json!({ "threads": [{ "id": 1, "name": "main" }] })))?;
                Ok(Directive::Stay)
            }
            "stackTrace" => {
                let frames = self.dbg.borrow().stack_frames(vm);
                let frames_json: Vec<Json> = frames
                    .into_iter()
                    .map(|f| {
                        let file_name = std::path::Path::new(&f.source_path)
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_else(|| f.source_path.clone());
                        json!({
                            "id": f.id,
                            "name": f.name,
                            "line": f.line,
                            "column": f.column,
                            "source": { "name": file_name, "path": f.source_path },
                        })
                    })
                    .collect();
                let total = frames_json.len();
                self.respond_ok(
                    &req,
                    Some(json!({ "stackFrames": frames_json, "totalFrames": total })),
                )?;
                Ok(Directive::Stay)
            }
            "scopes" => {
                let frame_id = args.get("frameId").and_then(Json::as_i64).unwrap_or(0);
                let scopes = self.dbg.borrow_mut().scopes(frame_id);
                let body: Vec<Json> = scopes
                    .into_iter()
                    .map(|s| {
                        json!({
                            "name": s.name,
                            "variablesReference": s.variables_reference,
                            "expensive": s.expensive,
                        })
                    })
                    .collect();
                self.respond_ok(&req, Some(json!({ "scopes": body })))?;
                Ok(Directive::Stay)
            }
            "variables" => {
                let varref = args.get("variablesReference").and_then(Json::as_i64).unwrap_or(0);
                let result = self.dbg.borrow_mut().variables(vm, varref);
                match result {
                    Ok(vars) => {
                        let body: Vec<Json> = vars
                            .into_iter()
                            .map(|v| {
                                json!({
                                    "name": v.name,
                                    "value": v.value,
                                    "type": v.r#type,
                                    "variablesReference": v.variables_reference,
                                })
                            })
                            .collect();
                        self.respond_ok(&req, Some(json!({ "variables": body })))?;
                    }
                    Err(e) => self.respond_err(&req, &e.to_string())?,
                }
                Ok(Directive::Stay)
            }
            "setVariable" => {
                let varref = args.get("variablesReference").and_then(Json::as_i64).unwrap_or(0);
                let name = args.get("name").and_then(Json::as_str).unwrap_or("");
                let value = args.get("value").and_then(Json::as_str).unwrap_or("");
                let outcome = self.dbg.borrow_mut().set_variable(vm, varref, name, value);
                match outcome {
                    Ok(var) => self.respond_ok(
                        &req,
                        Some(json!({
                            "value": var.value,
                            "type": var.r#type,
                            "variablesReference": var.variables_reference,
                        })),
                    )?,
                    Err(e) => self.respond_err(&req, &e.to_string())?,
                }
                Ok(Directive::Stay)
            }
            "continue" => {
                self.dbg.borrow_mut().request(StepMode::Continue, vm);
                self.respond_ok(&req, Some(json!({ "allThreadsContinued": true })))?;
                Ok(Directive::Resume)
            }
            "next" => {
                self.dbg.borrow_mut().request(StepMode::Over, vm);
                self.respond_ok(&req, None)?;
                Ok(Directive::Resume)
            }
            "stepIn" => {
                self.dbg.borrow_mut().request(StepMode::In, vm);
                self.respond_ok(&req, None)?;
                Ok(Directive::Resume)
            }
            "stepOut" => {
                self.dbg.borrow_mut().request(StepMode::Out, vm);
                self.respond_ok(&req, None)?;
                Ok(Directive::Resume)
            }
            "pause" => {
                self.dbg.borrow_mut().request(StepMode::Pause, vm);
                self.respond_ok(&req, None)?;
                Ok(Directive::Resume)
            }
            "disconnect" => {
                self.respond_ok(&req, None)?;
                Ok(Directive::Detach)
            }
            other => {
                warn!("unsupported dap command `{other}`");
                self.respond_err(&req, &format!("unsupported command `{other}`"))?;
                Ok(Directive::Stay)
            }
        }
    }

    /* ------------------------------ Sortants ------------------------------- */

    fn next_seq(&mut self) -> i64 {
        self.seq += 1;
        self.seq
    }

    fn respond_ok(&mut self, req: &Request, body: Option<Json>) -> DapResult<()> {
        let seq = self.next_seq();
        let msg = response(seq, req.seq, &req.command, true, body, None);
        self.transport.borrow_mut().send(&msg)
    }

    fn respond_err(&mut self, req: &Request, message: &str) -> DapResult<()> {
        let seq = self.next_seq();
        let msg = response(seq, req.seq, &req.command, false, None, Some(message));
        self.transport.borrow_mut().send(&msg)
    }

    fn send_event(&mut self, name: &str, body: Json) -> DapResult<()> {
        let seq = self.next_seq();
        let msg = event(seq, name, body);
        self.transport.borrow_mut().send(&msg)
    }

    /// Convertit les événements du débogueur en événements wire.
    pub fn pump_events(&mut self) {
        while let Ok(ev) = self.events.try_recv() {
            let result = match ev {
                DebugEvent::Stopped { reason, source_path, line, .. } => self.send_event(
                    "stopped",
                    json!({
                        "reason": reason.as_dap(),
                        "threadId": 1,
                        "source": { "path": source_path },
                        "line": line,
                    }),
                ),
                DebugEvent::Continued => {
                    self.send_event("continued", json!({ "threadId": 1 }))
                }
                DebugEvent::Terminated { exit_code } => {
                    self.send_event("terminated", json!({ "exitCode": exit_code }))
                }
                DebugEvent::Output { category, text } => {
                    self.send_event("output", json!({ "category": category, "output": text }))
                }
            };
            if let Err(e) = result {
                warn!("dropping dap event: {e}");
            }
        }
    }

    /// Relaye le stdout du programme : événement `output` quand un client
    /// est attaché, stdout réel sinon (hôte embarqué sans client).
    pub fn flush_stdout(&mut self) {
        let text = self.stdout_cap.drain();
        if text.is_empty() {
            return;
        }
        if self.transport.borrow().client_connected() {
            let _ = self.send_event("output", json!({ "category": "stdout", "output": text }));
        } else {
            use std::io::Write;
            let mut out = std::io::stdout().lock();
            let _ = out.write_all(text.as_bytes());
            let _ = out.flush();
        }
    }
}
