//! etch-cli — bibliothèque interne du binaire `etch`
//!
//! API propre et testable pour le CLI, sans parsing d'arguments (réservé
//! à `main.rs`) :
//! - pipeline générique **résolution bytecode → exécution** avec cache
//!   `__etch__/` (clé = hash du contenu source, `--force` l'ignore)
//! - hook pour brancher le compilateur source→bytecode (collaborateur
//!   externe ; sans lui, les sources passent par le cache ou échouent
//!   avec un message clair, les `.etcx` marchent toujours)
//! - commandes : run, compile, test (sidecars `.pass`/`.fail`),
//!   debug-server (DAP console), replay, record

#![deny(unused_must_use)]
#![forbid(unsafe_code)]

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context as _, Result};

use etch_core::Program;
use etch_etcx::replay::{Replay, StepPoint};
use etch_runtime::{CompileFn, CompileOptions, Context};
use etch_vm::Captured;

/* ───────────────────────────── Types publics ───────────────────────────── */

/// Commande haut-niveau (le parsing CLI reste dans `main.rs`).
#[derive(Clone, Debug)]
pub enum Command {
    /// Compiler si besoin, puis exécuter dans la VM.
    Run(RunTask),
    /// Émettre le `.etcx` uniquement.
    Compile(CompileTask),
    /// Exécuter avec validation `.pass`/`.fail`.
    Test(TestTask),
    /// Serveur DAP en mode console (stdio).
    DebugServer(DebugServerTask),
    /// Rejouer un enregistrement.
    Replay(ReplayTask),
    /// Exécuter et produire un enregistrement.
    Record(RecordTask),
}

/// Options communes à toutes les commandes.
#[derive(Clone, Debug, Default)]
pub struct CommonOpts {
    /// Verbosité (-v répété).
    pub verbose: u8,
    /// Émettre les infos de debug, baisser l'optimisation.
    pub debug: bool,
    /// Ignorer le cache bytecode.
    pub force: bool,
}

/// `run <file>`.
#[derive(Clone, Debug, Default)]
pub struct RunTask {
    /// Source ou `.etcx`.
    pub input: PathBuf,
}

/// `compile <file>`.
#[derive(Clone, Debug, Default)]
pub struct CompileTask {
    /// Fichier source.
    pub input: PathBuf,
    /// Sortie (par défaut : même nom + `.etcx`).
    pub output: Option<PathBuf>,
}

/// `test <path>`.
#[derive(Clone, Debug, Default)]
pub struct TestTask {
    /// Source ou `.etcx` avec sidecars `.pass`/`.fail`.
    pub input: PathBuf,
}

/// `debug-server <file>`.
#[derive(Clone, Debug, Default)]
pub struct DebugServerTask {
    /// Source ou `.etcx`.
    pub input: PathBuf,
}

/// `replay <record.replay> --step <spec>`.
#[derive(Clone, Debug, Default)]
pub struct ReplayTask {
    /// Fichier `.replay`.
    pub input: PathBuf,
    /// Spec de steps : liste de numéros de statements, `S`, `E`.
    pub step: String,
}

/// `record <path> --run <file>`.
#[derive(Clone, Debug, Default)]
pub struct RecordTask {
    /// Fichier `.replay` de sortie.
    pub output: PathBuf,
    /// Programme à exécuter.
    pub run: PathBuf,
}

/// Hooks pour brancher les implémentations externes.
#[derive(Clone, Copy, Default)]
pub struct Hooks {
    /// Compilateur source → octets `.etcx`.
    pub compile: Option<CompileFn>,
}

/* ─────────────────────────── Résolution bytecode ─────────────────────────── */

/// Source ou artefact → programme chargé. Les `.etcx` se chargent
/// directement ; une source passe par le cache `__etch__/`, puis par le
/// hook compilateur (qui alimente le cache).
pub fn resolve_program(input: &Path, hooks: &Hooks, opts: &CommonOpts) -> Result<Program> {
    if input.extension().and_then(|e| e.to_str()) == Some("etcx") {
        return etch_etcx::read_file(input)
            .map_err(|e| anyhow!("cannot load {}: {e}", input.display()));
    }

    if let Some(cached) = etch_etcx::cache::lookup(input, opts.force)
        .map_err(|e| anyhow!("cache lookup failed: {e}"))?
    {
        log::info!("using cached bytecode {}", cached.display());
        return etch_etcx::read_file(&cached)
            .map_err(|e| anyhow!("cannot load cached {}: {e}", cached.display()));
    }

    let Some(compile) = hooks.compile else {
        bail!(
            "{} is a source file and no compiler is configured (run a .etcx artifact, \
             or build with the compiler bridge)",
            input.display()
        );
    };
    let source = fs::read_to_string(input)
        .with_context(|| format!("cannot read {}", input.display()))?;
    let copts = CompileOptions {
        debug: opts.debug,
        source_path: Some(input.display().to_string()),
    };
    let bytes = compile(&source, &copts).map_err(|e| anyhow!("compile error: {e}"))?;
    let program = etch_etcx::decode_program(&bytes)
        .map_err(|e| anyhow!("compiler produced an invalid artifact: {e}"))?;
    let stored = etch_etcx::cache::store(input, &bytes)
        .map_err(|e| anyhow!("cannot write bytecode cache: {e}"))?;
    log::debug!("cached bytecode at {}", stored.display());
    Ok(program)
}

/* ───────────────────────────── Exécution ───────────────────────────── */

/// Exécute une commande ; retourne le code de sortie du processus.
pub fn execute(command: Command, hooks: &Hooks, opts: &CommonOpts) -> Result<i32> {
    match command {
        Command::Run(task) => run_program(&task.input, hooks, opts),
        Command::Compile(task) => compile_only(&task, hooks, opts),
        Command::Test(task) => run_test(&task.input, hooks, opts),
        Command::DebugServer(task) => debug_server(&task.input, hooks, opts),
        Command::Replay(task) => {
            let mut out = std::io::stdout().lock();
            replay_steps(&task.input, &task.step, &mut out)
        }
        Command::Record(task) => record_run(&task, hooks, opts),
    }
}

fn run_program(input: &Path, hooks: &Hooks, opts: &CommonOpts) -> Result<i32> {
    let program = resolve_program(input, hooks, opts)?;
    let mut ctx = Context::new();
    if opts.debug {
        // ETCH_DEBUG_PORT est lu au chargement ; sans --debug on n'ouvre
        // jamais de socket
        if let Ok(port) = std::env::var(etch_runtime::ENV_DEBUG_PORT) {
            if let Ok(port) = port.parse::<u16>() {
                ctx.enable_remote_debug(port);
            }
        }
    }
    ctx.load_program(program)
        .map_err(|e| anyhow!("cannot prepare VM: {e}"))?;
    match ctx.execute() {
        Ok(()) => Ok(0),
        Err(e) => {
            eprintln!("etch: {e}");
            Ok(1)
        }
    }
}

fn compile_only(task: &CompileTask, hooks: &Hooks, opts: &CommonOpts) -> Result<i32> {
    let Some(compile) = hooks.compile else {
        bail!("no compiler is configured");
    };
    let source = fs::read_to_string(&task.input)
        .with_context(|| format!("cannot read {}", task.input.display()))?;
    let copts = CompileOptions {
        debug: opts.debug,
        source_path: Some(task.input.display().to_string()),
    };
    let bytes = compile(&source, &copts).map_err(|e| anyhow!("compile error: {e}"))?;
    // validation avant écriture
    etch_etcx::decode_program(&bytes)
        .map_err(|e| anyhow!("compiler produced an invalid artifact: {e}"))?;
    let output = task
        .output
        .clone()
        .unwrap_or_else(|| task.input.with_extension("etcx"));
    fs::write(&output, &bytes).with_context(|| format!("cannot write {}", output.display()))?;
    println!("wrote {}", output.display());
    Ok(0)
}

fn debug_server(input: &Path, hooks: &Hooks, opts: &CommonOpts) -> Result<i32> {
    let program = Arc::new(resolve_program(input, hooks, opts)?);
    let mut vm = etch_vm::Vm::new(program.clone());
    let mut server = etch_dap::DapServer::new(program, etch_dap::ConsoleTransport::new());
    server
        .run_session(&mut vm)
        .map_err(|e| anyhow!("debug session failed: {e}"))
}

/* ───────────────────────────── test (.pass/.fail) ───────────────────────── */

/// Résultat d'un run de test.
#[derive(Debug, PartialEq, Eq)]
pub enum TestOutcome {
    /// Conforme au sidecar.
    Passed,
    /// Sortie ou statut inattendus.
    Failed(String),
}

fn run_test(input: &Path, hooks: &Hooks, opts: &CommonOpts) -> Result<i32> {
    let program = resolve_program(input, hooks, opts)?;
    match check_test(input, program)? {
        TestOutcome::Passed => {
            println!("PASS {}", input.display());
            Ok(0)
        }
        TestOutcome::Failed(why) => {
            eprintln!("FAIL {}: {why}", input.display());
            Ok(1)
        }
    }
}

/// Exécute `program` et compare aux sidecars de `input` : `.pass` porte
/// le stdout attendu (sortie 0 exigée), `.fail` un fragment du message
/// d'erreur attendu (sortie non nulle exigée).
pub fn check_test(input: &Path, program: Program) -> Result<TestOutcome> {
    let pass_file = input.with_extension("pass");
    let fail_file = input.with_extension("fail");

    let mut ctx = Context::new();
    let cap = Captured::default();
    ctx.set_stdout(Box::new(cap.clone()));
    ctx.load_program(program)
        .map_err(|e| anyhow!("cannot prepare VM: {e}"))?;
    let result = ctx.execute();
    let stdout = cap.get();

    if pass_file.is_file() {
        let expected = fs::read_to_string(&pass_file)
            .with_context(|| format!("cannot read {}", pass_file.display()))?;
        return Ok(match &result {
            Ok(()) if stdout == expected => TestOutcome::Passed,
            Ok(()) => TestOutcome::Failed(format!(
                "stdout mismatch\n--- expected ---\n{expected}\n--- actual ---\n{stdout}"
            )),
            Err(e) => TestOutcome::Failed(format!("expected success, VM failed: {e}")),
        });
    }

    if fail_file.is_file() {
        let expected = fs::read_to_string(&fail_file)
            .with_context(|| format!("cannot read {}", fail_file.display()))?;
        let expected = expected.trim();
        return Ok(match &result {
            Err(e) if e.to_string().contains(expected) => TestOutcome::Passed,
            Err(e) => TestOutcome::Failed(format!(
                "error mismatch: expected `{expected}`, got `{e}`"
            )),
            Ok(()) => TestOutcome::Failed("expected a failure, VM succeeded".into()),
        });
    }

    // pas de sidecar : le statut d'exécution fait foi
    Ok(match result {
        Ok(()) => TestOutcome::Passed,
        Err(e) => TestOutcome::Failed(e.to_string()),
    })
}

/* ───────────────────────────── replay / record ───────────────────────────── */

fn record_run(task: &RecordTask, hooks: &Hooks, opts: &CommonOpts) -> Result<i32> {
    let program = resolve_program(&task.run, hooks, opts)?;
    let replay = etch_runtime::record_execution(program)
        .map_err(|e| anyhow!("recording failed: {e}"))?;
    replay
        .write_file(&task.output)
        .map_err(|e| anyhow!("cannot write {}: {e}", task.output.display()))?;
    println!(
        "recorded {} statements into {}",
        replay.snapshots.len(),
        task.output.display()
    );
    Ok(0)
}

/// Charge un `.replay` et imprime les snapshots demandés par la spec de
/// steps. Un numéro hors plage produit un avertissement ; les autres
/// steps de la même spec continuent.
pub fn replay_steps(input: &Path, spec: &str, out: &mut dyn Write) -> Result<i32> {
    let replay = Replay::read_file(input)
        .map_err(|e| anyhow!("cannot load {}: {e}", input.display()))?;
    let points = etch_etcx::replay::parse_step_spec(spec)
        .map_err(|e| anyhow!("bad --step spec: {e}"))?;
    let total = replay.snapshots.len() as u32;

    let mut code = 0;
    for point in points {
        let ordinal = match point {
            StepPoint::Start => 1,
            StepPoint::End => total,
            StepPoint::Ordinal(n) => n,
        };
        if ordinal == 0 || ordinal > total {
            writeln!(out, "warning: step {ordinal} out of range ({total} statements recorded)")?;
            code = 1;
            continue;
        }
        let snap = &replay.snapshots[(ordinal - 1) as usize];
        let func = replay
            .program
            .funcs
            .get(snap.func as usize)
            .map(|f| f.display_name())
            .unwrap_or("<unknown>");
        writeln!(out, "statement {} — {func} line {} (pc {})", snap.ordinal, snap.line, snap.pc)?;
        for reg in &snap.regs {
            writeln!(out, "  r{}: {} = {}", reg.reg, reg.type_name, reg.rendered)?;
        }
    }
    Ok(code)
}

/* ───────────────────────────── Logger ───────────────────────────── */

/// Initialise `env_logger` depuis la verbosité CLI (sauf si `RUST_LOG`
/// est déjà posé).
pub fn init_logger(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let env = env_logger::Env::default().default_filter_or(level);
    let _ = env_logger::Builder::from_env(env).try_init();
}

/* ───────────────────────────── Tests ───────────────────────────── */

#[cfg(test)]
mod tests {
    use super::*;
    use etch_core::program::GLOBAL_FUNCTION;
    use etch_core::{DebugEntry, Instr, ProgramBuilder, Value};

    fn at(line: u32, stmt: u32) -> DebugEntry {
        DebugEntry { file: 0, line, col: 1, stmt }
    }

    fn hello_program() -> Program {
        let mut b = ProgramBuilder::new();
        b.file("hello.etch");
        let k = b.constant(Value::Int(30));
        b.begin_function(GLOBAL_FUNCTION, 1);
        b.emit(Instr::LoadConst { dst: 0, idx: k }, at(1, 0));
        b.emit(Instr::Print { src: 0 }, at(1, 0));
        b.emit(Instr::Return { first: 0, count: 0 }, at(2, 1));
        b.end_function();
        b.finish().unwrap()
    }

    fn failing_program() -> Program {
        let mut b = ProgramBuilder::new();
        b.file("boom.etch");
        let k1 = b.constant(Value::Int(1));
        let k0 = b.constant(Value::Int(0));
        b.begin_function(GLOBAL_FUNCTION, 3);
        b.emit(Instr::LoadConst { dst: 0, idx: k1 }, at(1, 0));
        b.emit(Instr::LoadConst { dst: 1, idx: k0 }, at(1, 0));
        b.emit(Instr::DivInt { dst: 2, lhs: 0, rhs: 1 }, at(2, 1));
        b.emit(Instr::Return { first: 0, count: 0 }, at(3, 2));
        b.end_function();
        b.finish().unwrap()
    }

    #[test]
    fn etcx_input_loads_without_compiler() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.etcx");
        etch_etcx::write_file(&hello_program(), &path).unwrap();

        let program =
            resolve_program(&path, &Hooks::default(), &CommonOpts::default()).unwrap();
        assert_eq!(program, hello_program());
    }

    #[test]
    fn source_without_compiler_is_a_clear_error() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("p.etch");
        fs::write(&src, "fn main() {}").unwrap();

        let err = resolve_program(&src, &Hooks::default(), &CommonOpts::default()).unwrap_err();
        assert!(err.to_string().contains("no compiler"), "got: {err}");
    }

    #[test]
    fn source_resolves_through_cache() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("p.etch");
        fs::write(&src, "fn main() { print(30); }").unwrap();
        // un artefact préchauffé dans le cache suffit, sans compilateur
        let bytes = etch_etcx::encode_program(&hello_program());
        etch_etcx::cache::store(&src, &bytes).unwrap();

        let program =
            resolve_program(&src, &Hooks::default(), &CommonOpts::default()).unwrap();
        assert_eq!(program, hello_program());

        // --force contourne le cache : sans compilateur, erreur claire
        let opts = CommonOpts { force: true, ..CommonOpts::default() };
        assert!(resolve_program(&src, &Hooks::default(), &opts).is_err());
    }

    #[test]
    fn pass_sidecar_checks_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("t.etch");
        fs::write(&input, "src").unwrap();
        fs::write(dir.path().join("t.pass"), "30\n").unwrap();

        assert_eq!(check_test(&input, hello_program()).unwrap(), TestOutcome::Passed);

        fs::write(dir.path().join("t.pass"), "31\n").unwrap();
        assert!(matches!(
            check_test(&input, hello_program()).unwrap(),
            TestOutcome::Failed(_)
        ));
    }

    #[test]
    fn fail_sidecar_checks_error_message() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("t.etch");
        fs::write(&input, "src").unwrap();
        fs::write(dir.path().join("t.fail"), "division by zero").unwrap();

        assert_eq!(check_test(&input, failing_program()).unwrap(), TestOutcome::Passed);

        // un programme qui réussit alors qu'on attendait l'échec
        assert!(matches!(
            check_test(&input, hello_program()).unwrap(),
            TestOutcome::Failed(_)
        ));
    }

    #[test]
    fn replay_roundtrip_and_step_spec() {
        let dir = tempfile::tempdir().unwrap();
        let replay_path = dir.path().join("r.replay");
        let replay = etch_runtime::record_execution(hello_program()).unwrap();
        replay.write_file(&replay_path).unwrap();

        let mut out = Vec::new();
        let code = replay_steps(&replay_path, "S,E", &mut out).unwrap();
        assert_eq!(code, 0);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("statement 1"), "got: {text}");
        assert!(text.contains("<global>"), "demangled function name: {text}");

        // hors plage : warning, les autres steps continuent
        let mut out = Vec::new();
        let code = replay_steps(&replay_path, "99,S", &mut out).unwrap();
        assert_eq!(code, 1);
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("out of range"));
        assert!(text.contains("statement 1"));
    }
}
