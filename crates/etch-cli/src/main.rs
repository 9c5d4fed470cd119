//! `etch` — CLI principal
//!
//! Ici on fait uniquement : parsing d'arguments, init logger, et
//! délégation à `etch_cli` (lib).

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};

use etch_cli as cli;

#[derive(Debug, Parser)]
#[command(name = "etch", version, about = "Etch — compiler, exécuter, déboguer, rejouer", long_about = None)]
struct Opt {
    /// Augmente la verbosité (-v, -vv, -vvv)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    verbose: u8,

    /// Émet les infos de debug et baisse l'optimisation
    #[arg(long = "debug", global = true)]
    debug: bool,

    /// Ignore le cache bytecode
    #[arg(long = "force", global = true)]
    force: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Compiler si besoin, puis exécuter dans la VM
    Run {
        /// Source (.etch) ou bytecode (.etcx)
        file: PathBuf,
    },

    /// Émettre le bytecode .etcx uniquement
    Compile {
        /// Fichier source
        file: PathBuf,
        /// Fichier de sortie (même nom + .etcx si omis)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Exécuter avec validation .pass/.fail
    Test {
        /// Source ou bytecode, avec sidecars
        path: PathBuf,
    },

    /// Serveur DAP en mode console (stdio)
    DebugServer {
        /// Source ou bytecode
        file: PathBuf,
    },

    /// Rejouer un enregistrement pas-à-pas
    Replay {
        /// Fichier .replay
        file: PathBuf,
        /// Steps : numéros de statements, S (début), E (fin) — ex: S,3,7,E
        #[arg(long)]
        step: String,
    },

    /// Exécuter et produire un fichier .replay
    Record {
        /// Fichier .replay de sortie
        path: PathBuf,
        /// Programme à exécuter
        #[arg(long)]
        run: PathBuf,
    },
}

// ──────────────────────────── Hooks (adapteurs) ────────────────────────────

fn make_hooks() -> cli::Hooks {
    let mut h = cli::Hooks::default();

    // Compilation — À RACCORDER au frontend réel (lexer/parser/typer/
    // prover/compiler). API attendue :
    //   fn compile(source: &str, opts: &CompileOptions) -> Result<Vec<u8>, String>
    // h.compile = Some(etch_compiler::compile_to_etcx);
    h.compile = None;

    h
}

// ──────────────────────────── main ────────────────────────────

fn main() -> ExitCode {
    match real_main() {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(1)
        }
    }
}

fn real_main() -> Result<i32> {
    let opt = Opt::parse();
    cli::init_logger(opt.verbose);

    let hooks = make_hooks();
    let opts = cli::CommonOpts { verbose: opt.verbose, debug: opt.debug, force: opt.force };

    let command = match opt.cmd {
        Command::Run { file } => cli::Command::Run(cli::RunTask { input: file }),
        Command::Compile { file, output } => {
            cli::Command::Compile(cli::CompileTask { input: file, output })
        }
        Command::Test { path } => cli::Command::Test(cli::TestTask { input: path }),
        Command::DebugServer { file } => {
            cli::Command::DebugServer(cli::DebugServerTask { input: file })
        }
        Command::Replay { file, step } => {
            cli::Command::Replay(cli::ReplayTask { input: file, step })
        }
        Command::Record { path, run } => {
            cli::Command::Record(cli::RecordTask { output: path, run })
        }
    };

    cli::execute(command, &hooks, &opts)
}
