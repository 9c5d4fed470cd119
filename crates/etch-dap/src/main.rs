//! main.rs — point d'entrée du binaire etch-dap
//!
//! Mode console : lit des requêtes DAP (une par ligne JSON) sur stdin,
//! exécute le bytecode passé en argument et répond sur stdout. C'est le
//! même serveur que la sous-commande `etch debug-server`.
//!
//! Pour debug manuel :
//!   $ etch-dap program.etcx
//!   {"seq":1,"type":"request","command":"initialize","arguments":{}}

use std::process::ExitCode;
use std::sync::Arc;

use etch_dap::{ConsoleTransport, DapServer};
use etch_vm::Vm;
use log::info;

fn main() -> ExitCode {
    env_logger::init();

    let Some(path) = std::env::args().nth(1) else {
        eprintln!("usage: etch-dap <program.etcx>");
        return ExitCode::from(2);
    };

    let program = match etch_etcx::read_file(&path) {
        Ok(p) => Arc::new(p),
        Err(e) => {
            eprintln!("etch-dap: cannot load {path}: {e}");
            return ExitCode::from(2);
        }
    };
    info!("serving {path} over stdio");

    let mut vm = Vm::new(program.clone());
    let mut server = DapServer::new(program, ConsoleTransport::new());
    match server.run_session(&mut vm) {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(e) => {
            eprintln!("etch-dap: {e}");
            ExitCode::from(1)
        }
    }
}
