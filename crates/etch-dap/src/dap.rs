//! etch-dap : adaptateur Debug Adapter Protocol pour la VM Etch.
//!
//! - Transport : **JSON délimité par des sauts de ligne** (un objet par
//!   ligne, dans les deux sens — pas de framing Content-Length :
//!   délibérément plus simple que le DAP classique, suffisant en mode
//!   embarqué), sur stdio ou sur une socket TCP loopback.
//! - Requêtes supportées : initialize, launch, attach, setBreakpoints,
//!   configurationDone, threads, stackTrace, scopes, variables,
//!   setVariable, continue, next, stepIn, stepOut, pause, disconnect
//! - Événements émis : initialized, stopped, continued, terminated, output
//!
//! Le serveur multiplexe avec l'exécution via le callback d'instruction :
//! il sonde la socket à chaque pas (non bloquant) ; une requête arrivée
//! pause la VM de façon synchrone, la requête est traitée, la réponse
//! envoyée, et la VM ne repart que sur un verbe de reprise.

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Transports (console stdio, TCP loopback, loopback mémoire pour tests).
pub mod transport;

/// Le serveur : dispatch des requêtes et boucle de session.
pub mod server;

pub use server::{DapServer, Directive};
pub use transport::{ConsoleTransport, LoopbackClient, LoopbackTransport, TcpTransport, Transport};

/// Résultat interne simplifié.
pub type DapResult<T> = Result<T, DapError>;

/// Erreurs internes du DAP.
#[derive(Debug)]
pub enum DapError {
    /// Erreur d'entrée/sortie transport.
    Io(io::Error),
    /// JSON invalide.
    Json(serde_json::Error),
    /// Violation de protocole.
    Protocol(String),
}

impl fmt::Display for DapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DapError::Io(e) => write!(f, "io: {e}"),
            DapError::Json(e) => write!(f, "json: {e}"),
            DapError::Protocol(m) => write!(f, "protocol: {m}"),
        }
    }
}

impl std::error::Error for DapError {}

impl From<io::Error> for DapError {
    fn from(e: io::Error) -> Self { DapError::Io(e) }
}

impl From<serde_json::Error> for DapError {
    fn from(e: serde_json::Error) -> Self { DapError::Json(e) }
}

/// Une requête client décodée.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Numéro de séquence client.
    pub seq: i64,
    /// Commande (`initialize`, `next`…).
    pub command: String,
    /// Arguments (objet libre).
    #[serde(default)]
    pub arguments: Json,
}

/// Décode une ligne entrante ; seuls les objets `type: "request"` nous
/// intéressent (un client DAP n'envoie rien d'autre).
pub fn parse_request(line: &str) -> DapResult<Option<Request>> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let value: Json = serde_json::from_str(line)?;
    if value.get("type").and_then(Json::as_str) != Some("request") {
        return Ok(None);
    }
    let seq = value.get("seq").and_then(Json::as_i64).unwrap_or(0);
    let command = value
        .get("command")
        .and_then(Json::as_str)
        .ok_or_else(|| DapError::Protocol("request without command".into()))?
        .to_string();
    let arguments = value.get("arguments").cloned().unwrap_or(Json::Null);
    Ok(Some(Request { seq, command, arguments }))
}

/// Fabrique un objet réponse.
pub fn response(seq: i64, request_seq: i64, command: &str, success: bool, body: Option<Json>, message: Option<&str>) -> Json {
    let mut obj = serde_json::json!({
        "seq": seq,
        "type": "response",
        "request_seq": request_seq,
        "command": command,
        "success": success,
    });
    if let Some(body) = body {
        obj["body"] = body;
    }
    if let Some(message) = message {
        obj["message"] = Json::String(message.to_string());
    }
    obj
}

/// Fabrique un objet événement.
pub fn event(seq: i64, name: &str, body: Json) -> Json {
    serde_json::json!({
        "seq": seq,
        "type": "event",
        "event": name,
        "body": body,
    })
}
