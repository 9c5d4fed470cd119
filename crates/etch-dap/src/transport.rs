//! transport.rs — Transports DAP
//!
//! Trois implémentations du même contrat ligne-à-ligne :
//! - [`ConsoleTransport`] : stdin/stdout (un thread lecteur alimente un
//!   canal, la sonde reste non bloquante côté VM)
//! - [`TcpTransport`] : socket TCP **loopback**, longue durée de vie — un
//!   client peut se déconnecter puis revenir, le serveur continue
//!   d'écouter ; l'accept et les lectures sont non bloquants, `EINTR`
//!   est retenté de façon transparente
//! - [`LoopbackTransport`] : paire de canaux en mémoire (tests, clients
//!   in-process)
//!
//! Toutes les lectures bloquantes passent par un poll-avec-timeout : la
//! VM n'est jamais gelée indéfiniment en attente d'un client.

use std::io::{self, BufRead, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, warn};
use serde_json::Value as Json;

use crate::{parse_request, DapResult, Request};

/// Contrat commun des transports.
pub trait Transport {
    /// Attend au plus `timeout` une requête complète. `Duration::ZERO`
    /// fait une passe strictement non bloquante (appelée depuis le
    /// callback d'instruction).
    fn poll(&mut self, timeout: Duration) -> DapResult<Option<Request>>;

    /// Envoie un objet JSON (réponse ou événement) sur sa propre ligne.
    fn send(&mut self, msg: &Json) -> DapResult<()>;

    /// Un client est-il actuellement joignable ?
    fn client_connected(&self) -> bool;

    /// Le transport peut-il revoir un client après une déconnexion ?
    fn supports_reattach(&self) -> bool;
}

/* ─────────────────────────── Console (stdio) ─────────────────────────── */

/// Transport stdio : une requête JSON par ligne sur stdin, réponses et
/// événements un objet par ligne sur stdout.
pub struct ConsoleTransport {
    rx: Receiver<String>,
    eof: bool,
}

impl ConsoleTransport {
    /// Démarre le thread lecteur de stdin.
    pub fn new() -> Self {
        let (tx, rx) = unbounded::<String>();
        std::thread::Builder::new()
            .name("etch-dap-stdin".into())
            .spawn(move || read_lines(io::stdin().lock(), &tx))
            .expect("spawn stdin reader");
        Self { rx, eof: false }
    }
}

impl Default for ConsoleTransport {
    fn default() -> Self { Self::new() }
}

fn read_lines<R: BufRead>(mut reader: R, tx: &Sender<String>) {
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {
                if tx.send(line.clone()).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("stdin read failed: {e}");
                break;
            }
        }
    }
}

impl Transport for ConsoleTransport {
    fn poll(&mut self, timeout: Duration) -> DapResult<Option<Request>> {
        if self.eof {
            return Ok(None);
        }
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let line = if timeout.is_zero() {
                match self.rx.try_recv() {
                    Ok(line) => line,
                    Err(_) => return Ok(None),
                }
            } else {
                match self.rx.recv_timeout(remaining) {
                    Ok(line) => line,
                    Err(RecvTimeoutError::Timeout) => return Ok(None),
                    Err(RecvTimeoutError::Disconnected) => {
                        self.eof = true;
                        return Ok(None);
                    }
                }
            };
            match parse_request(&line) {
                Ok(Some(req)) => return Ok(Some(req)),
                Ok(None) => {
                    if timeout.is_zero() {
                        return Ok(None);
                    }
                }
                Err(e) => warn!("ignoring malformed request line: {e}"),
            }
        }
    }

    fn send(&mut self, msg: &Json) -> DapResult<()> {
        let mut out = io::stdout().lock();
        serde_json::to_writer(&mut out, msg)?;
        out.write_all(b"\n")?;
        out.flush()?;
        Ok(())
    }

    fn client_connected(&self) -> bool { !self.eof }

    fn supports_reattach(&self) -> bool { false }
}

/* ─────────────────────────── TCP loopback ─────────────────────────── */

/// Transport TCP : écoute sur 127.0.0.1:port, accepte un client à la
/// fois, survit aux déconnexions.
pub struct TcpTransport {
    listener: TcpListener,
    client: Option<TcpStream>,
    buf: Vec<u8>,
}

impl TcpTransport {
    /// Lie le port sur l'interface loopback uniquement.
    pub fn bind(port: u16) -> DapResult<Self> {
        let listener = TcpListener::bind(("127.0.0.1", port))?;
        listener.set_nonblocking(true)?;
        Ok(Self { listener, client: None, buf: Vec::new() })
    }

    /// Le port effectivement lié (utile avec port 0 dans les tests).
    pub fn port(&self) -> u16 { self.listener.local_addr().map(|a| a.port()).unwrap_or(0) }

    fn try_accept(&mut self) -> DapResult<()> {
        if self.client.is_some() {
            return Ok(());
        }
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!("dap client connected from {peer}");
                    stream.set_nonblocking(true)?;
                    self.buf.clear();
                    self.client = Some(stream);
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn fill_buf(&mut self) -> DapResult<()> {
        let Some(stream) = self.client.as_mut() else { return Ok(()) };
        let mut chunk = [0u8; 4096];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => {
                    debug!("dap client disconnected");
                    self.client = None;
                    return Ok(());
                }
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("dap client read failed: {e}");
                    self.client = None;
                    return Ok(());
                }
            }
        }
    }

    fn take_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.buf.drain(..=pos).collect();
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}

impl Transport for TcpTransport {
    fn poll(&mut self, timeout: Duration) -> DapResult<Option<Request>> {
        let deadline = Instant::now() + timeout;
        loop {
            self.try_accept()?;
            self.fill_buf()?;
            while let Some(line) = self.take_line() {
                match parse_request(&line) {
                    Ok(Some(req)) => return Ok(Some(req)),
                    Ok(None) => {}
                    Err(e) => warn!("ignoring malformed request line: {e}"),
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn send(&mut self, msg: &Json) -> DapResult<()> {
        let Some(stream) = self.client.as_mut() else { return Ok(()) };
        let mut line = serde_json::to_vec(msg)?;
        line.push(b'\n');
        let mut written = 0;
        while written < line.len() {
            match stream.write(&line[written..]) {
                Ok(0) => {
                    self.client = None;
                    return Ok(());
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(1));
                }
                Err(e) => {
                    warn!("dap client write failed: {e}");
                    self.client = None;
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn client_connected(&self) -> bool { self.client.is_some() }

    fn supports_reattach(&self) -> bool { true }
}

/* ─────────────────────────── Loopback (mémoire) ─────────────────────────── */

/// Transport en mémoire : le « client » est un handle de canaux. Sert aux
/// tests d'intégration et aux clients in-process.
pub struct LoopbackTransport {
    rx: Receiver<String>,
    tx_out: Sender<Json>,
    connected: bool,
}

/// Côté client du transport loopback.
pub struct LoopbackClient {
    tx: Sender<String>,
    rx_out: Receiver<Json>,
    next_seq: i64,
}

/// Construit la paire (serveur, client).
pub fn loopback() -> (LoopbackTransport, LoopbackClient) {
    let (tx_in, rx_in) = unbounded::<String>();
    let (tx_out, rx_out) = unbounded::<Json>();
    (
        LoopbackTransport { rx: rx_in, tx_out, connected: true },
        LoopbackClient { tx: tx_in, rx_out, next_seq: 1 },
    )
}

impl LoopbackClient {
    /// Envoie une requête ; retourne son `seq`.
    pub fn send(&mut self, command: &str, arguments: Json) -> i64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        let msg = serde_json::json!({
            "seq": seq,
            "type": "request",
            "command": command,
            "arguments": arguments,
        });
        let _ = self.tx.send(msg.to_string());
        seq
    }

    /// Prochain message sortant (réponse ou événement), avec timeout.
    pub fn recv(&self, timeout: Duration) -> Option<Json> {
        self.rx_out.recv_timeout(timeout).ok()
    }

    /// Draine tout ce qui est déjà disponible.
    pub fn drain(&self) -> Vec<Json> {
        let mut out = Vec::new();
        while let Ok(msg) = self.rx_out.try_recv() {
            out.push(msg);
        }
        out
    }
}

impl Transport for LoopbackTransport {
    fn poll(&mut self, timeout: Duration) -> DapResult<Option<Request>> {
        let line = if timeout.is_zero() {
            match self.rx.try_recv() {
                Ok(line) => line,
                Err(_) => return Ok(None),
            }
        } else {
            match self.rx.recv_timeout(timeout) {
                Ok(line) => line,
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => {
                    self.connected = false;
                    return Ok(None);
                }
            }
        };
        parse_request(&line)
    }

    fn send(&mut self, msg: &Json) -> DapResult<()> {
        if self.tx_out.send(msg.clone()).is_err() {
            self.connected = false;
        }
        Ok(())
    }

    fn client_connected(&self) -> bool { self.connected }

    fn supports_reattach(&self) -> bool { true }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_roundtrip() {
        let (mut server, mut client) = loopback();
        client.send("initialize", serde_json::json!({}));
        let req = server.poll(Duration::from_millis(100)).unwrap().unwrap();
        assert_eq!(req.command, "initialize");
        assert_eq!(req.seq, 1);

        server.send(&serde_json::json!({"type": "response", "request_seq": 1})).unwrap();
        let msg = client.recv(Duration::from_millis(100)).unwrap();
        assert_eq!(msg["request_seq"], 1);
    }

    #[test]
    fn tcp_accepts_and_reads_lines() {
        let mut server = TcpTransport::bind(0).unwrap();
        let port = server.port();
        assert!(!server.client_connected());

        let mut sock = TcpStream::connect(("127.0.0.1", port)).unwrap();
        sock.write_all(b"{\"seq\":1,\"type\":\"request\",\"command\":\"threads\"}\n")
            .unwrap();

        let req = server.poll(Duration::from_millis(500)).unwrap().unwrap();
        assert_eq!(req.command, "threads");
        assert!(server.client_connected());

        server.send(&serde_json::json!({"type": "response", "request_seq": 1, "success": true})).unwrap();
        let mut reader = io::BufReader::new(sock.try_clone().unwrap());
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert!(line.contains("\"request_seq\":1"));

        // disconnect: the server keeps listening and accepts a new client
        drop(sock);
        drop(reader);
        let _ = server.poll(Duration::from_millis(50)).unwrap();
        assert!(!server.client_connected());

        let mut sock2 = TcpStream::connect(("127.0.0.1", port)).unwrap();
        sock2
            .write_all(b"{\"seq\":2,\"type\":\"request\",\"command\":\"threads\"}\n")
            .unwrap();
        let req = server.poll(Duration::from_millis(500)).unwrap().unwrap();
        assert_eq!(req.seq, 2);
    }
}
