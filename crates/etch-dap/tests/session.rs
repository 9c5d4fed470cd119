//! Full DAP sessions over the in-memory loopback transport. The server
//! (and its VM) run on a helper thread; the test plays the client.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde_json::{json, Value as Json};

use etch_core::program::GLOBAL_FUNCTION;
use etch_core::{DebugEntry, Instr, Program, ProgramBuilder, Value};
use etch_dap::transport::loopback;
use etch_dap::{DapServer, LoopbackClient};
use etch_vm::Vm;

const WAIT: Duration = Duration::from_secs(5);

fn at(line: u32, stmt: u32) -> DebugEntry {
    DebugEntry { file: 0, line, col: 1, stmt }
}

fn spawn_session(program: Arc<Program>) -> (thread::JoinHandle<i32>, LoopbackClient) {
    let (transport, client) = loopback();
    let handle = thread::spawn(move || {
        let mut vm = Vm::new(program.clone());
        let mut server = DapServer::new(program, transport);
        server.run_session(&mut vm).expect("session io")
    });
    (handle, client)
}

fn wait_response(client: &LoopbackClient, request_seq: i64) -> Json {
    loop {
        let msg = client.recv(WAIT).unwrap_or_else(|| panic!("timeout waiting response {request_seq}"));
        if msg["type"] == "response" && msg["request_seq"] == request_seq {
            return msg;
        }
    }
}

fn wait_event(client: &LoopbackClient, name: &str) -> Json {
    loop {
        let msg = client
            .recv(WAIT)
            .unwrap_or_else(|| panic!("timeout waiting event {name}"));
        if msg["type"] == "event" && msg["event"] == name {
            return msg;
        }
    }
}

/// `fn main() { let a=10; let b=20; print(a+b); }` behind a `<global>`
/// wrapper with its own source lines.
fn arith_program() -> Arc<Program> {
    let mut b = ProgramBuilder::new();
    b.file("main.etch");
    let ka = b.constant(Value::Int(10));
    let kb = b.constant(Value::Int(20));
    b.begin_function(GLOBAL_FUNCTION, 1);
    b.emit(Instr::Call { func: 1, num_args: 0, num_results: 0, first_arg: 0, first_result: 0 }, at(1, 0));
    b.emit(Instr::Return { first: 0, count: 0 }, at(4, 1));
    b.end_function();
    b.begin_function("main$_v", 3);
    b.local("a", 0);
    b.local("b", 1);
    b.emit(Instr::LoadConst { dst: 0, idx: ka }, at(11, 10));
    b.emit(Instr::LoadConst { dst: 1, idx: kb }, at(12, 11));
    b.emit(Instr::AddInt { dst: 2, lhs: 0, rhs: 1 }, at(13, 12));
    b.emit(Instr::Print { src: 2 }, at(13, 12));
    b.emit(Instr::Return { first: 0, count: 0 }, at(14, 13));
    b.end_function();
    Arc::new(b.finish().unwrap())
}

/// Three-iteration countdown with the print on line 8.
fn loop_program() -> Arc<Program> {
    let mut b = ProgramBuilder::new();
    b.file("loop.etch");
    let k3 = b.constant(Value::Int(3));
    let k0 = b.constant(Value::Int(0));
    let k1 = b.constant(Value::Int(1));
    b.begin_function(GLOBAL_FUNCTION, 4);
    b.local("i", 0);
    b.emit(Instr::LoadConst { dst: 0, idx: k3 }, at(6, 0));
    b.emit(Instr::LoadConst { dst: 1, idx: k0 }, at(6, 0));
    b.emit(Instr::LoadConst { dst: 2, idx: k1 }, at(6, 0));
    // header: line 7
    b.emit(Instr::Gt { dst: 3, lhs: 0, rhs: 1 }, at(7, 1));
    let exit_jump = b.emit(Instr::JumpIfNot { cond: 3, offset: 0 }, at(7, 1));
    // body: line 8
    b.emit(Instr::Print { src: 0 }, at(8, 2));
    b.emit(Instr::SubInt { dst: 0, lhs: 0, rhs: 2 }, at(9, 3));
    let back = b.here();
    b.emit(Instr::Jump { offset: 3 - (back as i32) - 1 }, at(9, 3));
    let end = b.here();
    b.patch(exit_jump, Instr::JumpIfNot { cond: 3, offset: (end - exit_jump - 1) as i32 });
    b.emit(Instr::Return { first: 0, count: 0 }, at(10, 4));
    b.end_function();
    Arc::new(b.finish().unwrap())
}

/// Scenario: step over two statements after stopping at entry.
#[test]
fn step_over_session() {
    let (handle, mut client) = spawn_session(arith_program());

    let seq = client.send("initialize", json!({}));
    let resp = wait_response(&client, seq);
    assert_eq!(resp["success"], true);
    assert_eq!(resp["body"]["supportsStepInRequest"], true);
    assert_eq!(resp["body"]["supportsConditionalBreakpoints"], true);
    assert_eq!(resp["body"]["supportsSetVariable"], true);
    wait_event(&client, "initialized");

    let seq = client.send("launch", json!({"stopAtEntry": true}));
    wait_response(&client, seq);
    let seq = client.send("configurationDone", json!({}));
    wait_response(&client, seq);

    // entry stop
    let stopped = wait_event(&client, "stopped");
    assert_eq!(stopped["body"]["reason"], "entry");

    // threads: the single main thread
    let seq = client.send("threads", json!({}));
    let resp = wait_response(&client, seq);
    assert_eq!(resp["body"]["threads"][0]["id"], 1);

    // step into main, then check the stack
    let seq = client.send("stepIn", json!({"threadId": 1}));
    wait_response(&client, seq);
    let stopped = wait_event(&client, "stopped");
    assert_eq!(stopped["body"]["reason"], "step");

    let seq = client.send("stackTrace", json!({"threadId": 1}));
    let resp = wait_response(&client, seq);
    assert_eq!(resp["body"]["stackFrames"][0]["name"], "main", "demangled name");

    // two nexts walk two statements
    let pre_depth = resp["body"]["totalFrames"].as_i64().unwrap();
    let seq = client.send("next", json!({"threadId": 1}));
    wait_response(&client, seq);
    let stopped = wait_event(&client, "stopped");
    assert_eq!(stopped["body"]["reason"], "step");

    let seq = client.send("stackTrace", json!({"threadId": 1}));
    let resp = wait_response(&client, seq);
    let post_depth = resp["body"]["totalFrames"].as_i64().unwrap();
    assert!(post_depth <= pre_depth, "next never lands deeper");

    let seq = client.send("next", json!({"threadId": 1}));
    wait_response(&client, seq);
    wait_event(&client, "stopped");

    // run to completion
    let seq = client.send("continue", json!({"threadId": 1}));
    wait_response(&client, seq);
    wait_event(&client, "terminated");

    assert_eq!(handle.join().unwrap(), 0);
}

/// Scenario: a breakpoint on the loop body line fires once per iteration.
#[test]
fn breakpoint_fires_once_per_iteration() {
    let (handle, mut client) = spawn_session(loop_program());

    let seq = client.send("initialize", json!({}));
    wait_response(&client, seq);
    let seq = client.send("launch", json!({}));
    wait_response(&client, seq);
    let seq = client.send(
        "setBreakpoints",
        json!({
            "source": {"path": "loop.etch"},
            "breakpoints": [{"line": 8}],
        }),
    );
    let resp = wait_response(&client, seq);
    assert_eq!(resp["body"]["breakpoints"][0]["verified"], true);
    assert_eq!(resp["body"]["breakpoints"][0]["line"], 8);
    let seq = client.send("configurationDone", json!({}));
    wait_response(&client, seq);

    let mut breakpoint_stops = 0;
    let mut stdout = String::new();
    loop {
        let msg = client.recv(WAIT).expect("session message");
        match msg["type"].as_str() {
            Some("event") if msg["event"] == "stopped" => {
                assert_eq!(msg["body"]["reason"], "breakpoint");
                assert_eq!(msg["body"]["line"], 8);
                breakpoint_stops += 1;
                let seq = client.send("continue", json!({"threadId": 1}));
                wait_response(&client, seq);
            }
            Some("event") if msg["event"] == "output" => {
                stdout.push_str(msg["body"]["output"].as_str().unwrap_or(""));
            }
            Some("event") if msg["event"] == "terminated" => break,
            _ => {}
        }
    }

    assert_eq!(breakpoint_stops, 3, "one stop per iteration");
    assert_eq!(stdout, "3\n2\n1\n");
    assert_eq!(handle.join().unwrap(), 0);
}

/// Conditional breakpoints and setVariable over the wire.
#[test]
fn conditional_breakpoint_and_set_variable() {
    let (handle, mut client) = spawn_session(loop_program());

    let seq = client.send("initialize", json!({}));
    wait_response(&client, seq);
    let seq = client.send("launch", json!({}));
    wait_response(&client, seq);
    // only the second iteration (i == 2) should stop
    let seq = client.send(
        "setBreakpoints",
        json!({
            "source": {"path": "loop.etch"},
            "breakpoints": [{"line": 8, "condition": "i == 2"}],
        }),
    );
    wait_response(&client, seq);
    let seq = client.send("configurationDone", json!({}));
    wait_response(&client, seq);

    let stopped = wait_event(&client, "stopped");
    assert_eq!(stopped["body"]["reason"], "breakpoint");

    // inspect: i is 2
    let seq = client.send("stackTrace", json!({"threadId": 1}));
    let frame_id = wait_response(&client, seq)["body"]["stackFrames"][0]["id"].clone();
    let seq = client.send("scopes", json!({"frameId": frame_id}));
    let resp = wait_response(&client, seq);
    assert_eq!(resp["body"]["scopes"][0]["name"], "Local Variables");
    let locals_ref = resp["body"]["scopes"][0]["variablesReference"].clone();

    let seq = client.send("variables", json!({"variablesReference": locals_ref}));
    let resp = wait_response(&client, seq);
    let vars = resp["body"]["variables"].as_array().unwrap();
    let i = vars.iter().find(|v| v["name"] == "i").unwrap();
    assert_eq!(i["value"], "2");
    assert_eq!(i["type"], "int");

    // setVariable type mismatch → structured failure, value unchanged
    let seq = client.send(
        "setVariable",
        json!({"variablesReference": locals_ref, "name": "i", "value": "\"zz\""}),
    );
    let resp = wait_response(&client, seq);
    assert_eq!(resp["success"], false);
    assert!(resp["message"].as_str().unwrap().contains("type mismatch"));

    // valid setVariable: short-circuit the loop
    let seq = client.send(
        "setVariable",
        json!({"variablesReference": locals_ref, "name": "i", "value": "0"}),
    );
    let resp = wait_response(&client, seq);
    assert_eq!(resp["success"], true);
    assert_eq!(resp["body"]["value"], "0");

    let seq = client.send("continue", json!({"threadId": 1}));
    wait_response(&client, seq);
    wait_event(&client, "terminated");
    assert_eq!(handle.join().unwrap(), 0);
}

/// Responses echo their request's seq and arrive in request order.
#[test]
fn response_ordering_invariants() {
    let (handle, mut client) = spawn_session(arith_program());

    let s1 = client.send("initialize", json!({}));
    let s2 = client.send("launch", json!({"stopAtEntry": true}));
    let s3 = client.send("configurationDone", json!({}));

    let mut response_seqs = Vec::new();
    let mut server_seqs = Vec::new();
    while response_seqs.len() < 3 {
        let msg = client.recv(WAIT).expect("message");
        if msg["type"] == "response" {
            response_seqs.push(msg["request_seq"].as_i64().unwrap());
            server_seqs.push(msg["seq"].as_i64().unwrap());
        }
    }
    assert_eq!(response_seqs, vec![s1, s2, s3], "responses in request order");
    assert!(server_seqs.windows(2).all(|w| w[0] < w[1]), "outgoing seqs monotonic");

    wait_event(&client, "stopped");
    let seq = client.send("continue", json!({"threadId": 1}));
    wait_response(&client, seq);
    wait_event(&client, "terminated");
    assert_eq!(handle.join().unwrap(), 0);
}

/// An unknown command fails the request without killing the session.
#[test]
fn unknown_command_is_nonfatal() {
    let (handle, mut client) = spawn_session(arith_program());

    let seq = client.send("initialize", json!({}));
    wait_response(&client, seq);
    let seq = client.send("restartFrame", json!({}));
    let resp = wait_response(&client, seq);
    assert_eq!(resp["success"], false);

    let seq = client.send("launch", json!({}));
    wait_response(&client, seq);
    let seq = client.send("configurationDone", json!({}));
    wait_response(&client, seq);
    wait_event(&client, "terminated");
    assert_eq!(handle.join().unwrap(), 0);
}
