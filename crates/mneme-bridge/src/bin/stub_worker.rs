//! Reference worker speaking the bridge wire protocol.
//!
//! Reads one request per line from stdin, answers on stdout. Every request is
//! handled on its own task, so replies can come back in any order.
//!
//! Actions:
//! - `ping`: `{"status":"ok"}`
//! - `echo`: returns its params
//! - `sleep {ms}`: replies after `ms` milliseconds
//! - `fail {message, details}`: error response
//! - `garbage`: writes a malformed line, then replies
//! - `exit {code}`: exits immediately without replying
//! - `silent`: never replies
//! - `shutdown`: replies, then stops reading
//!
//! Flags: `--no-ready`, `--no-id` (omit `id` from replies), `--ready-delay-ms <n>`.

use std::process;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::io::{AsyncWriteExt, Stdout, stdin, stdout};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

use mneme_bridge::bridge::codec::JsonLineCodec;
use mneme_bridge::bridge::protocol::{Request, Response};
use mneme_bridge::logging;

#[derive(Debug, Default, Clone, Copy)]
struct Flags {
    no_ready: bool,
    no_id: bool,
    ready_delay: Duration,
}

enum Outgoing {
    Message(Value),
    /// Written verbatim, bypassing the codec.
    Raw(&'static [u8]),
}

fn parse_flags() -> Result<Flags, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut flags = Flags::default();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--no-ready" => flags.no_ready = true,
            "--no-id" => flags.no_id = true,
            "--ready-delay-ms" => {
                i += 1;
                let ms: u64 = args
                    .get(i)
                    .and_then(|v| v.parse().ok())
                    .ok_or("--ready-delay-ms requires a number")?;
                flags.ready_delay = Duration::from_millis(ms);
            }
            other => return Err(format!("unknown argument: {other}")),
        }
        i += 1;
    }
    Ok(flags)
}

#[tokio::main]
async fn main() {
    logging::init_tracing();

    let flags = match parse_flags() {
        Ok(flags) => flags,
        Err(msg) => {
            eprintln!("error: {msg}");
            process::exit(2);
        }
    };

    let (tx, rx) = mpsc::unbounded_channel::<Outgoing>();
    let writer = tokio::spawn(write_stdout(rx));

    if !flags.ready_delay.is_zero() {
        tokio::time::sleep(flags.ready_delay).await;
    }
    if !flags.no_ready {
        let _ = tx.send(Outgoing::Message(json!({"ready": true})));
    }
    tracing::info!(?flags, "Stub worker ready");

    let mut requests = FramedRead::new(stdin(), JsonLineCodec::<Request>::new());
    while let Some(next) = requests.next().await {
        let request = match next {
            Ok(request) => request,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read stdin");
                break;
            }
        };
        tracing::debug!(id = %request.id, action = %request.action, "Request");

        if request.action == "shutdown" {
            let reply = reply_to(&request, flags, Ok(json!({"status": "shutting_down"})));
            let _ = tx.send(Outgoing::Message(reply));
            break;
        }

        let tx = tx.clone();
        tokio::spawn(async move {
            if let Some(reply) = handle(&request, flags, &tx).await {
                let _ = tx.send(Outgoing::Message(reply));
            }
        });
    }

    drop(tx);
    let _ = writer.await;
    tracing::info!("Stub worker exiting");
}

async fn handle(request: &Request, flags: Flags, tx: &mpsc::UnboundedSender<Outgoing>) -> Option<Value> {
    let params = &request.params;
    let outcome = match request.action.as_str() {
        "ping" => Ok(json!({"status": "ok", "message": "stub worker is running"})),
        "echo" => Ok(Value::Object(params.clone())),
        "sleep" => {
            let ms = params.get("ms").and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(json!({"slept_ms": ms}))
        }
        "fail" => Err((
            params
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("requested failure")
                .to_string(),
            params.get("details").and_then(Value::as_str).map(String::from),
        )),
        "garbage" => {
            let _ = tx.send(Outgoing::Raw(b"{this is not json\n"));
            Ok(json!({"after_garbage": true}))
        }
        "exit" => {
            let code = params.get("code").and_then(Value::as_i64).unwrap_or(1);
            tracing::info!(code, "Exiting on request");
            process::exit(code as i32);
        }
        "silent" => return None,
        other => Err((format!("Unknown action: {other}"), None)),
    };
    Some(reply_to(request, flags, outcome))
}

fn reply_to(
    request: &Request,
    flags: Flags,
    outcome: Result<Value, (String, Option<String>)>,
) -> Value {
    let id = (!flags.no_id).then(|| request.id.clone());
    let response = match outcome {
        Ok(data) => Response::success(id, data),
        Err((message, details)) => Response::failure(id, message, details),
    };
    serde_json::to_value(response).unwrap_or_else(|_| json!({"success": false}))
}

async fn write_stdout(mut rx: mpsc::UnboundedReceiver<Outgoing>) {
    let mut out: FramedWrite<Stdout, JsonLineCodec<Value>> =
        FramedWrite::new(stdout(), JsonLineCodec::new());
    while let Some(msg) = rx.recv().await {
        let result = match msg {
            Outgoing::Message(value) => out.send(value).await,
            Outgoing::Raw(bytes) => {
                let raw = out.get_mut();
                match raw.write_all(bytes).await {
                    Ok(()) => raw.flush().await,
                    Err(e) => Err(e),
                }
            }
        };
        if let Err(e) = result {
            tracing::error!(error = %e, "Failed to write stdout");
            break;
        }
    }
}
