//! End-to-end tests against the `mneme-stub-worker` binary.

use std::time::Duration;

use futures::future::join_all;
use serde::Deserialize;
use serde_json::{Value, json};

use mneme_bridge::{
    Bridge, BridgeConfig, BridgeError, CorrelationMode, ProcessState, WorkerCommand,
};

const STUB: &str = env!("CARGO_BIN_EXE_mneme-stub-worker");

fn config(flags: &[&str]) -> BridgeConfig {
    BridgeConfig::new(WorkerCommand::new(STUB).args(flags.iter().copied()))
        .with_request_timeout(Duration::from_secs(5))
        .with_startup_grace(Duration::from_secs(5))
        .with_shutdown_grace(Duration::from_millis(500))
}

async fn started(config: BridgeConfig) -> Bridge {
    let bridge = Bridge::new(config);
    bridge.start().await.unwrap();
    assert!(bridge.is_running());
    bridge
}

#[tokio::test]
async fn ping_round_trip() {
    let bridge = started(config(&[])).await;

    let data = bridge.request("ping", json!({})).await.unwrap();
    assert_eq!(data["status"], "ok");

    let status = bridge.status();
    assert_eq!(status.state, ProcessState::Running);
    assert!(status.pid.is_some());
    assert!(status.started_at.is_some());
    assert_eq!(status.pending, 0);

    bridge.stop().await;
    assert_eq!(bridge.state(), ProcessState::Stopped);
    assert_eq!(bridge.status().pid, None);
}

#[tokio::test]
async fn out_of_order_replies_reach_their_callers() {
    let bridge = started(config(&[])).await;

    let slow = bridge.request("sleep", json!({"ms": 300}));
    let fast = bridge.request("echo", json!({"tag": "fast"}));
    let (slow, fast) = tokio::join!(slow, fast);
    assert_eq!(slow.unwrap(), json!({"slept_ms": 300}));
    assert_eq!(fast.unwrap(), json!({"tag": "fast"}));

    bridge.stop().await;
}

#[tokio::test]
async fn many_concurrent_callers() {
    let bridge = started(config(&[])).await;

    let calls = (0..50).map(|i| {
        let bridge = bridge.clone();
        async move {
            let data = bridge.request("echo", json!({"n": i})).await.unwrap();
            (i, data)
        }
    });
    for (i, data) in join_all(calls).await {
        assert_eq!(data["n"], i);
    }
    assert_eq!(bridge.pending_count(), 0);

    bridge.stop().await;
}

#[tokio::test]
async fn backend_failure_is_surfaced_with_details() {
    let bridge = started(config(&[])).await;

    let err = bridge
        .request("fail", json!({"message": "Note not found", "details": "trace"}))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        BridgeError::backend("Note not found", Some("trace".to_string()))
    );
    assert_eq!(err.details(), Some("trace"));

    // Unrelated requests are unaffected.
    assert!(bridge.request("ping", json!({})).await.is_ok());
    bridge.stop().await;
}

#[tokio::test]
async fn malformed_line_does_not_stall_the_stream() {
    let bridge = started(config(&[])).await;

    let data = bridge.request("garbage", json!({})).await.unwrap();
    assert_eq!(data, json!({"after_garbage": true}));
    assert!(bridge.request("ping", json!({})).await.is_ok());

    bridge.stop().await;
}

#[tokio::test]
async fn timeout_affects_only_the_timed_out_request() {
    let bridge = started(config(&[])).await;

    let silent = bridge.request_with_timeout("silent", json!({}), Duration::from_millis(150));
    let ok = bridge.request("sleep", json!({"ms": 300}));
    let (silent, ok) = tokio::join!(silent, ok);

    let err = silent.unwrap_err();
    assert!(err.is_timeout(), "{err:?}");
    assert!(ok.is_ok());
    assert_eq!(bridge.pending_count(), 0);

    bridge.stop().await;
}

#[tokio::test]
async fn crash_fails_every_pending_request() {
    let bridge = started(config(&[])).await;
    let mut states = bridge.subscribe();

    let pending: Vec<_> = (0..3)
        .map(|_| {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.request("silent", json!({})).await })
        })
        .collect();
    // Let the silent requests reach the worker first.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = bridge
        .request("exit", json!({"code": 3}))
        .await
        .unwrap_err();
    assert_eq!(err, BridgeError::ProcessNotRunning);

    for handle in pending {
        assert_eq!(handle.await.unwrap(), Err(BridgeError::ProcessNotRunning));
    }
    states
        .wait_for(|state| *state == ProcessState::Crashed)
        .await
        .unwrap();
    assert!(!bridge.is_running());
    assert_eq!(bridge.pending_count(), 0);

    let err = bridge.request("ping", json!({})).await.unwrap_err();
    assert_eq!(err, BridgeError::ProcessNotRunning);

    // A fresh process can be started after a crash.
    bridge.start().await.unwrap();
    assert!(bridge.request("ping", json!({})).await.is_ok());
    bridge.stop().await;
}

#[tokio::test]
async fn stop_fails_pending_requests() {
    let bridge = started(config(&[])).await;

    let waiter = {
        let bridge = bridge.clone();
        tokio::spawn(async move { bridge.request("silent", json!({})).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    bridge.stop().await;
    assert_eq!(waiter.await.unwrap(), Err(BridgeError::ProcessNotRunning));
    assert_eq!(bridge.state(), ProcessState::Stopped);
}

#[tokio::test]
async fn start_and_stop_are_idempotent() {
    let bridge = started(config(&[])).await;
    let pid = bridge.status().pid;

    bridge.start().await.unwrap();
    assert_eq!(bridge.status().pid, pid);

    bridge.stop().await;
    bridge.stop().await;
    assert_eq!(bridge.state(), ProcessState::Stopped);
}

#[tokio::test]
async fn missing_executable_is_a_spawn_error() {
    let bridge = Bridge::new(BridgeConfig::new(WorkerCommand::new(
        "/nonexistent/mneme-worker-binary",
    )));
    let err = bridge.start().await.unwrap_err();
    assert!(matches!(err, BridgeError::ProcessSpawn(_)), "{err:?}");
    assert!(!bridge.is_running());
}

#[tokio::test]
async fn no_ready_signal_means_running_after_grace() {
    let bridge = Bridge::new(
        config(&["--no-ready"]).with_startup_grace(Duration::from_millis(200)),
    );
    bridge.start().await.unwrap();
    assert!(bridge.is_running());
    assert!(bridge.request("ping", json!({})).await.is_ok());
    bridge.stop().await;
}

#[tokio::test]
async fn late_ready_signal_is_awaited() {
    let bridge = started(config(&["--ready-delay-ms", "200"])).await;
    assert!(bridge.request("ping", json!({})).await.is_ok());
    bridge.stop().await;
}

#[cfg(unix)]
#[tokio::test]
async fn exit_during_startup_is_a_spawn_error() {
    let bridge = Bridge::new(
        BridgeConfig::new(WorkerCommand::new("/bin/sh").args(["-c", "exit 3"]))
            .with_startup_grace(Duration::from_secs(5))
            .with_shutdown_grace(Duration::from_millis(200)),
    );
    let err = bridge.start().await.unwrap_err();
    assert!(matches!(err, BridgeError::ProcessSpawn(_)), "{err:?}");
    assert_eq!(bridge.state(), ProcessState::Crashed);
}

#[tokio::test]
async fn sequential_mode_pairs_idless_replies() {
    let bridge = started(
        config(&["--no-id"]).with_correlation(CorrelationMode::Sequential),
    )
    .await;

    let calls = (0..5).map(|i| {
        let bridge = bridge.clone();
        async move { bridge.request("echo", json!({"n": i})).await.unwrap() }
    });
    for (i, data) in join_all(calls).await.into_iter().enumerate() {
        assert_eq!(data["n"], i);
    }

    bridge.stop().await;
}

#[tokio::test]
async fn sequential_mode_discards_reply_to_timed_out_request() {
    let bridge = started(
        config(&["--no-id"]).with_correlation(CorrelationMode::Sequential),
    )
    .await;

    let err = bridge
        .request_with_timeout("sleep", json!({"ms": 300}), Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    // Let the late id-less reply to `sleep` arrive; it must be dropped.
    tokio::time::sleep(Duration::from_millis(400)).await;

    let data = bridge.request("echo", json!({"tag": "next"})).await.unwrap();
    assert_eq!(data, json!({"tag": "next"}));

    bridge.stop().await;
}

#[tokio::test]
async fn echo_mode_ignores_idless_replies() {
    let bridge = started(config(&["--no-id"])).await;
    let err = bridge
        .request_with_timeout("ping", json!({}), Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(err.is_timeout());
    bridge.stop().await;
}

#[derive(Debug, Deserialize, PartialEq)]
struct Echoed {
    query: String,
    limit: u32,
}

#[tokio::test]
async fn typed_call() {
    let bridge = started(config(&[])).await;

    let params = mneme_bridge::actions::Search {
        query: "rust".into(),
        limit: Some(3),
        min_similarity: None,
    };
    let echoed: Echoed = bridge.call("echo", &params).await.unwrap();
    assert_eq!(
        echoed,
        Echoed {
            query: "rust".into(),
            limit: 3
        }
    );

    let err = bridge
        .call::<_, Vec<String>>("echo", &params)
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Decoding(_)), "{err:?}");

    let empty: Value = bridge.call("echo", &json!({})).await.unwrap();
    assert_eq!(empty, json!({}));

    bridge.stop().await;
}

#[tokio::test]
async fn unknown_action_is_a_backend_error() {
    let bridge = started(config(&[])).await;
    let err = bridge
        .request(mneme_bridge::Action::VaultSearch, json!({"query": "x"}))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        BridgeError::backend("Unknown action: vault.search", None)
    );
    bridge.stop().await;
}

#[tokio::test]
async fn nan_params_never_reach_the_worker() {
    let bridge = started(config(&[])).await;

    let params = mneme_bridge::actions::SetScore {
        choice_id: 1,
        factor_id: 2,
        score: f64::NAN,
        uncertainty: Some(f64::INFINITY),
        notes: None,
    };
    let err = bridge
        .call::<_, Value>("echo", &params)
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::Encoding(_)), "{err:?}");
    assert_eq!(bridge.pending_count(), 0);

    let finite = mneme_bridge::actions::SetScore {
        score: 4.0,
        uncertainty: None,
        ..params
    };
    let echoed: Value = bridge.call("echo", &finite).await.unwrap();
    assert_eq!(echoed, json!({"choice_id": 1, "factor_id": 2, "score": 4.0}));

    bridge.stop().await;
}

#[cfg(unix)]
#[tokio::test]
async fn worker_that_stops_reading_still_times_out() {
    // Signals ready, then never reads stdin.
    let bridge = started(
        BridgeConfig::new(
            WorkerCommand::new("/bin/sh").args(["-c", r#"echo '{"ready":true}'; exec sleep 30"#]),
        )
        .with_startup_grace(Duration::from_secs(5))
        .with_shutdown_grace(Duration::from_millis(200)),
    )
    .await;

    let timeout = Duration::from_millis(200);
    let blob = "x".repeat(1024 * 1024);
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        bridge.request_with_timeout("echo", json!({"blob": blob}), timeout),
    )
    .await
    .expect("request outlived its own timeout");
    assert_eq!(result, Err(BridgeError::Timeout(timeout)));

    // The stuck pipe must not hang later callers either.
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        bridge.request_with_timeout("ping", json!({}), timeout),
    )
    .await
    .expect("request outlived its own timeout");
    assert_eq!(result, Err(BridgeError::Timeout(timeout)));
    assert_eq!(bridge.pending_count(), 0);

    bridge.stop().await;
    assert_eq!(bridge.state(), ProcessState::Stopped);
}
