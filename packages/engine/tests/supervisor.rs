// packages/engine/tests/supervisor.rs
//! Supervisor policies against real worker processes

mod common;

use common::{echo_worker, eventually, pids, start_pool, supervised};
use relaypool_engine::utils::config::SupervisorConfig;
use relaypool_engine::{EngineError, Payload, PoolEvent};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_idle_ttl_replaces_idle_worker() {
    let cfg = supervised(
        1,
        SupervisorConfig {
            watch_tick: Duration::from_secs(1),
            idle_ttl: Duration::from_secs(1),
            ..Default::default()
        },
    );
    let pool = start_pool(echo_worker(&["pid"]), cfg).await.unwrap();

    let first: u32 = pool
        .exec(&Payload::body("pid"))
        .await
        .unwrap()
        .body_text()
        .parse()
        .unwrap();

    tokio::time::sleep(Duration::from_millis(2500)).await;

    let second: u32 = pool
        .exec(&Payload::body("pid"))
        .await
        .unwrap()
        .body_text()
        .parse()
        .unwrap();
    assert_ne!(first, second);

    pool.destroy().await;
}

#[tokio::test]
async fn test_ttl_recycles_workers() {
    let cfg = supervised(
        2,
        SupervisorConfig {
            watch_tick: Duration::from_millis(100),
            ttl: Duration::from_millis(500),
            ..Default::default()
        },
    );
    let pool = start_pool(echo_worker(&["echo"]), cfg).await.unwrap();

    let ttl_events = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = Arc::clone(&ttl_events);
    pool.events().subscribe(move |record| {
        if let PoolEvent::Ttl { pid } = record.event {
            sink.lock().push(pid);
        }
    });

    let before = pids(pool.as_ref());
    assert!(
        eventually(Duration::from_secs(5), || {
            let now = pids(pool.as_ref());
            now.len() == 2 && now.iter().all(|pid| !before.contains(pid))
        })
        .await
    );
    assert!(eventually(Duration::from_secs(1), || ttl_events.lock().len() >= 2).await);

    // still serving
    let reply = pool.exec(&Payload::body("after ttl")).await.unwrap();
    assert_eq!(reply.body_text(), "after ttl");

    pool.destroy().await;
}

#[tokio::test]
async fn test_exec_ttl_times_out() {
    let cfg = supervised(
        1,
        SupervisorConfig {
            watch_tick: Duration::from_secs(1),
            exec_ttl: Duration::from_millis(200),
            ..Default::default()
        },
    );
    let pool = start_pool(echo_worker(&["sleep"]), cfg).await.unwrap();
    let before = pids(pool.as_ref());

    let err = pool.exec(&Payload::body("slow")).await.unwrap_err();
    match err {
        EngineError::Timeout(ttl) => assert_eq!(ttl, Duration::from_millis(200)),
        other => panic!("expected supervisor timeout, got {}", other),
    }

    assert!(
        eventually(Duration::from_secs(5), || {
            let now = pids(pool.as_ref());
            now.len() == 1 && now != before
        })
        .await
    );

    pool.destroy().await;
}

#[tokio::test]
async fn test_busy_worker_survives_idle_ttl() {
    let cfg = supervised(
        1,
        SupervisorConfig {
            watch_tick: Duration::from_millis(100),
            idle_ttl: Duration::from_millis(200),
            ..Default::default()
        },
    );
    let pool = start_pool(echo_worker(&["sleep"]), cfg).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_millis(800);
    let err = pool
        .exec_with_deadline(deadline, &Payload::body("held"))
        .await
        .unwrap_err();

    // the caller's deadline fired; the relay was never cut by the idle policy
    assert!(matches!(err, EngineError::ExecTTL));

    pool.destroy().await;
}
