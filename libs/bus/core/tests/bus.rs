//! End-to-end bus behavior over the in-memory loopback transport: RPC
//! round trips, prefix delivery, timeout cleanup, dead-lettering, and
//! lifecycle idempotency.

use bus_core::{BusConfig, BusError, MemoryTransport, ServiceBus};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn test_bus(module: &str) -> (ServiceBus, bus_core::MemoryDeadLetterLog) {
    let config = BusConfig {
        default_rpc_timeout_ms: 200,
        ..BusConfig::new(module)
    };
    let transport = MemoryTransport::new(&config);
    let log = transport.dead_letter_log();
    let bus = ServiceBus::new(config, Box::new(transport)).unwrap();
    (bus, log)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 1s");
}

#[tokio::test]
async fn ping_returns_pong() {
    let (mut bus, _log) = test_bus("ping-module");
    bus.router().on("PING", |_env| async { Ok(Some("PONG".to_string())) });

    bus.start().await.unwrap();
    let result = bus.execute("PING", "{}").await.unwrap();
    assert_eq!(result, "PONG");

    bus.dispose().await.unwrap();
}

#[tokio::test]
async fn prefix_subscription_delivers_exactly_once() {
    let (mut bus, _log) = test_bus("orders-module");

    let invocations = Arc::new(AtomicU32::new(0));
    let counter = invocations.clone();
    bus.router().on_prefix("orders", move |_env| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }
    });

    bus.start().await.unwrap();
    bus.send("orders.created", r#"{"id":1}"#).await.unwrap();

    let check = invocations.clone();
    wait_until(move || check.load(Ordering::SeqCst) == 1).await;

    // no duplicate delivery from overlapping subscriptions
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    bus.dispose().await.unwrap();
}

#[tokio::test]
async fn concurrent_rpc_calls_resolve_independently() {
    let (mut bus, _log) = test_bus("echo-module");
    bus.router().on("echo", |env| async move { Ok(Some(env.payload)) });

    bus.start().await.unwrap();
    let bus = Arc::new(bus);

    let (a, b) = tokio::join!(
        bus.execute("echo", r#"{"call":"a"}"#),
        bus.execute("echo", r#"{"call":"b"}"#),
    );

    assert_eq!(a.unwrap(), r#"{"call":"a"}"#);
    assert_eq!(b.unwrap(), r#"{"call":"b"}"#);
}

#[tokio::test]
async fn unanswered_rpc_times_out_without_leaking_entries() {
    let (mut bus, _log) = test_bus("silent-module");
    bus.start().await.unwrap();

    for _ in 0..10 {
        let err = bus.execute("nobody.home", "{}").await.unwrap_err();
        assert!(matches!(err, BusError::Timeout(_)));
    }

    assert_eq!(bus.router().pending_calls(), 0);
    bus.dispose().await.unwrap();
}

#[tokio::test]
async fn failing_handler_produces_dead_letter() {
    let (mut bus, log) = test_bus("flaky-module");
    bus.router().on("orders.charge", |_env| async {
        Err(BusError::Handler("card declined".to_string()))
    });

    bus.start().await.unwrap();
    bus.send("orders.charge", r#"{"amount":10}"#).await.unwrap();

    let check = log.clone();
    wait_until(move || check.len() == 1).await;

    let records = log.records();
    assert_eq!(records[0].route, "orders.charge");
    assert_eq!(records[0].payload["amount"], 10);
    assert_eq!(records[0].error.kind, "handler");
    assert!(records[0].error.message.contains("card declined"));

    bus.dispose().await.unwrap();
}

#[tokio::test]
async fn handler_registered_for_prefix_serves_rpc() {
    let (mut bus, _log) = test_bus("prefix-rpc");
    bus.router().on_prefix("billing", |env| async move {
        Ok(Some(format!("handled {}", env.route)))
    });

    bus.start().await.unwrap();
    let reply = bus.execute("billing.invoice.create", "{}").await.unwrap();
    assert_eq!(reply, "handled billing.invoice.create");
}

#[tokio::test]
async fn disposal_is_idempotent_end_to_end() {
    let (mut bus, _log) = test_bus("lifecycle-module");
    bus.start().await.unwrap();

    bus.stop().await.unwrap();
    bus.stop().await.unwrap();
    bus.dispose().await.unwrap();
    bus.dispose().await.unwrap();

    // operations after disposal fail cleanly instead of touching a closed
    // transport
    assert!(matches!(
        bus.send("r", "{}").await.unwrap_err(),
        BusError::State(_)
    ));
}
