//! Integration tests against a real NATS server at localhost:4222.
//!
//! Run with: cargo test -p bus-nats -- --ignored

use bus_core::{BusConfig, ServiceBus};
use bus_nats::{NatsConfig, NatsTransport};

fn live_bus(module: &str) -> ServiceBus {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("bus_core=debug,bus_nats=debug")
        .try_init();

    let config = BusConfig {
        default_rpc_timeout_ms: 2_000,
        ..BusConfig::new(module)
    };
    let transport = NatsTransport::new(config.clone(), NatsConfig::default()).unwrap();
    ServiceBus::new(config, Box::new(transport)).unwrap()
}

#[tokio::test]
#[ignore = "requires a NATS server on localhost:4222"]
async fn ping_returns_pong_over_nats() {
    let mut bus = live_bus("nats-live-ping");
    bus.router().on("live.PING", |_env| async { Ok(Some("PONG".to_string())) });

    bus.start().await.unwrap();
    let reply = bus.execute("live.PING", "{}").await.unwrap();
    assert_eq!(reply, "PONG");

    bus.dispose().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a NATS server on localhost:4222"]
async fn prefix_wildcard_matches_nested_subjects() {
    let mut bus = live_bus("nats-live-prefix");
    bus.router().on_prefix("live.orders", |env| async move {
        Ok(Some(format!("seen {}", env.route)))
    });

    bus.start().await.unwrap();
    let reply = bus.execute("live.orders.eu.created", "{}").await.unwrap();
    assert_eq!(reply, "seen live.orders.eu.created");

    bus.dispose().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a NATS server on localhost:4222"]
async fn request_against_unserved_subject_times_out() {
    let mut bus = live_bus("nats-live-timeout");
    bus.start().await.unwrap();

    let err = bus.execute("live.nobody.listens", "{}").await.unwrap_err();
    assert!(matches!(err, bus_core::BusError::Timeout(_)));

    bus.dispose().await.unwrap();
}
