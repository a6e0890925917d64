//! Integration tests against a real RabbitMQ broker at localhost:5672.
//!
//! Run with: cargo test -p bus-amqp -- --ignored

use bus_core::{BusConfig, ServiceBus};
use bus_amqp::{AmqpConfig, AmqpTransport};

fn live_bus(module: &str) -> ServiceBus {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("bus_core=debug,bus_amqp=debug")
        .try_init();

    let config = BusConfig {
        default_rpc_timeout_ms: 2_000,
        test_mode: true,
        ..BusConfig::new(module)
    };
    let transport = AmqpTransport::new(config.clone(), AmqpConfig::default()).unwrap();
    ServiceBus::new(config, Box::new(transport)).unwrap()
}

#[tokio::test]
#[ignore = "requires a RabbitMQ broker on localhost:5672"]
async fn ping_returns_pong_over_amqp() {
    let mut bus = live_bus("amqp-live-ping");
    bus.router().on("live.amqp.PING", |_env| async { Ok(Some("PONG".to_string())) });

    bus.start().await.unwrap();
    let reply = bus.execute("live.amqp.PING", "{}").await.unwrap();
    assert_eq!(reply, "PONG");

    bus.dispose().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a RabbitMQ broker on localhost:5672"]
async fn prefix_binding_matches_nested_routing_keys() {
    let mut bus = live_bus("amqp-live-prefix");
    bus.router().on_prefix("live.amqp.orders", |env| async move {
        Ok(Some(format!("seen {}", env.route)))
    });

    bus.start().await.unwrap();
    let reply = bus
        .execute("live.amqp.orders.eu.created", "{}")
        .await
        .unwrap();
    assert_eq!(reply, "seen live.amqp.orders.eu.created");

    bus.dispose().await.unwrap();
}

#[tokio::test]
#[ignore = "requires a RabbitMQ broker on localhost:5672"]
async fn call_against_unserved_routing_key_times_out() {
    let mut bus = live_bus("amqp-live-timeout");
    bus.start().await.unwrap();

    let err = bus
        .execute("live.amqp.nobody.listens", "{}")
        .await
        .unwrap_err();
    assert!(matches!(err, bus_core::BusError::Timeout(_)));
    assert_eq!(bus.router().pending_calls(), 0);

    bus.dispose().await.unwrap();
}
