use core::panic;
use std::time::{Duration, Instant};

use pvars::{
    ChannelState, Client, ClientBuilder, ClientError, Server, ServerBuilder, ServerPV,
    client::{MonitorEvent, MonitorUpdate, Subscription},
    pvdata::{PvStructure, Structure, Value},
    server::{Operation, PeerIdentity, PvError},
};
use tokio::select;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::fmt::TestWriter;

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(LevelFilter::TRACE)
        .with_writer(TestWriter::new())
        .try_init();
}

fn demo() -> Structure {
    Structure::new().with("value", 3.13).with("tag", "Hello!")
}

fn demo_with(value: f64) -> Structure {
    Structure::new().with("value", value).with("tag", "Hello!")
}

/// Create a client and server instance, connected to each other via random port
pub async fn connected_client_server(builder: ServerBuilder) -> (Client, Server) {
    let server = builder
        .connection_port(0)
        .search_port(0)
        .beacons(false)
        .start()
        .await
        .unwrap();
    info!(
        "Server ports: {} {}",
        server.connection_port(),
        server.search_port()
    );
    let client = ClientBuilder::new()
        .search_port(server.search_port())
        .broadcast_to(vec![
            format!("127.0.0.1:{}", server.search_port())
                .parse()
                .unwrap(),
        ])
        .name_servers(Vec::new())
        .beacons(false)
        .timeout(Duration::from_secs(5))
        .start()
        .await
        .unwrap();
    (client, server)
}

async fn next_update(sub: &mut Subscription) -> MonitorUpdate {
    select! {
        _ = tokio::time::sleep(Duration::from_secs(4)) => panic!("Did not get subscription event"),
        v = sub.next_update() => v.expect("Subscription ended"),
    }
}

fn value_of(update: &MonitorUpdate) -> Option<f64> {
    update.value.get("value").and_then(Value::as_f64)
}

#[tokio::test]
async fn test_subscribe_to_one_field() {
    init_logging();
    let (client, server) = connected_client_server(ServerBuilder::new()).await;
    let pv = server
        .create_pv("DEMO", PvStructure::from_value(demo()).unwrap())
        .unwrap();

    let mut sub = client.subscribe("DEMO", "field(value)", None).await.unwrap();
    let initial = next_update(&mut sub).await;
    assert_eq!(value_of(&initial), Some(3.13));
    assert!(initial.value.get("tag").is_none());

    pv.update(demo_with(4.13)).unwrap();
    let update = next_update(&mut sub).await;
    assert_eq!(value_of(&update), Some(4.13));
    assert_eq!(update.changed_paths(), vec!["value".to_string()]);
    assert!(!update.has_overrun());

    // A change to a field we did not ask for sends nothing
    pv.update(Structure::new().with("value", 4.13).with("tag", "Bye"))
        .unwrap();
    select! {
        _ = tokio::time::sleep(Duration::from_millis(300)) => (),
        v = sub.next_update() => panic!("Unexpected update: {v:?}"),
    }
    sub.close();
    server.stop();
}

#[tokio::test]
async fn test_read_and_info() {
    init_logging();
    let (client, server) = connected_client_server(ServerBuilder::new()).await;
    server
        .create_pv("DEMO", PvStructure::from_value(demo()).unwrap())
        .unwrap();

    let value = client.read("DEMO", "").await.unwrap();
    assert_eq!(value.get("tag").and_then(Value::as_str), Some("Hello!"));
    let value = client.read("DEMO", "field(tag)").await.unwrap();
    assert!(value.get("value").is_none());

    let channel = client.channel("DEMO");
    assert_eq!(channel.state(), ChannelState::Connected);
    let desc = channel.info("field(value)").await.unwrap();
    let desc = desc.as_structure().unwrap();
    assert!(desc.get("value").is_some());
    assert!(desc.get("tag").is_none());

    assert!(matches!(
        client.read("DEMO", "field(value").await,
        Err(ClientError::Request(_))
    ));
    assert!(matches!(
        client.read("DEMO", "field(nope)").await,
        Err(ClientError::OperationFailed(_))
    ));
}

#[tokio::test]
async fn test_pipelined_monitor_coalesces() {
    init_logging();
    let (client, server) = connected_client_server(ServerBuilder::new()).await;
    let pv = server
        .create_pv("FLOW", PvStructure::from_value(demo()).unwrap())
        .unwrap();
    let mut sub = client.subscribe("FLOW", "", Some(4)).await.unwrap();
    next_update(&mut sub).await;

    for n in 1..=9 {
        pv.update(demo_with(n as f64)).unwrap();
    }
    for n in 1..=4 {
        let update = next_update(&mut sub).await;
        assert_eq!(value_of(&update), Some(n as f64));
        assert!(!update.has_overrun());
    }
    // Updates 5 to 9 were held back until we acknowledged
    let update = next_update(&mut sub).await;
    assert_eq!(value_of(&update), Some(9.0));
    assert_eq!(update.overrun_paths(), vec!["value".to_string()]);
    select! {
        _ = tokio::time::sleep(Duration::from_millis(300)) => (),
        v = sub.next_update() => panic!("Unexpected update: {v:?}"),
    }
}

#[tokio::test]
async fn test_server_loss_resets_channel() {
    init_logging();
    let (client, server) = connected_client_server(ServerBuilder::new()).await;
    server
        .create_pv("DEMO", PvStructure::from_value(demo()).unwrap())
        .unwrap();
    let channel = client.channel("DEMO");
    channel.wait_connected().await.unwrap();
    let mut sub = channel.subscribe("", None).await.unwrap();
    next_update(&mut sub).await;
    let mut states = channel.state_changes();

    server.stop();
    let mut seen = Vec::new();
    while !seen.contains(&ChannelState::Searching) {
        select! {
            _ = tokio::time::sleep(Duration::from_secs(4)) => panic!("Channel did not go back to searching: {seen:?}"),
            state = states.recv() => seen.push(state.unwrap()),
        }
    }
    assert_eq!(
        seen,
        vec![ChannelState::Disconnected, ChannelState::Searching]
    );
    select! {
        _ = tokio::time::sleep(Duration::from_secs(4)) => panic!("Subscription did not see the loss"),
        event = sub.recv() => assert!(matches!(event, Some(MonitorEvent::Disconnected))),
    }
}

#[tokio::test]
async fn test_incompatible_update_keeps_value() {
    init_logging();
    let (client, server) = connected_client_server(ServerBuilder::new()).await;
    let pv = server
        .create_pv("DEMO", PvStructure::from_value(demo()).unwrap())
        .unwrap();
    let result = pv.update(Structure::new().with("value", "text").with("tag", "Hello!"));
    assert!(matches!(result, Err(PvError::IncompatibleType(_))));
    let value = client.read("DEMO", "field(value)").await.unwrap();
    assert_eq!(value.get("value").and_then(Value::as_f64), Some(3.13));
}

#[tokio::test]
async fn test_writes() {
    init_logging();
    let (client, server) = connected_client_server(ServerBuilder::new()).await;
    server
        .create_pv("FIXED", PvStructure::from_value(demo()).unwrap())
        .unwrap();
    server
        .create_pv_with_writer(
            "STORED",
            PvStructure::from_value(demo()).unwrap(),
            |pv: &ServerPV, changed: &[String], written: &PvStructure| {
                assert_eq!(changed, ["value".to_string()]);
                pv.update(written.value().clone()).map_err(|e| e.to_string())
            },
        )
        .unwrap();

    match client.write("FIXED", "value", 1.0).await {
        Err(ClientError::OperationFailed(status)) => assert!(!status.is_success()),
        other => panic!("Write to a read-only PV gave {other:?}"),
    }
    client.write("STORED", "value", "7.5").await.unwrap();
    let value = client.read("STORED", "").await.unwrap();
    assert_eq!(value.get("value").and_then(Value::as_f64), Some(7.5));
    assert_eq!(value.get("tag").and_then(Value::as_str), Some("Hello!"));
}

#[tokio::test]
async fn test_authorization_denial() {
    init_logging();
    let builder = ServerBuilder::new().authorization(
        |_: &PeerIdentity, channel: &str, operation: Operation| {
            channel != "SECRET" || operation == Operation::Info
        },
    );
    let (client, server) = connected_client_server(builder).await;
    server
        .create_pv("SECRET", PvStructure::from_value(demo()).unwrap())
        .unwrap();
    server
        .create_pv("OPEN", PvStructure::from_value(demo()).unwrap())
        .unwrap();

    assert!(matches!(
        client.read("SECRET", "").await,
        Err(ClientError::OperationFailed(_))
    ));
    assert!(matches!(
        client.subscribe("SECRET", "", None).await,
        Err(ClientError::OperationFailed(_))
    ));
    // The connection survives a denial
    assert!(client.channel("SECRET").info("").await.is_ok());
    assert!(client.read("OPEN", "").await.is_ok());
}

#[tokio::test]
async fn test_slow_authorization_does_not_hold_up_other_channels() {
    init_logging();
    let builder = ServerBuilder::new().authorization(
        |_: &PeerIdentity, channel: &str, _: Operation| {
            if channel == "SLOW" {
                std::thread::sleep(Duration::from_secs(2));
            }
            true
        },
    );
    let (client, server) = connected_client_server(builder).await;
    server
        .create_pv("SLOW", PvStructure::from_value(demo()).unwrap())
        .unwrap();
    let fast = server
        .create_pv("FAST", PvStructure::from_value(demo()).unwrap())
        .unwrap();
    let slow = client.channel("SLOW");
    slow.wait_connected().await.unwrap();
    let mut sub = client.subscribe("FAST", "", None).await.unwrap();
    next_update(&mut sub).await;

    let slow_read = tokio::spawn(async move { slow.read("").await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    let sent = Instant::now();
    fast.update(demo_with(5.0)).unwrap();
    let update = next_update(&mut sub).await;
    assert_eq!(value_of(&update), Some(5.0));
    assert!(
        sent.elapsed() < Duration::from_secs(1),
        "Update waited {:?} behind another channel",
        sent.elapsed()
    );
    assert!(slow_read.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_rpc_round_trip() {
    init_logging();
    let (client, server) = connected_client_server(ServerBuilder::new()).await;
    server
        .create_rpc_pv("SUM", |request: PvStructure| {
            let total: f64 = request
                .value()
                .fields()
                .iter()
                .filter_map(|(_, v)| v.as_f64())
                .sum();
            if total < 0.0 {
                return Err("Negative total".to_owned());
            }
            PvStructure::from_value(Structure::new().with("value", total))
                .map_err(|e| e.to_string())
        })
        .unwrap();
    let channel = client.channel("SUM");
    let argument = Structure::new().with("a", 1.5).with("b", 2.0);
    let result = channel
        .invoke(PvStructure::from_value(argument).unwrap())
        .await
        .unwrap();
    assert_eq!(result.get("value").and_then(Value::as_f64), Some(3.5));

    let argument = Structure::new().with("a", -1.5);
    match channel.invoke(PvStructure::from_value(argument).unwrap()).await {
        Err(ClientError::OperationFailed(status)) => assert_eq!(status.message, "Negative total"),
        other => panic!("Expected a failed call, got {other:?}"),
    }
}

#[tokio::test]
async fn test_closed_pv_ends_subscription() {
    init_logging();
    let (client, server) = connected_client_server(ServerBuilder::new()).await;
    let pv = server
        .create_pv("DEMO", PvStructure::from_value(demo()).unwrap())
        .unwrap();
    let mut sub = client.subscribe("DEMO", "", None).await.unwrap();
    next_update(&mut sub).await;
    pv.close();
    assert!(server.pv("DEMO").is_none());
    select! {
        _ = tokio::time::sleep(Duration::from_secs(4)) => panic!("Subscription did not see the close"),
        event = sub.recv() => assert!(!matches!(event, Some(MonitorEvent::Update(_)))),
    }
    assert!(matches!(
        pv.update(demo_with(1.0)),
        Err(PvError::Closed(_))
    ));
}

#[tokio::test]
async fn test_list_servers() {
    init_logging();
    let (client, server) = connected_client_server(ServerBuilder::new()).await;
    let servers = client.list(Duration::from_millis(500)).await.unwrap();
    let found = servers
        .iter()
        .find(|s| s.guid == server.guid())
        .expect("Server did not answer list request");
    assert!(
        found
            .addresses
            .iter()
            .any(|a| a.port() == server.connection_port())
    );
}
