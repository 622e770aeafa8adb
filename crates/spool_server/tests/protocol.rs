//! End-to-end protocol scenarios against an in-process node on a real
//! socket: FIFO delivery, reliable reads, rollback on disconnect, monitor
//! streaming, and journal-backed restart recovery.

mod common;

use std::time::Duration;

use common::{disk_config, spawn_node, Client};
use spool_server::NodeConfig;

#[tokio::test]
async fn basic_fifo_round_trip() {
    let node = spawn_node(NodeConfig::default()).await;
    let mut client = Client::connect(node.addr()).await;

    assert_eq!(client.set("work", 0, b"hello").await, "STORED");
    assert_eq!(
        client.get_value("get work").await.as_deref(),
        Some(&b"hello"[..])
    );
    assert_eq!(client.get_value("get work").await, None);

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn reliable_read_confirm() {
    let node = spawn_node(NodeConfig::default()).await;

    let mut first = Client::connect(node.addr()).await;
    assert_eq!(first.set("q", 0, b"ABC").await, "STORED");
    assert_eq!(
        first.get_value("get q/open").await.as_deref(),
        Some(&b"ABC"[..])
    );
    // A non-transactional get with an open read pending is a protocol
    // violation and costs the connection.
    first.send("get q").await;
    first.expect_line("ERROR").await;
    first.expect_eof().await;

    // The violation rolled the open read back; a new session can claim and
    // confirm the item.
    let mut second = Client::connect(node.addr()).await;
    let reclaimed = loop {
        match second.get_value("get q/open").await {
            Some(data) => break data,
            None => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    };
    assert_eq!(reclaimed, b"ABC");
    second.send("confirm q 1").await;
    second.expect_line("END").await;
    assert_eq!(second.get_value("get q").await, None);

    // Confirming with nothing open is an error but not terminal.
    second.send("confirm q 1").await;
    second.expect_line("ERROR").await;
    second.send("version").await;
    let version = second.read_line().await.unwrap();
    assert!(version.starts_with("VERSION "));

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn abort_returns_item_to_head() {
    let node = spawn_node(NodeConfig::default()).await;
    let mut client = Client::connect(node.addr()).await;

    assert_eq!(client.set("q", 0, b"X").await, "STORED");
    assert_eq!(client.get_value("get q/open").await.as_deref(), Some(&b"X"[..]));
    assert_eq!(client.get_value("get q/abort").await, None);
    assert_eq!(client.get_value("get q").await.as_deref(), Some(&b"X"[..]));

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn too_many_open_reads_disconnects() {
    let config = NodeConfig {
        max_open_reads: 1,
        ..NodeConfig::default()
    };
    let node = spawn_node(config).await;
    let mut client = Client::connect(node.addr()).await;

    for _ in 0..3 {
        assert_eq!(client.set("q", 0, b"item").await, "STORED");
    }
    assert!(client.get_value("get q/open").await.is_some());
    client.send("get q/open").await;
    client.expect_line("ERROR").await;
    client.expect_eof().await;

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn dropped_session_rolls_back_open_reads() {
    let node = spawn_node(NodeConfig::default()).await;

    let mut producer = Client::connect(node.addr()).await;
    assert_eq!(producer.set("alpha", 0, b"a1").await, "STORED");
    assert_eq!(producer.set("beta", 0, b"b1").await, "STORED");

    {
        let mut holder = Client::connect(node.addr()).await;
        assert!(holder.get_value("get alpha/open").await.is_some());
        assert!(holder.get_value("get beta/open").await.is_some());
        // Dropped without confirm or abort.
    }

    // The server notices the disconnect asynchronously; poll until the
    // rollback lands.
    for queue in ["alpha", "beta"] {
        let expected: &[u8] = if queue == "alpha" { b"a1" } else { b"b1" };
        let data = loop {
            match producer.get_value(&format!("get {queue}")).await {
                Some(data) => break data,
                None => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        };
        assert_eq!(data, expected);
    }

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn monitor_streams_then_confirms() {
    let node = spawn_node(NodeConfig::default()).await;
    let mut client = Client::connect(node.addr()).await;

    assert_eq!(client.set("jobs", 0, b"m1").await, "STORED");
    assert_eq!(client.set("jobs", 0, b"m2").await, "STORED");

    client.send("monitor jobs 1 10").await;
    let streamed = client.read_stream_values().await;
    assert_eq!(streamed, vec![b"m1".to_vec(), b"m2".to_vec()]);

    client.send("confirm jobs 2").await;
    client.expect_line("END").await;
    assert_eq!(client.get_value("get jobs").await, None);

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn blocking_get_waits_for_producer() {
    let node = spawn_node(NodeConfig::default()).await;
    let addr = node.addr();

    let consumer = tokio::spawn(async move {
        let mut client = Client::connect(addr).await;
        client.get_value("get q/t=3000").await
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut producer = Client::connect(node.addr()).await;
    assert_eq!(producer.set("q", 0, b"fed").await, "STORED");

    let got = consumer.await.unwrap();
    assert_eq!(got.as_deref(), Some(&b"fed"[..]));

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn expiry_is_honored() {
    let node = spawn_node(NodeConfig::default()).await;
    let mut client = Client::connect(node.addr()).await;

    assert_eq!(client.set("q", 1, b"short-lived").await, "STORED");
    assert_eq!(client.set("q", 0, b"durable").await, "STORED");
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(
        client.get_value("get q").await.as_deref(),
        Some(&b"durable"[..])
    );

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn items_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let node = spawn_node(disk_config(&dir)).await;
        let mut client = Client::connect(node.addr()).await;
        assert_eq!(client.set("persist", 0, b"one").await, "STORED");
        assert_eq!(client.set("persist", 0, b"two").await, "STORED");
        // An unconfirmed open read must also roll back across restart.
        assert!(client.get_value("get persist/open").await.is_some());
        node.shutdown().await.unwrap();
    }

    let node = spawn_node(disk_config(&dir)).await;
    let mut client = Client::connect(node.addr()).await;
    assert_eq!(
        client.get_value("get persist").await.as_deref(),
        Some(&b"one"[..])
    );
    assert_eq!(
        client.get_value("get persist").await.as_deref(),
        Some(&b"two"[..])
    );

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn stats_and_version_and_flush() {
    let node = spawn_node(NodeConfig::default()).await;
    let mut client = Client::connect(node.addr()).await;

    assert_eq!(client.set("q", 0, b"x").await, "STORED");

    client.send("version").await;
    let version = client.read_line().await.unwrap();
    assert!(version.starts_with("VERSION "));

    client.send("stats").await;
    let mut saw_curr_items = false;
    loop {
        let line = client.read_line().await.unwrap();
        if line == "END" {
            break;
        }
        assert!(line.starts_with("STAT "), "unexpected stats line {line:?}");
        if line.starts_with("STAT curr_items ") {
            saw_curr_items = true;
        }
    }
    assert!(saw_curr_items);

    client.send("dump_stats").await;
    let mut dump = Vec::new();
    loop {
        let line = client.read_line().await.unwrap();
        if line == "END" {
            break;
        }
        dump.push(line);
    }
    assert!(dump.iter().any(|line| line.starts_with("queue 'q'")));

    client.send("flush q").await;
    client.expect_line("END").await;
    assert_eq!(client.get_value("get q").await, None);

    client.send("flush_all").await;
    client.expect_line("Flushed all queues.").await;

    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn unknown_command_disconnects() {
    let node = spawn_node(NodeConfig::default()).await;
    let mut client = Client::connect(node.addr()).await;
    client.send("gimme q").await;
    let line = client.read_line().await.unwrap();
    assert!(line.starts_with("CLIENT_ERROR"));
    client.expect_eof().await;
    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn shutdown_command_stops_the_node() {
    let config = NodeConfig {
        shutdown_delay: Duration::from_millis(10),
        ..NodeConfig::default()
    };
    let node = spawn_node(config).await;
    let shutdown = node.shutdown_handle();
    let mut client = Client::connect(node.addr()).await;
    client.send("shutdown").await;
    client.expect_eof().await;

    tokio::time::timeout(Duration::from_secs(5), shutdown.wait())
        .await
        .expect("shutdown signal");
    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn delete_and_peek() {
    let node = spawn_node(NodeConfig::default()).await;
    let mut client = Client::connect(node.addr()).await;

    assert_eq!(client.set("q", 0, b"peekable").await, "STORED");
    assert_eq!(
        client.get_value("get q/peek").await.as_deref(),
        Some(&b"peekable"[..])
    );
    // peek left the item in place
    assert_eq!(
        client.get_value("get q/peek").await.as_deref(),
        Some(&b"peekable"[..])
    );

    client.send("delete q").await;
    client.expect_line("DELETED").await;
    assert_eq!(client.get_value("get q").await, None);

    node.shutdown().await.unwrap();
}
