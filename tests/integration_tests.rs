//! Integration tests for the state sync server
//!
//! These tests run a real server on a loopback port and talk to it over real
//! sockets, the same way game clients do.

use futures_util::{SinkExt, StreamExt};
use server::{ConnectionSupervisor, ServerConfig, ShutdownHandle, StateStore, TransportKind};
use shared::{ClientState, StateSnapshot};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(3);

struct TestServer {
    addr: SocketAddr,
    store: StateStore,
    shutdown: ShutdownHandle,
    task: JoinHandle<()>,
}

async fn start_server(config: ServerConfig) -> TestServer {
    let config = ServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        ..config
    };
    let supervisor = ConnectionSupervisor::bind(config).await.unwrap();
    let addr = supervisor.local_addr().unwrap();
    let store = supervisor.store();
    let shutdown = supervisor.shutdown_handle();
    let task = tokio::spawn(supervisor.run());

    TestServer {
        addr,
        store,
        shutdown,
        task,
    }
}

async fn connect(addr: SocketAddr) -> WsClient {
    let (ws, _) = connect_async(format!("ws://{}", addr)).await.unwrap();
    ws
}

async fn wait_for_clients(store: &StateStore, count: usize) {
    timeout(WAIT, async {
        while store.len() != count {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("expected {} clients, have {}", count, store.len()));
}

async fn send(ws: &mut WsClient, json: &str) {
    ws.send(Message::Text(json.to_string())).await.unwrap();
}

async fn next_snapshot(ws: &mut WsClient) -> StateSnapshot {
    timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return StateSnapshot::decode(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("connection ended while waiting for a snapshot: {:?}", other),
            }
        }
    })
    .await
    .expect("no snapshot received")
}

/// Resolves once the server has closed this client's connection.
async fn expect_closed(ws: &mut WsClient) {
    timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .expect("server did not close the connection");
}

fn count_matching(snapshot: &StateSnapshot, state: ClientState) -> usize {
    snapshot.iter().filter(|(_, s)| **s == state).count()
}

/// BROADCAST SCENARIOS
mod broadcast_tests {
    use super::*;

    #[tokio::test]
    async fn update_reaches_every_client() {
        let server = start_server(ServerConfig::default()).await;
        let mut a = connect(server.addr).await;
        let mut b = connect(server.addr).await;
        let mut c = connect(server.addr).await;
        wait_for_clients(&server.store, 3).await;

        send(&mut a, r#"{"x": 10, "y": 10, "direction": 0}"#).await;

        for ws in [&mut a, &mut b, &mut c] {
            let snapshot = next_snapshot(ws).await;
            assert_eq!(snapshot.len(), 3);
            assert_eq!(
                count_matching(&snapshot, ClientState::new(10.0, 10.0, 0.0)),
                1
            );
            assert_eq!(count_matching(&snapshot, ClientState::default()), 2);
        }

        let registered: Vec<_> = server.store.snapshot().ids().collect();
        let broadcast: Vec<_> = next_snapshot_ids_after(&mut a, &mut b).await;
        assert_eq!(registered, broadcast);
    }

    /// Sends one more update from `sender` and returns the identities `reader`
    /// sees in the resulting snapshot.
    async fn next_snapshot_ids_after(
        sender: &mut WsClient,
        reader: &mut WsClient,
    ) -> Vec<shared::ClientId> {
        send(sender, r#"{"direction": 90}"#).await;
        next_snapshot(sender).await;
        next_snapshot(reader).await.ids().collect()
    }

    #[tokio::test]
    async fn partial_update_keeps_other_fields() {
        let server = start_server(ServerConfig::default()).await;
        let mut a = connect(server.addr).await;
        wait_for_clients(&server.store, 1).await;

        send(&mut a, r#"{"x": 1, "y": 2, "direction": 90}"#).await;
        next_snapshot(&mut a).await;
        send(&mut a, r#"{"x": 5}"#).await;
        let snapshot = next_snapshot(&mut a).await;

        assert_eq!(snapshot.len(), 1);
        assert_eq!(count_matching(&snapshot, ClientState::new(5.0, 2.0, 90.0)), 1);
    }

    #[tokio::test]
    async fn repeated_update_is_idempotent() {
        let server = start_server(ServerConfig::default()).await;
        let mut a = connect(server.addr).await;
        let _b = connect(server.addr).await;
        wait_for_clients(&server.store, 2).await;

        let update = r#"{"x": 33, "y": 44, "direction": 180}"#;
        send(&mut a, update).await;
        let once = next_snapshot(&mut a).await;
        send(&mut a, update).await;
        let twice = next_snapshot(&mut a).await;

        assert_eq!(once, twice);
    }
}

/// DISCONNECTION AND ERROR HANDLING
mod lifecycle_tests {
    use super::*;

    #[tokio::test]
    async fn abrupt_disconnect_is_omitted_from_broadcasts() {
        let server = start_server(ServerConfig::default()).await;
        let mut a = connect(server.addr).await;
        let b = connect(server.addr).await;
        let mut c = connect(server.addr).await;
        wait_for_clients(&server.store, 3).await;
        let before: Vec<_> = server.store.snapshot().ids().collect();

        // No close handshake, just a dropped socket.
        drop(b);
        wait_for_clients(&server.store, 2).await;
        let after: Vec<_> = server.store.snapshot().ids().collect();
        let departed = before.iter().find(|id| !after.contains(id)).copied().unwrap();

        send(&mut a, r#"{"x": 50}"#).await;

        for ws in [&mut a, &mut c] {
            let snapshot = next_snapshot(ws).await;
            assert_eq!(snapshot.len(), 2);
            assert!(!snapshot.contains(departed));
        }
    }

    #[tokio::test]
    async fn malformed_payload_closes_only_the_sender() {
        let server = start_server(ServerConfig::default()).await;
        let mut a = connect(server.addr).await;
        let mut b = connect(server.addr).await;
        wait_for_clients(&server.store, 2).await;

        send(&mut b, "this is not json").await;
        expect_closed(&mut b).await;
        wait_for_clients(&server.store, 1).await;

        send(&mut a, r#"{"y": 7}"#).await;
        let snapshot = next_snapshot(&mut a).await;
        assert_eq!(snapshot.len(), 1);
    }

    #[tokio::test]
    async fn reconnect_gets_new_identity_and_default_state() {
        let server = start_server(ServerConfig::default()).await;
        let mut a = connect(server.addr).await;
        wait_for_clients(&server.store, 1).await;
        let first_id = server.store.snapshot().ids().next().unwrap();

        send(&mut a, r#"{"x": 1, "y": 1, "direction": 270}"#).await;
        next_snapshot(&mut a).await;
        a.close(None).await.unwrap();
        wait_for_clients(&server.store, 0).await;

        let _again = connect(server.addr).await;
        wait_for_clients(&server.store, 1).await;
        let snapshot = server.store.snapshot();
        let (second_id, state) = snapshot.iter().next().unwrap();

        assert_ne!(first_id, second_id);
        assert_eq!(*state, ClientState::default());
    }

    #[tokio::test]
    async fn capacity_limit_refuses_extra_connections() {
        let server = start_server(ServerConfig {
            max_clients: 2,
            ..Default::default()
        })
        .await;
        let _a = connect(server.addr).await;
        let _b = connect(server.addr).await;
        wait_for_clients(&server.store, 2).await;

        let refused = timeout(WAIT, connect_async(format!("ws://{}", server.addr)))
            .await
            .expect("refused connection should fail fast");
        assert!(refused.is_err());
        assert_eq!(server.store.len(), 2);
    }

    #[tokio::test]
    async fn idle_clients_are_disconnected_when_configured() {
        let server = start_server(ServerConfig {
            idle_timeout: Some(Duration::from_millis(100)),
            ..Default::default()
        })
        .await;
        let mut idle = connect(server.addr).await;
        wait_for_clients(&server.store, 1).await;

        expect_closed(&mut idle).await;
        wait_for_clients(&server.store, 0).await;
    }

    #[tokio::test]
    async fn shutdown_unregisters_every_client() {
        let server = start_server(ServerConfig::default()).await;
        let mut a = connect(server.addr).await;
        let mut b = connect(server.addr).await;
        wait_for_clients(&server.store, 2).await;

        server.shutdown.shutdown();
        timeout(WAIT, server.task)
            .await
            .expect("server did not stop")
            .unwrap();

        assert!(server.store.is_empty());
        expect_closed(&mut a).await;
        expect_closed(&mut b).await;
    }
}

/// NEWLINE-DELIMITED TRANSPORT
mod lines_transport_tests {
    use super::*;

    #[tokio::test]
    async fn line_clients_receive_snapshots() {
        let server = start_server(ServerConfig {
            transport: TransportKind::Lines,
            ..Default::default()
        })
        .await;

        let (a_read, mut a_write) = TcpStream::connect(server.addr).await.unwrap().into_split();
        let (b_read, _b_write) = TcpStream::connect(server.addr).await.unwrap().into_split();
        let mut a_lines = BufReader::new(a_read).lines();
        let mut b_lines = BufReader::new(b_read).lines();
        wait_for_clients(&server.store, 2).await;

        // Split across two writes to exercise reassembly on the server.
        a_write.write_all(b"{\"x\": 10, \"y\"").await.unwrap();
        a_write.flush().await.unwrap();
        sleep(Duration::from_millis(20)).await;
        a_write.write_all(b": 10, \"direction\": 0}\n").await.unwrap();

        for lines in [&mut a_lines, &mut b_lines] {
            let line = timeout(WAIT, lines.next_line())
                .await
                .expect("no snapshot line")
                .unwrap()
                .unwrap();
            let snapshot = StateSnapshot::decode(&line).unwrap();
            assert_eq!(snapshot.len(), 2);
            assert_eq!(
                count_matching(&snapshot, ClientState::new(10.0, 10.0, 0.0)),
                1
            );
        }
    }

    #[tokio::test]
    async fn silent_client_is_not_dropped_while_others_play() {
        let server = start_server(ServerConfig {
            transport: TransportKind::Lines,
            ..Default::default()
        })
        .await;

        let (a_read, mut a_write) = TcpStream::connect(server.addr).await.unwrap().into_split();
        let mut a_lines = BufReader::new(a_read).lines();
        // Connected, healthy and never reading.
        let _silent = TcpStream::connect(server.addr).await.unwrap();
        wait_for_clients(&server.store, 2).await;

        for i in 0..2_000 {
            a_write
                .write_all(format!("{{\"x\": {}}}\n", i).as_bytes())
                .await
                .unwrap();
            timeout(WAIT, a_lines.next_line())
                .await
                .expect("no snapshot line")
                .unwrap()
                .unwrap();
        }

        assert_eq!(server.store.len(), 2);
    }
}
