//! Integration tests for the multi-server client

use std::sync::Arc;
use std::time::Duration;

use tern_rpc::{Options, Server, Service};
use tern_xclient::{Discovery, Error, MultiServersDiscovery, SelectMode, XClient};
use tokio::net::TcpListener;
use tokio::time::timeout;

struct Node {
    id: u32,
    fail: bool,
}

impl Node {
    async fn id(self: Arc<Self>, _args: ()) -> Result<u32, String> {
        Ok(self.id)
    }

    async fn sleep(self: Arc<Self>, millis: u64) -> Result<u32, String> {
        if self.fail {
            return Err(format!("node {} refuses to sleep", self.id));
        }
        tokio::time::sleep(Duration::from_millis(millis)).await;
        Ok(self.id)
    }
}

async fn start_node(id: u32, fail: bool) -> String {
    let server = Server::new();
    server
        .register(
            Service::builder("Node", Node { id, fail })
                .method("Id", Node::id)
                .method("Sleep", Node::sleep),
        )
        .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move { server.accept(listener).await });
    addr
}

#[tokio::test]
async fn test_round_robin_calls_alternate() {
    let servers = vec![start_node(1, false).await, start_node(2, false).await];
    let xclient = XClient::new(
        MultiServersDiscovery::new(servers),
        SelectMode::RoundRobin,
        Options::default(),
    );

    let mut ids = Vec::new();
    for _ in 0..4 {
        let id: u32 = xclient.call("Node.Id", &()).await.unwrap();
        ids.push(id);
    }

    assert_ne!(ids[0], ids[1]);
    assert_eq!(ids[0], ids[2]);
    assert_eq!(ids[1], ids[3]);
    xclient.close().await;
}

#[tokio::test]
async fn test_random_calls_reach_a_server() {
    let servers = vec![start_node(1, false).await, start_node(2, false).await];
    let xclient = XClient::new(
        MultiServersDiscovery::new(servers),
        SelectMode::Random,
        Options::default(),
    );

    for _ in 0..5 {
        let id: u32 = xclient.call("Node.Id", &()).await.unwrap();
        assert!(id == 1 || id == 2);
    }
}

#[tokio::test]
async fn test_call_with_timeout() {
    let servers = vec![start_node(1, false).await];
    let xclient = XClient::new(
        MultiServersDiscovery::new(servers),
        SelectMode::RoundRobin,
        Options::default(),
    );

    let err = xclient
        .call_with_timeout::<_, u32>("Node.Sleep", &5_000_u64, Duration::from_millis(50))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Rpc(tern_rpc::Error::Timeout(_))));
    let id: u32 = xclient.call("Node.Id", &()).await.unwrap();
    assert_eq!(id, 1);
}

#[tokio::test]
async fn test_empty_discovery() {
    let xclient = XClient::new(
        MultiServersDiscovery::new(Vec::new()),
        SelectMode::Random,
        Options::default(),
    );

    assert!(matches!(
        xclient.call::<_, u32>("Node.Id", &()).await,
        Err(Error::NoAvailableServers)
    ));
    assert!(matches!(
        xclient.broadcast::<_, u32>("Node.Id", &()).await,
        Err(Error::NoAvailableServers)
    ));
}

#[tokio::test]
async fn test_broadcast_returns_a_reply() {
    let servers = vec![start_node(1, false).await, start_node(2, false).await];
    let xclient = XClient::new(
        MultiServersDiscovery::new(servers),
        SelectMode::Random,
        Options::default(),
    );

    let id: u32 = xclient.broadcast("Node.Id", &()).await.unwrap();

    assert!(id == 1 || id == 2);
}

#[tokio::test]
async fn test_broadcast_first_error_cancels_the_rest() {
    let servers = vec![start_node(1, false).await, start_node(2, true).await];
    let xclient = XClient::new(
        MultiServersDiscovery::new(servers),
        SelectMode::Random,
        Options::default(),
    );

    let result = timeout(
        Duration::from_secs(5),
        xclient.broadcast::<_, u32>("Node.Sleep", &60_000_u64),
    )
    .await
    .unwrap();

    match result {
        Err(Error::Rpc(tern_rpc::Error::Server(message))) => {
            assert_eq!(message, "node 2 refuses to sleep");
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn test_redial_after_server_update() {
    let first = start_node(1, false).await;
    let second = start_node(2, false).await;
    let xclient = XClient::new(
        MultiServersDiscovery::new(vec![first]),
        SelectMode::RoundRobin,
        Options::default(),
    );

    let id: u32 = xclient.call("Node.Id", &()).await.unwrap();
    assert_eq!(id, 1);

    xclient.discovery().update(vec![second]).await.unwrap();
    let id: u32 = xclient.call("Node.Id", &()).await.unwrap();
    assert_eq!(id, 2);
}

#[tokio::test]
async fn test_slow_dial_does_not_block_other_servers() {
    let good = start_node(1, false).await;
    // TEST-NET-1 is not routed, so connecting either hangs or fails at once.
    let options = Options::default().with_connect_timeout(Duration::from_secs(3));
    let xclient = Arc::new(XClient::new(
        MultiServersDiscovery::new(vec!["192.0.2.1:9".to_string()]),
        SelectMode::RoundRobin,
        options,
    ));

    let slow = {
        let xclient = Arc::clone(&xclient);
        tokio::spawn(async move { xclient.call::<_, u32>("Node.Id", &()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    xclient.discovery().update(vec![good]).await.unwrap();
    let id: u32 = timeout(Duration::from_secs(1), xclient.call("Node.Id", &()))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(id, 1);
    assert!(slow.await.unwrap().is_err());
}
