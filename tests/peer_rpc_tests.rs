//! LeaderAndISR round trip over a real TCP socket.

use skipjack::protocol::{
    read_frame, write_frame, LeaderAndIsrRequest, LeaderAndIsrResponse, PartitionState,
    PeerClient, TcpPeerClient,
};
use tokio::net::TcpListener;

fn sample_request() -> LeaderAndIsrRequest {
    LeaderAndIsrRequest {
        controller_id: 2,
        controller_epoch: 0,
        partition_states: vec![
            PartitionState {
                topic: "events".to_string(),
                partition: 0,
                leader: 2,
                isr: vec![2, 3],
                replicas: vec![2, 3],
                controller_epoch: 0,
                leader_epoch: 0,
                zk_version: 0,
            },
            PartitionState {
                topic: "events".to_string(),
                partition: 1,
                leader: 3,
                isr: vec![3],
                replicas: vec![2, 3],
                controller_epoch: 0,
                leader_epoch: 0,
                zk_version: 0,
            },
        ],
        live_leaders: Vec::new(),
    }
}

#[tokio::test]
async fn test_leader_and_isr_roundtrip() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let request: LeaderAndIsrRequest = read_frame(&mut stream).await.unwrap();
        write_frame(&mut stream, &LeaderAndIsrResponse::ok())
            .await
            .unwrap();
        request
    });

    let client = TcpPeerClient::new();
    let request = sample_request();
    let response = client.leader_and_isr(&addr, &request).await.unwrap();
    assert_eq!(response.error_code, 0);

    let received = server.await.unwrap();
    assert_eq!(received, request);
    assert_eq!(received.partition_states.len(), 2);
}

#[tokio::test]
async fn test_delivery_to_multiple_brokers() {
    let mut addrs = Vec::new();
    let mut servers = Vec::new();
    for _ in 0..2 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        addrs.push(listener.local_addr().unwrap().to_string());
        servers.push(tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request: LeaderAndIsrRequest = read_frame(&mut stream).await.unwrap();
            write_frame(&mut stream, &LeaderAndIsrResponse::ok())
                .await
                .unwrap();
            request.controller_id
        }));
    }

    let client = TcpPeerClient::new();
    let request = sample_request();
    for addr in &addrs {
        client.leader_and_isr(addr, &request).await.unwrap();
    }

    for server in servers {
        assert_eq!(server.await.unwrap(), 2);
    }
}
