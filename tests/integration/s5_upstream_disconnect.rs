//! S5: a mid-session tunnel disconnect is reflected in the cluster
//! registry within a couple of gossip intervals, and new requests fail
//! over accordingly.

use crate::common::harness::{http_request, TestAgent, TestNode};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::Request;
use std::time::Duration;
use test_log::test;

fn hello_request() -> Request<Full<Bytes>> {
    Request::builder()
        .method("GET")
        .uri("/hello")
        .header("x-piko-endpoint", "e1")
        .body(Full::new(Bytes::new()))
        .unwrap()
}

#[test(tokio::test)]
async fn disconnected_tunnel_stops_receiving_routed_requests() {
    let result = tokio::time::timeout(Duration::from_secs(15), async {
        let node_a = TestNode::spawn(vec![]).await.expect("spawn node A");
        let node_b = TestNode::spawn(vec![node_a.join_addr()]).await.expect("spawn node B");
        let agent = TestAgent::connect(node_a.config.upstream_addr, "e1", None).await.expect("connect agent to A");

        // Wait until B can reach e1 through A.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let (status, _) = http_request(node_b.config.proxy_addr, hello_request()).await.expect("request to B");
            if status == 200 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "gossip never converged");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        agent.disconnect().await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let (status, _) = http_request(node_b.config.proxy_addr, hello_request()).await.expect("request to B");
            if status == 502 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "registry never reflected the disconnect, last status {status}");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;

    assert!(result.is_ok(), "test timed out");
}
