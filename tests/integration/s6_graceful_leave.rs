//! S6: a graceful leave is observed by the rest of the cluster, and
//! routing to endpoints on other nodes keeps working throughout.

use crate::common::harness::{http_request, TestAgent, TestNode};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::Request;
use std::time::Duration;
use test_log::test;

fn endpoint_request(endpoint_id: &str) -> Request<Full<Bytes>> {
    Request::builder()
        .method("GET")
        .uri("/hello")
        .header("x-piko-endpoint", endpoint_id)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

#[test(tokio::test)]
async fn leaving_node_stops_receiving_traffic_without_disrupting_others() {
    let result = tokio::time::timeout(Duration::from_secs(15), async {
        let node_a = TestNode::spawn(vec![]).await.expect("spawn node A");
        let node_b = TestNode::spawn(vec![node_a.join_addr()]).await.expect("spawn node B");
        let _agent_a = TestAgent::connect(node_a.config.upstream_addr, "e1", None).await.expect("connect agent to A");
        let _agent_b = TestAgent::connect(node_b.config.upstream_addr, "e2", None).await.expect("connect agent to B");

        // Wait for both endpoints to be reachable cluster-wide.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let (s1, _) = http_request(node_b.config.proxy_addr, endpoint_request("e1")).await.expect("request e1 via B");
            let (s2, _) = http_request(node_a.config.proxy_addr, endpoint_request("e2")).await.expect("request e2 via A");
            if s1 == 200 && s2 == 200 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "gossip never converged");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        node_a.shutdown.cancel();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let (s1, _) = http_request(node_b.config.proxy_addr, endpoint_request("e1")).await.expect("request e1 via B");
            if s1 == 502 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "B never stopped routing to the departed node, last status {s1}");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        // e2, served entirely by B, must be unaffected.
        let (s2, body) = http_request(node_b.config.proxy_addr, endpoint_request("e2")).await.expect("request e2 via B");
        assert_eq!(s2, 200);
        assert_eq!(&body[..], b"world");
    })
    .await;

    assert!(result.is_ok(), "test timed out");
}
