//! S4: a two-node cluster forwards a request to the node holding the
//! tunnel for the requested endpoint, exactly once.

use crate::common::harness::{http_request, TestAgent, TestNode};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::Request;
use std::time::Duration;
use test_log::test;

#[test(tokio::test)]
async fn request_is_forwarded_to_the_node_holding_the_tunnel() {
    let result = tokio::time::timeout(Duration::from_secs(15), async {
        let node_a = TestNode::spawn(vec![]).await.expect("spawn node A");
        let node_b = TestNode::spawn(vec![node_a.join_addr()]).await.expect("spawn node B");

        let _agent = TestAgent::connect(node_b.config.upstream_addr, "e1", None).await.expect("connect agent to B");

        // Poll node A until cluster gossip has converged enough that it
        // can forward to B; before convergence it legitimately 502s.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let req = Request::builder()
                .method("GET")
                .uri("/hello")
                .header("x-piko-endpoint", "e1")
                .body(Full::new(Bytes::new()))
                .unwrap();
            let (status, body) = http_request(node_a.config.proxy_addr, req).await.expect("request to node A");
            if status == 200 {
                assert_eq!(&body[..], b"world");
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "gossip never converged: last status {status}");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;

    assert!(result.is_ok(), "test timed out");
}
