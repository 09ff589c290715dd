//! S3: round-trip byte-for-byte equality through the tunnel.

use crate::common::harness::{http_request, TestAgent, TestNode};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::Request;
use rand::RngCore;
use std::time::Duration;
use test_log::test;

#[test(tokio::test)]
async fn echo_round_trips_request_body() {
    let result = tokio::time::timeout(Duration::from_secs(10), async {
        let node = TestNode::spawn(vec![]).await.expect("spawn node");
        let _agent = TestAgent::connect(node.config.upstream_addr, "e1", None).await.expect("connect agent");

        let mut payload = vec![0u8; 4096];
        rand::thread_rng().fill_bytes(&mut payload);

        let req = Request::builder()
            .method("POST")
            .uri("/echo")
            .header("x-piko-endpoint", "e1")
            .body(Full::<Bytes>::from(payload.clone()))
            .unwrap();

        let (status, body) = http_request(node.config.proxy_addr, req).await.expect("request to proxy");
        assert_eq!(status, 200);
        assert_eq!(body.to_vec(), payload);
    })
    .await;

    assert!(result.is_ok(), "test timed out");
}
