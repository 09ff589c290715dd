//! S1: single node, tunnel-declared endpoint, header-based routing.

use crate::common::harness::{http_request, TestAgent, TestNode};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::Request;
use std::time::Duration;
use test_log::test;

#[test(tokio::test)]
async fn single_node_routes_by_endpoint_header() {
    let result = tokio::time::timeout(Duration::from_secs(10), async {
        let node = TestNode::spawn(vec![]).await.expect("spawn node");
        let _agent = TestAgent::connect(node.config.upstream_addr, "e1", None).await.expect("connect agent");

        let req = Request::builder()
            .method("GET")
            .uri("/hello")
            .header("x-piko-endpoint", "e1")
            .header("host", node.config.proxy_addr.to_string())
            .body(Full::new(Bytes::new()))
            .unwrap();

        let (status, body) = http_request(node.config.proxy_addr, req).await.expect("request to proxy");
        assert_eq!(status, 200);
        assert_eq!(&body[..], b"world");
    })
    .await;

    assert!(result.is_ok(), "test timed out");
}
