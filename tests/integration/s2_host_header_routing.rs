//! S2: endpoint resolved from the first label of the `Host` header when
//! `x-piko-endpoint` is absent.

use crate::common::harness::{http_request, TestAgent, TestNode};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::Request;
use std::time::Duration;
use test_log::test;

#[test(tokio::test)]
async fn host_header_label_resolves_endpoint() {
    let result = tokio::time::timeout(Duration::from_secs(10), async {
        let node = TestNode::spawn(vec![]).await.expect("spawn node");
        let _agent = TestAgent::connect(node.config.upstream_addr, "e1", None).await.expect("connect agent");

        let req = Request::builder()
            .method("GET")
            .uri("/hello")
            .header("host", "e1.piko.example.com:8000")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let (status, body) = http_request(node.config.proxy_addr, req).await.expect("request to proxy");
        assert_eq!(status, 200);
        assert_eq!(&body[..], b"world");
    })
    .await;

    assert!(result.is_ok(), "test timed out");
}

#[test(tokio::test)]
async fn missing_endpoint_identification_is_rejected() {
    let result = tokio::time::timeout(Duration::from_secs(10), async {
        let node = TestNode::spawn(vec![]).await.expect("spawn node");

        let req = Request::builder()
            .method("GET")
            .uri("/hello")
            .header("host", "localhost:8000")
            .body(Full::new(Bytes::new()))
            .unwrap();

        let (status, _) = http_request(node.config.proxy_addr, req).await.expect("request to proxy");
        assert_eq!(status, 400);
    })
    .await;

    assert!(result.is_ok(), "test timed out");
}
