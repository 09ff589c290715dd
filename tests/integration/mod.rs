//! tests/integration/mod.rs
//!
//! Discovers the scenario test files, one module per spec scenario.

mod s1_single_node_http;
mod s2_host_header_routing;
mod s3_echo;
mod s4_two_node_forward;
mod s5_upstream_disconnect;
mod s6_graceful_leave;
