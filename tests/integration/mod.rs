//! Integration tests across components

pub mod http_api_test;
pub mod session_test;
pub mod storage_test;
pub mod websocket_test;
