//! Redis 实时传输模块
//!
//! 事件走 Pub/Sub 频道（每主题一个频道），在场集合存每主题一个
//! 带 TTL 的哈希。

pub mod transport;

pub use transport::*;
