//! 实时传输端口
//!
//! 对远端变更流的统一抽象：主题订阅、事件发布、在场跟踪。
//! 基础设施层提供 Redis 实现，单进程部署和测试使用内存实现。
//!
//! 投递语义为至少一次、尽力有序：订阅方可能收到重复或乱序的事件，
//! 去重与排序由上层依据事件内容处理。

use async_trait::async_trait;
use domain::{
    feed_topic, ChangeFilter, ChangeTable, PresenceEntry, PresenceSnapshot, RealtimeEvent, Topic,
    UserId,
};
use thiserror::Error;
use tokio::sync::broadcast;

/// 传输层错误
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport connection failed: {0}")]
    Connection(String),
    #[error("publish failed on topic {topic}: {reason}")]
    Publish { topic: String, reason: String },
    #[error("presence operation failed: {0}")]
    Presence(String),
    #[error("subscription closed")]
    Closed,
}

impl TransportError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    pub fn publish(topic: &Topic, reason: impl Into<String>) -> Self {
        Self::Publish {
            topic: topic.to_string(),
            reason: reason.into(),
        }
    }

    pub fn presence(message: impl Into<String>) -> Self {
        Self::Presence(message.into())
    }
}

/// 订阅得到的事件流
///
/// 底层是广播通道：消费过慢时最旧的事件会被丢弃，丢弃只记日志不报错。
pub struct EventStream {
    receiver: broadcast::Receiver<RealtimeEvent>,
}

impl EventStream {
    pub fn new(receiver: broadcast::Receiver<RealtimeEvent>) -> Self {
        Self { receiver }
    }

    /// 接收下一个事件；发送端全部关闭后返回 `Closed`
    pub async fn recv(&mut self) -> Result<RealtimeEvent, TransportError> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Ok(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped = skipped, "event stream lagged, oldest events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return Err(TransportError::Closed),
            }
        }
    }

    /// 非阻塞读取，没有待处理事件时返回 None
    pub fn try_recv(&mut self) -> Option<RealtimeEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}

/// 实时传输端口
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// 订阅主题，返回该主题的事件流
    async fn subscribe(&self, topic: &Topic) -> Result<EventStream, TransportError>;

    /// 向主题发布事件
    async fn publish(&self, topic: &Topic, event: &RealtimeEvent) -> Result<(), TransportError>;

    /// 把在场条目登记到主题，并向订阅方广播加入事件
    async fn track(&self, topic: &Topic, entry: PresenceEntry) -> Result<(), TransportError>;

    /// 把用户从主题的在场集合移除，并向订阅方广播离开事件
    async fn untrack(&self, topic: &Topic, user_id: UserId) -> Result<(), TransportError>;

    /// 读取主题当前的在场全量快照
    async fn presence_state(&self, topic: &Topic) -> Result<PresenceSnapshot, TransportError>;

    /// 订阅某张表在给定过滤条件下的行插入事件流
    async fn on_insert(
        &self,
        table: ChangeTable,
        filter: ChangeFilter,
    ) -> Result<EventStream, TransportError> {
        self.subscribe(&feed_topic(table, filter)).await
    }
}
