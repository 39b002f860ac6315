//! 推送投递端口

use async_trait::async_trait;
use domain::UserId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 一次推送请求：发给一组用户的短通知
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    pub title: String,
    pub message: String,
    /// 投递目标；推送服务按用户ID展开到各自的设备
    #[serde(rename = "userIds")]
    pub user_ids: Vec<UserId>,
    /// 点击通知后跳转的应用内路由
    pub url: String,
}

#[derive(Debug, Error)]
pub enum PushError {
    #[error("push delivery failed: {0}")]
    Failed(String),
}

impl PushError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

#[async_trait]
pub trait PushSender: Send + Sync {
    async fn send(&self, request: PushRequest) -> Result<(), PushError>;
}

/// 未配置推送端点时的空实现
#[derive(Debug, Default)]
pub struct NoopPushSender;

#[async_trait]
impl PushSender for NoopPushSender {
    async fn send(&self, _request: PushRequest) -> Result<(), PushError> {
        Ok(())
    }
}
