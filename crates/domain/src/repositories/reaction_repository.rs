//! 消息表情回应仓储接口定义

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::entities::Reaction;
use crate::errors::RepositoryError;
use crate::value_objects::MessageId;

/// 回应切换的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReactionToggle {
    /// 新增回应
    Added,
    /// 换成了另一个表情
    Replaced,
    /// 撤销了已有回应（同一表情再次提交）
    Removed,
}

#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait ReactionRepository: Send + Sync {
    /// 切换用户对消息的回应：无则增，同表情则删，异表情则换。
    /// (message_id, user_id) 唯一性由存储层保证。
    async fn toggle(&self, reaction: Reaction) -> Result<ReactionToggle, RepositoryError>;

    /// 列出某条消息的全部回应
    async fn list_for_message(
        &self,
        message_id: MessageId,
    ) -> Result<Vec<Reaction>, RepositoryError>;
}
