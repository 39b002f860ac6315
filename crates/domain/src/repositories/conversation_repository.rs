//! 会话仓储接口定义

use async_trait::async_trait;

use crate::entities::Conversation;
use crate::errors::RepositoryError;
use crate::value_objects::{ConversationId, Timestamp};

#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait ConversationRepository: Send + Sync {
    async fn create(&self, conversation: Conversation) -> Result<Conversation, RepositoryError>;

    async fn find_by_id(
        &self,
        id: ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError>;

    /// 推进会话的最近活动时间（发送流水线第二步，尽力而为）
    async fn touch(&self, id: ConversationId, at: Timestamp) -> Result<(), RepositoryError>;
}
