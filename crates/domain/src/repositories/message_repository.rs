//! 消息仓储接口定义

use async_trait::async_trait;

use crate::entities::Message;
use crate::errors::RepositoryError;
use crate::value_objects::{ConversationId, MessageId, UserId};

#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// 插入消息行；这是发送流水线中唯一对用户可见的失败点
    async fn insert(&self, message: Message) -> Result<Message, RepositoryError>;

    /// 根据ID查找消息
    async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>, RepositoryError>;

    /// 获取会话最近的消息（按创建时间升序返回，支持向前翻页）
    async fn list_recent(
        &self,
        conversation_id: ConversationId,
        limit: i64,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>, RepositoryError>;

    /// 标记单条消息已读
    async fn mark_read(&self, id: MessageId) -> Result<(), RepositoryError>;

    /// 标记会话内对端发来的全部未读消息为已读，返回受影响的消息ID
    async fn mark_conversation_read(
        &self,
        conversation_id: ConversationId,
        reader_id: UserId,
    ) -> Result<Vec<MessageId>, RepositoryError>;
}
