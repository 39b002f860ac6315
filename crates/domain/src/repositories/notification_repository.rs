//! 通知仓储接口定义

use async_trait::async_trait;

use crate::entities::Notification;
use crate::errors::RepositoryError;
use crate::value_objects::{NotificationId, Timestamp, UserId};

#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait NotificationRepository: Send + Sync {
    /// 创建通知记录
    async fn create(&self, notification: Notification) -> Result<Notification, RepositoryError>;

    /// 标记单条通知已读
    async fn mark_as_read(&self, id: NotificationId, at: Timestamp)
        -> Result<(), RepositoryError>;

    /// 按跳转路由批量标记已读（通知没有会话列，路由就是会话的标识），
    /// 返回受影响的记录数
    async fn mark_read_by_action(
        &self,
        user_id: UserId,
        action_url: &str,
        at: Timestamp,
    ) -> Result<u64, RepositoryError>;

    /// 用户未读通知数
    async fn count_unread(&self, user_id: UserId) -> Result<i64, RepositoryError>;
}
