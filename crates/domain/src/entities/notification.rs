//! 通知实体定义

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value_objects::{NotificationId, Timestamp, UserId};

/// 通知类型常量
pub mod notification_kinds {
    pub const NEW_MESSAGE: &str = "new_message";
    pub const INCOMING_CALL: &str = "incoming_call";
    pub const MISSED_CALL: &str = "missed_call";
}

/// 用户通知记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// 通知ID
    pub id: NotificationId,
    /// 接收用户ID
    pub user_id: UserId,
    /// 通知类型
    pub kind: String,
    /// 通知内容
    pub content: String,
    /// 点击后跳转的路由
    pub action_url: Option<String>,
    /// 是否已读
    pub read: bool,
    /// 创建时间
    pub created_at: Timestamp,
    /// 阅读时间
    pub read_at: Option<Timestamp>,
}

impl Notification {
    /// 创建新通知
    pub fn new(
        user_id: UserId,
        kind: impl Into<String>,
        content: impl Into<String>,
        action_url: Option<String>,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id: NotificationId::from(Uuid::new_v4()),
            user_id,
            kind: kind.into(),
            content: content.into(),
            action_url,
            read: false,
            created_at,
            read_at: None,
        }
    }

    /// 标记为已读，幂等
    pub fn mark_as_read(&mut self, now: Timestamp) {
        if self.read {
            return;
        }
        self.read = true;
        self.read_at = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;

    #[test]
    fn mark_as_read_sets_timestamp_once() {
        let now = Utc::now();
        let mut notification = Notification::new(
            UserId::from(Uuid::new_v4()),
            notification_kinds::NEW_MESSAGE,
            "你有一条新消息",
            Some("/conversations/abc".to_string()),
            now,
        );
        assert!(!notification.read);
        assert!(notification.read_at.is_none());

        let read_time = now + Duration::seconds(5);
        notification.mark_as_read(read_time);
        assert!(notification.read);
        assert_eq!(notification.read_at, Some(read_time));

        // 重复标记不应覆盖首次阅读时间
        notification.mark_as_read(read_time + Duration::seconds(5));
        assert_eq!(notification.read_at, Some(read_time));
    }
}
