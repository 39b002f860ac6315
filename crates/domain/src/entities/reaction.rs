//! 消息表情回应实体定义

use serde::{Deserialize, Serialize};

use crate::errors::{DomainError, DomainResult};
use crate::value_objects::{MessageId, Timestamp, UserId};

/// 表情字段允许的最大长度（字符数）
pub const MAX_EMOJI_CHARS: usize = 16;

/// 消息表情回应
///
/// 服务端持久化，按 (message_id, user_id) 唯一：
/// 每个用户对一条消息最多保留一个回应。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reaction {
    /// 目标消息ID
    pub message_id: MessageId,
    /// 回应者ID
    pub user_id: UserId,
    /// 表情内容
    pub emoji: String,
    /// 创建时间
    pub created_at: Timestamp,
}

impl Reaction {
    /// 校验并构造回应
    pub fn new(
        message_id: MessageId,
        user_id: UserId,
        emoji: impl Into<String>,
        created_at: Timestamp,
    ) -> DomainResult<Self> {
        let emoji = emoji.into();
        if emoji.trim().is_empty() {
            return Err(DomainError::validation_error("emoji", "表情不能为空"));
        }
        if emoji.chars().count() > MAX_EMOJI_CHARS {
            return Err(DomainError::validation_error(
                "emoji",
                format!("表情超过 {} 字符上限", MAX_EMOJI_CHARS),
            ));
        }
        Ok(Self {
            message_id,
            user_id,
            emoji,
            created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;

    #[test]
    fn emoji_must_be_present_and_bounded() {
        let message_id = MessageId::from(Uuid::new_v4());
        let user_id = UserId::from(Uuid::new_v4());

        assert!(Reaction::new(message_id, user_id, "👍", Utc::now()).is_ok());
        assert!(Reaction::new(message_id, user_id, "", Utc::now()).is_err());
        assert!(Reaction::new(message_id, user_id, "x".repeat(MAX_EMOJI_CHARS + 1), Utc::now()).is_err());
    }
}
