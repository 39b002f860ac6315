//! 消息实体定义

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{DomainError, DomainResult};
use crate::value_objects::{ConversationId, MessageId, Timestamp, UserId};

/// 消息正文允许的最大长度（字符数）
pub const MAX_MESSAGE_CHARS: usize = 4096;

/// 消息正文值对象，构造时完成校验
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageContent(String);

impl MessageContent {
    /// 校验并构造消息正文：不允许为空白，长度受限
    pub fn new(raw: impl Into<String>) -> DomainResult<Self> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            return Err(DomainError::validation_error("content", "消息内容不能为空"));
        }
        if raw.chars().count() > MAX_MESSAGE_CHARS {
            return Err(DomainError::validation_error(
                "content",
                format!("消息内容超过 {} 字符上限", MAX_MESSAGE_CHARS),
            ));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 生成通知用的内容摘要，超长时截断并追加省略号
    pub fn preview(&self, max_chars: usize) -> String {
        if self.0.chars().count() <= max_chars {
            return self.0.clone();
        }
        let truncated: String = self.0.chars().take(max_chars).collect();
        format!("{}…", truncated)
    }
}

impl fmt::Display for MessageContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// 会话消息
///
/// `read` 只由接收方的同步协调器翻转，发送方永远不主动置位。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// 消息ID
    pub id: MessageId,
    /// 所属会话ID
    pub conversation_id: ConversationId,
    /// 发送者ID
    pub sender_id: UserId,
    /// 消息正文
    pub content: MessageContent,
    /// 创建时间
    pub created_at: Timestamp,
    /// 接收方是否已读
    pub read: bool,
}

impl Message {
    pub fn new(
        id: MessageId,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: MessageContent,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id,
            conversation_id,
            sender_id,
            content,
            created_at,
            read: false,
        }
    }

    /// 标记为已读，幂等；返回状态是否发生变化
    pub fn mark_read(&mut self) -> bool {
        if self.read {
            return false;
        }
        self.read = true;
        true
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;

    fn sample_message() -> Message {
        Message::new(
            MessageId::from(Uuid::new_v4()),
            ConversationId::from(Uuid::new_v4()),
            UserId::from(Uuid::new_v4()),
            MessageContent::new("hello").unwrap(),
            Utc::now(),
        )
    }

    #[test]
    fn content_rejects_blank_input() {
        assert!(MessageContent::new("").is_err());
        assert!(MessageContent::new("   ").is_err());
    }

    #[test]
    fn content_rejects_oversized_input() {
        let oversized = "x".repeat(MAX_MESSAGE_CHARS + 1);
        assert!(MessageContent::new(oversized).is_err());

        let exactly_max = "x".repeat(MAX_MESSAGE_CHARS);
        assert!(MessageContent::new(exactly_max).is_ok());
    }

    #[test]
    fn preview_truncates_long_content() {
        let content = MessageContent::new("abcdefgh").unwrap();
        assert_eq!(content.preview(4), "abcd…");
        assert_eq!(content.preview(8), "abcdefgh");
    }

    #[test]
    fn mark_read_is_idempotent() {
        let mut message = sample_message();
        assert!(!message.read);

        assert!(message.mark_read());
        assert!(message.read);

        // 第二次调用不应再报告变化
        assert!(!message.mark_read());
        assert!(message.read);
    }
}
