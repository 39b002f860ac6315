//! 实时事件定义
//!
//! 定义传输层承载的全部事件类型：广播事件（输入状态、已读回执）、
//! 变更流事件（消息、信令、通知、表情的行插入）以及在场事件。

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::entities::{CallSignal, Message, Notification, PresenceEntry, PresenceSnapshot};
use crate::value_objects::{ConversationId, MessageId, Timestamp, Topic, UserId};

/// 变更流覆盖的存储表
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeTable {
    Messages,
    CallSignals,
    Notifications,
    Reactions,
}

impl fmt::Display for ChangeTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeTable::Messages => write!(f, "messages"),
            ChangeTable::CallSignals => write!(f, "call_signals"),
            ChangeTable::Notifications => write!(f, "notifications"),
            ChangeTable::Reactions => write!(f, "reactions"),
        }
    }
}

/// 变更流过滤条件，决定订阅者收到哪部分行插入
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeFilter {
    /// 按会话过滤（消息、表情）
    Conversation(ConversationId),
    /// 按被叫方过滤（通话信令）
    Callee(UserId),
    /// 按接收用户过滤（通知）
    User(UserId),
}

impl fmt::Display for ChangeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeFilter::Conversation(id) => write!(f, "conversation:{}", id),
            ChangeFilter::Callee(id) => write!(f, "callee:{}", id),
            ChangeFilter::User(id) => write!(f, "user:{}", id),
        }
    }
}

/// 派生变更流主题；表和过滤条件共同构成主题名
pub fn feed_topic(table: ChangeTable, filter: ChangeFilter) -> Topic {
    Topic::new(format!("feed:{}:{}", table, filter))
}

/// 实时事件枚举
///
/// 所有跨客户端传播的状态变化都通过这一个类型流动；
/// 事件自带路由信息（见 `topic()`），发布方和订阅方共享同一份派生规则。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RealtimeEvent {
    /// 消息行插入事件
    MessageInserted { message: Message },

    /// 已读回执：接收方批量确认某些消息已读
    ReadReceipt {
        conversation_id: ConversationId,
        reader_id: UserId,
        message_ids: Vec<MessageId>,
        timestamp: Timestamp,
    },

    /// 输入状态变化（瞬时事件，不持久化）
    TypingChanged {
        conversation_id: ConversationId,
        user_id: UserId,
        typing: bool,
        timestamp: Timestamp,
    },

    /// 通话信令行插入事件
    SignalInserted { signal: CallSignal },

    /// 通知行插入事件
    NotificationInserted { notification: Notification },

    /// 表情回应变化；`emoji` 为 None 表示该用户撤销了回应
    ReactionChanged {
        conversation_id: ConversationId,
        message_id: MessageId,
        user_id: UserId,
        emoji: Option<String>,
        timestamp: Timestamp,
    },

    /// 全量在场快照（权威状态）
    PresenceSync {
        topic: Topic,
        snapshot: PresenceSnapshot,
    },

    /// 增量加入
    PresenceJoined {
        topic: Topic,
        entry: PresenceEntry,
        timestamp: Timestamp,
    },

    /// 增量离开
    PresenceLeft {
        topic: Topic,
        user_id: UserId,
        timestamp: Timestamp,
    },
}

impl RealtimeEvent {
    /// 事件的发布主题
    pub fn topic(&self) -> Topic {
        match self {
            RealtimeEvent::MessageInserted { message } => feed_topic(
                ChangeTable::Messages,
                ChangeFilter::Conversation(message.conversation_id),
            ),
            RealtimeEvent::ReadReceipt {
                conversation_id, ..
            } => Topic::conversation(*conversation_id),
            RealtimeEvent::TypingChanged {
                conversation_id, ..
            } => Topic::conversation(*conversation_id),
            RealtimeEvent::SignalInserted { signal } => feed_topic(
                ChangeTable::CallSignals,
                ChangeFilter::Callee(signal.callee_id),
            ),
            RealtimeEvent::NotificationInserted { notification } => feed_topic(
                ChangeTable::Notifications,
                ChangeFilter::User(notification.user_id),
            ),
            RealtimeEvent::ReactionChanged {
                conversation_id, ..
            } => feed_topic(
                ChangeTable::Reactions,
                ChangeFilter::Conversation(*conversation_id),
            ),
            RealtimeEvent::PresenceSync { topic, .. } => topic.clone(),
            RealtimeEvent::PresenceJoined { topic, .. } => topic.clone(),
            RealtimeEvent::PresenceLeft { topic, .. } => topic.clone(),
        }
    }

    /// 事件的时间戳
    pub fn timestamp(&self) -> Timestamp {
        match self {
            RealtimeEvent::MessageInserted { message } => message.created_at,
            RealtimeEvent::ReadReceipt { timestamp, .. } => *timestamp,
            RealtimeEvent::TypingChanged { timestamp, .. } => *timestamp,
            RealtimeEvent::SignalInserted { signal } => signal.created_at,
            RealtimeEvent::NotificationInserted { notification } => notification.created_at,
            RealtimeEvent::ReactionChanged { timestamp, .. } => *timestamp,
            RealtimeEvent::PresenceSync { snapshot, .. } => snapshot.captured_at,
            RealtimeEvent::PresenceJoined { timestamp, .. } => *timestamp,
            RealtimeEvent::PresenceLeft { timestamp, .. } => *timestamp,
        }
    }

    /// 事件类型名称（用于日志和监控）
    pub fn event_type(&self) -> &'static str {
        match self {
            RealtimeEvent::MessageInserted { .. } => "message_inserted",
            RealtimeEvent::ReadReceipt { .. } => "read_receipt",
            RealtimeEvent::TypingChanged { .. } => "typing_changed",
            RealtimeEvent::SignalInserted { .. } => "signal_inserted",
            RealtimeEvent::NotificationInserted { .. } => "notification_inserted",
            RealtimeEvent::ReactionChanged { .. } => "reaction_changed",
            RealtimeEvent::PresenceSync { .. } => "presence_sync",
            RealtimeEvent::PresenceJoined { .. } => "presence_joined",
            RealtimeEvent::PresenceLeft { .. } => "presence_left",
        }
    }

    /// 瞬时事件不落库（输入状态、在场）
    pub fn is_ephemeral(&self) -> bool {
        matches!(
            self,
            RealtimeEvent::TypingChanged { .. }
                | RealtimeEvent::PresenceSync { .. }
                | RealtimeEvent::PresenceJoined { .. }
                | RealtimeEvent::PresenceLeft { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    use crate::entities::{CallSignal, CallType, MessageContent};

    use super::*;

    #[test]
    fn message_insert_routes_to_conversation_feed() {
        let conversation_id = ConversationId::from(Uuid::nil());
        let message = Message::new(
            MessageId::from(Uuid::new_v4()),
            conversation_id,
            UserId::from(Uuid::new_v4()),
            MessageContent::new("hi").unwrap(),
            Utc::now(),
        );
        let event = RealtimeEvent::MessageInserted { message };

        assert_eq!(
            event.topic().as_str(),
            "feed:messages:conversation:00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(event.event_type(), "message_inserted");
        assert!(!event.is_ephemeral());
    }

    #[test]
    fn signal_insert_routes_to_callee_feed() {
        let callee = UserId::from(Uuid::nil());
        let signal = CallSignal::offer(
            ConversationId::from(Uuid::new_v4()),
            UserId::from(Uuid::new_v4()),
            callee,
            CallType::Voice,
            json!({"sdp": "v=0"}),
            Utc::now(),
        );
        let event = RealtimeEvent::SignalInserted { signal };

        assert_eq!(
            event.topic().as_str(),
            "feed:call_signals:callee:00000000-0000-0000-0000-000000000000"
        );
    }

    #[test]
    fn typing_routes_to_conversation_topic_and_is_ephemeral() {
        let conversation_id = ConversationId::from(Uuid::nil());
        let event = RealtimeEvent::TypingChanged {
            conversation_id,
            user_id: UserId::from(Uuid::new_v4()),
            typing: true,
            timestamp: Utc::now(),
        };

        assert_eq!(
            event.topic().as_str(),
            "conversation:00000000-0000-0000-0000-000000000000"
        );
        assert!(event.is_ephemeral());
    }

    #[test]
    fn events_survive_serde_round_trip() {
        let event = RealtimeEvent::ReactionChanged {
            conversation_id: ConversationId::from(Uuid::new_v4()),
            message_id: MessageId::from(Uuid::new_v4()),
            user_id: UserId::from(Uuid::new_v4()),
            emoji: Some("👍".to_string()),
            timestamp: Utc::now(),
        };

        let encoded = serde_json::to_string(&event).unwrap();
        let decoded: RealtimeEvent = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, event);
    }
}
