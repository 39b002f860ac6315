//! 会话实体定义

use serde::{Deserialize, Serialize};

use crate::value_objects::{ConversationId, Timestamp, UserId};

/// 双人会话
///
/// 参与者固定为两人；`updated_at` 是"最近活动"时间戳，
/// 由发送流水线的第二步推进。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    /// 会话ID
    pub id: ConversationId,
    /// 参与者 A
    pub participant_a: UserId,
    /// 参与者 B
    pub participant_b: UserId,
    /// 最近活动时间
    pub updated_at: Timestamp,
}

impl Conversation {
    pub fn new(
        id: ConversationId,
        participant_a: UserId,
        participant_b: UserId,
        updated_at: Timestamp,
    ) -> Self {
        Self {
            id,
            participant_a,
            participant_b,
            updated_at,
        }
    }

    /// 用户是否为会话参与者
    pub fn involves(&self, user_id: UserId) -> bool {
        self.participant_a == user_id || self.participant_b == user_id
    }

    /// 给定一方，返回另一方；非参与者返回 None
    pub fn peer_of(&self, user_id: UserId) -> Option<UserId> {
        if self.participant_a == user_id {
            Some(self.participant_b)
        } else if self.participant_b == user_id {
            Some(self.participant_a)
        } else {
            None
        }
    }

    /// 推进最近活动时间
    pub fn touch(&mut self, now: Timestamp) {
        self.updated_at = now;
    }
}
