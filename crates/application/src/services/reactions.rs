//! 消息表情回应
//!
//! 本端切换走仓储的幂等 toggle，远端变化经变更流送达；两边共同
//! 维护一份按消息聚合的回应视图，界面每次收到完整集合而不是增量。

use std::collections::HashMap;
use std::sync::Arc;

use domain::{
    ConversationId, MessageId, RealtimeEvent, Reaction, ReactionRepository, ReactionToggle, UserId,
};
use tokio::sync::Mutex;

use crate::client_events::{ClientEvent, ClientEvents, UserReaction};
use crate::clock::Clock;
use crate::error::ApplicationError;
use crate::transport::RealtimeTransport;

pub struct ReactionServiceDependencies {
    pub reactions: Arc<dyn ReactionRepository>,
    pub transport: Arc<dyn RealtimeTransport>,
    pub clock: Arc<dyn Clock>,
    pub events: Arc<ClientEvents>,
}

/// 会话内的回应服务；一个实例服务一个会话
pub struct ReactionService {
    reactions: Arc<dyn ReactionRepository>,
    transport: Arc<dyn RealtimeTransport>,
    clock: Arc<dyn Clock>,
    events: Arc<ClientEvents>,
    conversation_id: ConversationId,
    user_id: UserId,
    /// 消息 → (用户 → 表情) 的本地视图
    tally: Mutex<HashMap<MessageId, HashMap<UserId, String>>>,
}

impl ReactionService {
    pub fn new(
        deps: ReactionServiceDependencies,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Self {
        Self {
            reactions: deps.reactions,
            transport: deps.transport,
            clock: deps.clock,
            events: deps.events,
            conversation_id,
            user_id,
            tally: Mutex::new(HashMap::new()),
        }
    }

    /// 切换本端对某条消息的回应
    ///
    /// 仓储 toggle 的失败对调用方可见；变化广播尽力而为。本地视图
    /// 跟着落库结果立即更新，不等自己的事件绕一圈回来。
    pub async fn toggle(
        &self,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<ReactionToggle, ApplicationError> {
        let now = self.clock.now();
        let reaction = Reaction::new(message_id, self.user_id, emoji, now)?;
        let outcome = self.reactions.toggle(reaction).await?;

        let emoji_after = match outcome {
            ReactionToggle::Added | ReactionToggle::Replaced => Some(emoji.to_string()),
            ReactionToggle::Removed => None,
        };
        self.apply(message_id, self.user_id, emoji_after.clone())
            .await;

        let event = RealtimeEvent::ReactionChanged {
            conversation_id: self.conversation_id,
            message_id,
            user_id: self.user_id,
            emoji: emoji_after,
            timestamp: now,
        };
        if let Err(error) = self.transport.publish(&event.topic(), &event).await {
            tracing::error!(error = %error, message_id = %message_id, "reaction publish failed");
        }

        Ok(outcome)
    }

    /// 处理变更流送达的回应变化；`emoji` 为 None 表示撤销。
    /// 自己发布的回声也会走到这里，套用是幂等的。
    pub async fn handle_event(&self, message_id: MessageId, user_id: UserId, emoji: Option<String>) {
        self.apply(message_id, user_id, emoji).await;
    }

    /// 从存储装载某条消息的回应集合，装载完成后通知界面
    pub async fn load(&self, message_id: MessageId) -> Result<(), ApplicationError> {
        let rows = self.reactions.list_for_message(message_id).await?;
        {
            let mut tally = self.tally.lock().await;
            let entry = tally.entry(message_id).or_default();
            entry.clear();
            for row in rows {
                entry.insert(row.user_id, row.emoji);
            }
        }
        self.emit_snapshot(message_id).await;
        Ok(())
    }

    /// 某条消息当前的回应集合，按用户ID排序
    pub async fn reactions_for(&self, message_id: MessageId) -> Vec<UserReaction> {
        let tally = self.tally.lock().await;
        snapshot(&tally, message_id)
    }

    async fn apply(&self, message_id: MessageId, user_id: UserId, emoji: Option<String>) {
        {
            let mut tally = self.tally.lock().await;
            let entry = tally.entry(message_id).or_default();
            match emoji {
                Some(emoji) => {
                    entry.insert(user_id, emoji);
                }
                None => {
                    entry.remove(&user_id);
                }
            }
        }
        self.emit_snapshot(message_id).await;
    }

    async fn emit_snapshot(&self, message_id: MessageId) {
        let reactions = {
            let tally = self.tally.lock().await;
            snapshot(&tally, message_id)
        };
        self.events.emit(ClientEvent::ReactionsChanged {
            message_id,
            reactions,
        });
    }
}

fn snapshot(
    tally: &HashMap<MessageId, HashMap<UserId, String>>,
    message_id: MessageId,
) -> Vec<UserReaction> {
    let mut reactions: Vec<UserReaction> = tally
        .get(&message_id)
        .map(|entry| {
            entry
                .iter()
                .map(|(user_id, emoji)| UserReaction {
                    user_id: *user_id,
                    emoji: emoji.clone(),
                })
                .collect()
        })
        .unwrap_or_default();
    reactions.sort_by_key(|reaction| reaction.user_id.0);
    reactions
}
