//! 会话内消息同步
//!
//! 维护一份按时间排序、按消息ID去重的本地消息单：传输层承诺
//! 至少一次、尽力有序，重复与乱序在这里消化。发送走固定流水线，
//! 只有落库失败对发送方可见，其余步骤尽力而为。

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use domain::{
    ConversationId, ConversationRepository, Message, MessageContent, MessageId, MessageRepository,
    RealtimeEvent, Timestamp, UserId,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::client_events::{ClientEvent, ClientEvents};
use crate::clock::Clock;
use crate::error::ApplicationError;
use crate::presence::PresenceTracker;
use crate::services::notifications::NotificationService;
use crate::transport::RealtimeTransport;

/// 通知正文里消息预览的截断长度
const PREVIEW_CHARS: usize = 80;

pub struct MessageSyncDependencies {
    pub messages: Arc<dyn MessageRepository>,
    pub conversations: Arc<dyn ConversationRepository>,
    pub notifications: Arc<NotificationService>,
    pub transport: Arc<dyn RealtimeTransport>,
    pub clock: Arc<dyn Clock>,
    pub events: Arc<ClientEvents>,
    pub presence: Arc<PresenceTracker>,
}

struct Transcript {
    messages: Vec<Message>,
    seen: HashSet<MessageId>,
}

/// 单个会话的消息同步服务
pub struct MessageSyncService {
    messages: Arc<dyn MessageRepository>,
    conversations: Arc<dyn ConversationRepository>,
    notifications: Arc<NotificationService>,
    transport: Arc<dyn RealtimeTransport>,
    clock: Arc<dyn Clock>,
    events: Arc<ClientEvents>,
    presence: Arc<PresenceTracker>,
    conversation_id: ConversationId,
    me: UserId,
    peer: UserId,
    /// 发送方展示名，进入对端通知正文
    sender_name: String,
    transcript: Mutex<Transcript>,
    viewing: AtomicBool,
}

impl MessageSyncService {
    pub fn new(
        dependencies: MessageSyncDependencies,
        conversation_id: ConversationId,
        me: UserId,
        peer: UserId,
        sender_name: String,
    ) -> Self {
        Self {
            messages: dependencies.messages,
            conversations: dependencies.conversations,
            notifications: dependencies.notifications,
            transport: dependencies.transport,
            clock: dependencies.clock,
            events: dependencies.events,
            presence: dependencies.presence,
            conversation_id,
            me,
            peer,
            sender_name,
            transcript: Mutex::new(Transcript {
                messages: Vec::new(),
                seen: HashSet::new(),
            }),
            viewing: AtomicBool::new(false),
        }
    }

    /// 装载最近的历史消息，替换本地消息单
    pub async fn load_history(&self, limit: i64) -> Result<Vec<Message>, ApplicationError> {
        let rows = self
            .messages
            .list_recent(self.conversation_id, limit, None)
            .await?;
        {
            let mut transcript = self.transcript.lock().await;
            transcript.seen = rows.iter().map(|row| row.id).collect();
            transcript.messages = rows.clone();
        }
        self.events.emit(ClientEvent::TranscriptLoaded {
            messages: rows.clone(),
        });
        Ok(rows)
    }

    /// 向前翻一页更早的历史，返回本次新装载的消息
    pub async fn load_older(&self, limit: i64) -> Result<Vec<Message>, ApplicationError> {
        let before = {
            let transcript = self.transcript.lock().await;
            transcript.messages.first().map(|row| row.id)
        };
        let rows = self
            .messages
            .list_recent(self.conversation_id, limit, before)
            .await?;

        let full = {
            let mut transcript = self.transcript.lock().await;
            for row in rows.iter().rev() {
                if transcript.seen.insert(row.id) {
                    transcript.messages.insert(0, row.clone());
                }
            }
            transcript.messages.clone()
        };
        self.events
            .emit(ClientEvent::TranscriptLoaded { messages: full });
        Ok(rows)
    }

    /// 发送消息
    ///
    /// 流水线：落库 → 广播行插入 → 推进会话活动时间 → 清掉自己的
    /// 未读通知 → 给对端建通知。只有第一步的失败向上传递。
    pub async fn send(&self, content: MessageContent) -> Result<Message, ApplicationError> {
        let now = self.clock.now();
        let message = Message::new(
            MessageId::from(Uuid::new_v4()),
            self.conversation_id,
            self.me,
            content,
            now,
        );

        // 1. 落库，唯一对用户可见的失败点
        let message = self.messages.insert(message).await?;

        // 2. 广播行插入事件，对端在线时实时收到
        let event = RealtimeEvent::MessageInserted {
            message: message.clone(),
        };
        if let Err(error) = self.transport.publish(&event.topic(), &event).await {
            tracing::error!(
                error = %error,
                message_id = %message.id,
                "message event publish failed"
            );
        }

        // 3. 推进会话活动时间
        if let Err(error) = self.conversations.touch(self.conversation_id, now).await {
            tracing::error!(
                error = %error,
                conversation_id = %self.conversation_id,
                "conversation touch failed"
            );
        }

        // 4. 发消息意味着自己正看着会话，清掉指向它的未读通知
        if let Err(error) = self
            .notifications
            .clear_for_conversation(self.me, self.conversation_id)
            .await
        {
            tracing::error!(
                error = %error,
                conversation_id = %self.conversation_id,
                "clearing own notifications failed"
            );
        }

        // 5. 给对端建通知；对端不在会话里才触发推送
        let peer_in_conversation = self.presence.is_online(self.peer).await;
        if let Err(error) = self
            .notifications
            .notify_new_message(
                self.peer,
                &self.sender_name,
                self.conversation_id,
                &message.content.preview(PREVIEW_CHARS),
                !peer_in_conversation,
            )
            .await
        {
            tracing::error!(
                error = %error,
                conversation_id = %self.conversation_id,
                "peer notification failed"
            );
        }

        // 本端回显
        self.apply_insert(message.clone()).await;
        Ok(message)
    }

    /// 消化一条行插入事件（含自己发送后的回环），按ID去重
    pub(crate) async fn apply_insert(&self, message: Message) {
        if message.conversation_id != self.conversation_id {
            return;
        }
        {
            let mut transcript = self.transcript.lock().await;
            if !transcript.seen.insert(message.id) {
                tracing::debug!(message_id = %message.id, "duplicate delivery ignored");
                return;
            }
            insert_ordered(&mut transcript.messages, message.clone());
        }
        self.events.emit(ClientEvent::MessageReceived {
            message: message.clone(),
        });

        // 对端消息到达时正盯着会话看，立即确认已读
        if message.sender_id != self.me && self.viewing.load(Ordering::SeqCst) {
            if let Err(error) = self.messages.mark_read(message.id).await {
                tracing::error!(error = %error, message_id = %message.id, "mark read failed");
            }
            self.finish_read(vec![message.id]).await;
        }
    }

    /// 消化一条已读回执，翻转本地消息单里的已读位
    pub(crate) async fn apply_receipt(
        &self,
        reader_id: UserId,
        message_ids: Vec<MessageId>,
        timestamp: Timestamp,
    ) {
        {
            let mut transcript = self.transcript.lock().await;
            for row in transcript.messages.iter_mut() {
                if message_ids.contains(&row.id) {
                    row.mark_read();
                }
            }
        }
        self.events.emit(ClientEvent::ReadReceipt {
            reader_id,
            message_ids,
            timestamp,
        });
    }

    /// 切换“正在查看会话”状态；进入查看时扫除全部未读
    pub async fn set_viewing(&self, viewing: bool) {
        self.viewing.store(viewing, Ordering::SeqCst);
        if !viewing {
            return;
        }

        match self
            .messages
            .mark_conversation_read(self.conversation_id, self.me)
            .await
        {
            Ok(changed) if !changed.is_empty() => self.finish_read(changed).await,
            Ok(_) => {}
            Err(error) => {
                tracing::error!(
                    error = %error,
                    conversation_id = %self.conversation_id,
                    "read sweep failed"
                );
            }
        }
    }

    pub fn is_viewing(&self) -> bool {
        self.viewing.load(Ordering::SeqCst)
    }

    /// 当前本地消息单
    pub async fn transcript(&self) -> Vec<Message> {
        self.transcript.lock().await.messages.clone()
    }

    /// 已读确认的收尾：翻本地已读位、广播回执、清未读通知
    async fn finish_read(&self, message_ids: Vec<MessageId>) {
        let now = self.clock.now();
        {
            let mut transcript = self.transcript.lock().await;
            for row in transcript.messages.iter_mut() {
                if message_ids.contains(&row.id) {
                    row.mark_read();
                }
            }
        }

        let event = RealtimeEvent::ReadReceipt {
            conversation_id: self.conversation_id,
            reader_id: self.me,
            message_ids: message_ids.clone(),
            timestamp: now,
        };
        if let Err(error) = self.transport.publish(&event.topic(), &event).await {
            tracing::error!(
                error = %error,
                conversation_id = %self.conversation_id,
                "read receipt publish failed"
            );
        }

        if let Err(error) = self
            .notifications
            .clear_for_conversation(self.me, self.conversation_id)
            .await
        {
            tracing::error!(
                error = %error,
                conversation_id = %self.conversation_id,
                "clearing own notifications failed"
            );
        }

        self.events.emit(ClientEvent::ReadReceipt {
            reader_id: self.me,
            message_ids,
            timestamp: now,
        });
    }
}

/// 按 (created_at, id) 有序插入；常态是尾部追加
fn insert_ordered(messages: &mut Vec<Message>, message: Message) {
    let position = messages
        .iter()
        .rposition(|existing| {
            (existing.created_at, existing.id.0) <= (message.created_at, message.id.0)
        })
        .map(|index| index + 1)
        .unwrap_or(0);
    messages.insert(position, message);
}
