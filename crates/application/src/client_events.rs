//! 客户端事件出口
//!
//! 会话各服务产出的界面事件经此扇出给客户端消费方；
//! 无人订阅时事件直接丢弃，不阻塞业务路径。

use domain::{notification_kinds, CallSignal, Message, MessageId, Notification, Timestamp, UserId};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::services::calls::CallState;

/// 呈现给客户端的通知载荷
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientNotification {
    pub title: String,
    pub body: String,
    pub data: NotificationData,
}

/// 通知附带的跳转数据
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationData {
    pub url: String,
}

impl From<&Notification> for ClientNotification {
    fn from(notification: &Notification) -> Self {
        Self {
            title: display_title(&notification.kind).to_string(),
            body: notification.content.clone(),
            data: NotificationData {
                url: notification.action_url.clone().unwrap_or_default(),
            },
        }
    }
}

/// 通知类型对应的展示标题；未知类型原样展示
pub fn display_title(kind: &str) -> &str {
    match kind {
        notification_kinds::NEW_MESSAGE => "New message",
        notification_kinds::INCOMING_CALL => "Incoming call",
        notification_kinds::MISSED_CALL => "Missed call",
        other => other,
    }
}

/// 某用户对消息的当前回应
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserReaction {
    pub user_id: UserId,
    pub emoji: String,
}

/// 推给客户端界面的事件
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ClientEvent {
    /// 历史消息装载完成
    TranscriptLoaded { messages: Vec<Message> },
    /// 新消息进入对话（含本端回显）
    MessageReceived { message: Message },
    /// 对端已读回执
    ReadReceipt {
        reader_id: UserId,
        message_ids: Vec<MessageId>,
        timestamp: Timestamp,
    },
    /// 对端输入状态变化
    PeerTyping { user_id: UserId, typing: bool },
    /// 对端在场状态变化
    PeerPresence { user_id: UserId, online: bool },
    /// 来电振铃，携带 offer 原文供应答协商
    IncomingCall {
        signal: CallSignal,
        caller_name: String,
    },
    /// 去电被接听，携带 answer 原文
    CallAnswered { signal: CallSignal },
    /// ICE 候选转发
    CallCandidate { signal: CallSignal },
    /// 通话状态机迁移
    CallStateChanged { state: CallState },
    /// 新通知到达
    NotificationArrived { notification: ClientNotification },
    /// 某条消息的回应集合变化
    ReactionsChanged {
        message_id: MessageId,
        reactions: Vec<UserReaction>,
    },
}

/// 客户端事件广播器
pub struct ClientEvents {
    sender: broadcast::Sender<ClientEvent>,
}

impl ClientEvents {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// 发出事件；没有订阅者时静默丢弃
    pub fn emit(&self, event: ClientEvent) {
        if self.sender.receiver_count() == 0 {
            return;
        }
        if let Err(error) = self.sender.send(event) {
            tracing::debug!(error = %error, "client event dropped");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.sender.subscribe()
    }

    /// 以 Stream 形式订阅，便于前端用组合子消费
    pub fn stream(&self) -> BroadcastStream<ClientEvent> {
        BroadcastStream::new(self.sender.subscribe())
    }
}
