//! 运行时装配
//!
//! 进程级实时上下文：持有通道注册表、客户端事件出口、通话状态机
//! 和通知服务。start 建立全局订阅（本人在场、信令流、通知流），
//! open_conversation 为单个会话装配在场、输入、消息同步与回应，
//! 事件由会话内唯一的分发任务路由到各组件。

use std::sync::Arc;

use config::RealtimeConfig;
use domain::{
    feed_topic, CallSignalRepository, ChangeFilter, ChangeTable, Conversation, ConversationId,
    ConversationRepository, DomainError, Message, MessageContent, MessageId, MessageRepository,
    NotificationRepository, PresenceEntry, ProfileRepository, ReactionRepository, ReactionToggle,
    RealtimeEvent, Topic, UserId,
};
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::channels::{ChannelHandle, ChannelOptions, ChannelRegistry};
use crate::client_events::{ClientEvent, ClientEvents, ClientNotification, UserReaction};
use crate::clock::Clock;
use crate::error::ApplicationError;
use crate::presence::PresenceTracker;
use crate::push::PushSender;
use crate::services::calls::{CallSignaling, CallSignalingDependencies};
use crate::services::messages::{MessageSyncDependencies, MessageSyncService};
use crate::services::notifications::{NotificationService, NotificationServiceDependencies};
use crate::services::reactions::{ReactionService, ReactionServiceDependencies};
use crate::transport::{EventStream, RealtimeTransport};
use crate::typing::TypingCoordinator;

/// 打开会话时装载的历史页大小
const HISTORY_PAGE: i64 = 50;

/// 资料缺失时的兜底展示名
const FALLBACK_NAME: &str = "Unknown";

pub struct RuntimeDependencies {
    pub messages: Arc<dyn MessageRepository>,
    pub conversations: Arc<dyn ConversationRepository>,
    pub signals: Arc<dyn CallSignalRepository>,
    pub notifications: Arc<dyn NotificationRepository>,
    pub reactions: Arc<dyn ReactionRepository>,
    pub profiles: Arc<dyn ProfileRepository>,
    pub transport: Arc<dyn RealtimeTransport>,
    pub push: Arc<dyn PushSender>,
    pub clock: Arc<dyn Clock>,
}

/// 进程级实时运行时；一个实例服务一个登录用户
pub struct RealtimeRuntime {
    user_id: UserId,
    config: RealtimeConfig,
    registry: ChannelRegistry,
    events: Arc<ClientEvents>,
    notifications: Arc<NotificationService>,
    calls: CallSignaling,
    messages: Arc<dyn MessageRepository>,
    conversations: Arc<dyn ConversationRepository>,
    reactions: Arc<dyn ReactionRepository>,
    profiles: Arc<dyn ProfileRepository>,
    transport: Arc<dyn RealtimeTransport>,
    clock: Arc<dyn Clock>,
    user_channel: Mutex<Option<ChannelHandle>>,
    feed_channels: Mutex<Vec<ChannelHandle>>,
    global_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RealtimeRuntime {
    pub fn new(deps: RuntimeDependencies, config: RealtimeConfig, user_id: UserId) -> Self {
        let registry = ChannelRegistry::new(deps.transport.clone(), config.channel_capacity);
        let events = Arc::new(ClientEvents::new(config.channel_capacity));
        let notifications = Arc::new(NotificationService::new(NotificationServiceDependencies {
            notifications: deps.notifications,
            push: deps.push,
            transport: deps.transport.clone(),
            clock: deps.clock.clone(),
        }));
        let calls = CallSignaling::new(
            CallSignalingDependencies {
                signals: deps.signals,
                profiles: deps.profiles.clone(),
                notifications: notifications.clone(),
                transport: deps.transport.clone(),
                clock: deps.clock.clone(),
                events: events.clone(),
            },
            user_id,
            config.ring_timeout(),
        );
        Self {
            user_id,
            config,
            registry,
            events,
            notifications,
            calls,
            messages: deps.messages,
            conversations: deps.conversations,
            reactions: deps.reactions,
            profiles: deps.profiles,
            transport: deps.transport,
            clock: deps.clock,
            user_channel: Mutex::new(None),
            feed_channels: Mutex::new(Vec::new()),
            global_tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// 客户端事件出口；界面经 subscribe/stream 消费
    pub fn events(&self) -> &ClientEvents {
        &self.events
    }

    /// 通话操作入口
    pub fn calls(&self) -> &CallSignaling {
        &self.calls
    }

    pub fn notifications(&self) -> &NotificationService {
        &self.notifications
    }

    /// 建立全局订阅：本人在场、信令流、通知流；幂等
    pub async fn start(&self) -> Result<(), ApplicationError> {
        {
            let guard = self.user_channel.lock().await;
            if guard.is_some() {
                tracing::warn!(user_id = %self.user_id, "runtime already started");
                return Ok(());
            }
        }

        let display_name = self.own_display_name().await;
        let entry = PresenceEntry::new(self.user_id, self.clock.now())
            .with_meta(json!({ "display_name": display_name }));
        let user_channel = self
            .registry
            .attach(
                Topic::user(self.user_id),
                ChannelOptions::with_presence(entry),
            )
            .await?;

        let signal_channel = match self
            .registry
            .attach(
                feed_topic(ChangeTable::CallSignals, ChangeFilter::Callee(self.user_id)),
                ChannelOptions::listen_only(),
            )
            .await
        {
            Ok(channel) => channel,
            Err(error) => {
                user_channel.detach().await;
                return Err(error.into());
            }
        };
        let notification_channel = match self
            .registry
            .attach(
                feed_topic(ChangeTable::Notifications, ChangeFilter::User(self.user_id)),
                ChannelOptions::listen_only(),
            )
            .await
        {
            Ok(channel) => channel,
            Err(error) => {
                signal_channel.detach().await;
                user_channel.detach().await;
                return Err(error.into());
            }
        };

        let tasks = vec![
            spawn_signal_dispatch(signal_channel.events(), self.calls.clone()),
            spawn_notification_dispatch(notification_channel.events(), self.events.clone()),
        ];

        *self.user_channel.lock().await = Some(user_channel);
        *self.feed_channels.lock().await = vec![signal_channel, notification_channel];
        *self.global_tasks.lock().await = tasks;

        tracing::info!(user_id = %self.user_id, "realtime runtime started");
        Ok(())
    }

    /// 拆除全局订阅与通话会话；幂等
    pub async fn shutdown(&self) {
        for task in self.global_tasks.lock().await.drain(..) {
            task.abort();
        }
        self.calls.shutdown().await;
        for handle in self.feed_channels.lock().await.drain(..) {
            handle.detach().await;
        }
        if let Some(handle) = self.user_channel.lock().await.take() {
            handle.detach().await;
        }
        tracing::info!(user_id = %self.user_id, "realtime runtime stopped");
    }

    /// 某用户是否在线：其个人主题的在场状态非空
    pub async fn is_user_online(&self, user_id: UserId) -> Result<bool, ApplicationError> {
        let snapshot = self
            .transport
            .presence_state(&Topic::user(user_id))
            .await?;
        Ok(!snapshot.is_empty())
    }

    /// 打开一个会话
    ///
    /// 装配顺序：建通道（会话主题带在场、消息流、回应流）、开事件流、
    /// 播种在场、装载历史、进入可视状态，最后启动分发任务。
    pub async fn open_conversation(
        &self,
        conversation: Conversation,
    ) -> Result<ConversationSession, ApplicationError> {
        let Some(peer_id) = conversation.peer_of(self.user_id) else {
            return Err(
                DomainError::business_rule_violation("当前用户不是该会话的参与方").into(),
            );
        };
        let conversation_id = conversation.id;

        let display_name = self.own_display_name().await;
        let entry = PresenceEntry::new(self.user_id, self.clock.now())
            .with_meta(json!({ "display_name": display_name.clone() }));

        let conversation_channel = self
            .registry
            .attach(
                Topic::conversation(conversation_id),
                ChannelOptions::with_presence(entry),
            )
            .await?;
        let message_feed = match self
            .registry
            .attach(
                feed_topic(
                    ChangeTable::Messages,
                    ChangeFilter::Conversation(conversation_id),
                ),
                ChannelOptions::listen_only(),
            )
            .await
        {
            Ok(channel) => channel,
            Err(error) => {
                conversation_channel.detach().await;
                return Err(error.into());
            }
        };
        let reaction_feed = match self
            .registry
            .attach(
                feed_topic(
                    ChangeTable::Reactions,
                    ChangeFilter::Conversation(conversation_id),
                ),
                ChannelOptions::listen_only(),
            )
            .await
        {
            Ok(channel) => channel,
            Err(error) => {
                message_feed.detach().await;
                conversation_channel.detach().await;
                return Err(error.into());
            }
        };

        // 先开流再播种，播种间隙的增量会在流里等着
        let conversation_events = conversation_channel.events();
        let message_events = message_feed.events();
        let reaction_events = reaction_feed.events();

        let presence = Arc::new(PresenceTracker::new());
        match conversation_channel.presence_state().await {
            Ok(snapshot) => {
                presence.apply_sync(&snapshot).await;
            }
            Err(error) => {
                tracing::warn!(error = %error, "presence seed failed, starting empty");
            }
        }

        let typing = TypingCoordinator::new(
            self.transport.clone(),
            self.clock.clone(),
            conversation_id,
            self.user_id,
            self.config.typing_expiry(),
        );
        let messages = Arc::new(MessageSyncService::new(
            MessageSyncDependencies {
                messages: self.messages.clone(),
                conversations: self.conversations.clone(),
                notifications: self.notifications.clone(),
                transport: self.transport.clone(),
                clock: self.clock.clone(),
                events: self.events.clone(),
                presence: presence.clone(),
            },
            conversation_id,
            self.user_id,
            peer_id,
            display_name,
        ));
        let reactions = Arc::new(ReactionService::new(
            ReactionServiceDependencies {
                reactions: self.reactions.clone(),
                transport: self.transport.clone(),
                clock: self.clock.clone(),
                events: self.events.clone(),
            },
            conversation_id,
            self.user_id,
        ));

        if let Err(error) = messages.load_history(HISTORY_PAGE).await {
            reaction_feed.detach().await;
            message_feed.detach().await;
            conversation_channel.detach().await;
            return Err(error);
        }
        messages.set_viewing(true).await;

        let dispatch = spawn_session_dispatch(SessionDispatch {
            me: self.user_id,
            peer_id,
            conversation_events,
            message_events,
            reaction_events,
            typing: typing.clone(),
            messages: messages.clone(),
            reactions: reactions.clone(),
            presence: presence.clone(),
            events: self.events.clone(),
        });

        tracing::info!(
            conversation_id = %conversation_id,
            peer_id = %peer_id,
            "conversation session opened"
        );

        Ok(ConversationSession {
            conversation_id,
            peer_id,
            typing,
            messages,
            reactions,
            presence,
            dispatch,
            conversation_channel: Some(conversation_channel),
            message_feed: Some(message_feed),
            reaction_feed: Some(reaction_feed),
        })
    }

    async fn own_display_name(&self) -> String {
        match self.profiles.find_by_id(self.user_id).await {
            Ok(Some(profile)) => profile.display_name,
            Ok(None) => FALLBACK_NAME.to_string(),
            Err(error) => {
                tracing::error!(error = %error, user_id = %self.user_id, "profile lookup failed");
                FALLBACK_NAME.to_string()
            }
        }
    }
}

/// 一个打开的会话；持有其通道与分发任务
pub struct ConversationSession {
    conversation_id: ConversationId,
    peer_id: UserId,
    typing: TypingCoordinator,
    messages: Arc<MessageSyncService>,
    reactions: Arc<ReactionService>,
    presence: Arc<PresenceTracker>,
    dispatch: JoinHandle<()>,
    conversation_channel: Option<ChannelHandle>,
    message_feed: Option<ChannelHandle>,
    reaction_feed: Option<ChannelHandle>,
}

impl ConversationSession {
    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn peer_id(&self) -> UserId {
        self.peer_id
    }

    /// 发送消息；只有落库失败会返回错误
    pub async fn send(&self, content: MessageContent) -> Result<Message, ApplicationError> {
        self.messages.send(content).await
    }

    /// 当前本地消息单
    pub async fn transcript(&self) -> Vec<Message> {
        self.messages.transcript().await
    }

    /// 向前翻一页更早的历史
    pub async fn load_older(&self, limit: i64) -> Result<Vec<Message>, ApplicationError> {
        self.messages.load_older(limit).await
    }

    /// 上报本端输入状态
    pub async fn set_typing(&self, typing: bool) {
        self.typing.set_typing(typing).await;
    }

    /// 对端此刻是否在输入
    pub async fn peer_typing(&self) -> bool {
        self.typing.is_typing(self.peer_id).await
    }

    /// 切换本端对某条消息的回应
    pub async fn toggle_reaction(
        &self,
        message_id: MessageId,
        emoji: &str,
    ) -> Result<ReactionToggle, ApplicationError> {
        self.reactions.toggle(message_id, emoji).await
    }

    /// 从存储装载某条消息的回应集合
    pub async fn load_reactions(
        &self,
        message_id: MessageId,
    ) -> Result<Vec<UserReaction>, ApplicationError> {
        self.reactions.load(message_id).await?;
        Ok(self.reactions.reactions_for(message_id).await)
    }

    /// 会话是否处于可视状态；进入可视会补扫未读
    pub async fn set_viewing(&self, viewing: bool) {
        self.messages.set_viewing(viewing).await;
    }

    /// 对端是否在场
    pub async fn peer_online(&self) -> bool {
        self.presence.is_online(self.peer_id).await
    }

    /// 关闭会话
    ///
    /// 拆除顺序：先停输入指示（广播 false），再退订并去掉在场注册，
    /// 最后中止分发任务；定时器随组件一并作废。
    pub async fn close(mut self) {
        self.typing.shutdown().await;
        self.messages.set_viewing(false).await;
        if let Some(handle) = self.conversation_channel.take() {
            handle.detach().await;
        }
        if let Some(handle) = self.message_feed.take() {
            handle.detach().await;
        }
        if let Some(handle) = self.reaction_feed.take() {
            handle.detach().await;
        }
        self.dispatch.abort();
        tracing::info!(conversation_id = %self.conversation_id, "conversation session closed");
    }
}

fn spawn_signal_dispatch(mut stream: EventStream, calls: CallSignaling) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match stream.recv().await {
                Ok(RealtimeEvent::SignalInserted { signal }) => calls.handle_signal(signal).await,
                Ok(_) => {}
                Err(_) => break,
            }
        }
    })
}

fn spawn_notification_dispatch(mut stream: EventStream, events: Arc<ClientEvents>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match stream.recv().await {
                Ok(RealtimeEvent::NotificationInserted { notification }) => {
                    events.emit(ClientEvent::NotificationArrived {
                        notification: ClientNotification::from(&notification),
                    });
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    })
}

struct SessionDispatch {
    me: UserId,
    peer_id: UserId,
    conversation_events: EventStream,
    message_events: EventStream,
    reaction_events: EventStream,
    typing: TypingCoordinator,
    messages: Arc<MessageSyncService>,
    reactions: Arc<ReactionService>,
    presence: Arc<PresenceTracker>,
    events: Arc<ClientEvents>,
}

/// 会话分发任务：单任务消费三路事件流并路由到各组件，
/// 组件状态因此只有一个写者
fn spawn_session_dispatch(mut ctx: SessionDispatch) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut peer_online = ctx.presence.is_online(ctx.peer_id).await;
        loop {
            let received = tokio::select! {
                event = ctx.conversation_events.recv() => event,
                event = ctx.message_events.recv() => event,
                event = ctx.reaction_events.recv() => event,
            };
            let event = match received {
                Ok(event) => event,
                Err(_) => break,
            };

            match event {
                RealtimeEvent::TypingChanged {
                    user_id, typing, ..
                } => {
                    if user_id == ctx.me {
                        continue;
                    }
                    ctx.typing.apply_remote(user_id, typing).await;
                    ctx.events.emit(ClientEvent::PeerTyping { user_id, typing });
                }
                RealtimeEvent::ReadReceipt {
                    reader_id,
                    message_ids,
                    timestamp,
                    ..
                } => {
                    if reader_id == ctx.me {
                        continue;
                    }
                    ctx.messages
                        .apply_receipt(reader_id, message_ids, timestamp)
                        .await;
                }
                RealtimeEvent::MessageInserted { message } => {
                    ctx.messages.apply_insert(message).await;
                }
                RealtimeEvent::ReactionChanged {
                    message_id,
                    user_id,
                    emoji,
                    ..
                } => {
                    if user_id == ctx.me {
                        continue;
                    }
                    ctx.reactions.handle_event(message_id, user_id, emoji).await;
                }
                RealtimeEvent::PresenceSync { snapshot, .. } => {
                    ctx.presence.apply_sync(&snapshot).await;
                    peer_online = emit_peer_presence(&ctx, peer_online).await;
                }
                RealtimeEvent::PresenceJoined {
                    entry, timestamp, ..
                } => {
                    ctx.presence.apply_join(entry, timestamp).await;
                    peer_online = emit_peer_presence(&ctx, peer_online).await;
                }
                RealtimeEvent::PresenceLeft {
                    user_id, timestamp, ..
                } => {
                    ctx.presence.apply_leave(user_id, timestamp).await;
                    peer_online = emit_peer_presence(&ctx, peer_online).await;
                }
                other => {
                    tracing::debug!(event_type = other.event_type(), "unrouted event ignored");
                }
            }
        }
    })
}

/// 对端上下线有实际变化时才通知界面
async fn emit_peer_presence(ctx: &SessionDispatch, was_online: bool) -> bool {
    let online = ctx.presence.is_online(ctx.peer_id).await;
    if online != was_online {
        ctx.events.emit(ClientEvent::PeerPresence {
            user_id: ctx.peer_id,
            online,
        });
    }
    online
}
