//! 内存适配器
//!
//! 传输、仓储、时钟、推送端口的进程内实现。测试全部跑在这些
//! 适配器上；单进程部署也可以直接使用内存传输。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use domain::{
    CallSignal, Conversation, ConversationId, Message, MessageId, Notification, NotificationId,
    PresenceEntry, PresenceSnapshot, Reaction, ReactionToggle, RealtimeEvent, RepositoryError,
    SignalId, SignalStatus, Timestamp, Topic, UserId, UserProfile,
};
use domain::{
    CallSignalRepository, ConversationRepository, MessageRepository, NotificationRepository,
    ProfileRepository, ReactionRepository,
};
use tokio::sync::{broadcast, Mutex};

use crate::clock::{Clock, SystemClock};
use crate::push::{PushError, PushRequest, PushSender};
use crate::transport::{EventStream, RealtimeTransport, TransportError};

/// 可手动拨动的时钟
pub struct ManualClock {
    now: std::sync::Mutex<Timestamp>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::starting_at(chrono::Utc::now())
    }
}

impl ManualClock {
    pub fn starting_at(now: Timestamp) -> Self {
        Self {
            now: std::sync::Mutex::new(now),
        }
    }

    pub fn advance(&self, delta: chrono::Duration) {
        let mut guard = self.guard();
        *guard += delta;
    }

    pub fn set(&self, now: Timestamp) {
        *self.guard() = now;
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, Timestamp> {
        self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        *self.guard()
    }
}

struct MemoryTopic {
    sender: broadcast::Sender<RealtimeEvent>,
    presence: HashMap<String, Vec<PresenceEntry>>,
}

/// 进程内传输：每个主题一条广播通道，在场集合存在同一张表里
pub struct MemoryTransport {
    capacity: usize,
    clock: Arc<dyn Clock>,
    topics: Mutex<HashMap<String, MemoryTopic>>,
}

impl MemoryTransport {
    pub fn new(capacity: usize) -> Self {
        Self::with_clock(capacity, Arc::new(SystemClock))
    }

    pub fn with_clock(capacity: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            capacity,
            clock,
            topics: Mutex::new(HashMap::new()),
        }
    }

    fn snapshot_of(topic: &MemoryTopic, captured_at: Timestamp) -> PresenceSnapshot {
        let mut snapshot = PresenceSnapshot::new(captured_at);
        for (key, entries) in &topic.presence {
            for entry in entries {
                snapshot.insert(key.clone(), entry.clone());
            }
        }
        snapshot
    }
}

fn ensure<'a>(
    topics: &'a mut HashMap<String, MemoryTopic>,
    capacity: usize,
    topic: &Topic,
) -> &'a mut MemoryTopic {
    topics.entry(topic.as_str().to_string()).or_insert_with(|| {
        let (sender, _) = broadcast::channel(capacity);
        MemoryTopic {
            sender,
            presence: HashMap::new(),
        }
    })
}

fn fanout(entry: &MemoryTopic, event: RealtimeEvent) {
    if entry.sender.receiver_count() == 0 {
        return;
    }
    if let Err(error) = entry.sender.send(event) {
        tracing::debug!(error = %error, "memory transport dropped event");
    }
}

#[async_trait]
impl RealtimeTransport for MemoryTransport {
    async fn subscribe(&self, topic: &Topic) -> Result<EventStream, TransportError> {
        let mut topics = self.topics.lock().await;
        let entry = ensure(&mut topics, self.capacity, topic);
        Ok(EventStream::new(entry.sender.subscribe()))
    }

    async fn publish(&self, topic: &Topic, event: &RealtimeEvent) -> Result<(), TransportError> {
        let mut topics = self.topics.lock().await;
        let entry = ensure(&mut topics, self.capacity, topic);
        fanout(entry, event.clone());
        Ok(())
    }

    async fn track(&self, topic: &Topic, entry: PresenceEntry) -> Result<(), TransportError> {
        let now = self.clock.now();
        let mut topics = self.topics.lock().await;
        let channel = ensure(&mut topics, self.capacity, topic);
        channel
            .presence
            .entry(entry.user_id.to_string())
            .or_default()
            .push(entry.clone());

        fanout(
            channel,
            RealtimeEvent::PresenceJoined {
                topic: topic.clone(),
                entry,
                timestamp: now,
            },
        );
        let snapshot = Self::snapshot_of(channel, now);
        fanout(
            channel,
            RealtimeEvent::PresenceSync {
                topic: topic.clone(),
                snapshot,
            },
        );
        Ok(())
    }

    async fn untrack(&self, topic: &Topic, user_id: UserId) -> Result<(), TransportError> {
        let now = self.clock.now();
        let mut topics = self.topics.lock().await;
        let channel = ensure(&mut topics, self.capacity, topic);
        channel.presence.remove(&user_id.to_string());

        fanout(
            channel,
            RealtimeEvent::PresenceLeft {
                topic: topic.clone(),
                user_id,
                timestamp: now,
            },
        );
        let snapshot = Self::snapshot_of(channel, now);
        fanout(
            channel,
            RealtimeEvent::PresenceSync {
                topic: topic.clone(),
                snapshot,
            },
        );
        Ok(())
    }

    async fn presence_state(&self, topic: &Topic) -> Result<PresenceSnapshot, TransportError> {
        let now = self.clock.now();
        let topics = self.topics.lock().await;
        match topics.get(topic.as_str()) {
            Some(channel) => Ok(Self::snapshot_of(channel, now)),
            None => Ok(PresenceSnapshot::new(now)),
        }
    }
}

/// 内存消息仓储
#[derive(Default)]
pub struct InMemoryMessageRepository {
    rows: Mutex<Vec<Message>>,
}

impl InMemoryMessageRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageRepository for InMemoryMessageRepository {
    async fn insert(&self, message: Message) -> Result<Message, RepositoryError> {
        let mut rows = self.rows.lock().await;
        if rows.iter().any(|row| row.id == message.id) {
            return Err(RepositoryError::conflict(format!(
                "message {} already exists",
                message.id
            )));
        }
        rows.push(message.clone());
        Ok(message)
    }

    async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>, RepositoryError> {
        let rows = self.rows.lock().await;
        Ok(rows.iter().find(|row| row.id == id).cloned())
    }

    async fn list_recent(
        &self,
        conversation_id: ConversationId,
        limit: i64,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>, RepositoryError> {
        let rows = self.rows.lock().await;
        let mut matched: Vec<Message> = rows
            .iter()
            .filter(|row| row.conversation_id == conversation_id)
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.0.cmp(&b.id.0)));

        if let Some(before_id) = before {
            if let Some(pivot) = matched.iter().position(|row| row.id == before_id) {
                matched.truncate(pivot);
            }
        }

        let limit = limit.max(0) as usize;
        if matched.len() > limit {
            matched.drain(..matched.len() - limit);
        }
        Ok(matched)
    }

    async fn mark_read(&self, id: MessageId) -> Result<(), RepositoryError> {
        let mut rows = self.rows.lock().await;
        match rows.iter_mut().find(|row| row.id == id) {
            Some(row) => {
                row.mark_read();
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn mark_conversation_read(
        &self,
        conversation_id: ConversationId,
        reader_id: UserId,
    ) -> Result<Vec<MessageId>, RepositoryError> {
        let mut rows = self.rows.lock().await;
        let mut changed = Vec::new();
        for row in rows.iter_mut() {
            if row.conversation_id == conversation_id
                && row.sender_id != reader_id
                && row.mark_read()
            {
                changed.push(row.id);
            }
        }
        Ok(changed)
    }
}

/// 内存信令仓储
#[derive(Default)]
pub struct InMemoryCallSignalRepository {
    rows: Mutex<Vec<CallSignal>>,
}

impl InMemoryCallSignalRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CallSignalRepository for InMemoryCallSignalRepository {
    async fn insert(&self, signal: CallSignal) -> Result<CallSignal, RepositoryError> {
        let mut rows = self.rows.lock().await;
        if rows.iter().any(|row| row.id == signal.id) {
            return Err(RepositoryError::conflict(format!(
                "signal {} already exists",
                signal.id
            )));
        }
        rows.push(signal.clone());
        Ok(signal)
    }

    async fn find_by_id(&self, id: SignalId) -> Result<Option<CallSignal>, RepositoryError> {
        let rows = self.rows.lock().await;
        Ok(rows.iter().find(|row| row.id == id).cloned())
    }

    async fn update_status(
        &self,
        id: SignalId,
        status: SignalStatus,
    ) -> Result<(), RepositoryError> {
        let mut rows = self.rows.lock().await;
        match rows.iter_mut().find(|row| row.id == id) {
            Some(row) => {
                row.status = status;
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn supersede_pending_offers(
        &self,
        caller_id: UserId,
        callee_id: UserId,
    ) -> Result<u64, RepositoryError> {
        let mut rows = self.rows.lock().await;
        let mut affected = 0;
        for row in rows.iter_mut() {
            if row.caller_id == caller_id
                && row.callee_id == callee_id
                && row.signal_type() == "offer"
                && row.status == SignalStatus::Pending
            {
                row.status = SignalStatus::Ended;
                affected += 1;
            }
        }
        Ok(affected)
    }
}

/// 内存会话仓储
#[derive(Default)]
pub struct InMemoryConversationRepository {
    rows: Mutex<HashMap<ConversationId, Conversation>>,
}

impl InMemoryConversationRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConversationRepository for InMemoryConversationRepository {
    async fn create(&self, conversation: Conversation) -> Result<Conversation, RepositoryError> {
        let mut rows = self.rows.lock().await;
        if rows.contains_key(&conversation.id) {
            return Err(RepositoryError::conflict(format!(
                "conversation {} already exists",
                conversation.id
            )));
        }
        rows.insert(conversation.id, conversation.clone());
        Ok(conversation)
    }

    async fn find_by_id(
        &self,
        id: ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let rows = self.rows.lock().await;
        Ok(rows.get(&id).cloned())
    }

    async fn touch(&self, id: ConversationId, at: Timestamp) -> Result<(), RepositoryError> {
        let mut rows = self.rows.lock().await;
        match rows.get_mut(&id) {
            Some(row) => {
                row.touch(at);
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }
}

/// 内存通知仓储
#[derive(Default)]
pub struct InMemoryNotificationRepository {
    rows: Mutex<Vec<Notification>>,
}

impl InMemoryNotificationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// 测试断言用：取某用户的全部通知
    pub async fn for_user(&self, user_id: UserId) -> Vec<Notification> {
        let rows = self.rows.lock().await;
        rows.iter()
            .filter(|row| row.user_id == user_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl NotificationRepository for InMemoryNotificationRepository {
    async fn create(&self, notification: Notification) -> Result<Notification, RepositoryError> {
        let mut rows = self.rows.lock().await;
        rows.push(notification.clone());
        Ok(notification)
    }

    async fn mark_as_read(
        &self,
        id: NotificationId,
        at: Timestamp,
    ) -> Result<(), RepositoryError> {
        let mut rows = self.rows.lock().await;
        match rows.iter_mut().find(|row| row.id == id) {
            Some(row) => {
                row.mark_as_read(at);
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn mark_read_by_action(
        &self,
        user_id: UserId,
        action_url: &str,
        at: Timestamp,
    ) -> Result<u64, RepositoryError> {
        let mut rows = self.rows.lock().await;
        let mut affected = 0;
        for row in rows.iter_mut() {
            if row.user_id == user_id
                && !row.read
                && row.action_url.as_deref() == Some(action_url)
            {
                row.mark_as_read(at);
                affected += 1;
            }
        }
        Ok(affected)
    }

    async fn count_unread(&self, user_id: UserId) -> Result<i64, RepositoryError> {
        let rows = self.rows.lock().await;
        Ok(rows
            .iter()
            .filter(|row| row.user_id == user_id && !row.read)
            .count() as i64)
    }
}

/// 内存回应仓储；(message_id, user_id) 唯一性由切换逻辑保证
#[derive(Default)]
pub struct InMemoryReactionRepository {
    rows: Mutex<Vec<Reaction>>,
}

impl InMemoryReactionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ReactionRepository for InMemoryReactionRepository {
    async fn toggle(&self, reaction: Reaction) -> Result<ReactionToggle, RepositoryError> {
        let mut rows = self.rows.lock().await;
        let existing = rows
            .iter()
            .position(|row| row.message_id == reaction.message_id && row.user_id == reaction.user_id);
        match existing {
            None => {
                rows.push(reaction);
                Ok(ReactionToggle::Added)
            }
            Some(index) if rows[index].emoji == reaction.emoji => {
                rows.remove(index);
                Ok(ReactionToggle::Removed)
            }
            Some(index) => {
                rows[index] = reaction;
                Ok(ReactionToggle::Replaced)
            }
        }
    }

    async fn list_for_message(
        &self,
        message_id: MessageId,
    ) -> Result<Vec<Reaction>, RepositoryError> {
        let rows = self.rows.lock().await;
        Ok(rows
            .iter()
            .filter(|row| row.message_id == message_id)
            .cloned()
            .collect())
    }
}

/// 内存用户资料仓储
#[derive(Default)]
pub struct InMemoryProfileRepository {
    rows: Mutex<HashMap<UserId, UserProfile>>,
}

impl InMemoryProfileRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// 预置一条资料
    pub async fn put(&self, profile: UserProfile) {
        let mut rows = self.rows.lock().await;
        rows.insert(profile.id, profile);
    }
}

#[async_trait]
impl ProfileRepository for InMemoryProfileRepository {
    async fn find_by_id(&self, id: UserId) -> Result<Option<UserProfile>, RepositoryError> {
        let rows = self.rows.lock().await;
        Ok(rows.get(&id).cloned())
    }
}

/// 记录型推送发送器；可切换为故障模式来验证尽力而为路径
#[derive(Default)]
pub struct RecordingPushSender {
    sent: Mutex<Vec<PushRequest>>,
    failing: AtomicBool,
}

impl RecordingPushSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<PushRequest> {
        self.sent.lock().await.clone()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl PushSender for RecordingPushSender {
    async fn send(&self, request: PushRequest) -> Result<(), PushError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PushError::failed("simulated push outage"));
        }
        self.sent.lock().await.push(request);
        Ok(())
    }
}
