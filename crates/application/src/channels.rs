//! 频道注册表
//!
//! 把主题映射到本地扇出管道：同一主题的多次接入共享同一份远端订阅，
//! 由一个泵任务把远端事件搬进本地广播通道；最后一个接入方离开时
//! 退订并终止泵任务。

use std::collections::HashMap;
use std::sync::Arc;

use domain::{PresenceEntry, PresenceSnapshot, RealtimeEvent, Topic, UserId};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::transport::{EventStream, RealtimeTransport, TransportError};

/// 接入频道时的选项
#[derive(Debug, Default)]
pub struct ChannelOptions {
    /// 接入后立即登记的在场条目；None 表示只听不亮相
    pub presence: Option<PresenceEntry>,
}

impl ChannelOptions {
    pub fn listen_only() -> Self {
        Self::default()
    }

    pub fn with_presence(entry: PresenceEntry) -> Self {
        Self {
            presence: Some(entry),
        }
    }
}

struct ChannelShared {
    sender: broadcast::Sender<RealtimeEvent>,
    /// 接入计数，归零时拆除频道
    refs: usize,
    pump: JoinHandle<()>,
}

struct RegistryInner {
    transport: Arc<dyn RealtimeTransport>,
    capacity: usize,
    channels: Mutex<HashMap<String, ChannelShared>>,
}

/// 频道注册表；clone 共享同一份状态
#[derive(Clone)]
pub struct ChannelRegistry {
    inner: Arc<RegistryInner>,
}

impl ChannelRegistry {
    pub fn new(transport: Arc<dyn RealtimeTransport>, capacity: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                transport,
                capacity,
                channels: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// 接入主题；首个接入方建立远端订阅，后续接入方共享
    pub async fn attach(
        &self,
        topic: Topic,
        options: ChannelOptions,
    ) -> Result<ChannelHandle, TransportError> {
        let sender = {
            let mut channels = self.inner.channels.lock().await;
            match channels.get_mut(topic.as_str()) {
                Some(shared) => {
                    shared.refs += 1;
                    shared.sender.clone()
                }
                None => {
                    let remote = self.inner.transport.subscribe(&topic).await?;
                    let (sender, _) = broadcast::channel(self.inner.capacity);
                    let pump = spawn_pump(topic.clone(), remote, sender.clone());
                    channels.insert(
                        topic.as_str().to_string(),
                        ChannelShared {
                            sender: sender.clone(),
                            refs: 1,
                            pump,
                        },
                    );
                    sender
                }
            }
        };

        let mut tracked = None;
        if let Some(entry) = options.presence {
            let user_id = entry.user_id;
            if let Err(error) = self.inner.transport.track(&topic, entry).await {
                // 登记失败时收回刚才的接入，不给调用方留半开的频道
                self.release(&topic).await;
                return Err(error);
            }
            tracked = Some(user_id);
        }

        Ok(ChannelHandle {
            topic,
            registry: self.clone(),
            sender,
            tracked,
        })
    }

    /// 当前活跃的频道数
    pub async fn channel_count(&self) -> usize {
        self.inner.channels.lock().await.len()
    }

    async fn release(&self, topic: &Topic) {
        let mut channels = self.inner.channels.lock().await;
        let emptied = match channels.get_mut(topic.as_str()) {
            Some(shared) => {
                shared.refs -= 1;
                shared.refs == 0
            }
            None => false,
        };
        if emptied {
            if let Some(shared) = channels.remove(topic.as_str()) {
                shared.pump.abort();
                tracing::debug!(topic = %topic, "channel torn down");
            }
        }
    }
}

/// 一次频道接入
///
/// 用完必须调用 `detach` 释放；直接丢弃会让共享订阅多挂一个引用。
pub struct ChannelHandle {
    topic: Topic,
    registry: ChannelRegistry,
    sender: broadcast::Sender<RealtimeEvent>,
    tracked: Option<UserId>,
}

impl ChannelHandle {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// 本频道的事件流；可多次调用，各流独立消费
    pub fn events(&self) -> EventStream {
        EventStream::new(self.sender.subscribe())
    }

    /// 读取本频道当前的在场全量快照
    pub async fn presence_state(&self) -> Result<PresenceSnapshot, TransportError> {
        self.registry
            .inner
            .transport
            .presence_state(&self.topic)
            .await
    }

    /// 退出频道：先摘掉在场登记，再释放共享订阅
    pub async fn detach(self) {
        if let Some(user_id) = self.tracked {
            if let Err(error) = self
                .registry
                .inner
                .transport
                .untrack(&self.topic, user_id)
                .await
            {
                tracing::warn!(topic = %self.topic, error = %error, "presence untrack failed");
            }
        }
        self.registry.release(&self.topic).await;
    }
}

fn spawn_pump(
    topic: Topic,
    mut remote: EventStream,
    sender: broadcast::Sender<RealtimeEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match remote.recv().await {
                Ok(event) => {
                    if sender.receiver_count() == 0 {
                        continue;
                    }
                    if let Err(error) = sender.send(event) {
                        tracing::debug!(topic = %topic, error = %error, "local fanout dropped event");
                    }
                }
                Err(TransportError::Closed) => {
                    tracing::debug!(topic = %topic, "remote stream closed, pump exiting");
                    break;
                }
                Err(error) => {
                    tracing::warn!(topic = %topic, error = %error, "pump failed, channel going quiet");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use domain::ConversationId;
    use uuid::Uuid;

    use crate::memory::MemoryTransport;

    use super::*;

    fn topic() -> Topic {
        Topic::conversation(ConversationId::from(Uuid::new_v4()))
    }

    #[tokio::test]
    async fn attaches_share_one_channel() {
        let transport: Arc<dyn RealtimeTransport> = Arc::new(MemoryTransport::new(16));
        let registry = ChannelRegistry::new(transport, 16);
        let topic = topic();

        let first = registry
            .attach(topic.clone(), ChannelOptions::listen_only())
            .await
            .unwrap();
        let second = registry
            .attach(topic.clone(), ChannelOptions::listen_only())
            .await
            .unwrap();
        assert_eq!(registry.channel_count().await, 1);

        first.detach().await;
        assert_eq!(registry.channel_count().await, 1);

        second.detach().await;
        assert_eq!(registry.channel_count().await, 0);
    }

    #[tokio::test]
    async fn events_reach_attached_handles() {
        let transport: Arc<dyn RealtimeTransport> = Arc::new(MemoryTransport::new(16));
        let registry = ChannelRegistry::new(Arc::clone(&transport), 16);
        let topic = topic();

        let handle = registry
            .attach(topic.clone(), ChannelOptions::listen_only())
            .await
            .unwrap();
        let mut events = handle.events();

        let conversation_id = ConversationId::from(Uuid::new_v4());
        let event = RealtimeEvent::TypingChanged {
            conversation_id,
            user_id: UserId::from(Uuid::new_v4()),
            typing: true,
            timestamp: Utc::now(),
        };
        transport.publish(&topic, &event).await.unwrap();

        let received = events.recv().await.unwrap();
        assert_eq!(received, event);

        handle.detach().await;
    }

    #[tokio::test]
    async fn presence_is_tracked_and_untracked() {
        let transport: Arc<dyn RealtimeTransport> = Arc::new(MemoryTransport::new(16));
        let registry = ChannelRegistry::new(Arc::clone(&transport), 16);
        let topic = topic();
        let user_id = UserId::from(Uuid::new_v4());

        let handle = registry
            .attach(
                topic.clone(),
                ChannelOptions::with_presence(PresenceEntry::new(user_id, Utc::now())),
            )
            .await
            .unwrap();

        let snapshot = handle.presence_state().await.unwrap();
        assert_eq!(snapshot.users(), vec![user_id]);

        handle.detach().await;
        let snapshot = transport.presence_state(&topic).await.unwrap();
        assert!(snapshot.is_empty());
    }
}
