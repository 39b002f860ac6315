//! Redis 实时传输实现
//!
//! 发布侧走共享的命令连接（自动重连），订阅侧为每次订阅建立独立的
//! Pub/Sub 连接并由后台泵任务转发进广播通道。在场条目写进
//! `presence:{topic}` 哈希并设置 TTL，心跳任务负责续期和重播全量快照，
//! 进程崩溃后条目随 TTL 过期自动回收。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use application::{EventStream, RealtimeTransport, TransportError};
use async_trait::async_trait;
use chrono::Utc;
use config::{RealtimeConfig, RedisConfig};
use domain::{PresenceEntry, PresenceSnapshot, RealtimeEvent, Topic, UserId};
use futures_util::StreamExt;
use redis::aio::{ConnectionManager, PubSub};
use redis::{AsyncCommands, Client};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

/// 发布失败的最大尝试次数
const PUBLISH_RETRIES: u32 = 3;
/// 订阅连接连续重建失败的上限
const MAX_RECONNECTS: u32 = 5;
/// 订阅重建的退避基数
const RECONNECT_BASE: Duration = Duration::from_millis(500);
/// 泵任务检查退出条件的轮询间隔
const POLL_INTERVAL: Duration = Duration::from_millis(1000);

type TrackedEntries = Arc<Mutex<HashMap<String, HashMap<String, PresenceEntry>>>>;

fn presence_key(topic: &str) -> String {
    format!("presence:{}", topic)
}

/// 基于 Redis 的实时传输
pub struct RedisRealtimeTransport {
    client: Client,
    connection: ConnectionManager,
    capacity: usize,
    presence_ttl: Duration,
    tracked: TrackedEntries,
    shutdown: Arc<AtomicBool>,
    heartbeat: JoinHandle<()>,
}

impl RedisRealtimeTransport {
    /// 建立客户端与命令连接，并启动在场心跳任务
    pub async fn connect(
        redis: &RedisConfig,
        realtime: &RealtimeConfig,
    ) -> Result<Self, TransportError> {
        let client = Client::open(redis.url.as_str())
            .map_err(|error| TransportError::connection(format!("invalid redis url: {}", error)))?;
        let connection = client
            .get_connection_manager()
            .await
            .map_err(|error| TransportError::connection(error.to_string()))?;

        let tracked: TrackedEntries = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let heartbeat = tokio::spawn(heartbeat_loop(
            connection.clone(),
            Arc::clone(&tracked),
            realtime.presence_ttl(),
            Arc::clone(&shutdown),
        ));

        tracing::info!("redis realtime transport connected");

        Ok(Self {
            client,
            connection,
            capacity: realtime.channel_capacity,
            presence_ttl: realtime.presence_ttl(),
            tracked,
            shutdown,
            heartbeat,
        })
    }

    /// 读回全量在场并广播快照；失败只记日志，由下一次心跳补上
    async fn broadcast_presence_sync(&self, topic: &Topic) {
        let snapshot = match self.presence_state(topic).await {
            Ok(snapshot) => snapshot,
            Err(error) => {
                tracing::warn!(topic = %topic, error = %error, "presence snapshot read failed");
                return;
            }
        };
        let event = RealtimeEvent::PresenceSync {
            topic: topic.clone(),
            snapshot,
        };
        if let Err(error) = self.publish(topic, &event).await {
            tracing::warn!(topic = %topic, error = %error, "presence sync broadcast failed");
        }
    }
}

#[async_trait]
impl RealtimeTransport for RedisRealtimeTransport {
    async fn subscribe(&self, topic: &Topic) -> Result<EventStream, TransportError> {
        // 首次订阅在这里完成，连不上直接让调用方看到错误
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|error| TransportError::connection(error.to_string()))?;
        pubsub
            .subscribe(topic.as_str())
            .await
            .map_err(|error| TransportError::connection(error.to_string()))?;

        let (sender, receiver) = broadcast::channel(self.capacity);
        let client = self.client.clone();
        let shutdown = Arc::clone(&self.shutdown);
        let channel = topic.as_str().to_string();
        tokio::spawn(pump(client, pubsub, channel, sender, shutdown));

        Ok(EventStream::new(receiver))
    }

    async fn publish(&self, topic: &Topic, event: &RealtimeEvent) -> Result<(), TransportError> {
        let payload = serde_json::to_string(event)
            .map_err(|error| TransportError::publish(topic, format!("serialize event: {}", error)))?;

        let mut attempt: u32 = 0;
        loop {
            let mut connection = self.connection.clone();
            match connection
                .publish::<_, _, i64>(topic.as_str(), &payload)
                .await
            {
                Ok(_) => return Ok(()),
                Err(error) => {
                    attempt += 1;
                    if attempt >= PUBLISH_RETRIES {
                        return Err(TransportError::publish(topic, error.to_string()));
                    }
                    let delay = Duration::from_millis(100 * 2u64.pow(attempt));
                    tracing::warn!(
                        topic = %topic,
                        error = %error,
                        attempt = attempt,
                        "publish failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn track(&self, topic: &Topic, entry: PresenceEntry) -> Result<(), TransportError> {
        let encoded = serde_json::to_string(&entry).map_err(|error| {
            TransportError::presence(format!("serialize presence entry: {}", error))
        })?;
        let key = presence_key(topic.as_str());
        let field = entry.user_id.to_string();

        let mut connection = self.connection.clone();
        let _: () = connection
            .hset(&key, &field, &encoded)
            .await
            .map_err(|error| TransportError::presence(error.to_string()))?;
        let _: () = connection
            .expire(&key, self.presence_ttl.as_secs() as i64)
            .await
            .map_err(|error| TransportError::presence(error.to_string()))?;

        {
            let mut tracked = self.tracked.lock().await;
            tracked
                .entry(topic.as_str().to_string())
                .or_default()
                .insert(field, entry.clone());
        }

        // 增量广播是尽力而为，错过的订阅方由心跳的全量快照补齐
        let joined = RealtimeEvent::PresenceJoined {
            topic: topic.clone(),
            entry,
            timestamp: Utc::now(),
        };
        if let Err(error) = self.publish(topic, &joined).await {
            tracing::warn!(topic = %topic, error = %error, "presence join broadcast failed");
        }
        self.broadcast_presence_sync(topic).await;
        Ok(())
    }

    async fn untrack(&self, topic: &Topic, user_id: UserId) -> Result<(), TransportError> {
        let key = presence_key(topic.as_str());
        let field = user_id.to_string();

        let mut connection = self.connection.clone();
        let _: () = connection
            .hdel(&key, &field)
            .await
            .map_err(|error| TransportError::presence(error.to_string()))?;

        {
            let mut tracked = self.tracked.lock().await;
            if let Some(entries) = tracked.get_mut(topic.as_str()) {
                entries.remove(&field);
                if entries.is_empty() {
                    tracked.remove(topic.as_str());
                }
            }
        }

        let left = RealtimeEvent::PresenceLeft {
            topic: topic.clone(),
            user_id,
            timestamp: Utc::now(),
        };
        if let Err(error) = self.publish(topic, &left).await {
            tracing::warn!(topic = %topic, error = %error, "presence leave broadcast failed");
        }
        self.broadcast_presence_sync(topic).await;
        Ok(())
    }

    async fn presence_state(&self, topic: &Topic) -> Result<PresenceSnapshot, TransportError> {
        let mut connection = self.connection.clone();
        read_snapshot(&mut connection, topic.as_str())
            .await
            .map_err(|error| TransportError::presence(error.to_string()))
    }
}

impl Drop for RedisRealtimeTransport {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.heartbeat.abort();
    }
}

/// 泵任务的单轮监听结果
enum ListenExit {
    /// 订阅方全部离开或收到停机信号
    Detached,
    /// 连接中断，需要重建
    Disconnected,
}

/// 订阅泵：把频道消息解码后转发进广播通道，连接断开时带退避重建
async fn pump(
    client: Client,
    initial: PubSub,
    channel: String,
    sender: broadcast::Sender<RealtimeEvent>,
    shutdown: Arc<AtomicBool>,
) {
    let mut retry_count: u32 = 0;
    let mut pubsub = Some(initial);

    loop {
        if shutdown.load(Ordering::Relaxed) || sender.receiver_count() == 0 {
            break;
        }

        let connection = match pubsub.take() {
            Some(connection) => connection,
            None => match resubscribe(&client, &channel).await {
                Ok(connection) => {
                    retry_count = 0;
                    connection
                }
                Err(error) => {
                    retry_count += 1;
                    if retry_count >= MAX_RECONNECTS {
                        tracing::error!(
                            topic = %channel,
                            error = %error,
                            "subscription gave up after repeated reconnect failures"
                        );
                        break;
                    }
                    let delay = RECONNECT_BASE * 2u32.pow(retry_count - 1);
                    tracing::warn!(
                        topic = %channel,
                        error = %error,
                        retry = retry_count,
                        "subscription reconnect failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    continue;
                }
            },
        };

        match listen(connection, &channel, &sender, &shutdown).await {
            ListenExit::Detached => break,
            ListenExit::Disconnected => {
                tracing::warn!(topic = %channel, "pubsub stream ended, reconnecting");
                tokio::time::sleep(RECONNECT_BASE).await;
            }
        }
    }

    tracing::debug!(topic = %channel, "subscription pump stopped");
}

async fn listen(
    mut pubsub: PubSub,
    channel: &str,
    sender: &broadcast::Sender<RealtimeEvent>,
    shutdown: &Arc<AtomicBool>,
) -> ListenExit {
    loop {
        if shutdown.load(Ordering::Relaxed) || sender.receiver_count() == 0 {
            return ListenExit::Detached;
        }

        // 超时轮询用来周期性检查退出条件
        let next = tokio::time::timeout(POLL_INTERVAL, async {
            pubsub.on_message().next().await
        })
        .await;

        match next {
            Ok(Some(message)) => {
                let payload = match message.get_payload::<String>() {
                    Ok(payload) => payload,
                    Err(error) => {
                        tracing::warn!(topic = channel, error = %error, "failed to read pubsub payload");
                        continue;
                    }
                };
                match serde_json::from_str::<RealtimeEvent>(&payload) {
                    Ok(event) => {
                        // 发送失败说明订阅方刚好全部离开，循环头部会退出
                        let _ = sender.send(event);
                    }
                    Err(error) => {
                        tracing::warn!(topic = channel, error = %error, "discarding undecodable event payload");
                    }
                }
            }
            Ok(None) => return ListenExit::Disconnected,
            Err(_) => continue,
        }
    }
}

async fn resubscribe(client: &Client, channel: &str) -> Result<PubSub, redis::RedisError> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(channel).await?;
    tracing::debug!(topic = channel, "redis subscription re-established");
    Ok(pubsub)
}

/// 读出某主题的全量在场快照
async fn read_snapshot(
    connection: &mut ConnectionManager,
    topic: &str,
) -> Result<PresenceSnapshot, redis::RedisError> {
    let rows: HashMap<String, String> = connection.hgetall(presence_key(topic)).await?;

    let mut snapshot = PresenceSnapshot::new(Utc::now());
    for (field, raw) in rows {
        match serde_json::from_str::<PresenceEntry>(&raw) {
            Ok(entry) => snapshot.insert(field, entry),
            Err(error) => {
                tracing::warn!(topic = topic, field = %field, error = %error, "skipping undecodable presence entry");
            }
        }
    }
    Ok(snapshot)
}

/// 心跳：续期本进程登记的在场条目并重播全量快照
async fn heartbeat_loop(
    mut connection: ConnectionManager,
    tracked: TrackedEntries,
    ttl: Duration,
    shutdown: Arc<AtomicBool>,
) {
    let period = Duration::from_secs((ttl.as_secs() / 3).max(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if shutdown.load(Ordering::Relaxed) {
            break;
        }

        let topics: Vec<(String, Vec<(String, PresenceEntry)>)> = {
            let tracked = tracked.lock().await;
            tracked
                .iter()
                .filter(|(_, entries)| !entries.is_empty())
                .map(|(topic, entries)| {
                    let entries = entries
                        .iter()
                        .map(|(field, entry)| (field.clone(), entry.clone()))
                        .collect();
                    (topic.clone(), entries)
                })
                .collect()
        };

        for (topic, entries) in topics {
            if let Err(error) = refresh_presence(&mut connection, &topic, &entries, ttl).await {
                tracing::warn!(topic = %topic, error = %error, "presence heartbeat failed");
            }
        }
    }
}

async fn refresh_presence(
    connection: &mut ConnectionManager,
    topic: &str,
    entries: &[(String, PresenceEntry)],
    ttl: Duration,
) -> Result<(), redis::RedisError> {
    let key = presence_key(topic);
    for (field, entry) in entries {
        match serde_json::to_string(entry) {
            Ok(encoded) => {
                let _: () = connection.hset(&key, field, encoded).await?;
            }
            Err(error) => {
                tracing::warn!(topic = topic, error = %error, "presence entry serialize failed");
            }
        }
    }
    let _: () = connection.expire(&key, ttl.as_secs() as i64).await?;

    // 周期性重播全量快照，补上订阅方错过的增量
    let snapshot = read_snapshot(connection, topic).await?;
    let event = RealtimeEvent::PresenceSync {
        topic: Topic::new(topic),
        snapshot,
    };
    match serde_json::to_string(&event) {
        Ok(payload) => {
            let _: i64 = connection.publish(topic, payload).await?;
        }
        Err(error) => {
            tracing::warn!(topic = topic, error = %error, "presence sync serialize failed");
        }
    }
    Ok(())
}
