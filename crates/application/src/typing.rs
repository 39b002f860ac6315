//! 输入状态协调
//!
//! 发送侧：输入中的重复上报被节流到每个窗口至多广播一次 true，
//! 停止输入（显式停止或窗口内无新输入）时广播 false。
//! 接收侧：对端的 true 按到达时间授予一个过期窗口，窗口内未续期
//! 即视为已停止，读取时惰性清理，不依赖对端一定发来 false。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use domain::{ConversationId, RealtimeEvent, Timestamp, UserId};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::transport::RealtimeTransport;

struct SenderState {
    active: bool,
    last_sent: Option<Timestamp>,
    /// 每次重置定时器时递增；到期回调凭此识别自己是否已过时
    epoch: u64,
    timer: Option<JoinHandle<()>>,
}

struct TypingInner {
    transport: Arc<dyn RealtimeTransport>,
    clock: Arc<dyn Clock>,
    conversation_id: ConversationId,
    user_id: UserId,
    window: Duration,
    sender: Mutex<SenderState>,
    peers: Mutex<HashMap<UserId, Timestamp>>,
}

/// 单个会话的输入状态协调器；clone 共享同一份状态
#[derive(Clone)]
pub struct TypingCoordinator {
    inner: Arc<TypingInner>,
}

impl TypingCoordinator {
    pub fn new(
        transport: Arc<dyn RealtimeTransport>,
        clock: Arc<dyn Clock>,
        conversation_id: ConversationId,
        user_id: UserId,
        window: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(TypingInner {
                transport,
                clock,
                conversation_id,
                user_id,
                window,
                sender: Mutex::new(SenderState {
                    active: false,
                    last_sent: None,
                    epoch: 0,
                    timer: None,
                }),
                peers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// 上报本端输入状态；输入状态是瞬时信息，广播失败只记日志
    pub async fn set_typing(&self, typing: bool) {
        if typing {
            self.refresh().await;
        } else {
            self.stop().await;
        }
    }

    /// 会话关闭前调用：撤掉定时器，必要时补发 false
    pub async fn shutdown(&self) {
        self.stop().await;
    }

    async fn refresh(&self) {
        let now = self.inner.clock.now();
        let mut broadcast_start = false;
        {
            let mut state = self.inner.sender.lock().await;
            let due = match state.last_sent {
                Some(last) => {
                    now.signed_duration_since(last).num_milliseconds()
                        >= self.inner.window.as_millis() as i64
                }
                None => true,
            };
            if !state.active || due {
                state.active = true;
                state.last_sent = Some(now);
                broadcast_start = true;
            }

            // 无论是否广播，停止定时器都从最近一次输入重新起算
            state.epoch += 1;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            let inner = Arc::clone(&self.inner);
            let epoch = state.epoch;
            state.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(inner.window).await;
                expire(&inner, epoch).await;
            }));
        }

        if broadcast_start {
            broadcast(&self.inner, true, now).await;
        }
    }

    async fn stop(&self) {
        let now = self.inner.clock.now();
        let was_active;
        {
            let mut state = self.inner.sender.lock().await;
            state.epoch += 1;
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            was_active = state.active;
            state.active = false;
            state.last_sent = None;
        }
        if was_active {
            broadcast(&self.inner, false, now).await;
        }
    }

    /// 记录对端输入状态；true 授予一个从到达时刻起算的过期窗口
    pub async fn apply_remote(&self, user_id: UserId, typing: bool) {
        let mut peers = self.inner.peers.lock().await;
        if typing {
            let expires_at = self.inner.clock.now()
                + chrono::Duration::milliseconds(self.inner.window.as_millis() as i64);
            peers.insert(user_id, expires_at);
        } else {
            peers.remove(&user_id);
        }
    }

    /// 对端是否仍在输入；过期条目在读取时清理
    pub async fn is_typing(&self, user_id: UserId) -> bool {
        let now = self.inner.clock.now();
        let mut peers = self.inner.peers.lock().await;
        peers.retain(|_, expires_at| *expires_at > now);
        peers.contains_key(&user_id)
    }
}

async fn expire(inner: &Arc<TypingInner>, epoch: u64) {
    let now = inner.clock.now();
    {
        let mut state = inner.sender.lock().await;
        if state.epoch != epoch || !state.active {
            return;
        }
        state.active = false;
        state.last_sent = None;
        state.timer = None;
    }
    broadcast(inner, false, now).await;
}

async fn broadcast(inner: &Arc<TypingInner>, typing: bool, timestamp: Timestamp) {
    let event = RealtimeEvent::TypingChanged {
        conversation_id: inner.conversation_id,
        user_id: inner.user_id,
        typing,
        timestamp,
    };
    if let Err(error) = inner.transport.publish(&event.topic(), &event).await {
        tracing::warn!(error = %error, "typing broadcast failed");
    }
}

#[cfg(test)]
mod tests {
    use domain::Topic;
    use uuid::Uuid;

    use crate::memory::{ManualClock, MemoryTransport};

    use super::*;

    const WINDOW: Duration = Duration::from_secs(3);

    struct Fixture {
        coordinator: TypingCoordinator,
        clock: Arc<ManualClock>,
        transport: Arc<MemoryTransport>,
        topic: Topic,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let transport = Arc::new(MemoryTransport::new(64));
        let conversation_id = ConversationId::from(Uuid::new_v4());
        let coordinator = TypingCoordinator::new(
            Arc::clone(&transport) as Arc<dyn RealtimeTransport>,
            Arc::clone(&clock) as Arc<dyn Clock>,
            conversation_id,
            UserId::from(Uuid::new_v4()),
            WINDOW,
        );
        Fixture {
            coordinator,
            clock,
            transport,
            topic: Topic::conversation(conversation_id),
        }
    }

    fn typing_flag(event: &RealtimeEvent) -> bool {
        match event {
            RealtimeEvent::TypingChanged { typing, .. } => *typing,
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_input_broadcasts_once_per_window() {
        let fx = fixture();
        let mut events = fx.transport.subscribe(&fx.topic).await.unwrap();

        fx.coordinator.set_typing(true).await;
        fx.coordinator.set_typing(true).await;
        fx.coordinator.set_typing(true).await;

        assert!(typing_flag(&events.try_recv().unwrap()));
        assert!(events.try_recv().is_none(), "throttle should hold inside the window");
    }

    #[tokio::test(start_paused = true)]
    async fn silence_expires_into_false() {
        let fx = fixture();
        let mut events = fx.transport.subscribe(&fx.topic).await.unwrap();

        fx.coordinator.set_typing(true).await;
        assert!(typing_flag(&events.try_recv().unwrap()));

        // recv 挂起后测试时钟自动推进，停止定时器随之到期
        let event = events.recv().await.unwrap();
        assert!(!typing_flag(&event));
    }

    #[tokio::test(start_paused = true)]
    async fn continued_input_extends_the_timer() {
        let fx = fixture();
        let mut events = fx.transport.subscribe(&fx.topic).await.unwrap();

        fx.coordinator.set_typing(true).await;
        assert!(typing_flag(&events.try_recv().unwrap()));

        // 窗口过半继续输入：不重复广播，但定时器重新起算
        tokio::time::advance(WINDOW / 2).await;
        fx.clock.advance(chrono::Duration::milliseconds(1500));
        fx.coordinator.set_typing(true).await;
        assert!(events.try_recv().is_none());

        tokio::time::advance(WINDOW / 2).await;
        assert!(events.try_recv().is_none(), "timer restarted, not expired yet");

        let event = events.recv().await.unwrap();
        assert!(!typing_flag(&event));
    }

    #[tokio::test(start_paused = true)]
    async fn long_bursts_rebroadcast_after_the_window() {
        let fx = fixture();
        let mut events = fx.transport.subscribe(&fx.topic).await.unwrap();

        fx.coordinator.set_typing(true).await;
        assert!(typing_flag(&events.try_recv().unwrap()));

        tokio::time::advance(WINDOW - Duration::from_millis(1)).await;
        fx.clock.advance(chrono::Duration::seconds(3));
        fx.coordinator.set_typing(true).await;

        // 对端的过期窗口需要续期，超过窗口的持续输入会再次广播 true
        assert!(typing_flag(&events.try_recv().unwrap()));
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_stop_broadcasts_false_once() {
        let fx = fixture();
        let mut events = fx.transport.subscribe(&fx.topic).await.unwrap();

        fx.coordinator.set_typing(true).await;
        assert!(typing_flag(&events.try_recv().unwrap()));

        fx.coordinator.set_typing(false).await;
        assert!(!typing_flag(&events.try_recv().unwrap()));

        // 幂等：再次停止不再广播
        fx.coordinator.set_typing(false).await;
        assert!(events.try_recv().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn peer_typing_expires_without_refresh() {
        let fx = fixture();
        let peer = UserId::from(Uuid::new_v4());

        fx.coordinator.apply_remote(peer, true).await;
        assert!(fx.coordinator.is_typing(peer).await);

        fx.clock.advance(chrono::Duration::seconds(4));
        assert!(!fx.coordinator.is_typing(peer).await);
    }

    #[tokio::test(start_paused = true)]
    async fn peer_false_clears_immediately() {
        let fx = fixture();
        let peer = UserId::from(Uuid::new_v4());

        fx.coordinator.apply_remote(peer, true).await;
        fx.coordinator.apply_remote(peer, false).await;
        assert!(!fx.coordinator.is_typing(peer).await);
    }
}
