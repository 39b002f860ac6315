//! 通话信令状态机
//!
//! 每个客户端同一时刻至多一路通话：去电 Dialing、来电 Ringing、
//! 接通 Active。响铃窗口由本端定时器看护，超时按未接处理，offer
//! 在存储里保持 pending 作为未接的判定依据。通话中收到新 offer 时
//! 自动以 busy 拒绝，现有会话不受影响。不合法的状态迁移一律记
//! 日志后忽略，不向调用方报错。

use std::sync::Arc;
use std::time::Duration;

use domain::{
    CallSignal, CallSignalRepository, CallType, ConversationId, EndReason, ProfileRepository,
    RealtimeEvent, SignalId, SignalPayload, SignalStatus, UserId,
};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::client_events::{ClientEvent, ClientEvents};
use crate::clock::Clock;
use crate::error::ApplicationError;
use crate::services::notifications::NotificationService;
use crate::transport::RealtimeTransport;

/// 资料缺失时的兜底称呼
const FALLBACK_NAME: &str = "Unknown";

/// 通话状态机对外暴露的状态
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CallState {
    Idle,
    Dialing {
        conversation_id: ConversationId,
        peer_id: UserId,
        peer_name: String,
        call_type: CallType,
    },
    Ringing {
        conversation_id: ConversationId,
        peer_id: UserId,
        peer_name: String,
        call_type: CallType,
    },
    Active {
        conversation_id: ConversationId,
        peer_id: UserId,
        peer_name: String,
        call_type: CallType,
    },
    Ended {
        reason: EndReason,
    },
}

/// 会话内部阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Dialing,
    Ringing,
    Active,
}

/// 进行中的一路通话
struct CallSession {
    /// 建立本会话的 offer 原文；接听时据此构造 answer
    offer: CallSignal,
    peer_id: UserId,
    peer_name: String,
    /// 本端是否主叫
    outgoing: bool,
    phase: Phase,
}

/// 通话槽位；epoch 在每次会话建立和拆除时递增，
/// 在途的响铃定时器凭此识别自己是否已过时
struct SessionSlot {
    current: Option<CallSession>,
    epoch: u64,
    ring_timer: Option<JoinHandle<()>>,
}

pub struct CallSignalingDependencies {
    pub signals: Arc<dyn CallSignalRepository>,
    pub profiles: Arc<dyn ProfileRepository>,
    pub notifications: Arc<NotificationService>,
    pub transport: Arc<dyn RealtimeTransport>,
    pub clock: Arc<dyn Clock>,
    pub events: Arc<ClientEvents>,
}

struct CallInner {
    user_id: UserId,
    ring_timeout: Duration,
    signals: Arc<dyn CallSignalRepository>,
    profiles: Arc<dyn ProfileRepository>,
    notifications: Arc<NotificationService>,
    transport: Arc<dyn RealtimeTransport>,
    clock: Arc<dyn Clock>,
    events: Arc<ClientEvents>,
    slot: Mutex<SessionSlot>,
}

/// 通话信令服务
#[derive(Clone)]
pub struct CallSignaling {
    inner: Arc<CallInner>,
}

impl CallSignaling {
    pub fn new(deps: CallSignalingDependencies, user_id: UserId, ring_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(CallInner {
                user_id,
                ring_timeout,
                signals: deps.signals,
                profiles: deps.profiles,
                notifications: deps.notifications,
                transport: deps.transport,
                clock: deps.clock,
                events: deps.events,
                slot: Mutex::new(SessionSlot {
                    current: None,
                    epoch: 0,
                    ring_timer: None,
                }),
            }),
        }
    }

    /// 发起通话
    ///
    /// 已有通话在身时不发起，返回 `Ok(None)`。只有 offer 落库失败
    /// 对调用方可见，其余步骤尽力而为。
    pub async fn start_call(
        &self,
        conversation_id: ConversationId,
        callee_id: UserId,
        call_type: CallType,
        sdp: JsonValue,
    ) -> Result<Option<SignalId>, ApplicationError> {
        let mut slot = self.inner.slot.lock().await;
        if slot.current.is_some() {
            tracing::warn!(
                user_id = %self.inner.user_id,
                "start_call while already in a call ignored"
            );
            return Ok(None);
        }

        // 1. 清掉本方向上残留的未决 offer（上次进程异常退出的遗留）
        match self
            .inner
            .signals
            .supersede_pending_offers(self.inner.user_id, callee_id)
            .await
        {
            Ok(0) => {}
            Ok(count) => tracing::warn!(count, "superseded stale pending offers"),
            Err(error) => tracing::error!(error = %error, "superseding stale offers failed"),
        }

        // 2. 落库 offer，这一步失败对用户可见
        let now = self.inner.clock.now();
        let offer = CallSignal::offer(
            conversation_id,
            self.inner.user_id,
            callee_id,
            call_type,
            sdp,
            now,
        );
        let offer = self.inner.signals.insert(offer).await?;

        // 3. 广播行插入，尽力而为
        publish_signal(&self.inner, &offer).await;

        // 4. 给被叫写来电通知，离线设备靠推送唤醒，尽力而为
        let my_name = display_name_of(&self.inner, self.inner.user_id).await;
        if let Err(error) = self
            .inner
            .notifications
            .notify_incoming_call(callee_id, &my_name, call_type, conversation_id)
            .await
        {
            tracing::error!(error = %error, "incoming call notification failed");
        }

        // 5. 建立本端会话并武装响铃定时器
        let peer_name = display_name_of(&self.inner, callee_id).await;
        let offer_id = offer.id;
        let session = CallSession {
            offer,
            peer_id: callee_id,
            peer_name,
            outgoing: true,
            phase: Phase::Dialing,
        };
        let state = state_of(&session);
        slot.epoch += 1;
        slot.current = Some(session);
        arm_ring_timer(&self.inner, &mut slot);
        drop(slot);

        self.inner.events.emit(ClientEvent::CallStateChanged { state });
        Ok(Some(offer_id))
    }

    /// 接听来电
    ///
    /// 只在响铃态有效。answer 行落库失败对调用方可见，此时停留在
    /// 响铃态允许重试；offer 状态推进和广播尽力而为。
    pub async fn accept(&self, sdp: JsonValue) -> Result<(), ApplicationError> {
        let mut slot = self.inner.slot.lock().await;
        let Some(mut session) = slot.current.take() else {
            tracing::warn!(
                user_id = %self.inner.user_id,
                "accept without a ringing call ignored"
            );
            return Ok(());
        };
        if session.outgoing || session.phase != Phase::Ringing {
            tracing::warn!(
                user_id = %self.inner.user_id,
                "accept outside the ringing state ignored"
            );
            slot.current = Some(session);
            return Ok(());
        }

        let now = self.inner.clock.now();
        let answer = CallSignal::answer(
            session.offer.conversation_id,
            self.inner.user_id,
            session.offer.caller_id,
            session.offer.call_type,
            sdp,
            now,
        );
        let answer = match self.inner.signals.insert(answer).await {
            Ok(answer) => answer,
            Err(error) => {
                slot.current = Some(session);
                return Err(error.into());
            }
        };

        if let Err(error) = self
            .inner
            .signals
            .update_status(session.offer.id, SignalStatus::Accepted)
            .await
        {
            tracing::error!(
                error = %error,
                signal_id = %session.offer.id,
                "offer status update failed"
            );
        }
        publish_signal(&self.inner, &answer).await;

        session.phase = Phase::Active;
        let state = state_of(&session);
        slot.epoch += 1;
        if let Some(timer) = slot.ring_timer.take() {
            timer.abort();
        }
        slot.current = Some(session);
        drop(slot);

        self.inner.events.emit(ClientEvent::CallStateChanged { state });
        Ok(())
    }

    /// 拒接来电；本地立即生效，信令回应与状态推进尽力而为
    pub async fn reject(&self) {
        let session = {
            let mut slot = self.inner.slot.lock().await;
            let ringing = matches!(
                &slot.current,
                Some(session) if !session.outgoing && session.phase == Phase::Ringing
            );
            if !ringing {
                tracing::warn!(
                    user_id = %self.inner.user_id,
                    "reject without a ringing call ignored"
                );
                return;
            }
            teardown(&mut slot)
        };
        let Some(session) = session else { return };

        send_end_reply(&self.inner, &session.offer, session.peer_id, EndReason::Rejected).await;
        self.inner.events.emit(ClientEvent::CallStateChanged {
            state: CallState::Ended {
                reason: EndReason::Rejected,
            },
        });
    }

    /// 挂断；拨号中等价于取消呼叫，通话中结束通话
    pub async fn hang_up(&self) {
        let session = {
            let mut slot = self.inner.slot.lock().await;
            if slot.current.is_none() {
                tracing::warn!(
                    user_id = %self.inner.user_id,
                    "hang_up without a call ignored"
                );
                return;
            }
            teardown(&mut slot)
        };
        let Some(session) = session else { return };

        send_end_reply(&self.inner, &session.offer, session.peer_id, EndReason::Hangup).await;
        self.inner.events.emit(ClientEvent::CallStateChanged {
            state: CallState::Ended {
                reason: EndReason::Hangup,
            },
        });
    }

    /// 发送 ICE 候选；候选是持续小流量，单条失败不影响通话建立
    pub async fn send_candidate(&self, candidate: JsonValue) {
        let target = {
            let slot = self.inner.slot.lock().await;
            slot.current.as_ref().map(|session| {
                (
                    session.offer.conversation_id,
                    session.peer_id,
                    session.offer.call_type,
                )
            })
        };
        let Some((conversation_id, peer_id, call_type)) = target else {
            tracing::debug!(user_id = %self.inner.user_id, "candidate without a call dropped");
            return;
        };

        let now = self.inner.clock.now();
        let signal = CallSignal::candidate(
            conversation_id,
            self.inner.user_id,
            peer_id,
            call_type,
            candidate,
            now,
        );
        if let Err(error) = self.inner.signals.insert(signal.clone()).await {
            tracing::error!(error = %error, signal_id = %signal.id, "candidate insert failed");
        }
        publish_signal(&self.inner, &signal).await;
    }

    /// 处理对端送达的信令；变更流按被叫过滤，非本端地址的直接丢弃
    pub async fn handle_signal(&self, signal: CallSignal) {
        if signal.callee_id != self.inner.user_id {
            tracing::debug!(
                signal_id = %signal.id,
                "signal addressed to someone else ignored"
            );
            return;
        }
        match &signal.payload {
            SignalPayload::Offer { .. } => self.on_offer(signal).await,
            SignalPayload::Answer { .. } => self.on_answer(signal).await,
            SignalPayload::Candidate { .. } => self.on_candidate(signal).await,
            SignalPayload::End { reason } => {
                let reason = *reason;
                self.on_end(signal, reason).await;
            }
        }
    }

    /// 当前通话状态
    pub async fn state(&self) -> CallState {
        let slot = self.inner.slot.lock().await;
        match &slot.current {
            Some(session) => state_of(session),
            None => CallState::Idle,
        }
    }

    /// 静默拆除会话；进程收尾时调用，不再发信令
    pub async fn shutdown(&self) {
        let mut slot = self.inner.slot.lock().await;
        teardown(&mut slot);
    }

    async fn on_offer(&self, offer: CallSignal) {
        let mut slot = self.inner.slot.lock().await;

        let busy = match &slot.current {
            // 传输层承诺至少一次，重复送达按原文 ID 去重
            Some(session) if session.offer.id == offer.id => {
                tracing::debug!(signal_id = %offer.id, "duplicate offer delivery ignored");
                return;
            }
            Some(_) => true,
            None => false,
        };
        if busy {
            drop(slot);
            tracing::info!(
                signal_id = %offer.id,
                caller_id = %offer.caller_id,
                "already in a call, auto-rejecting with busy"
            );
            send_end_reply(&self.inner, &offer, offer.caller_id, EndReason::Busy).await;
            return;
        }

        let caller_name = display_name_of(&self.inner, offer.caller_id).await;
        let session = CallSession {
            peer_id: offer.caller_id,
            peer_name: caller_name.clone(),
            outgoing: false,
            phase: Phase::Ringing,
            offer: offer.clone(),
        };
        let state = state_of(&session);
        slot.epoch += 1;
        slot.current = Some(session);
        arm_ring_timer(&self.inner, &mut slot);
        drop(slot);

        self.inner.events.emit(ClientEvent::IncomingCall {
            signal: offer,
            caller_name,
        });
        self.inner.events.emit(ClientEvent::CallStateChanged { state });
    }

    async fn on_answer(&self, answer: CallSignal) {
        let state = {
            let mut slot = self.inner.slot.lock().await;
            let accepted = match &mut slot.current {
                Some(session)
                    if session.outgoing
                        && session.phase == Phase::Dialing
                        && session.offer.conversation_id == answer.conversation_id
                        && session.peer_id == answer.caller_id =>
                {
                    session.phase = Phase::Active;
                    Some(state_of(session))
                }
                _ => None,
            };
            if accepted.is_some() {
                // 对端已接听，撤掉响铃定时器
                slot.epoch += 1;
                if let Some(timer) = slot.ring_timer.take() {
                    timer.abort();
                }
            }
            accepted
        };
        match state {
            Some(state) => {
                self.inner.events.emit(ClientEvent::CallAnswered { signal: answer });
                self.inner.events.emit(ClientEvent::CallStateChanged { state });
            }
            None => tracing::warn!(
                signal_id = %answer.id,
                "answer without a matching outgoing call ignored"
            ),
        }
    }

    async fn on_candidate(&self, candidate: CallSignal) {
        let relevant = {
            let slot = self.inner.slot.lock().await;
            slot.current.as_ref().is_some_and(|session| {
                session.offer.conversation_id == candidate.conversation_id
                    && session.peer_id == candidate.caller_id
            })
        };
        if relevant {
            self.inner
                .events
                .emit(ClientEvent::CallCandidate { signal: candidate });
        } else {
            tracing::debug!(signal_id = %candidate.id, "candidate without a matching call dropped");
        }
    }

    async fn on_end(&self, end: CallSignal, reason: EndReason) {
        let matched = {
            let mut slot = self.inner.slot.lock().await;
            let matches_session = slot.current.as_ref().is_some_and(|session| {
                session.offer.conversation_id == end.conversation_id
                    && session.peer_id == end.caller_id
            });
            if matches_session {
                teardown(&mut slot);
            }
            matches_session
        };
        if matched {
            self.inner.events.emit(ClientEvent::CallStateChanged {
                state: CallState::Ended { reason },
            });
        } else {
            tracing::debug!(signal_id = %end.id, "end without a matching call ignored");
        }
    }
}

fn state_of(session: &CallSession) -> CallState {
    let conversation_id = session.offer.conversation_id;
    let call_type = session.offer.call_type;
    match session.phase {
        Phase::Dialing => CallState::Dialing {
            conversation_id,
            peer_id: session.peer_id,
            peer_name: session.peer_name.clone(),
            call_type,
        },
        Phase::Ringing => CallState::Ringing {
            conversation_id,
            peer_id: session.peer_id,
            peer_name: session.peer_name.clone(),
            call_type,
        },
        Phase::Active => CallState::Active {
            conversation_id,
            peer_id: session.peer_id,
            peer_name: session.peer_name.clone(),
            call_type,
        },
    }
}

/// 清空会话并使在途的响铃定时器作废
fn teardown(slot: &mut SessionSlot) -> Option<CallSession> {
    slot.epoch += 1;
    if let Some(timer) = slot.ring_timer.take() {
        timer.abort();
    }
    slot.current.take()
}

fn arm_ring_timer(inner: &Arc<CallInner>, slot: &mut SessionSlot) {
    if let Some(timer) = slot.ring_timer.take() {
        timer.abort();
    }
    let shared = Arc::clone(inner);
    let epoch = slot.epoch;
    slot.ring_timer = Some(tokio::spawn(async move {
        tokio::time::sleep(shared.ring_timeout).await;
        on_ring_timeout(shared, epoch).await;
    }));
}

async fn on_ring_timeout(inner: Arc<CallInner>, epoch: u64) {
    let session = {
        let mut slot = inner.slot.lock().await;
        // 会话建立和拆除都会推进 epoch；不相等说明定时器已过时
        if slot.epoch != epoch {
            return;
        }
        match teardown(&mut slot) {
            Some(session) => session,
            None => return,
        }
    };

    tracing::info!(
        signal_id = %session.offer.id,
        outgoing = session.outgoing,
        "ring window elapsed, treating call as missed"
    );

    // offer 保持 pending：未接来电的判据就是从未到达终态的 offer
    if session.outgoing {
        // 被叫可能整个离线，由主叫侧补未接通知
        let my_name = display_name_of(&inner, inner.user_id).await;
        if let Err(error) = inner
            .notifications
            .notify_missed_call(
                session.peer_id,
                &my_name,
                session.offer.call_type,
                session.offer.conversation_id,
            )
            .await
        {
            tracing::error!(error = %error, "missed call notification failed");
        }
    }

    inner.events.emit(ClientEvent::CallStateChanged {
        state: CallState::Ended {
            reason: EndReason::Missed,
        },
    });
}

/// 以 end 信令回应对端并推进 offer 状态；各步骤相互独立、尽力而为
async fn send_end_reply(
    inner: &CallInner,
    offer: &CallSignal,
    recipient: UserId,
    reason: EndReason,
) {
    let now = inner.clock.now();
    let end = CallSignal::end(
        offer.conversation_id,
        inner.user_id,
        recipient,
        offer.call_type,
        reason,
        now,
    );

    if let Err(error) = inner.signals.update_status(offer.id, end.status).await {
        tracing::error!(error = %error, signal_id = %offer.id, "offer status update failed");
    }
    if let Err(error) = inner.signals.insert(end.clone()).await {
        tracing::error!(error = %error, signal_id = %end.id, "end signal insert failed");
    }
    publish_signal(inner, &end).await;
}

async fn publish_signal(inner: &CallInner, signal: &CallSignal) {
    let event = RealtimeEvent::SignalInserted {
        signal: signal.clone(),
    };
    if let Err(error) = inner.transport.publish(&event.topic(), &event).await {
        tracing::error!(error = %error, signal_id = %signal.id, "signal publish failed");
    }
}

/// 查询展示名；资料缺失或查询失败时退化为固定称呼
async fn display_name_of(inner: &CallInner, user_id: UserId) -> String {
    match inner.profiles.find_by_id(user_id).await {
        Ok(Some(profile)) => profile.display_name,
        Ok(None) => FALLBACK_NAME.to_string(),
        Err(error) => {
            tracing::error!(error = %error, user_id = %user_id, "profile lookup failed");
            FALLBACK_NAME.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use domain::{feed_topic, notification_kinds, ChangeFilter, ChangeTable, UserProfile};
    use serde_json::json;
    use tokio::sync::broadcast;
    use uuid::Uuid;

    use crate::memory::{
        InMemoryCallSignalRepository, InMemoryNotificationRepository, InMemoryProfileRepository,
        ManualClock, MemoryTransport, RecordingPushSender,
    };
    use crate::services::notifications::NotificationServiceDependencies;
    use crate::transport::EventStream;

    use super::*;

    const RING_TIMEOUT: Duration = Duration::from_secs(30);

    struct Fixture {
        signals: Arc<InMemoryCallSignalRepository>,
        notifications: Arc<InMemoryNotificationRepository>,
        profiles: Arc<InMemoryProfileRepository>,
        push: Arc<RecordingPushSender>,
        transport: Arc<MemoryTransport>,
        clock: Arc<ManualClock>,
    }

    struct Party {
        service: CallSignaling,
        events: broadcast::Receiver<ClientEvent>,
        feed: EventStream,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                signals: Arc::new(InMemoryCallSignalRepository::new()),
                notifications: Arc::new(InMemoryNotificationRepository::new()),
                profiles: Arc::new(InMemoryProfileRepository::new()),
                push: Arc::new(RecordingPushSender::new()),
                transport: Arc::new(MemoryTransport::new(64)),
                clock: Arc::new(ManualClock::default()),
            }
        }

        async fn user(&self, display_name: &str) -> UserId {
            let user_id = UserId::from(Uuid::new_v4());
            self.profiles
                .put(UserProfile::new(user_id, display_name, None))
                .await;
            user_id
        }

        async fn party(&self, user_id: UserId) -> Party {
            let events = Arc::new(ClientEvents::new(32));
            let notifications = Arc::new(NotificationService::new(NotificationServiceDependencies {
                notifications: self.notifications.clone(),
                push: self.push.clone(),
                transport: self.transport.clone(),
                clock: self.clock.clone(),
            }));
            let service = CallSignaling::new(
                CallSignalingDependencies {
                    signals: self.signals.clone(),
                    profiles: self.profiles.clone(),
                    notifications,
                    transport: self.transport.clone(),
                    clock: self.clock.clone(),
                    events: events.clone(),
                },
                user_id,
                RING_TIMEOUT,
            );
            let feed = self
                .transport
                .subscribe(&feed_topic(
                    ChangeTable::CallSignals,
                    ChangeFilter::Callee(user_id),
                ))
                .await
                .unwrap();
            Party {
                service,
                events: events.subscribe(),
                feed,
            }
        }

        async fn signal_status(&self, id: SignalId) -> SignalStatus {
            self.signals.find_by_id(id).await.unwrap().unwrap().status
        }
    }

    /// 从变更流取出一条信令并交给对端处理，模拟传输层送达
    async fn relay(feed: &mut EventStream, to: &CallSignaling) -> CallSignal {
        match feed.try_recv() {
            Some(RealtimeEvent::SignalInserted { signal }) => {
                to.handle_signal(signal.clone()).await;
                signal
            }
            other => panic!("expected a signal event, got {:?}", other),
        }
    }

    fn next_event(receiver: &mut broadcast::Receiver<ClientEvent>) -> ClientEvent {
        receiver.try_recv().expect("expected a buffered client event")
    }

    /// 把两端推进到接通态，返回建立通话的 offer
    async fn connect(caller: &mut Party, callee: &mut Party) -> CallSignal {
        let conversation_id = ConversationId::from(Uuid::new_v4());
        let callee_id = callee.service.inner.user_id;
        caller
            .service
            .start_call(conversation_id, callee_id, CallType::Voice, json!({"sdp": "v=0"}))
            .await
            .unwrap()
            .expect("idle caller should dial");
        let offer = relay(&mut callee.feed, &callee.service).await;
        callee
            .service
            .accept(json!({"sdp": "v=0 answer"}))
            .await
            .unwrap();
        relay(&mut caller.feed, &caller.service).await;
        offer
    }

    #[tokio::test]
    async fn offer_rings_the_callee() {
        let fixture = Fixture::new();
        let alice = fixture.user("Alice").await;
        let bob = fixture.user("Bob").await;
        let conversation_id = ConversationId::from(Uuid::new_v4());

        let mut caller = fixture.party(alice).await;
        let mut callee = fixture.party(bob).await;

        let signal_id = caller
            .service
            .start_call(conversation_id, bob, CallType::Video, json!({"sdp": "v=0"}))
            .await
            .unwrap()
            .expect("idle caller should dial");

        assert_eq!(
            caller.service.state().await,
            CallState::Dialing {
                conversation_id,
                peer_id: bob,
                peer_name: "Bob".to_string(),
                call_type: CallType::Video,
            }
        );

        let offer = relay(&mut callee.feed, &callee.service).await;
        assert_eq!(offer.id, signal_id);

        match next_event(&mut callee.events) {
            ClientEvent::IncomingCall {
                signal,
                caller_name,
            } => {
                assert_eq!(signal.id, signal_id);
                assert_eq!(caller_name, "Alice");
            }
            other => panic!("expected IncomingCall, got {:?}", other),
        }
        match next_event(&mut callee.events) {
            ClientEvent::CallStateChanged { state } => {
                assert!(matches!(state, CallState::Ringing { .. }));
            }
            other => panic!("expected CallStateChanged, got {:?}", other),
        }

        // 被叫同时收到来电通知和推送
        let rows = fixture.notifications.for_user(bob).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].kind, notification_kinds::INCOMING_CALL);
        assert_eq!(fixture.push.sent().await.len(), 1);
    }

    #[tokio::test]
    async fn accept_connects_both_sides() {
        let fixture = Fixture::new();
        let alice = fixture.user("Alice").await;
        let bob = fixture.user("Bob").await;
        let conversation_id = ConversationId::from(Uuid::new_v4());

        let mut caller = fixture.party(alice).await;
        let mut callee = fixture.party(bob).await;

        caller
            .service
            .start_call(conversation_id, bob, CallType::Voice, json!({"sdp": "v=0"}))
            .await
            .unwrap();
        let offer = relay(&mut callee.feed, &callee.service).await;

        callee
            .service
            .accept(json!({"sdp": "v=0 answer"}))
            .await
            .unwrap();
        assert_eq!(
            callee.service.state().await,
            CallState::Active {
                conversation_id,
                peer_id: alice,
                peer_name: "Alice".to_string(),
                call_type: CallType::Voice,
            }
        );

        let answer = relay(&mut caller.feed, &caller.service).await;
        assert!(matches!(answer.payload, SignalPayload::Answer { .. }));
        assert_eq!(answer.callee_id, alice);

        // 主叫端看到接听和状态迁移
        assert!(matches!(
            next_event(&mut caller.events),
            ClientEvent::CallStateChanged {
                state: CallState::Dialing { .. }
            }
        ));
        match next_event(&mut caller.events) {
            ClientEvent::CallAnswered { signal } => assert_eq!(signal.id, answer.id),
            other => panic!("expected CallAnswered, got {:?}", other),
        }
        assert!(matches!(
            next_event(&mut caller.events),
            ClientEvent::CallStateChanged {
                state: CallState::Active { .. }
            }
        ));

        assert_eq!(fixture.signal_status(offer.id).await, SignalStatus::Accepted);
        assert_eq!(
            fixture.signal_status(answer.id).await,
            SignalStatus::Accepted
        );
    }

    #[tokio::test]
    async fn reject_ends_the_pending_offer() {
        let fixture = Fixture::new();
        let alice = fixture.user("Alice").await;
        let bob = fixture.user("Bob").await;
        let conversation_id = ConversationId::from(Uuid::new_v4());

        let mut caller = fixture.party(alice).await;
        let mut callee = fixture.party(bob).await;

        caller
            .service
            .start_call(conversation_id, bob, CallType::Voice, json!({"sdp": "v=0"}))
            .await
            .unwrap();
        let offer = relay(&mut callee.feed, &callee.service).await;

        callee.service.reject().await;
        assert_eq!(callee.service.state().await, CallState::Idle);

        let end = relay(&mut caller.feed, &caller.service).await;
        assert!(matches!(
            end.payload,
            SignalPayload::End {
                reason: EndReason::Rejected
            }
        ));
        assert_eq!(caller.service.state().await, CallState::Idle);
        assert_eq!(fixture.signal_status(offer.id).await, SignalStatus::Rejected);

        // 主叫端界面收到结束
        assert!(matches!(
            next_event(&mut caller.events),
            ClientEvent::CallStateChanged {
                state: CallState::Dialing { .. }
            }
        ));
        assert_eq!(
            next_event(&mut caller.events),
            ClientEvent::CallStateChanged {
                state: CallState::Ended {
                    reason: EndReason::Rejected
                }
            }
        );
    }

    #[tokio::test]
    async fn second_caller_gets_busy() {
        let fixture = Fixture::new();
        let alice = fixture.user("Alice").await;
        let bob = fixture.user("Bob").await;
        let carol = fixture.user("Carol").await;

        let mut caller = fixture.party(alice).await;
        let mut callee = fixture.party(bob).await;
        let mut late_caller = fixture.party(carol).await;

        connect(&mut caller, &mut callee).await;

        let conversation_id = ConversationId::from(Uuid::new_v4());
        late_caller
            .service
            .start_call(conversation_id, bob, CallType::Voice, json!({"sdp": "v=0"}))
            .await
            .unwrap();
        let second_offer = relay(&mut callee.feed, &callee.service).await;

        // 现有通话不受影响
        assert!(matches!(
            callee.service.state().await,
            CallState::Active { .. }
        ));

        let end = relay(&mut late_caller.feed, &late_caller.service).await;
        assert!(matches!(
            end.payload,
            SignalPayload::End {
                reason: EndReason::Busy
            }
        ));
        assert_eq!(late_caller.service.state().await, CallState::Idle);
        assert_eq!(
            fixture.signal_status(second_offer.id).await,
            SignalStatus::Rejected
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_call_times_out_as_missed() {
        let fixture = Fixture::new();
        let alice = fixture.user("Alice").await;
        let bob = fixture.user("Bob").await;
        let conversation_id = ConversationId::from(Uuid::new_v4());

        // 被叫整个离线，没有任何一端替它收信令
        let mut caller = fixture.party(alice).await;

        let signal_id = caller
            .service
            .start_call(conversation_id, bob, CallType::Voice, json!({"sdp": "v=0"}))
            .await
            .unwrap()
            .expect("idle caller should dial");

        assert!(matches!(
            next_event(&mut caller.events),
            ClientEvent::CallStateChanged {
                state: CallState::Dialing { .. }
            }
        ));

        // 响铃窗口耗尽
        let event = caller.events.recv().await.unwrap();
        assert_eq!(
            event,
            ClientEvent::CallStateChanged {
                state: CallState::Ended {
                    reason: EndReason::Missed
                }
            }
        );
        assert_eq!(caller.service.state().await, CallState::Idle);

        // offer 保持 pending
        assert_eq!(fixture.signal_status(signal_id).await, SignalStatus::Pending);

        // 被叫侧先有来电通知，超时后补未接通知
        let rows = fixture.notifications.for_user(bob).await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].kind, notification_kinds::INCOMING_CALL);
        assert_eq!(rows[1].kind, notification_kinds::MISSED_CALL);
    }

    #[tokio::test]
    async fn duplicate_offer_delivery_is_ignored() {
        let fixture = Fixture::new();
        let alice = fixture.user("Alice").await;
        let bob = fixture.user("Bob").await;
        let conversation_id = ConversationId::from(Uuid::new_v4());

        let mut caller = fixture.party(alice).await;
        let mut callee = fixture.party(bob).await;

        caller
            .service
            .start_call(conversation_id, bob, CallType::Voice, json!({"sdp": "v=0"}))
            .await
            .unwrap();
        let offer = relay(&mut callee.feed, &callee.service).await;
        callee.service.handle_signal(offer.clone()).await;

        // 只振铃一次，也没有误回 busy
        assert!(matches!(
            next_event(&mut callee.events),
            ClientEvent::IncomingCall { .. }
        ));
        assert!(matches!(
            next_event(&mut callee.events),
            ClientEvent::CallStateChanged { .. }
        ));
        assert!(callee.events.try_recv().is_err());
        assert!(caller.feed.try_recv().is_none());
        assert!(matches!(
            callee.service.state().await,
            CallState::Ringing { .. }
        ));
    }

    #[tokio::test]
    async fn controls_without_a_call_are_ignored() {
        let fixture = Fixture::new();
        let bob = fixture.user("Bob").await;
        let mut party = fixture.party(bob).await;

        party.service.accept(json!({"sdp": "late"})).await.unwrap();
        party.service.reject().await;
        party.service.hang_up().await;
        party.service.send_candidate(json!({"candidate": "a"})).await;

        assert_eq!(party.service.state().await, CallState::Idle);
        assert!(party.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn hang_up_reaches_the_peer() {
        let fixture = Fixture::new();
        let alice = fixture.user("Alice").await;
        let bob = fixture.user("Bob").await;

        let mut caller = fixture.party(alice).await;
        let mut callee = fixture.party(bob).await;
        let offer = connect(&mut caller, &mut callee).await;

        caller.service.hang_up().await;
        assert_eq!(caller.service.state().await, CallState::Idle);

        let end = relay(&mut callee.feed, &callee.service).await;
        assert!(matches!(
            end.payload,
            SignalPayload::End {
                reason: EndReason::Hangup
            }
        ));
        assert_eq!(callee.service.state().await, CallState::Idle);
        assert_eq!(fixture.signal_status(offer.id).await, SignalStatus::Ended);

        // 被叫端：振铃、响铃态、接通态之后是挂断
        assert!(matches!(
            next_event(&mut callee.events),
            ClientEvent::IncomingCall { .. }
        ));
        assert!(matches!(
            next_event(&mut callee.events),
            ClientEvent::CallStateChanged {
                state: CallState::Ringing { .. }
            }
        ));
        assert!(matches!(
            next_event(&mut callee.events),
            ClientEvent::CallStateChanged {
                state: CallState::Active { .. }
            }
        ));
        assert_eq!(
            next_event(&mut callee.events),
            ClientEvent::CallStateChanged {
                state: CallState::Ended {
                    reason: EndReason::Hangup
                }
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn answered_call_outlives_the_ring_window() {
        let fixture = Fixture::new();
        let alice = fixture.user("Alice").await;
        let bob = fixture.user("Bob").await;

        let mut caller = fixture.party(alice).await;
        let mut callee = fixture.party(bob).await;
        connect(&mut caller, &mut callee).await;

        while caller.events.try_recv().is_ok() {}
        while callee.events.try_recv().is_ok() {}

        tokio::time::advance(RING_TIMEOUT * 2).await;
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        // 双方定时器都已作废，通话保持接通
        assert!(matches!(
            caller.service.state().await,
            CallState::Active { .. }
        ));
        assert!(matches!(
            callee.service.state().await,
            CallState::Active { .. }
        ));
        assert!(caller.events.try_recv().is_err());
        assert!(callee.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn candidates_relay_between_parties() {
        let fixture = Fixture::new();
        let alice = fixture.user("Alice").await;
        let bob = fixture.user("Bob").await;

        let mut caller = fixture.party(alice).await;
        let mut callee = fixture.party(bob).await;
        connect(&mut caller, &mut callee).await;
        while callee.events.try_recv().is_ok() {}

        caller
            .service
            .send_candidate(json!({"candidate": "cand-1"}))
            .await;

        let signal = relay(&mut callee.feed, &callee.service).await;
        assert!(matches!(signal.payload, SignalPayload::Candidate { .. }));
        match next_event(&mut callee.events) {
            ClientEvent::CallCandidate { signal: relayed } => assert_eq!(relayed.id, signal.id),
            other => panic!("expected CallCandidate, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn redial_supersedes_a_stale_pending_offer() {
        let fixture = Fixture::new();
        let alice = fixture.user("Alice").await;
        let bob = fixture.user("Bob").await;
        let conversation_id = ConversationId::from(Uuid::new_v4());

        // 上次进程异常退出残留的未决 offer
        let stale = fixture
            .signals
            .insert(CallSignal::offer(
                conversation_id,
                alice,
                bob,
                CallType::Voice,
                json!({"sdp": "old"}),
                fixture.clock.now(),
            ))
            .await
            .unwrap();

        let caller = fixture.party(alice).await;
        caller
            .service
            .start_call(conversation_id, bob, CallType::Voice, json!({"sdp": "new"}))
            .await
            .unwrap();

        assert_eq!(fixture.signal_status(stale.id).await, SignalStatus::Ended);
    }
}
