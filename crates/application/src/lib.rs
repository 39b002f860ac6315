//! 应用层实现。
//!
//! 这里装配会话的实时用例：频道接入与在场、消息同步与已读回执、
//! 输入指示、通话信令、通知与回应。对传输、时钟、推送等外部
//! 适配器只依赖端口，具体实现由基础设施层提供。

pub mod channels;
pub mod client_events;
pub mod clock;
pub mod error;
pub mod memory;
pub mod presence;
pub mod push;
pub mod runtime;
pub mod services;
pub mod transport;
pub mod typing;

pub use channels::{ChannelHandle, ChannelOptions, ChannelRegistry};
pub use client_events::{ClientEvent, ClientEvents, ClientNotification, UserReaction};
pub use clock::{Clock, SystemClock};
pub use error::ApplicationError;
pub use presence::PresenceTracker;
pub use push::{NoopPushSender, PushError, PushRequest, PushSender};
pub use runtime::{ConversationSession, RealtimeRuntime, RuntimeDependencies};
pub use services::{
    CallSignaling, CallSignalingDependencies, CallState, MessageSyncDependencies,
    MessageSyncService, NotificationService, NotificationServiceDependencies, ReactionService,
    ReactionServiceDependencies,
};
pub use transport::{EventStream, RealtimeTransport, TransportError};
pub use typing::TypingCoordinator;
