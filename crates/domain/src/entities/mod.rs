//! 核心实体定义

pub mod call_signal;
pub mod conversation;
pub mod message;
pub mod notification;
pub mod presence;
pub mod profile;
pub mod reaction;

pub use call_signal::{CallSignal, CallType, EndReason, SignalPayload, SignalStatus};
pub use conversation::Conversation;
pub use message::{Message, MessageContent, MAX_MESSAGE_CHARS};
pub use notification::{notification_kinds, Notification};
pub use presence::{PresenceEntry, PresenceSnapshot};
pub use profile::UserProfile;
pub use reaction::{Reaction, MAX_EMOJI_CHARS};
