//! 仓储接口定义
//!
//! 按聚合划分的持久化端口；实现位于基础设施层，
//! 测试用内存实现位于应用层。

pub mod call_signal_repository;
pub mod conversation_repository;
pub mod message_repository;
pub mod notification_repository;
pub mod profile_repository;
pub mod reaction_repository;

pub use call_signal_repository::CallSignalRepository;
pub use conversation_repository::ConversationRepository;
pub use message_repository::MessageRepository;
pub use notification_repository::NotificationRepository;
pub use profile_repository::ProfileRepository;
pub use reaction_repository::{ReactionRepository, ReactionToggle};

#[cfg(feature = "testing")]
pub use call_signal_repository::MockCallSignalRepository;
#[cfg(feature = "testing")]
pub use conversation_repository::MockConversationRepository;
#[cfg(feature = "testing")]
pub use message_repository::MockMessageRepository;
#[cfg(feature = "testing")]
pub use notification_repository::MockNotificationRepository;
#[cfg(feature = "testing")]
pub use profile_repository::MockProfileRepository;
#[cfg(feature = "testing")]
pub use reaction_repository::MockReactionRepository;
