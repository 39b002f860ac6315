//! 应用服务集合

pub mod calls;
pub mod messages;
pub mod notifications;
pub mod reactions;

pub use calls::{CallSignaling, CallSignalingDependencies, CallState};
pub use messages::{MessageSyncDependencies, MessageSyncService};
pub use notifications::{NotificationService, NotificationServiceDependencies};
pub use reactions::{ReactionService, ReactionServiceDependencies};
