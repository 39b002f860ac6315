//! Repository实现模块
//!
//! 领域仓储端口的 Postgres 实现，按聚合一文件

pub mod call_signal_repository_impl;
pub mod conversation_repository_impl;
pub mod message_repository_impl;
pub mod notification_repository_impl;
pub mod profile_repository_impl;
pub mod reaction_repository_impl;

// 重新导出所有Repository实现
pub use call_signal_repository_impl::*;
pub use conversation_repository_impl::*;
pub use message_repository_impl::*;
pub use notification_repository_impl::*;
pub use profile_repository_impl::*;
pub use reaction_repository_impl::*;
