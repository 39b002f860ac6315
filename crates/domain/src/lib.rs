//! 双人会话实时协调核心领域模型
//!
//! 包含消息、通话信令、会话、通知等核心实体，实时事件模型，
//! 以及各聚合的仓储接口。

pub mod entities;
pub mod errors;
pub mod events;
pub mod repositories;
pub mod value_objects;

// 重新导出常用类型
pub use entities::*;
pub use errors::*;
pub use events::*;
pub use repositories::*;
pub use value_objects::*;
