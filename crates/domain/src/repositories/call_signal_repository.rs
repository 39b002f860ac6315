//! 通话信令仓储接口定义

use async_trait::async_trait;

use crate::entities::{CallSignal, SignalStatus};
use crate::errors::RepositoryError;
use crate::value_objects::{SignalId, UserId};

#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait CallSignalRepository: Send + Sync {
    /// 插入信令记录；发起/接听通话时这一步的失败对用户可见
    async fn insert(&self, signal: CallSignal) -> Result<CallSignal, RepositoryError>;

    /// 根据ID查找信令记录
    async fn find_by_id(&self, id: SignalId) -> Result<Option<CallSignal>, RepositoryError>;

    /// 更新信令记录状态
    async fn update_status(&self, id: SignalId, status: SignalStatus)
        -> Result<(), RepositoryError>;

    /// 将 (caller, callee) 对上仍处于 pending 的 offer 置为 ended。
    /// 新的呼叫发起前调用，保证同一有序对最多一条未决 offer。
    /// 返回受影响的记录数。
    async fn supersede_pending_offers(
        &self,
        caller_id: UserId,
        callee_id: UserId,
    ) -> Result<u64, RepositoryError>;
}
