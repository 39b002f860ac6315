//! 用户资料仓储接口定义

use async_trait::async_trait;

use crate::entities::UserProfile;
use crate::errors::RepositoryError;
use crate::value_objects::UserId;

#[cfg_attr(feature = "testing", mockall::automock)]
#[async_trait]
pub trait ProfileRepository: Send + Sync {
    /// 查找用户展示资料（来电界面、通知文案）
    async fn find_by_id(&self, id: UserId) -> Result<Option<UserProfile>, RepositoryError>;
}
