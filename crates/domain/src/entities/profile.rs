//! 用户资料实体定义

use serde::{Deserialize, Serialize};

use crate::value_objects::UserId;

/// 用户展示资料，来电界面与通知文案使用的只读数据
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
}

impl UserProfile {
    pub fn new(id: UserId, display_name: impl Into<String>, avatar_url: Option<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            avatar_url,
        }
    }
}
