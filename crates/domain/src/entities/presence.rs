//! 在场状态模型
//!
//! 在场数据只存在于传输层，不做持久化；条目由客户端在附加主题时写入，
//! 断开后由传输层自动收回。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::value_objects::{Timestamp, UserId};

/// 单个在场条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    /// 条目归属用户
    pub user_id: UserId,
    /// 加入时间
    pub joined_at: Timestamp,
    /// 展示元数据（昵称、头像等），对本系统不透明
    pub meta: JsonValue,
}

impl PresenceEntry {
    pub fn new(user_id: UserId, joined_at: Timestamp) -> Self {
        Self {
            user_id,
            joined_at,
            meta: JsonValue::Object(serde_json::Map::new()),
        }
    }

    pub fn with_meta(mut self, meta: JsonValue) -> Self {
        self.meta = meta;
        self
    }
}

/// 某主题的全量在场快照
///
/// `captured_at` 是单调性水位：追踪器只接受不早于当前水位的快照。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceSnapshot {
    /// 在场键 -> 条目列表
    pub entries: HashMap<String, Vec<PresenceEntry>>,
    /// 快照采集时间
    pub captured_at: Timestamp,
}

impl PresenceSnapshot {
    pub fn new(captured_at: Timestamp) -> Self {
        Self {
            entries: HashMap::new(),
            captured_at,
        }
    }

    /// 追加一个键下的条目
    pub fn insert(&mut self, key: impl Into<String>, entry: PresenceEntry) {
        self.entries.entry(key.into()).or_default().push(entry);
    }

    /// 快照中出现的全部用户
    pub fn users(&self) -> Vec<UserId> {
        let mut users: Vec<UserId> = self
            .entries
            .values()
            .flatten()
            .map(|entry| entry.user_id)
            .collect();
        users.sort_by_key(|id| id.0);
        users.dedup();
        users
    }

    pub fn is_empty(&self) -> bool {
        self.entries.values().all(|entries| entries.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;

    #[test]
    fn snapshot_collects_unique_users() {
        let user = UserId::from(Uuid::new_v4());
        let other = UserId::from(Uuid::new_v4());
        let now = Utc::now();

        let mut snapshot = PresenceSnapshot::new(now);
        assert!(snapshot.is_empty());

        snapshot.insert(user.to_string(), PresenceEntry::new(user, now));
        snapshot.insert(user.to_string(), PresenceEntry::new(user, now));
        snapshot.insert(other.to_string(), PresenceEntry::new(other, now));

        let users = snapshot.users();
        assert_eq!(users.len(), 2);
        assert!(users.contains(&user));
        assert!(users.contains(&other));
        assert!(!snapshot.is_empty());
    }
}
