//! 在场状态追踪
//!
//! 订阅方侧的在场视图。全量快照是权威状态，快照携带采集时间戳，
//! 只有不早于当前水位的快照才会被应用；joined/left 增量在两次快照
//! 之间即时生效，同样推进水位。乱序到达的旧快照因此不会把刚上线
//! 的用户又判成离线。

use std::collections::HashMap;

use domain::{PresenceEntry, PresenceSnapshot, Timestamp, UserId};
use tokio::sync::RwLock;

struct PresenceState {
    entries: HashMap<UserId, Vec<PresenceEntry>>,
    watermark: Option<Timestamp>,
}

/// 单个主题的在场追踪器
pub struct PresenceTracker {
    state: RwLock<PresenceState>,
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(PresenceState {
                entries: HashMap::new(),
                watermark: None,
            }),
        }
    }

    /// 应用全量快照；早于水位的快照被忽略，返回是否生效
    pub async fn apply_sync(&self, snapshot: &PresenceSnapshot) -> bool {
        let mut state = self.state.write().await;
        if let Some(watermark) = state.watermark {
            if snapshot.captured_at < watermark {
                tracing::debug!(
                    captured_at = %snapshot.captured_at,
                    watermark = %watermark,
                    "stale presence snapshot ignored"
                );
                return false;
            }
        }

        let mut entries: HashMap<UserId, Vec<PresenceEntry>> = HashMap::new();
        for entry in snapshot.entries.values().flatten() {
            entries.entry(entry.user_id).or_default().push(entry.clone());
        }
        state.entries = entries;
        state.watermark = Some(snapshot.captured_at);
        true
    }

    /// 应用增量加入
    pub async fn apply_join(&self, entry: PresenceEntry, at: Timestamp) {
        let mut state = self.state.write().await;
        state.entries.entry(entry.user_id).or_default().push(entry);
        state.watermark = Some(state.watermark.map_or(at, |w| w.max(at)));
    }

    /// 应用增量离开；移除该用户的全部条目
    pub async fn apply_leave(&self, user_id: UserId, at: Timestamp) {
        let mut state = self.state.write().await;
        state.entries.remove(&user_id);
        state.watermark = Some(state.watermark.map_or(at, |w| w.max(at)));
    }

    pub async fn is_online(&self, user_id: UserId) -> bool {
        let state = self.state.read().await;
        state
            .entries
            .get(&user_id)
            .is_some_and(|entries| !entries.is_empty())
    }

    /// 当前在线的用户，按ID排序
    pub async fn online_users(&self) -> Vec<UserId> {
        let state = self.state.read().await;
        let mut users: Vec<UserId> = state
            .entries
            .iter()
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(user_id, _)| *user_id)
            .collect();
        users.sort_by_key(|id| id.0);
        users
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    use super::*;

    fn user() -> UserId {
        UserId::from(Uuid::new_v4())
    }

    #[tokio::test]
    async fn snapshot_is_authoritative() {
        let tracker = PresenceTracker::new();
        let (alice, bob) = (user(), user());
        let now = Utc::now();

        let mut snapshot = PresenceSnapshot::new(now);
        snapshot.insert(alice.to_string(), PresenceEntry::new(alice, now));
        snapshot.insert(bob.to_string(), PresenceEntry::new(bob, now));
        assert!(tracker.apply_sync(&snapshot).await);

        assert!(tracker.is_online(alice).await);
        assert!(tracker.is_online(bob).await);

        // 下一份快照里 bob 不见了，视图随之收敛
        let mut snapshot = PresenceSnapshot::new(now + Duration::seconds(1));
        snapshot.insert(alice.to_string(), PresenceEntry::new(alice, now));
        assert!(tracker.apply_sync(&snapshot).await);

        assert!(tracker.is_online(alice).await);
        assert!(!tracker.is_online(bob).await);
    }

    #[tokio::test]
    async fn stale_snapshot_does_not_regress_state() {
        let tracker = PresenceTracker::new();
        let alice = user();
        let now = Utc::now();

        tracker
            .apply_join(PresenceEntry::new(alice, now), now)
            .await;

        // 水位已推进到 now，更早采集的空快照不得生效
        let stale = PresenceSnapshot::new(now - Duration::seconds(10));
        assert!(!tracker.apply_sync(&stale).await);
        assert!(tracker.is_online(alice).await);
    }

    #[tokio::test]
    async fn join_and_leave_update_view() {
        let tracker = PresenceTracker::new();
        let alice = user();
        let now = Utc::now();

        tracker
            .apply_join(PresenceEntry::new(alice, now), now)
            .await;
        assert!(tracker.is_online(alice).await);

        tracker.apply_leave(alice, now + Duration::seconds(1)).await;
        assert!(!tracker.is_online(alice).await);
        assert!(tracker.online_users().await.is_empty());
    }
}
