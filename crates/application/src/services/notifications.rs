//! 通知编排
//!
//! 先持久化通知行，再把行插入事件发到用户的通知变更流，最后按需
//! 触发离线推送。落库失败向调用方传递；事件广播和推送尽力而为，
//! 失败只记日志。

use std::sync::Arc;

use domain::{
    notification_kinds, CallType, ConversationId, Notification, NotificationId,
    NotificationRepository, RealtimeEvent, UserId,
};

use crate::client_events::display_title;
use crate::clock::Clock;
use crate::error::ApplicationError;
use crate::push::{PushRequest, PushSender};
use crate::transport::RealtimeTransport;

/// 会话的应用内路由。通知表没有会话外键，清理未读时靠这个路由对账。
pub fn conversation_url(conversation_id: ConversationId) -> String {
    format!("/conversations/{}", conversation_id)
}

pub struct NotificationServiceDependencies {
    pub notifications: Arc<dyn NotificationRepository>,
    pub push: Arc<dyn PushSender>,
    pub transport: Arc<dyn RealtimeTransport>,
    pub clock: Arc<dyn Clock>,
}

pub struct NotificationService {
    notifications: Arc<dyn NotificationRepository>,
    push: Arc<dyn PushSender>,
    transport: Arc<dyn RealtimeTransport>,
    clock: Arc<dyn Clock>,
}

impl NotificationService {
    pub fn new(dependencies: NotificationServiceDependencies) -> Self {
        Self {
            notifications: dependencies.notifications,
            push: dependencies.push,
            transport: dependencies.transport,
            clock: dependencies.clock,
        }
    }

    /// 新消息通知；`with_push` 由调用方依据对端在场状态决定
    pub async fn notify_new_message(
        &self,
        recipient: UserId,
        sender_name: &str,
        conversation_id: ConversationId,
        preview: &str,
        with_push: bool,
    ) -> Result<Notification, ApplicationError> {
        let content = format!("{}: {}", sender_name, preview);
        self.deliver(
            recipient,
            notification_kinds::NEW_MESSAGE,
            content,
            conversation_id,
            with_push,
        )
        .await
    }

    /// 来电通知，始终附带推送：离线设备就靠它知道有人在呼叫
    pub async fn notify_incoming_call(
        &self,
        recipient: UserId,
        caller_name: &str,
        call_type: CallType,
        conversation_id: ConversationId,
    ) -> Result<Notification, ApplicationError> {
        let content = format!("{} is starting a {} call", caller_name, call_type);
        self.deliver(
            recipient,
            notification_kinds::INCOMING_CALL,
            content,
            conversation_id,
            true,
        )
        .await
    }

    /// 未接来电通知，响铃超时后由主叫方写入
    pub async fn notify_missed_call(
        &self,
        recipient: UserId,
        caller_name: &str,
        call_type: CallType,
        conversation_id: ConversationId,
    ) -> Result<Notification, ApplicationError> {
        let content = format!("You missed a {} call from {}", call_type, caller_name);
        self.deliver(
            recipient,
            notification_kinds::MISSED_CALL,
            content,
            conversation_id,
            true,
        )
        .await
    }

    async fn deliver(
        &self,
        recipient: UserId,
        kind: &'static str,
        content: String,
        conversation_id: ConversationId,
        with_push: bool,
    ) -> Result<Notification, ApplicationError> {
        let now = self.clock.now();
        let action_url = conversation_url(conversation_id);
        let notification =
            Notification::new(recipient, kind, content, Some(action_url.clone()), now);
        let notification = self.notifications.create(notification).await?;

        let event = RealtimeEvent::NotificationInserted {
            notification: notification.clone(),
        };
        if let Err(error) = self.transport.publish(&event.topic(), &event).await {
            tracing::error!(
                error = %error,
                notification_id = %notification.id,
                "notification event publish failed"
            );
        }

        if with_push {
            let request = PushRequest {
                title: display_title(kind).to_string(),
                message: notification.content.clone(),
                user_ids: vec![recipient],
                url: action_url,
            };
            if let Err(error) = self.push.send(request).await {
                tracing::error!(
                    error = %error,
                    notification_id = %notification.id,
                    "push delivery failed"
                );
            }
        }

        Ok(notification)
    }

    /// 标记单条通知已读
    pub async fn mark_read(&self, id: NotificationId) -> Result<(), ApplicationError> {
        self.notifications.mark_as_read(id, self.clock.now()).await?;
        Ok(())
    }

    /// 清掉某用户指向某会话的全部未读通知，返回清理条数
    pub async fn clear_for_conversation(
        &self,
        user_id: UserId,
        conversation_id: ConversationId,
    ) -> Result<u64, ApplicationError> {
        let affected = self
            .notifications
            .mark_read_by_action(user_id, &conversation_url(conversation_id), self.clock.now())
            .await?;
        Ok(affected)
    }

    pub async fn unread_count(&self, user_id: UserId) -> Result<i64, ApplicationError> {
        Ok(self.notifications.count_unread(user_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use domain::{MockNotificationRepository, RepositoryError};
    use uuid::Uuid;

    use crate::clock::SystemClock;
    use crate::memory::{InMemoryNotificationRepository, MemoryTransport, RecordingPushSender};
    use crate::transport::RealtimeTransport;

    use super::*;

    struct Fixture {
        service: NotificationService,
        repo: Arc<InMemoryNotificationRepository>,
        push: Arc<RecordingPushSender>,
        transport: Arc<MemoryTransport>,
    }

    fn fixture() -> Fixture {
        let repo = Arc::new(InMemoryNotificationRepository::new());
        let push = Arc::new(RecordingPushSender::new());
        let transport = Arc::new(MemoryTransport::new(32));
        let service = NotificationService::new(NotificationServiceDependencies {
            notifications: Arc::clone(&repo) as Arc<dyn NotificationRepository>,
            push: Arc::clone(&push) as Arc<dyn PushSender>,
            transport: Arc::clone(&transport) as Arc<dyn RealtimeTransport>,
            clock: Arc::new(SystemClock),
        });
        Fixture {
            service,
            repo,
            push,
            transport,
        }
    }

    #[tokio::test]
    async fn new_message_notification_persists_and_publishes() {
        let fx = fixture();
        let recipient = UserId::from(Uuid::new_v4());
        let conversation_id = ConversationId::from(Uuid::new_v4());

        let feed = domain::feed_topic(
            domain::ChangeTable::Notifications,
            domain::ChangeFilter::User(recipient),
        );
        let mut events = fx.transport.subscribe(&feed).await.unwrap();

        let notification = fx
            .service
            .notify_new_message(recipient, "Ada", conversation_id, "see you at 6", true)
            .await
            .unwrap();

        assert_eq!(notification.kind, notification_kinds::NEW_MESSAGE);
        assert_eq!(notification.content, "Ada: see you at 6");
        assert_eq!(
            notification.action_url.as_deref(),
            Some(conversation_url(conversation_id).as_str())
        );

        match events.recv().await.unwrap() {
            domain::RealtimeEvent::NotificationInserted { notification: row } => {
                assert_eq!(row.id, notification.id)
            }
            other => panic!("expected notification event, got {:?}", other),
        }

        let pushes = fx.push.sent().await;
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].title, "New message");
        assert_eq!(pushes[0].user_ids, vec![recipient]);
        assert_eq!(pushes[0].url, conversation_url(conversation_id));
    }

    #[tokio::test]
    async fn push_is_skipped_when_not_requested() {
        let fx = fixture();
        let recipient = UserId::from(Uuid::new_v4());
        let conversation_id = ConversationId::from(Uuid::new_v4());

        fx.service
            .notify_new_message(recipient, "Ada", conversation_id, "hi", false)
            .await
            .unwrap();

        assert!(fx.push.sent().await.is_empty());
        assert_eq!(fx.repo.count_unread(recipient).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn push_outage_does_not_fail_delivery() {
        let fx = fixture();
        fx.push.set_failing(true);
        let recipient = UserId::from(Uuid::new_v4());

        let result = fx
            .service
            .notify_missed_call(
                recipient,
                "Ada",
                CallType::Video,
                ConversationId::from(Uuid::new_v4()),
            )
            .await;

        assert!(result.is_ok());
        assert_eq!(fx.repo.count_unread(recipient).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn repository_failure_propagates() {
        let mut repo = MockNotificationRepository::new();
        repo.expect_create()
            .returning(|_| Err(RepositoryError::database("connection reset")));

        let service = NotificationService::new(NotificationServiceDependencies {
            notifications: Arc::new(repo),
            push: Arc::new(RecordingPushSender::new()),
            transport: Arc::new(MemoryTransport::new(8)),
            clock: Arc::new(SystemClock),
        });

        let result = service
            .notify_new_message(
                UserId::from(Uuid::new_v4()),
                "Ada",
                ConversationId::from(Uuid::new_v4()),
                "hi",
                false,
            )
            .await;
        assert!(matches!(result, Err(ApplicationError::Repository(_))));
    }

    #[tokio::test]
    async fn clear_uses_conversation_route() {
        let conversation_id = ConversationId::from(Uuid::new_v4());
        let user_id = UserId::from(Uuid::new_v4());
        let expected = conversation_url(conversation_id);

        let mut repo = MockNotificationRepository::new();
        repo.expect_mark_read_by_action()
            .withf(move |user, url, _| *user == user_id && url == expected)
            .returning(|_, _, _| Ok(2));

        let service = NotificationService::new(NotificationServiceDependencies {
            notifications: Arc::new(repo),
            push: Arc::new(RecordingPushSender::new()),
            transport: Arc::new(MemoryTransport::new(8)),
            clock: Arc::new(SystemClock),
        });

        let affected = service
            .clear_for_conversation(user_id, conversation_id)
            .await
            .unwrap();
        assert_eq!(affected, 2);
    }
}
