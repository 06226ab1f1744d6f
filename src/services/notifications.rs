//! Per-user notifications.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::auth::{Access, Caller, DownstreamAuthGuard};
use crate::error::{GatewayError, GatewayResult};
use crate::rpc::{RpcServer, operation, service};
use crate::services::{Ack, Empty};

service!(
    NotificationService = "gateway.notifications.NotificationService",
    registry = "notifications"
);

operation!(CreateNotification on NotificationService, "Create", NewNotification => Notification);
operation!(
    /// Notifications addressed to the caller.
    ListNotifications on NotificationService, "List", Empty => Vec<Notification>
);
operation!(
    /// Mark some of the caller's notifications as read.
    CheckNotifications on NotificationService, "Check", CheckRequest => Ack
);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewNotification {
    pub message: String,
    pub level: NotificationLevel,
    /// Recipient user id.
    pub recipient: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub message: String,
    pub level: NotificationLevel,
    pub recipient: i64,
    pub created_at: DateTime<Utc>,
    pub checked: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckRequest {
    pub ids: Vec<i64>,
}

pub trait NotificationStore: Send + Sync + 'static {
    fn create(
        &self,
        notification: NewNotification,
    ) -> impl Future<Output = GatewayResult<Notification>> + Send;

    fn list_for(&self, caller: &Caller) -> impl Future<Output = GatewayResult<Vec<Notification>>> + Send;

    /// Mark `ids` as checked. Ids that do not belong to the caller are
    /// ignored; the count of marked notifications is returned.
    fn check(&self, caller: &Caller, ids: &[i64]) -> impl Future<Output = GatewayResult<usize>> + Send;
}

#[derive(Default)]
struct NotificationTable {
    next_id: i64,
    rows: Vec<Notification>,
}

/// Process-local [`NotificationStore`].
#[derive(Default)]
pub struct InMemoryNotifications {
    table: RwLock<NotificationTable>,
}

impl InMemoryNotifications {
    pub fn new() -> Self {
        Self::default()
    }
}

impl NotificationStore for InMemoryNotifications {
    async fn create(&self, notification: NewNotification) -> GatewayResult<Notification> {
        if notification.message.trim().is_empty() {
            return Err(GatewayError::Validation("empty notification message".to_string()));
        }

        let mut table = self.table.write();
        table.next_id += 1;
        let row = Notification {
            id: table.next_id,
            message: notification.message,
            level: notification.level,
            recipient: notification.recipient,
            created_at: Utc::now(),
            checked: false,
        };
        table.rows.push(row.clone());
        Ok(row)
    }

    async fn list_for(&self, caller: &Caller) -> GatewayResult<Vec<Notification>> {
        let user_id = caller.claims()?.user_id;
        Ok(self
            .table
            .read()
            .rows
            .iter()
            .filter(|n| n.recipient == user_id)
            .cloned()
            .collect())
    }

    async fn check(&self, caller: &Caller, ids: &[i64]) -> GatewayResult<usize> {
        let user_id = caller.claims()?.user_id;
        let mut table = self.table.write();
        let mut marked = 0;
        for row in table
            .rows
            .iter_mut()
            .filter(|n| n.recipient == user_id && ids.contains(&n.id))
        {
            row.checked = true;
            marked += 1;
        }
        Ok(marked)
    }
}

pub fn notifications_server<N: NotificationStore>(
    store: Arc<N>,
    guard: DownstreamAuthGuard,
) -> RpcServer<NotificationService> {
    let create = store.clone();
    let list = store.clone();
    let check = store;

    RpcServer::builder(guard)
        .route::<CreateNotification, _, _>(Access::Authenticated, move |_, req: NewNotification| {
            let store = create.clone();
            async move { store.create(req).await }
        })
        .route::<ListNotifications, _, _>(Access::Authenticated, move |caller, _: Empty| {
            let store = list.clone();
            async move { store.list_for(&caller).await }
        })
        .route::<CheckNotifications, _, _>(Access::Authenticated, move |caller, req: CheckRequest| {
            let store = check.clone();
            async move {
                let marked = store.check(&caller, &req.ids).await?;
                Ok(Ack::new(format!("Checked {}", marked)))
            }
        })
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Claims, Role};

    fn user(user_id: i64) -> Caller {
        Caller::User(Claims {
            user_id,
            role: Role::User,
            iat: 0,
            exp: i64::MAX,
        })
    }

    fn note(recipient: i64, message: &str) -> NewNotification {
        NewNotification {
            message: message.to_string(),
            level: NotificationLevel::Info,
            recipient,
        }
    }

    #[tokio::test]
    async fn test_list_only_returns_callers_notifications() {
        let store = InMemoryNotifications::new();
        store.create(note(1, "for one")).await.unwrap();
        store.create(note(2, "for two")).await.unwrap();
        store.create(note(1, "also for one")).await.unwrap();

        let mine = store.list_for(&user(1)).await.unwrap();
        assert_eq!(mine.len(), 2);
        assert!(mine.iter().all(|n| n.recipient == 1 && !n.checked));
    }

    #[tokio::test]
    async fn test_check_ignores_foreign_ids() {
        let store = InMemoryNotifications::new();
        let own = store.create(note(1, "mine")).await.unwrap();
        let foreign = store.create(note(2, "theirs")).await.unwrap();

        let marked = store.check(&user(1), &[own.id, foreign.id]).await.unwrap();
        assert_eq!(marked, 1);
        assert!(store.list_for(&user(1)).await.unwrap()[0].checked);
        assert!(!store.list_for(&user(2)).await.unwrap()[0].checked);
    }

    #[tokio::test]
    async fn test_empty_message_is_rejected() {
        let store = InMemoryNotifications::new();
        assert!(matches!(
            store.create(note(1, "  ")).await,
            Err(GatewayError::Validation(_))
        ));
    }

    #[test]
    fn test_level_uses_lowercase_names() {
        assert_eq!(
            serde_json::to_string(&NotificationLevel::Warning).unwrap(),
            "\"warning\""
        );
    }
}
