//! Backend service contracts.
//!
//! Each submodule declares one service: its descriptor, its typed
//! operations, a collaborator trait holding the business logic, an in-memory
//! implementation of that trait and a `*_server` function that mounts the
//! operations behind the [`DownstreamAuthGuard`](crate::auth::DownstreamAuthGuard).

pub mod auth;
pub mod notifications;
pub mod support;
pub mod user;

use serde::{Deserialize, Serialize};

pub use auth::{AuthService, auth_server};
pub use notifications::{InMemoryNotifications, NotificationService, notifications_server};
pub use support::{InMemorySupport, SupportService, support_server};
pub use user::{InMemoryUsers, UserService, user_server};

/// Request body of operations that take no input.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Empty {}

/// Plain acknowledgement returned by state-changing operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub message: String,
}

impl Ack {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
