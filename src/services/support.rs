//! Support tickets and their message threads.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::auth::{Access, Caller, DownstreamAuthGuard, Role};
use crate::error::{GatewayError, GatewayResult};
use crate::rpc::{RpcServer, operation, service};
use crate::services::Empty;

service!(SupportService = "gateway.support.SupportService", registry = "support");

operation!(CreateTicket on SupportService, "CreateTicket", NewTicket => Ticket);
operation!(GetTicket on SupportService, "GetTicket", TicketRef => Ticket);
operation!(
    /// Tickets opened by the caller.
    ListTickets on SupportService, "ListTickets", Empty => Vec<Ticket>
);
operation!(
    /// Assign a ticket to the calling admin.
    AcceptTicket on SupportService, "AcceptTicket", TicketRef => Ticket
);
operation!(AddMessage on SupportService, "AddMessage", NewMessage => TicketMessage);
operation!(GetMessages on SupportService, "GetMessages", TicketRef => Vec<TicketMessage>);
operation!(ChangeStatus on SupportService, "ChangeStatus", StatusChange => Ticket);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TicketStatus {
    #[serde(rename = "opened")]
    Opened,
    #[serde(rename = "in process")]
    InProcess,
    #[serde(rename = "closed")]
    Closed,
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Opened => write!(f, "opened"),
            Self::InProcess => write!(f, "in process"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTicket {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub section: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub section: String,
    /// Author's user id.
    pub from: i64,
    /// Admin handling the ticket, once accepted.
    pub helper: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub status: TicketStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketRef {
    pub ticket_id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub ticket_id: i64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketMessage {
    pub id: i64,
    pub who: i64,
    pub ticket_id: i64,
    pub message: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub ticket_id: i64,
    pub status: TicketStatus,
}

pub trait SupportDesk: Send + Sync + 'static {
    fn create_ticket(
        &self,
        caller: &Caller,
        ticket: NewTicket,
    ) -> impl Future<Output = GatewayResult<Ticket>> + Send;

    fn get_ticket(&self, ticket_id: i64) -> impl Future<Output = GatewayResult<Ticket>> + Send;

    fn tickets_of(&self, caller: &Caller) -> impl Future<Output = GatewayResult<Vec<Ticket>>> + Send;

    fn accept_ticket(
        &self,
        caller: &Caller,
        ticket_id: i64,
    ) -> impl Future<Output = GatewayResult<Ticket>> + Send;

    fn add_message(
        &self,
        caller: &Caller,
        message: NewMessage,
    ) -> impl Future<Output = GatewayResult<TicketMessage>> + Send;

    fn messages(&self, ticket_id: i64)
    -> impl Future<Output = GatewayResult<Vec<TicketMessage>>> + Send;

    fn change_status(
        &self,
        ticket_id: i64,
        status: TicketStatus,
    ) -> impl Future<Output = GatewayResult<Ticket>> + Send;
}

#[derive(Default)]
struct Desk {
    next_ticket: i64,
    next_message: i64,
    tickets: Vec<Ticket>,
    messages: Vec<TicketMessage>,
}

impl Desk {
    fn ticket_mut(&mut self, ticket_id: i64) -> GatewayResult<&mut Ticket> {
        self.tickets
            .iter_mut()
            .find(|t| t.id == ticket_id)
            .ok_or_else(|| GatewayError::NotFound(format!("ticket {}", ticket_id)))
    }
}

/// Process-local [`SupportDesk`].
#[derive(Default)]
pub struct InMemorySupport {
    desk: RwLock<Desk>,
}

impl InMemorySupport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SupportDesk for InMemorySupport {
    async fn create_ticket(&self, caller: &Caller, ticket: NewTicket) -> GatewayResult<Ticket> {
        let from = caller.claims()?.user_id;
        if ticket.title.trim().is_empty() {
            return Err(GatewayError::Validation("ticket title is required".to_string()));
        }

        let mut desk = self.desk.write();
        desk.next_ticket += 1;
        let row = Ticket {
            id: desk.next_ticket,
            title: ticket.title,
            description: ticket.description,
            section: ticket.section,
            from,
            helper: None,
            created_at: Utc::now(),
            status: TicketStatus::Opened,
        };
        desk.tickets.push(row.clone());
        info!(ticket_id = row.id, from, "Ticket created");
        Ok(row)
    }

    async fn get_ticket(&self, ticket_id: i64) -> GatewayResult<Ticket> {
        self.desk
            .read()
            .tickets
            .iter()
            .find(|t| t.id == ticket_id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("ticket {}", ticket_id)))
    }

    async fn tickets_of(&self, caller: &Caller) -> GatewayResult<Vec<Ticket>> {
        let user_id = caller.claims()?.user_id;
        Ok(self
            .desk
            .read()
            .tickets
            .iter()
            .filter(|t| t.from == user_id)
            .cloned()
            .collect())
    }

    async fn accept_ticket(&self, caller: &Caller, ticket_id: i64) -> GatewayResult<Ticket> {
        let claims = caller.claims()?;
        if claims.role != Role::Admin {
            return Err(GatewayError::PermissionDenied(
                "only admins may accept tickets".to_string(),
            ));
        }

        let mut desk = self.desk.write();
        let ticket = desk.ticket_mut(ticket_id)?;
        ticket.helper = Some(claims.user_id);
        ticket.status = TicketStatus::InProcess;
        info!(ticket_id, helper = claims.user_id, "Ticket accepted");
        Ok(ticket.clone())
    }

    async fn add_message(&self, caller: &Caller, message: NewMessage) -> GatewayResult<TicketMessage> {
        let who = caller.claims()?.user_id;
        let mut desk = self.desk.write();
        desk.ticket_mut(message.ticket_id)?;

        desk.next_message += 1;
        let row = TicketMessage {
            id: desk.next_message,
            who,
            ticket_id: message.ticket_id,
            message: message.message,
            sent_at: Utc::now(),
        };
        desk.messages.push(row.clone());
        Ok(row)
    }

    async fn messages(&self, ticket_id: i64) -> GatewayResult<Vec<TicketMessage>> {
        Ok(self
            .desk
            .read()
            .messages
            .iter()
            .filter(|m| m.ticket_id == ticket_id)
            .cloned()
            .collect())
    }

    async fn change_status(&self, ticket_id: i64, status: TicketStatus) -> GatewayResult<Ticket> {
        let mut desk = self.desk.write();
        let ticket = desk.ticket_mut(ticket_id)?;
        ticket.status = status;
        info!(ticket_id, %status, "Ticket status changed");
        Ok(ticket.clone())
    }
}

pub fn support_server<D: SupportDesk>(desk: Arc<D>, guard: DownstreamAuthGuard) -> RpcServer<SupportService> {
    let create = desk.clone();
    let get = desk.clone();
    let list = desk.clone();
    let accept = desk.clone();
    let add = desk.clone();
    let messages = desk.clone();
    let status = desk;

    RpcServer::builder(guard)
        .route::<CreateTicket, _, _>(Access::Authenticated, move |caller, req: NewTicket| {
            let desk = create.clone();
            async move { desk.create_ticket(&caller, req).await }
        })
        .route::<GetTicket, _, _>(Access::Authenticated, move |_, req: TicketRef| {
            let desk = get.clone();
            async move { desk.get_ticket(req.ticket_id).await }
        })
        .route::<ListTickets, _, _>(Access::Authenticated, move |caller, _: Empty| {
            let desk = list.clone();
            async move { desk.tickets_of(&caller).await }
        })
        .route::<AcceptTicket, _, _>(Access::Role(Role::Admin), move |caller, req: TicketRef| {
            let desk = accept.clone();
            async move { desk.accept_ticket(&caller, req.ticket_id).await }
        })
        .route::<AddMessage, _, _>(Access::Authenticated, move |caller, req: NewMessage| {
            let desk = add.clone();
            async move { desk.add_message(&caller, req).await }
        })
        .route::<GetMessages, _, _>(Access::Authenticated, move |_, req: TicketRef| {
            let desk = messages.clone();
            async move { desk.messages(req.ticket_id).await }
        })
        .route::<ChangeStatus, _, _>(Access::Authenticated, move |_, req: StatusChange| {
            let desk = status.clone();
            async move { desk.change_status(req.ticket_id, req.status).await }
        })
        .build()
}
