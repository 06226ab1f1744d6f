//! Session lifecycle: sign-in, handle translation and logout.

pub mod authenticator;
pub mod service;
pub mod store;

pub use authenticator::DispatchAuthenticator;
pub use service::{AuthenticatedUser, GatewaySessionService, SignInResponse, UserAuthenticator};
pub use store::{SessionRecord, SessionStore};
