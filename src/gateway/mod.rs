//! HTTP surface: API-key gate, session registry, router and server

pub mod auth;
mod registry;
mod router;
mod server;

pub use auth::AuthGate;
pub use registry::SessionRegistry;
pub use router::{AppState, create_router};
pub use server::Gateway;
