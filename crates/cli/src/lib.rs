//! Deployable surface of the failover gateway: component wiring and the
//! axum application.

pub mod bootstrap;
pub mod server;

pub use bootstrap::{build_gateway, Gateway};
pub use server::{build_app, AppState, ErrorResponse, SESSION_HEADER};
