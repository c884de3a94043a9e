//! Session persistence: conversation histories with expiry and the
//! per-session audit trail of provider switches.

mod janitor;
mod session;
mod store;

#[cfg(feature = "persistence")]
mod sled_store;

pub use janitor::spawn_janitor;
pub use session::{Clock, ManualClock, Session, SystemClock, TransitionRecord};
pub use store::{AuditLog, InMemorySessionStore, SessionIter, SessionStore};

#[cfg(feature = "persistence")]
pub use sled_store::SledSessionStore;
