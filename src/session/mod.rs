//! Session negotiation and persistence

pub mod store;
pub mod sync;

pub use store::{MemorySessionStore, SessionStore, SqliteSessionStore, StoredSession};
pub use sync::{Session, SessionSynchronizer, StopResult};
