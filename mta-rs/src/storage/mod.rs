//! Message storage module
//!
//! - [`message`]: the stored `Message` record
//! - [`threading`]: pure thread reconstruction over the log
//! - [`store`]: the persisted log plus its per-identity index
//! - [`artifacts`]: content-addressed blobs referenced from message bodies

pub mod artifacts;
pub mod message;
pub mod store;
pub mod threading;

pub use artifacts::ArtifactStore;
pub use message::{generate_id, Message, NewMessage};
pub use store::MessageStore;
pub use threading::{Inbox, Thread, MAX_THREAD_DEPTH};
