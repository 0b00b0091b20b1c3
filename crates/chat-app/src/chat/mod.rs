pub mod controller;
pub mod message;
pub mod session_store;
pub mod title;

pub use controller::ChatController;
pub use message::{ChatMessage, MessagePatch, Role};
pub use session_store::{SessionPhase, SessionStore};
