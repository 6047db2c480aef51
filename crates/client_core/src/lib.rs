pub mod api;
pub mod calls;
pub mod config;
pub mod conversation_list;
pub mod engine;
pub mod error;
pub mod message_log;
pub mod realtime;
pub mod session;
pub mod synchronizer;
pub mod typing;

pub use api::{ChatBackend, HttpBackend};
pub use config::{load_client_settings, ClientSettings};
pub use engine::{SyncEngine, SyncHandle};
pub use error::{ClientError, ClientResult};
pub use realtime::{ChannelEvent, ChannelState, RealtimeChannel, RealtimeHandle};
pub use session::{Credential, Session, SessionContext, SessionStore, WebSocketChannelFactory};
pub use synchronizer::{NoticeLevel, SyncEvent, SyncSnapshot, Synchronizer};

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
