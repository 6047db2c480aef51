use std::sync::Arc;

use shared::{
    domain::{User, UserId},
    protocol::ClientCommand,
};
use storage::{keys, Storage};
use tracing::{info, warn};

use crate::{
    error::{ClientError, ClientResult},
    realtime::{ChannelOptions, RealtimeChannel, RealtimeHandle},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Registered,
    Guest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Registered { token: String },
    Guest { guest_token: String },
}

impl Credential {
    pub fn auth_header(&self) -> String {
        match self {
            Self::Registered { token } => format!("Bearer {token}"),
            Self::Guest { guest_token } => format!("Guest {guest_token}"),
        }
    }

    pub fn mode(&self) -> AuthMode {
        match self {
            Self::Registered { .. } => AuthMode::Registered,
            Self::Guest { .. } => AuthMode::Guest,
        }
    }

    pub fn token(&self) -> &str {
        match self {
            Self::Registered { token } => token,
            Self::Guest { guest_token } => guest_token,
        }
    }

    /// First frame sent on every realtime connection.
    pub fn authentication_command(&self) -> ClientCommand {
        match self {
            Self::Registered { token } => ClientCommand::Authenticate(token.clone()),
            Self::Guest { guest_token } => ClientCommand::AuthenticateGuest(guest_token.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user: User,
    pub credential: Credential,
}

impl Session {
    pub fn registered(user: User, token: impl Into<String>) -> Self {
        Self {
            user,
            credential: Credential::Registered {
                token: token.into(),
            },
        }
    }

    pub fn guest(mut user: User, guest_token: impl Into<String>) -> Self {
        user.is_guest = true;
        Self {
            user,
            credential: Credential::Guest {
                guest_token: guest_token.into(),
            },
        }
    }

    pub fn auth_header(&self) -> String {
        self.credential.auth_header()
    }

    pub fn mode(&self) -> AuthMode {
        self.credential.mode()
    }

    pub fn user_id(&self) -> &UserId {
        &self.user.id
    }

    pub fn is_guest(&self) -> bool {
        self.mode() == AuthMode::Guest
    }

    /// Same kind of session for the same user; the realtime channel can be kept.
    pub fn same_identity(&self, other: &Session) -> bool {
        self.mode() == other.mode() && self.user.id == other.user.id
    }
}

/// Durable copy of the session under the keys the web client used.
#[derive(Clone)]
pub struct SessionStore {
    storage: Storage,
}

impl SessionStore {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// Registered session first, then guest. Corrupt entries are cleared and skipped.
    pub async fn load(&self) -> ClientResult<Option<Session>> {
        if let Some(session) = self.load_mode(AuthMode::Registered).await? {
            return Ok(Some(session));
        }
        self.load_mode(AuthMode::Guest).await
    }

    pub async fn save(&self, session: &Session) -> ClientResult<()> {
        let user = serde_json::to_string(&session.user)?;
        let (token_key, user_key) = key_pair(session.mode());
        self.storage
            .set_values(&[(token_key, session.credential.token()), (user_key, user.as_str())])
            .await?;
        Ok(())
    }

    pub async fn clear(&self, mode: AuthMode) -> ClientResult<()> {
        let (token_key, user_key) = key_pair(mode);
        self.storage.remove_values(&[token_key, user_key]).await?;
        Ok(())
    }

    pub async fn clear_all(&self) -> ClientResult<()> {
        self.clear(AuthMode::Registered).await?;
        self.clear(AuthMode::Guest).await
    }

    async fn load_mode(&self, mode: AuthMode) -> ClientResult<Option<Session>> {
        let (token_key, user_key) = key_pair(mode);
        let Some(token) = self.storage.get_value(token_key).await? else {
            return Ok(None);
        };
        let Some(raw_user) = self.storage.get_value(user_key).await? else {
            return Ok(None);
        };
        if token.trim().is_empty() {
            return Ok(None);
        }

        match serde_json::from_str::<User>(&raw_user) {
            Ok(user) => Ok(Some(match mode {
                AuthMode::Registered => Session::registered(user, token),
                AuthMode::Guest => Session::guest(user, token),
            })),
            Err(err) => {
                warn!(key = user_key, error = %err, "discarding corrupt persisted user");
                self.clear(mode).await?;
                Ok(None)
            }
        }
    }
}

fn key_pair(mode: AuthMode) -> (&'static str, &'static str) {
    match mode {
        AuthMode::Registered => (keys::AUTH_TOKEN, keys::AUTH_USER),
        AuthMode::Guest => (keys::GUEST_TOKEN, keys::GUEST_USER),
    }
}

/// Opens the realtime channel for a session.
pub trait ChannelFactory: Send + Sync {
    fn open(&self, session: &Session) -> Arc<dyn RealtimeHandle>;
}

pub struct WebSocketChannelFactory {
    url: String,
    options: ChannelOptions,
}

impl WebSocketChannelFactory {
    pub fn new(url: impl Into<String>, options: ChannelOptions) -> Self {
        Self {
            url: url.into(),
            options,
        }
    }
}

impl ChannelFactory for WebSocketChannelFactory {
    fn open(&self, session: &Session) -> Arc<dyn RealtimeHandle> {
        RealtimeChannel::connect(self.url.clone(), session.credential.clone(), self.options)
    }
}

/// Current identity plus the realtime channel scoped to it.
pub struct SessionContext {
    store: SessionStore,
    factory: Arc<dyn ChannelFactory>,
    session: Option<Session>,
    channel: Option<Arc<dyn RealtimeHandle>>,
}

impl SessionContext {
    pub fn new(store: SessionStore, factory: Arc<dyn ChannelFactory>) -> Self {
        Self {
            store,
            factory,
            session: None,
            channel: None,
        }
    }

    /// Restores the persisted session, if any, and opens its channel.
    pub async fn bootstrap(&mut self) -> ClientResult<Option<&Session>> {
        match self.store.load().await? {
            Some(session) => {
                info!(user_id = %session.user.id, mode = ?session.mode(), "restored session");
                self.activate(session);
                Ok(self.session.as_ref())
            }
            None => Ok(None),
        }
    }

    /// Persists a freshly obtained session and makes it current.
    pub async fn establish(&mut self, session: Session) -> ClientResult<Arc<dyn RealtimeHandle>> {
        self.store.save(&session).await?;
        let stale_mode = match session.mode() {
            AuthMode::Registered => AuthMode::Guest,
            AuthMode::Guest => AuthMode::Registered,
        };
        self.store.clear(stale_mode).await?;
        info!(user_id = %session.user.id, mode = ?session.mode(), "session established");
        Ok(self.activate(session))
    }

    pub async fn logout(&mut self) -> ClientResult<()> {
        match self.session.take() {
            Some(session) => self.store.clear(session.mode()).await?,
            None => self.store.clear_all().await?,
        }
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
        info!("session cleared");
        Ok(())
    }

    pub fn current_session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn require_session(&self) -> ClientResult<&Session> {
        self.session
            .as_ref()
            .ok_or_else(|| ClientError::Unauthenticated("no active session".into()))
    }

    pub fn auth_header(&self) -> ClientResult<String> {
        self.require_session().map(Session::auth_header)
    }

    pub fn channel(&self) -> Option<Arc<dyn RealtimeHandle>> {
        self.channel.clone()
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    fn activate(&mut self, session: Session) -> Arc<dyn RealtimeHandle> {
        let reusable = self
            .session
            .as_ref()
            .is_some_and(|current| current.same_identity(&session));

        let channel = match (reusable, self.channel.take()) {
            (true, Some(channel)) => channel,
            (_, previous) => {
                if let Some(previous) = previous {
                    previous.close();
                }
                self.factory.open(&session)
            }
        };

        self.session = Some(session);
        self.channel = Some(Arc::clone(&channel));
        channel
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
