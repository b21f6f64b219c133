//! Identity resolution.
//!
//! The resolver turns whatever the identity provider knows about the current
//! session, plus the display name remembered in the visitor's preference
//! store, into a [`Me`]. Only a ready `Me` yields an [`Actor`], and only an
//! `Actor` can be handed to the claim engine.
//!
//! The engine trusts the uid it is given. Nothing in this crate proves that
//! the caller really owns that uid: a deployment must re-check claims in the
//! storage layer's access rules.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::GiftlistConfig;
use crate::error::{ClaimError, IdentityError};
use crate::list::List;

/// Preference key holding the visitor's chosen display name.
pub const VISITOR_NAME_KEY: &str = "visitor_name";

/// Opaque user id assigned by the identity provider.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uid(String);

impl Uid {
    pub fn new(uid: impl Into<String>) -> Self {
        Self(uid.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Uid {
    fn from(uid: &str) -> Self {
        Self::new(uid)
    }
}

impl From<String> for Uid {
    fn from(uid: String) -> Self {
        Self(uid)
    }
}

/// The identity a claim is made on behalf of.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Actor {
    pub uid: Uid,
    pub name: String,
}

impl Actor {
    pub fn new(uid: impl Into<Uid>, name: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            name: name.into(),
        }
    }

    pub fn is_ready(&self) -> bool {
        !self.uid.as_str().is_empty() && !self.name.trim().is_empty()
    }
}

/// What the identity provider reports about a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthIdentity {
    pub uid: Uid,
    pub is_anonymous: bool,
    /// Provider profile name, only known for permanent accounts.
    pub display_name: Option<String>,
}

impl AuthIdentity {
    pub fn anonymous(uid: impl Into<Uid>) -> Self {
        Self {
            uid: uid.into(),
            is_anonymous: true,
            display_name: None,
        }
    }

    pub fn permanent(uid: impl Into<Uid>, display_name: Option<String>) -> Self {
        Self {
            uid: uid.into(),
            is_anonymous: false,
            display_name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    EmailPassword { email: String, password: String },
    /// A federated sign-in (e.g. Google) that the provider has already
    /// verified.
    Federated {
        provider: String,
        subject: String,
        display_name: Option<String>,
    },
}

/// Source of authenticated sessions.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn current_identity(&self) -> Option<AuthIdentity>;

    async fn create_anonymous(&self) -> Result<AuthIdentity, IdentityError>;

    async fn sign_in_permanent(&self, credentials: Credentials) -> Result<AuthIdentity, IdentityError>;

    async fn sign_out(&self) -> Result<(), IdentityError>;

    /// Every identity change, including sign-out (`None`).
    fn changes(&self) -> broadcast::Receiver<Option<AuthIdentity>>;
}

/// Browser-scoped key/value storage, independent of any server identity.
pub trait PreferenceStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), IdentityError>;

    fn clear(&self, key: &str) -> Result<(), IdentityError>;
}

/// In-process [`PreferenceStore`] with per-key expiry.
#[derive(Debug, Default)]
pub struct MemoryPreferences {
    entries: DashMap<String, (String, DateTime<Utc>)>,
}

impl MemoryPreferences {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferenceStore for MemoryPreferences {
    fn get(&self, key: &str) -> Option<String> {
        match self.entries.get(key) {
            Some(entry) if entry.1 > Utc::now() => return Some(entry.0.clone()),
            Some(_) => {}
            None => return None,
        }
        self.entries
            .remove_if(key, |_, (_, expires_at)| *expires_at <= Utc::now());
        None
    }

    fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), IdentityError> {
        self.entries
            .insert(key.to_string(), (value.to_string(), Utc::now() + ttl));
        Ok(())
    }

    fn clear(&self, key: &str) -> Result<(), IdentityError> {
        self.entries.remove(key);
        Ok(())
    }
}

/// In-process [`IdentityProvider`] holding a single session.
pub struct LocalIdentityProvider {
    current: RwLock<Option<AuthIdentity>>,
    accounts: DashMap<String, (String, AuthIdentity)>,
    changes: broadcast::Sender<Option<AuthIdentity>>,
}

impl LocalIdentityProvider {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(16);
        Self {
            current: RwLock::new(None),
            accounts: DashMap::new(),
            changes,
        }
    }

    /// Register an email/password account and return its uid.
    pub fn register(&self, email: &str, password: &str, display_name: Option<String>) -> Uid {
        let uid = Uid::new(format!("user-{}", Uuid::new_v4().simple()));
        self.accounts.insert(
            email.to_lowercase(),
            (
                password.to_string(),
                AuthIdentity::permanent(uid.clone(), display_name),
            ),
        );
        uid
    }

    async fn switch_to(&self, identity: Option<AuthIdentity>) {
        *self.current.write().await = identity.clone();
        // No receivers is fine.
        let _ = self.changes.send(identity);
    }
}

impl Default for LocalIdentityProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdentityProvider for LocalIdentityProvider {
    async fn current_identity(&self) -> Option<AuthIdentity> {
        self.current.read().await.clone()
    }

    async fn create_anonymous(&self) -> Result<AuthIdentity, IdentityError> {
        let identity = AuthIdentity::anonymous(format!("anon-{}", Uuid::new_v4().simple()));
        self.switch_to(Some(identity.clone())).await;
        Ok(identity)
    }

    async fn sign_in_permanent(&self, credentials: Credentials) -> Result<AuthIdentity, IdentityError> {
        let identity = match credentials {
            Credentials::EmailPassword { email, password } => {
                let account = self
                    .accounts
                    .get(&email.to_lowercase())
                    .ok_or_else(|| IdentityError::Provider("unknown account".into()))?;
                if account.0 != password {
                    return Err(IdentityError::Provider("wrong password".into()));
                }
                account.1.clone()
            }
            Credentials::Federated {
                provider,
                subject,
                display_name,
            } => AuthIdentity::permanent(format!("{provider}:{subject}"), display_name),
        };
        self.switch_to(Some(identity.clone())).await;
        Ok(identity)
    }

    async fn sign_out(&self) -> Result<(), IdentityError> {
        self.switch_to(None).await;
        Ok(())
    }

    fn changes(&self) -> broadcast::Receiver<Option<AuthIdentity>> {
        self.changes.subscribe()
    }
}

/// Which surface the resolver serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewContext {
    /// `/l/<slug>`: anonymous sessions are bootstrapped here.
    PublicList,
    /// `/l/<slug>/manage`: owner only, never bootstraps.
    Manage,
    Other,
}

impl ViewContext {
    pub fn from_path(path: &str) -> Self {
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        match segments.as_slice() {
            ["l", slug] if !slug.is_empty() => ViewContext::PublicList,
            ["l", slug, "manage", ..] if !slug.is_empty() => ViewContext::Manage,
            _ => ViewContext::Other,
        }
    }
}

/// The resolved identity of whoever is looking at the page.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Me {
    pub uid: Option<Uid>,
    pub name: Option<String>,
    pub is_anonymous: bool,
    /// False while authentication is still in flight.
    pub resolved: bool,
}

impl Me {
    pub fn ready(&self) -> bool {
        self.resolved
            && self.uid.is_some()
            && self.name.as_deref().is_some_and(|name| !name.is_empty())
    }

    /// The actor to claim as, or `IdentityNotReady`.
    pub fn actor(&self) -> Result<Actor, ClaimError> {
        match (&self.uid, &self.name) {
            (Some(uid), Some(name)) if self.ready() => Ok(Actor::new(uid.clone(), name.clone())),
            _ => Err(ClaimError::IdentityNotReady),
        }
    }
}

/// How the current actor relates to a specific list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Viewer {
    Owner(Uid),
    Visitor(Me),
}

pub struct IdentityResolver<P: ?Sized, S: ?Sized> {
    provider: Arc<P>,
    prefs: Arc<S>,
    context: ViewContext,
    name_ttl: Duration,
    /// `None` until the provider has answered.
    auth: Option<Option<AuthIdentity>>,
    name: Option<String>,
    anon_attempted: bool,
}

impl<P, S> IdentityResolver<P, S>
where
    P: IdentityProvider + ?Sized,
    S: PreferenceStore + ?Sized,
{
    pub fn new(provider: Arc<P>, prefs: Arc<S>, context: ViewContext, config: &GiftlistConfig) -> Self {
        let name = prefs
            .get(VISITOR_NAME_KEY)
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());
        Self {
            provider,
            prefs,
            context,
            name_ttl: config.visitor_name_ttl,
            auth: None,
            name,
            anon_attempted: false,
        }
    }

    /// Ask the provider who we are, bootstrapping an anonymous session on
    /// public list pages when there is none.
    ///
    /// An existing session, anonymous or permanent, is always kept. A
    /// failed bootstrap leaves the page readable but unable to claim.
    pub async fn resolve(&mut self) -> Me {
        let current = self.provider.current_identity().await;
        let needs_session = current.is_none();
        self.auth = Some(current);

        if needs_session && self.context == ViewContext::PublicList && !self.anon_attempted {
            self.anon_attempted = true;
            match self.provider.create_anonymous().await {
                Ok(identity) => {
                    info!(uid = %identity.uid, "bootstrapped anonymous session");
                    self.auth = Some(Some(identity));
                }
                Err(err) => {
                    warn!(error = %err, "anonymous sign-in failed, continuing read-only");
                }
            }
        }
        self.me()
    }

    /// Feed an identity change from [`IdentityProvider::changes`].
    pub fn observe(&mut self, change: Option<AuthIdentity>) {
        debug!(uid = ?change.as_ref().map(|identity| &identity.uid), "identity changed");
        self.auth = Some(change);
    }

    /// Remember a display name. An empty name clears it.
    pub fn set_name(&mut self, name: &str) -> Result<(), IdentityError> {
        let name = name.trim();
        if name.is_empty() {
            return self.clear_name();
        }
        self.prefs.set(VISITOR_NAME_KEY, name, self.name_ttl)?;
        self.name = Some(name.to_string());
        Ok(())
    }

    /// Forget the display name so the visitor is prompted again.
    pub fn clear_name(&mut self) -> Result<(), IdentityError> {
        self.prefs.clear(VISITOR_NAME_KEY)?;
        self.name = None;
        Ok(())
    }

    pub fn me(&self) -> Me {
        let identity = self.auth.as_ref().and_then(Option::as_ref);
        let fallback = identity
            .filter(|identity| !identity.is_anonymous)
            .and_then(|identity| identity.display_name.clone())
            .filter(|name| !name.trim().is_empty());
        Me {
            uid: identity.map(|identity| identity.uid.clone()),
            name: self.name.clone().or(fallback),
            is_anonymous: identity.is_some_and(|identity| identity.is_anonymous),
            resolved: self.auth.is_some(),
        }
    }

    pub fn viewer_for(&self, list: &List) -> Viewer {
        let me = self.me();
        match &me.uid {
            Some(uid) if *uid == list.owner_uid => Viewer::Owner(uid.clone()),
            _ => Viewer::Visitor(me),
        }
    }

    pub fn context(&self) -> ViewContext {
        self.context
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(
        provider: &Arc<LocalIdentityProvider>,
        prefs: &Arc<MemoryPreferences>,
        context: ViewContext,
    ) -> IdentityResolver<LocalIdentityProvider, MemoryPreferences> {
        IdentityResolver::new(
            provider.clone(),
            prefs.clone(),
            context,
            &GiftlistConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_fresh_visit_needs_a_name() {
        let provider = Arc::new(LocalIdentityProvider::new());
        let prefs = Arc::new(MemoryPreferences::new());
        let mut resolver = resolver(&provider, &prefs, ViewContext::PublicList);

        assert!(!resolver.me().ready());
        let me = resolver.resolve().await;
        assert!(me.uid.is_some());
        assert!(me.is_anonymous);
        assert!(!me.ready());

        resolver.set_name("  Alice ").unwrap();
        let me = resolver.me();
        assert!(me.ready());
        assert_eq!(me.actor().unwrap().name, "Alice");
    }

    #[tokio::test]
    async fn test_return_visit_is_ready_immediately() {
        let provider = Arc::new(LocalIdentityProvider::new());
        let prefs = Arc::new(MemoryPreferences::new());

        let mut first = resolver(&provider, &prefs, ViewContext::PublicList);
        let uid = first.resolve().await.uid;
        first.set_name("Alice").unwrap();

        let mut second = resolver(&provider, &prefs, ViewContext::PublicList);
        let me = second.resolve().await;
        assert!(me.ready());
        assert_eq!(me.uid, uid);
        assert_eq!(me.name.as_deref(), Some("Alice"));
    }

    #[tokio::test]
    async fn test_permanent_session_is_never_replaced() {
        let provider = Arc::new(LocalIdentityProvider::new());
        let prefs = Arc::new(MemoryPreferences::new());
        let signed_in = provider
            .sign_in_permanent(Credentials::Federated {
                provider: "google".into(),
                subject: "123".into(),
                display_name: Some("Grace".into()),
            })
            .await
            .unwrap();

        let mut resolver = resolver(&provider, &prefs, ViewContext::PublicList);
        let me = resolver.resolve().await;
        assert_eq!(me.uid, Some(signed_in.uid));
        assert!(!me.is_anonymous);
        assert_eq!(me.name.as_deref(), Some("Grace"));
        assert!(me.ready());
    }

    #[tokio::test]
    async fn test_manage_page_does_not_bootstrap() {
        let provider = Arc::new(LocalIdentityProvider::new());
        let prefs = Arc::new(MemoryPreferences::new());
        let mut resolver = resolver(&provider, &prefs, ViewContext::Manage);

        let me = resolver.resolve().await;
        assert!(me.resolved);
        assert!(me.uid.is_none());
        assert!(provider.current_identity().await.is_none());
    }

    #[tokio::test]
    async fn test_empty_name_clears_preference() {
        let provider = Arc::new(LocalIdentityProvider::new());
        let prefs = Arc::new(MemoryPreferences::new());
        let mut resolver = resolver(&provider, &prefs, ViewContext::PublicList);
        resolver.resolve().await;

        resolver.set_name("Alice").unwrap();
        assert_eq!(prefs.get(VISITOR_NAME_KEY).as_deref(), Some("Alice"));
        resolver.set_name("   ").unwrap();
        assert!(prefs.get(VISITOR_NAME_KEY).is_none());
        assert!(matches!(resolver.me().actor(), Err(ClaimError::IdentityNotReady)));
    }

    #[tokio::test]
    async fn test_sign_out_unreadies_visitor() {
        let provider = Arc::new(LocalIdentityProvider::new());
        let prefs = Arc::new(MemoryPreferences::new());
        let mut changes = provider.changes();
        let mut resolver = resolver(&provider, &prefs, ViewContext::PublicList);
        resolver.resolve().await;
        resolver.set_name("Alice").unwrap();
        assert!(resolver.me().ready());

        provider.sign_out().await.unwrap();
        // The bootstrap itself was the first change.
        let _bootstrap = changes.recv().await.unwrap();
        resolver.observe(changes.recv().await.unwrap());
        assert!(!resolver.me().ready());
    }

    #[test]
    fn test_expired_preference_is_gone() {
        let prefs = MemoryPreferences::new();
        prefs
            .set(VISITOR_NAME_KEY, "Alice", Duration::seconds(-1))
            .unwrap();
        assert!(prefs.get(VISITOR_NAME_KEY).is_none());
    }

    #[test]
    fn test_view_context_from_path() {
        assert_eq!(ViewContext::from_path("/l/xmas-2026"), ViewContext::PublicList);
        assert_eq!(ViewContext::from_path("/l/xmas-2026/manage"), ViewContext::Manage);
        assert_eq!(ViewContext::from_path("/"), ViewContext::Other);
        assert_eq!(ViewContext::from_path("/feedback"), ViewContext::Other);
    }
}
