use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::Utc;
use uuid::Uuid;

use coreauth::server::provider::ProviderSigner;
use coreauth::wire::AuthorizeParams;

/// Grants and tokens older than this are dropped
pub const GRANT_TTL_SECS: i64 = 600;

/// An authorization waiting for the user to approve or deny it
#[derive(Debug, Clone)]
pub struct PendingGrant {
    pub identity: String, // application that asked
    pub callbacks: AuthorizeParams,
    pub created_at: i64,
}

#[derive(Debug, Clone)]
struct IssuedToken {
    identity: String,
    created_at: i64,
}

/// Provider-side state shared by all workers
pub struct ProviderState {
    pub signer: ProviderSigner,
    pub public_url: String, // base of the approval pages
    grants: RwLock<HashMap<String, PendingGrant>>,
    tokens: RwLock<HashMap<String, IssuedToken>>,
}

impl ProviderState {
    pub fn new(signer: ProviderSigner, public_url: impl Into<String>) -> Self {
        let public_url: String = public_url.into();
        Self {
            signer,
            public_url: public_url.trim_end_matches('/').to_string(),
            grants: RwLock::new(HashMap::new()),
            tokens: RwLock::new(HashMap::new()),
        }
    }

    /// Record a new grant and return its id
    pub fn open_grant(&self, identity: &str, callbacks: AuthorizeParams) -> String {
        let now = Utc::now().timestamp();
        let grant_id = Uuid::new_v4().simple().to_string();

        let mut grants = self.grants.write().unwrap_or_else(PoisonError::into_inner);
        grants.retain(|_, grant| !expired(grant.created_at, now));
        grants.insert(
            grant_id.clone(),
            PendingGrant {
                identity: identity.to_string(),
                callbacks,
                created_at: now,
            },
        );

        tracing::debug!("Opened grant for {}", identity);
        grant_id
    }

    pub fn approval_location(&self, grant_id: &str) -> String {
        format!("{}/approve?grant={}", self.public_url, grant_id)
    }

    /// Look at a live grant without consuming it
    pub fn peek_grant(&self, grant_id: &str) -> Option<PendingGrant> {
        let now = Utc::now().timestamp();
        let grants = self.grants.read().unwrap_or_else(PoisonError::into_inner);
        grants.get(grant_id).filter(|g| !expired(g.created_at, now)).cloned()
    }

    /// Consume a grant; a grant can be approved or denied once
    pub fn take_grant(&self, grant_id: &str) -> Option<PendingGrant> {
        let now = Utc::now().timestamp();
        let mut grants = self.grants.write().unwrap_or_else(PoisonError::into_inner);
        grants.remove(grant_id).filter(|g| !expired(g.created_at, now))
    }

    pub fn issue_token(&self, identity: &str) -> String {
        let now = Utc::now().timestamp();
        let token = Uuid::new_v4().simple().to_string();

        let mut tokens = self.tokens.write().unwrap_or_else(PoisonError::into_inner);
        tokens.retain(|_, t| !expired(t.created_at, now));
        tokens.insert(
            token.clone(),
            IssuedToken {
                identity: identity.to_string(),
                created_at: now,
            },
        );
        token
    }

    /// Single-use: the token is gone afterwards whether or not it matched `identity`
    pub fn redeem_token(&self, token: &str, identity: &str) -> bool {
        let now = Utc::now().timestamp();
        let mut tokens = self.tokens.write().unwrap_or_else(PoisonError::into_inner);

        match tokens.remove(token) {
            Some(issued) if !expired(issued.created_at, now) && issued.identity == identity => true,
            Some(_) => {
                tracing::warn!("⚠️  Token presented by {} was expired or issued to another application", identity);
                false
            }
            None => false,
        }
    }
}

fn expired(created_at: i64, now: i64) -> bool {
    now.saturating_sub(created_at) > GRANT_TTL_SECS
}

#[cfg(test)]
mod tests {
    use super::*;
    use coreauth::keys::SigningKey;

    fn state() -> ProviderState {
        ProviderState::new(ProviderSigner::new(SigningKey::generate()), "http://provider.test/")
    }

    fn callbacks() -> AuthorizeParams {
        AuthorizeParams {
            success: "http://app.test/authorized".to_string(),
            failure: "http://app.test/fail".to_string(),
        }
    }

    #[test]
    fn grants_are_single_use() {
        let state = state();
        let grant = state.open_grant("app-1", callbacks());
        assert_eq!(
            state.approval_location(&grant),
            format!("http://provider.test/approve?grant={}", grant)
        );

        assert!(state.peek_grant(&grant).is_some());
        assert_eq!(state.take_grant(&grant).unwrap().identity, "app-1");
        assert!(state.take_grant(&grant).is_none());
        assert!(state.peek_grant(&grant).is_none());
    }

    #[test]
    fn tokens_are_single_use_and_bound_to_identity() {
        let state = state();

        let token = state.issue_token("app-1");
        assert!(state.redeem_token(&token, "app-1"));
        assert!(!state.redeem_token(&token, "app-1"));

        let token = state.issue_token("app-1");
        assert!(!state.redeem_token(&token, "app-2"));
        assert!(!state.redeem_token(&token, "app-1"));
    }

    #[test]
    fn expiry_window() {
        assert!(!expired(1_000, 1_000 + GRANT_TTL_SECS));
        assert!(expired(1_000, 1_001 + GRANT_TTL_SECS));
        assert!(expired(i64::MIN, 1_000));
        assert!(!expired(i64::MAX, 1_000));
    }
}
