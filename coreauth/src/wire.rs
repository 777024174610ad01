use serde::{Deserialize, Serialize};

/// Seconds a signed request or reply stays acceptable on either side
pub const FRESHNESS_WINDOW_SECS: i64 = 60;

const REQUEST_DOMAIN: &[u8] = b"coreauth-request";
const RESPONSE_DOMAIN: &[u8] = b"coreauth-response";
const SEPARATOR: &[u8] = b"||";

/// Remote capabilities exposed by the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Authorize,
    Info,
}

impl Capability {
    pub fn name(self) -> &'static str {
        match self {
            Capability::Authorize => "core.authorize",
            Capability::Info => "core.info",
        }
    }

    /// Path below the provider endpoint
    pub fn path(self) -> &'static str {
        match self {
            Capability::Authorize => "core/authorize",
            Capability::Info => "core/info",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "core.authorize" => Some(Capability::Authorize),
            "core.info" => Some(Capability::Info),
            _ => None,
        }
    }
}

/// Outbound call, signed by the application
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SignedRequest {
    pub identity: String,   // application ID issued by the provider
    pub capability: String, // e.g. "core.authorize"
    pub nonce: String,      // random per request, echoed by the reply
    pub timestamp: i64,     // Unix timestamp (seconds)
    pub payload: String,    // JSON parameters, signed as sent
    pub signature: String,  // P-256 r || s over signing_message(), hex
}

impl SignedRequest {
    pub fn signing_message(&self) -> Vec<u8> {
        join(&[
            REQUEST_DOMAIN,
            self.identity.as_bytes(),
            self.capability.as_bytes(),
            self.nonce.as_bytes(),
            self.timestamp.to_string().as_bytes(),
            self.payload.as_bytes(),
        ])
    }
}

/// Provider reply, signed by the provider
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SignedResponse {
    pub nonce: String,     // nonce of the request being answered
    pub timestamp: i64,
    pub payload: String,   // JSON result
    pub signature: String, // P-256 r || s over signing_message(), hex
}

impl SignedResponse {
    pub fn signing_message(&self) -> Vec<u8> {
        join(&[
            RESPONSE_DOMAIN,
            self.nonce.as_bytes(),
            self.timestamp.to_string().as_bytes(),
            self.payload.as_bytes(),
        ])
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AuthorizeParams {
    pub success: String, // callback after the user approves
    pub failure: String, // callback after the user denies
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AuthorizeGrant {
    pub location: String, // provider-hosted page the browser must visit
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct InfoParams {
    pub token: String,
}

/// Identity info returned by `core.info`; passed through to the caller untouched.
pub type IdentityInfo = serde_json::Map<String, serde_json::Value>;

pub fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// `timestamp` comes off the wire and may be any i64
pub fn is_fresh(timestamp: i64, now: i64) -> bool {
    now.abs_diff(timestamp) <= FRESHNESS_WINDOW_SECS as u64
}

fn join(parts: &[&[u8]]) -> Vec<u8> {
    let mut message = Vec::with_capacity(parts.iter().map(|p| p.len() + SEPARATOR.len()).sum());
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            message.extend_from_slice(SEPARATOR);
        }
        message.extend_from_slice(part);
    }
    message
}
