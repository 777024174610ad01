//! Signed redirect handshake between a relying application and a Core identity provider.
//!
//! Every outbound call is signed with the application's P-256 key and every provider reply is
//! verified against the provider's P-256 key before its payload is used.

pub mod error;
pub mod handshake;
pub mod keys;
pub mod wire;

pub mod client {
    pub mod api;
    pub mod pin;
    pub mod transport;
}

pub mod server {
    pub mod provider;
    pub mod tls;
}

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;
