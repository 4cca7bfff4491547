//! Matchlink - trust establishment and secure channel setup for partner PSI matches
//!
//! Two organizations that want to intersect their identifier sets first prove
//! who they are to a federation service, then open a mutually authenticated
//! TLS channel to each other, agree on a PSI protocol, and hand the channel to
//! a PSI engine.
//!
//! # Architecture
//!
//! - Partners authenticate RPCs with short-lived ES256 bearer tokens whose
//!   header carries an ephemeral certificate
//! - Each match attempt mints a fresh self-signed certificate from the
//!   partner's long-lived key
//! - The data channel pins the peer's exact certificate instead of walking a
//!   CA chain
//! - The connecting side proposes PSI protocols; the accepting side decides
//!
//! # Modules
//!
//! - [`pki`] - Ephemeral certificates and PEM/DER helpers
//! - [`tls`] - Pinned and CA-chain peer verification, TLS configs
//! - [`auth`] - External tokens, signed requests, authentication chain
//! - [`network`] - Connect with retry, accept with deadline
//! - [`negotiate`] - One-round PSI protocol negotiation
//! - [`identifiers`] - Identifier file ingestion and streaming
//! - [`orchestrator`] - End-to-end match driver on both sides
//! - [`config`] - Partner and match configuration
//! - [`telemetry`] - Logging initialization
//! - [`retry`] - Fixed-interval polling and retry until a deadline
//! - [`error`] - Crate-level error taxonomy

#![deny(missing_docs)]

pub mod auth;
pub mod config;
pub mod error;
pub mod identifiers;
pub mod negotiate;
pub mod network;
pub mod orchestrator;
pub mod pki;
pub mod retry;
pub mod telemetry;
pub mod tls;

#[cfg(test)]
mod testing;

pub use error::{Error, ErrorKind};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Validity window of an external token
pub const EXTERNAL_TOKEN_LIFETIME: std::time::Duration = std::time::Duration::from_secs(5 * 60);

/// Validity window of a partner-signed RPC token
pub const PARTNER_TOKEN_LIFETIME: std::time::Duration = std::time::Duration::from_secs(10 * 60);

/// Maximum clock skew tolerated on a signed request timestamp
pub const SIGNED_REQUEST_MAX_AGE: std::time::Duration = std::time::Duration::from_secs(10 * 60);
