//! Seams to the federation service and the PSI engine
//!
//! The service RPCs and the PSI algorithm live outside this crate. The
//! orchestrator only needs the narrow shapes below.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::error::ErrorKind;
use crate::identifiers::Insights;
use crate::negotiate::Protocol;
use crate::network::Connection;

/// Failure reported by the PSI engine
pub type EngineError = Box<dyn std::error::Error + Send + Sync>;

/// Federation service RPC failures
#[derive(Debug, Error)]
pub enum ApiError {
    /// Service refused our credentials
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Service answered with an error status
    #[error("service returned {code}: {message}")]
    Status {
        /// Status code
        code: u16,
        /// Error message from the service
        message: String,
    },

    /// Request never got an answer
    #[error("request failed: {0}")]
    Transport(String),

    /// Request body could not be encoded
    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
}

impl ApiError {
    /// Failure category
    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Unauthorized(_) => ErrorKind::Authentication,
            ApiError::Status { .. } => ErrorKind::Protocol,
            ApiError::Transport(_) => ErrorKind::Transport,
            ApiError::Encode(_) => ErrorKind::Internal,
        }
    }
}

/// Ask the service to start a match and hand out the peer endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMatchRequest {
    /// Match to run
    pub match_id: String,
    /// Id the result will be stored under, chosen by us
    pub match_result_id: String,
    /// Our ephemeral certificate, which the peer will pin
    pub client_certificate_pem: String,
}

/// Where and whom to connect to; an empty endpoint means not ready yet
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunMatchResponse {
    /// `host:port` of the peer's PSI listener
    pub endpoint: String,
    /// Peer certificate to pin
    pub server_certificate_pem: String,
    /// Id to poll results under
    pub match_result_id: String,
}

/// Ask for the outcome of a match run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetResultRequest {
    /// Id from the run response
    pub match_result_id: String,
}

/// Lifecycle of a match result
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchResultState {
    /// State not reported
    #[default]
    Unknown,
    /// Still computing
    Pending,
    /// Finished with insights
    Completed,
    /// Finished with an error
    Errored,
}

/// Outcome of a match as reported by the service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchResult {
    /// Current state
    pub state: MatchResultState,
    /// Error message when errored
    pub error_msg: String,
    /// Matched counts per identifier kind
    pub insights: Insights,
}

/// Federation service client
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MatchApi: Send + Sync {
    /// Start or resume a match run
    async fn run_match(
        &self,
        authorization: &str,
        request: &RunMatchRequest,
    ) -> Result<RunMatchResponse, ApiError>;

    /// Fetch a match result
    async fn get_result(
        &self,
        authorization: &str,
        request: &GetResultRequest,
    ) -> Result<MatchResult, ApiError>;
}

/// Sending half of a PSI engine
#[async_trait]
pub trait PsiSender: Send + Sync {
    /// Run `protocol` over `connection`, feeding `count` records from `records`
    async fn send(
        &self,
        protocol: Protocol,
        connection: Connection,
        count: u64,
        records: mpsc::Receiver<Vec<u8>>,
    ) -> Result<(), EngineError>;
}

/// Receiving half of a PSI engine
#[async_trait]
pub trait PsiReceiver: Send + Sync {
    /// Run `protocol` over `connection` and return the intersection
    async fn receive(
        &self,
        protocol: Protocol,
        connection: Connection,
        count: u64,
        records: mpsc::Receiver<Vec<u8>>,
    ) -> Result<Vec<Vec<u8>>, EngineError>;
}
