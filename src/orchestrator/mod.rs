//! One match attempt, end to end
//!
//! The sending side walks through these states:
//!
//! ```text
//! PollingRunEndpoint -> Connecting -> NegotiatingProtocol
//!     -> DelegatingToExternalEngine -> PollingResult -> Completed | Errored
//! ```
//!
//! Only "not ready" RPC answers are retried, at a fixed interval and bounded
//! by the init timeout (run endpoint) or the run timeout (everything else).
//! Any other failure ends the attempt immediately and names the stage it
//! happened in. A PSI exchange whose result never arrives is a timeout, not a
//! success.
//!
//! The receiving side ([`MatchOrchestrator::serve`]) accepts one pinned
//! connection, decides the protocol and hands the channel to a PSI receiver.

pub mod api;

use std::fmt;
use std::future::Future;
use std::time::Duration;

use rcgen::KeyPair;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

pub use api::{
    ApiError, EngineError, GetResultRequest, MatchApi, MatchResult, MatchResultState, PsiReceiver,
    PsiSender, RunMatchRequest, RunMatchResponse,
};

use crate::auth::external::TokenError;
use crate::auth::{authorization_header, TokenSource};
use crate::config::{ConfigError, MatchConfig};
use crate::error::ErrorKind;
use crate::identifiers::IdentifierSet;
use crate::negotiate::{decide_as_receiver, propose_as_sender, NegotiationError, Protocol};
use crate::network::{ConnectionManager, TransportError};
use crate::pki::{EphemeralCertificate, PkiError};
use crate::retry::{poll_until, PollStatus, RetryError};
use crate::tls::{client_config, server_config, PeerVerification, PinnedCertificate, TlsError};

/// Where a match attempt is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchState {
    /// Waiting for the service to hand out the peer endpoint
    PollingRunEndpoint,
    /// Opening the TLS data channel
    Connecting,
    /// Agreeing on a PSI protocol
    NegotiatingProtocol,
    /// PSI engine owns the channel
    DelegatingToExternalEngine,
    /// Waiting for the service to publish the result
    PollingResult,
    /// Result available
    Completed,
    /// Attempt failed
    Errored,
}

impl MatchState {
    /// Whether the attempt is over
    pub fn is_terminal(self) -> bool {
        matches!(self, MatchState::Completed | MatchState::Errored)
    }
}

impl fmt::Display for MatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MatchState::PollingRunEndpoint => "polling run endpoint",
            MatchState::Connecting => "connecting",
            MatchState::NegotiatingProtocol => "negotiating protocol",
            MatchState::DelegatingToExternalEngine => "running PSI",
            MatchState::PollingResult => "polling result",
            MatchState::Completed => "completed",
            MatchState::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// Match attempt failures, tagged with the stage they happened in
#[derive(Debug, Error)]
pub enum MatchError {
    /// Orchestrator configuration rejected
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Our ephemeral certificate could not be created
    #[error("failed to create ephemeral certificate: {0}")]
    Certificate(#[source] PkiError),

    /// Certificate from the run response is unusable
    #[error("failed to parse peer pinned certificate: {0}")]
    PeerCertificate(#[source] PkiError),

    /// TLS config could not be built
    #[error("failed to create TLS config: {0}")]
    Tls(#[from] TlsError),

    /// Request token could not be minted
    #[error("failed to create request token: {0}")]
    Token(#[from] TokenError),

    /// Service RPC failed
    #[error("{stage}: {source}")]
    Api {
        /// Stage of the failing call
        stage: MatchState,
        /// RPC failure
        #[source]
        source: ApiError,
    },

    /// Data channel failed
    #[error("{stage}: {source}")]
    Transport {
        /// Stage of the failure
        stage: MatchState,
        /// Transport failure
        #[source]
        source: TransportError,
    },

    /// Protocol negotiation failed
    #[error("negotiating protocol: {0}")]
    Negotiation(#[from] NegotiationError),

    /// PSI engine failed
    #[error("failed to run PSI: {0}")]
    Engine(#[source] EngineError),

    /// A stage outlived its deadline
    #[error("{stage} timed out after {timeout:?}")]
    Timeout {
        /// Stage that timed out
        stage: MatchState,
        /// Deadline that applied
        timeout: Duration,
    },

    /// Caller cancelled the attempt
    #[error("match cancelled while {stage}")]
    Cancelled {
        /// Stage at cancellation
        stage: MatchState,
    },

    /// Service reported the match as errored
    #[error("got an errored match result: {message}")]
    ResultErrored {
        /// Service-provided reason
        message: String,
    },

    /// Service reported a state other than completed or errored
    #[error("match result in unexpected state {0:?}")]
    UnexpectedResultState(MatchResultState),
}

impl MatchError {
    /// Failure category
    pub fn kind(&self) -> ErrorKind {
        match self {
            MatchError::Config(_) | MatchError::Certificate(_) | MatchError::Tls(_) => {
                ErrorKind::Configuration
            }
            MatchError::PeerCertificate(_) => ErrorKind::Trust,
            MatchError::Token(e) => e.kind(),
            MatchError::Api { source, .. } => source.kind(),
            MatchError::Transport { source, .. } => source.kind(),
            MatchError::Negotiation(_)
            | MatchError::Engine(_)
            | MatchError::ResultErrored { .. }
            | MatchError::UnexpectedResultState(_) => ErrorKind::Protocol,
            MatchError::Timeout { .. } => ErrorKind::OrchestrationTimeout,
            MatchError::Cancelled { .. } => ErrorKind::Internal,
        }
    }

    /// Stage the failure belongs to, when known
    pub fn stage(&self) -> Option<MatchState> {
        match self {
            MatchError::Api { stage, .. }
            | MatchError::Transport { stage, .. }
            | MatchError::Timeout { stage, .. }
            | MatchError::Cancelled { stage } => Some(*stage),
            MatchError::PeerCertificate(_) | MatchError::Tls(_) => Some(MatchState::Connecting),
            MatchError::Negotiation(_) => Some(MatchState::NegotiatingProtocol),
            MatchError::Engine(_) => Some(MatchState::DelegatingToExternalEngine),
            MatchError::ResultErrored { .. } | MatchError::UnexpectedResultState(_) => {
                Some(MatchState::Errored)
            }
            _ => None,
        }
    }
}

/// Successful sending-side attempt
#[derive(Debug, Clone)]
pub struct MatchOutcome {
    /// Id the result was published under
    pub match_result_id: String,
    /// Protocol the partners agreed on
    pub protocol: Protocol,
    /// Completed result
    pub result: MatchResult,
}

/// Successful receiving-side attempt
#[derive(Debug, Clone)]
pub struct ServeOutcome {
    /// Protocol the partners agreed on
    pub protocol: Protocol,
    /// Records both sides hold
    pub intersection: Vec<Vec<u8>>,
}

/// Drives match attempts against a federation service
pub struct MatchOrchestrator<A, T> {
    api: A,
    tokens: T,
    connections: ConnectionManager,
    config: MatchConfig,
}

impl<A: MatchApi, T: TokenSource> MatchOrchestrator<A, T> {
    /// Orchestrator with validated configuration
    pub fn new(api: A, tokens: T, config: MatchConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            api,
            tokens,
            connections: ConnectionManager::new(config.connect.clone()),
            config,
        })
    }

    /// Configuration in use
    pub fn config(&self) -> &MatchConfig {
        &self.config
    }

    /// Run one attempt as the connecting (sending) side
    pub async fn run<S>(
        &self,
        cancel: &CancellationToken,
        partner_key: &KeyPair,
        match_id: &str,
        identifiers: IdentifierSet,
        engine: &S,
    ) -> Result<MatchOutcome, MatchError>
    where
        S: PsiSender + ?Sized,
    {
        let started = Instant::now();
        let run_deadline = started + self.config.run_timeout;
        let init_deadline = (started + self.config.init_timeout).min(run_deadline);

        let certificate =
            EphemeralCertificate::issue(partner_key).map_err(MatchError::Certificate)?;
        debug!("Generated ephemeral certificate for TLS authentication");

        let match_result_id = Uuid::new_v4().to_string();
        info!(
            match_id = %match_id,
            match_result_id = %match_result_id,
            records = identifiers.len(),
            breakdown = %identifiers.insights(),
            "Starting match attempt"
        );

        let request = RunMatchRequest {
            match_id: match_id.to_string(),
            match_result_id: match_result_id.clone(),
            client_certificate_pem: certificate.certificate_pem().to_string(),
        };
        let run = self
            .poll_run_endpoint(cancel, init_deadline, &request)
            .await?;
        info!(endpoint = %run.endpoint, "Got match endpoint");

        let pin = PinnedCertificate::from_pem(&run.server_certificate_pem)
            .map_err(MatchError::PeerCertificate)?;
        let tls = client_config(certificate.to_tls_credential(), PeerVerification::Pinned(pin))?;

        let mut connection = within(
            MatchState::Connecting,
            run_deadline,
            self.config.run_timeout,
            cancel,
            self.connections.connect(cancel, &run.endpoint, tls),
        )
        .await?
        .map_err(|source| MatchError::Transport {
            stage: MatchState::Connecting,
            source,
        })?;

        let protocol = within(
            MatchState::NegotiatingProtocol,
            run_deadline,
            self.config.run_timeout,
            cancel,
            propose_as_sender(&mut connection, &self.config.preferred_protocols),
        )
        .await??;

        let (count, records, producer) = identifiers.stream();
        info!(%protocol, count, "Handing connection to PSI sender");
        let sent = within(
            MatchState::DelegatingToExternalEngine,
            run_deadline,
            self.config.run_timeout,
            cancel,
            engine.send(protocol, connection, count, records),
        )
        .await;
        producer.abort();
        sent?.map_err(MatchError::Engine)?;
        info!("Successfully completed PSI");

        let result_id = if run.match_result_id.is_empty() {
            match_result_id
        } else {
            run.match_result_id
        };
        let result = self.poll_result(cancel, run_deadline, &result_id).await?;

        match result.state {
            MatchResultState::Completed => {
                info!(match_result_id = %result_id, insights = %result.insights, "Match completed");
                Ok(MatchOutcome {
                    match_result_id: result_id,
                    protocol,
                    result,
                })
            }
            MatchResultState::Errored => {
                error!(match_result_id = %result_id, error = %result.error_msg, "Match errored");
                Err(MatchError::ResultErrored {
                    message: result.error_msg,
                })
            }
            other => Err(MatchError::UnexpectedResultState(other)),
        }
    }

    async fn poll_run_endpoint(
        &self,
        cancel: &CancellationToken,
        deadline: Instant,
        request: &RunMatchRequest,
    ) -> Result<RunMatchResponse, MatchError> {
        let stage = MatchState::PollingRunEndpoint;
        info!(timeout = ?self.config.init_timeout, "Polling run endpoint");

        poll_until(
            self.config.poll_interval,
            deadline,
            cancel,
            "run_match",
            || self.request_run(request),
        )
        .await
        .map_err(|e| stage_error(e, stage, self.config.init_timeout))
    }

    async fn request_run(
        &self,
        request: &RunMatchRequest,
    ) -> Result<PollStatus<RunMatchResponse>, MatchError> {
        let stage = MatchState::PollingRunEndpoint;
        let body = serde_json::to_vec(request).map_err(|e| MatchError::Api {
            stage,
            source: ApiError::Encode(e),
        })?;
        let token = self.tokens.token(&body)?;

        let response = self
            .api
            .run_match(&authorization_header(&token), request)
            .await
            .map_err(|source| MatchError::Api { stage, source })?;

        if response.endpoint.is_empty() {
            debug!("Match endpoint not ready");
            return Ok(PollStatus::Pending);
        }
        Ok(PollStatus::Ready(response))
    }

    async fn poll_result(
        &self,
        cancel: &CancellationToken,
        deadline: Instant,
        match_result_id: &str,
    ) -> Result<MatchResult, MatchError> {
        let stage = MatchState::PollingResult;
        let request = GetResultRequest {
            match_result_id: match_result_id.to_string(),
        };
        info!(match_result_id = %match_result_id, "Polling match result");

        poll_until(
            self.config.poll_interval,
            deadline,
            cancel,
            "get_result",
            || self.request_result(&request),
        )
        .await
        .map_err(|e| stage_error(e, stage, self.config.run_timeout))
    }

    async fn request_result(
        &self,
        request: &GetResultRequest,
    ) -> Result<PollStatus<MatchResult>, MatchError> {
        let stage = MatchState::PollingResult;
        let body = serde_json::to_vec(request).map_err(|e| MatchError::Api {
            stage,
            source: ApiError::Encode(e),
        })?;
        let token = self.tokens.token(&body)?;

        let result = self
            .api
            .get_result(&authorization_header(&token), request)
            .await
            .map_err(|source| MatchError::Api { stage, source })?;

        if result.state == MatchResultState::Pending {
            debug!("Match result not ready");
            return Ok(PollStatus::Pending);
        }
        Ok(PollStatus::Ready(result))
    }

    /// Run one attempt as the accepting (receiving) side.
    ///
    /// `own` is the certificate this side presents and `peer_certificate_pem`
    /// the connecting partner's certificate, both exchanged through the
    /// service beforehand.
    pub async fn serve<R>(
        &self,
        cancel: &CancellationToken,
        listener: TcpListener,
        own: &EphemeralCertificate,
        peer_certificate_pem: &str,
        identifiers: IdentifierSet,
        engine: &R,
    ) -> Result<ServeOutcome, MatchError>
    where
        R: PsiReceiver + ?Sized,
    {
        let run_deadline = Instant::now() + self.config.run_timeout;

        let pin = PinnedCertificate::from_pem(peer_certificate_pem)
            .map_err(MatchError::PeerCertificate)?;
        let tls = server_config(own.to_tls_credential(), PeerVerification::Pinned(pin))?;

        let mut connection = within(
            MatchState::Connecting,
            run_deadline,
            self.config.run_timeout,
            cancel,
            self.connections.accept_on(cancel, listener, tls),
        )
        .await?
        .map_err(|source| MatchError::Transport {
            stage: MatchState::Connecting,
            source,
        })?;

        let protocol = within(
            MatchState::NegotiatingProtocol,
            run_deadline,
            self.config.run_timeout,
            cancel,
            decide_as_receiver(&mut connection, &self.config.preferred_protocols),
        )
        .await??;

        let (count, records, producer) = identifiers.stream();
        info!(%protocol, count, "Handing connection to PSI receiver");
        let received = within(
            MatchState::DelegatingToExternalEngine,
            run_deadline,
            self.config.run_timeout,
            cancel,
            engine.receive(protocol, connection, count, records),
        )
        .await;
        producer.abort();
        let intersection = received?.map_err(MatchError::Engine)?;

        info!(%protocol, matched = intersection.len(), "PSI receiver finished");
        Ok(ServeOutcome {
            protocol,
            intersection,
        })
    }
}

/// Race `fut` against cancellation and `deadline`
async fn within<F: Future>(
    stage: MatchState,
    deadline: Instant,
    timeout: Duration,
    cancel: &CancellationToken,
    fut: F,
) -> Result<F::Output, MatchError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(MatchError::Cancelled { stage }),
        _ = tokio::time::sleep_until(deadline) => Err(MatchError::Timeout { stage, timeout }),
        out = fut => Ok(out),
    }
}

fn stage_error(e: RetryError<MatchError>, stage: MatchState, timeout: Duration) -> MatchError {
    match e {
        RetryError::Failed(e) => e,
        RetryError::DeadlineExceeded { attempts, .. } => {
            error!(%stage, attempts, ?timeout, "Polling deadline exceeded");
            MatchError::Timeout { stage, timeout }
        }
        RetryError::Cancelled => MatchError::Cancelled { stage },
    }
}
