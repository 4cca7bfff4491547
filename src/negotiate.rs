//! PSI protocol negotiation
//!
//! One round, right after the TLS handshake and before any PSI bytes:
//!
//! ```text
//! proposer -> decider   [N][id_1]...[id_N]   ids in proposer's preference order
//! decider  -> proposer  [id]                 the decision
//! ```
//!
//! The decider picks the first protocol in its own preference order that the
//! proposer offered, and falls back to [`Protocol::default`] when there is no
//! overlap. Ids the decider does not know are ignored.
//!
//! Older single-byte acknowledgement and single-preference formats are not
//! spoken.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

/// PSI protocol variant run over the data channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Diffie-Hellman based PSI
    #[default]
    Dhpsi,
    /// KKRT oblivious-transport based PSI
    Kkrtpsi,
}

impl Protocol {
    /// Every protocol this crate can negotiate
    pub const ALL: [Protocol; 2] = [Protocol::Dhpsi, Protocol::Kkrtpsi];

    /// Wire id
    pub fn id(self) -> u8 {
        match self {
            Protocol::Dhpsi => 1,
            Protocol::Kkrtpsi => 2,
        }
    }

    /// Protocol for a wire id
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(Protocol::Dhpsi),
            2 => Some(Protocol::Kkrtpsi),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Dhpsi => write!(f, "dhpsi"),
            Protocol::Kkrtpsi => write!(f, "kkrtpsi"),
        }
    }
}

impl FromStr for Protocol {
    type Err = NegotiationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dhpsi" => Ok(Protocol::Dhpsi),
            "kkrtpsi" => Ok(Protocol::Kkrtpsi),
            other => Err(NegotiationError::UnknownProtocolName(other.to_string())),
        }
    }
}

/// Negotiation failures
#[derive(Debug, Error)]
pub enum NegotiationError {
    /// Writing our message failed or was cut short
    #[error("failed to send protocol negotiation message: {0}")]
    Send(#[source] std::io::Error),

    /// Peer's message was missing or cut short
    #[error("failed to receive protocol negotiation message: {0}")]
    Receive(#[source] std::io::Error),

    /// Proposal does not fit the one-byte count
    #[error("cannot propose {0} protocols, at most 255")]
    TooManyProtocols(usize),

    /// Decider chose an id we do not know
    #[error("peer selected unsupported protocol id {0}")]
    UnsupportedProtocol(u8),

    /// Configured protocol name not recognized
    #[error("unknown protocol name {0:?}")]
    UnknownProtocolName(String),
}

/// Offer `preferred` in order and return the peer's decision
pub async fn propose_as_sender<S>(
    stream: &mut S,
    preferred: &[Protocol],
) -> Result<Protocol, NegotiationError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let count =
        u8::try_from(preferred.len()).map_err(|_| NegotiationError::TooManyProtocols(preferred.len()))?;

    let mut message = Vec::with_capacity(preferred.len() + 1);
    message.push(count);
    message.extend(preferred.iter().map(|p| p.id()));

    stream
        .write_all(&message)
        .await
        .map_err(NegotiationError::Send)?;
    stream.flush().await.map_err(NegotiationError::Send)?;

    let decision = stream.read_u8().await.map_err(NegotiationError::Receive)?;
    let protocol = Protocol::from_id(decision).ok_or(NegotiationError::UnsupportedProtocol(decision))?;

    info!(offered = ?preferred, %protocol, "PSI protocol agreed");
    Ok(protocol)
}

/// Read the peer's offer, decide against `own_preferences` and answer
pub async fn decide_as_receiver<S>(
    stream: &mut S,
    own_preferences: &[Protocol],
) -> Result<Protocol, NegotiationError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let count = stream.read_u8().await.map_err(NegotiationError::Receive)?;
    let mut offered_ids = vec![0u8; usize::from(count)];
    stream
        .read_exact(&mut offered_ids)
        .await
        .map_err(NegotiationError::Receive)?;

    let offered: Vec<Protocol> = offered_ids.iter().filter_map(|id| Protocol::from_id(*id)).collect();
    debug!(offered = ?offered, ignored = offered_ids.len() - offered.len(), "Received protocol proposal");

    let protocol = select(own_preferences, &offered);

    stream
        .write_all(&[protocol.id()])
        .await
        .map_err(NegotiationError::Send)?;
    stream.flush().await.map_err(NegotiationError::Send)?;

    info!(offered = ?offered, %protocol, "PSI protocol decided");
    Ok(protocol)
}

/// First of `own` that appears in `offered`, else the default
pub fn select(own: &[Protocol], offered: &[Protocol]) -> Protocol {
    own.iter()
        .copied()
        .find(|p| offered.contains(p))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    async fn negotiate(sender: &[Protocol], receiver: &[Protocol]) -> (Protocol, Protocol) {
        let (mut a, mut b) = duplex(64);
        let (proposed, decided) = tokio::join!(
            propose_as_sender(&mut a, sender),
            decide_as_receiver(&mut b, receiver)
        );
        (proposed.unwrap(), decided.unwrap())
    }

    // ==========================================================================
    // Story Tests: Agreeing on a PSI Protocol
    // ==========================================================================

    /// Story: both sides support DHPSI, the sender would prefer KKRT
    #[tokio::test]
    async fn story_overlap_picks_receivers_preference() {
        let (sender, receiver) =
            negotiate(&[Protocol::Kkrtpsi, Protocol::Dhpsi], &[Protocol::Dhpsi]).await;
        assert_eq!(sender, Protocol::Dhpsi);
        assert_eq!(receiver, Protocol::Dhpsi);
    }

    /// Story: no overlap at all, both fall back to the default
    #[tokio::test]
    async fn story_no_overlap_falls_back_to_default() {
        let (sender, receiver) = negotiate(&[Protocol::Kkrtpsi], &[Protocol::Dhpsi]).await;
        assert_eq!(sender, Protocol::default());
        assert_eq!(receiver, Protocol::default());
    }

    #[tokio::test]
    async fn receiver_order_wins_over_sender_order() {
        let (sender, receiver) = negotiate(
            &[Protocol::Dhpsi, Protocol::Kkrtpsi],
            &[Protocol::Kkrtpsi, Protocol::Dhpsi],
        )
        .await;
        assert_eq!(sender, Protocol::Kkrtpsi);
        assert_eq!(receiver, Protocol::Kkrtpsi);
    }

    #[tokio::test]
    async fn proposal_wire_format() {
        let (mut a, mut b) = duplex(64);
        let proposer = tokio::spawn(async move {
            propose_as_sender(&mut a, &[Protocol::Kkrtpsi, Protocol::Dhpsi]).await
        });

        let mut message = [0u8; 3];
        b.read_exact(&mut message).await.unwrap();
        assert_eq!(message, [2, 2, 1]);
        b.write_all(&[1]).await.unwrap();

        assert_eq!(proposer.await.unwrap().unwrap(), Protocol::Dhpsi);
    }

    #[tokio::test]
    async fn unknown_offered_ids_are_ignored() {
        let (mut a, mut b) = duplex(64);
        a.write_all(&[3, 0, 9, 2]).await.unwrap();

        let decided = decide_as_receiver(&mut b, &[Protocol::Dhpsi, Protocol::Kkrtpsi])
            .await
            .unwrap();
        assert_eq!(decided, Protocol::Kkrtpsi);
        assert_eq!(a.read_u8().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn unknown_decision_is_rejected() {
        let (mut a, mut b) = duplex(64);
        b.write_all(&[7]).await.unwrap();

        let err = propose_as_sender(&mut a, &[Protocol::Dhpsi]).await.unwrap_err();
        assert!(matches!(err, NegotiationError::UnsupportedProtocol(7)));
    }

    #[tokio::test]
    async fn short_proposal_is_a_hard_error() {
        let (mut a, mut b) = duplex(64);
        a.write_all(&[2, 1]).await.unwrap();
        drop(a);

        let err = decide_as_receiver(&mut b, &[Protocol::Dhpsi]).await.unwrap_err();
        assert!(matches!(err, NegotiationError::Receive(_)));
    }

    #[tokio::test]
    async fn closed_peer_fails_the_proposer() {
        let (mut a, b) = duplex(64);
        drop(b);

        let err = propose_as_sender(&mut a, &[Protocol::Dhpsi]).await.unwrap_err();
        assert!(matches!(
            err,
            NegotiationError::Send(_) | NegotiationError::Receive(_)
        ));
    }

    #[test]
    fn protocol_names_parse() {
        assert_eq!("dhpsi".parse::<Protocol>().unwrap(), Protocol::Dhpsi);
        assert_eq!(" KKRTPSI ".parse::<Protocol>().unwrap(), Protocol::Kkrtpsi);
        assert!("ecdh".parse::<Protocol>().is_err());
        for protocol in Protocol::ALL {
            assert_eq!(Protocol::from_id(protocol.id()), Some(protocol));
            assert_eq!(protocol.to_string().parse::<Protocol>().unwrap(), protocol);
        }
        assert_eq!(Protocol::from_id(0), None);
    }

    #[tokio::test]
    async fn too_many_protocols() {
        let many = vec![Protocol::Dhpsi; 256];
        let (mut a, _b) = duplex(1024);
        let err = propose_as_sender(&mut a, &many).await.unwrap_err();
        assert!(matches!(err, NegotiationError::TooManyProtocols(256)));
    }
}
