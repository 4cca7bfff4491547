//! Identifier ingestion
//!
//! Input is newline-delimited, one identifier per line, each prefixed with
//! its kind and a colon (`e:alice@example.com`, `i4:10.0.0.1`). Lines with an
//! unknown prefix, no prefix or an empty value are dropped. Duplicates are
//! removed before counting, so the count handed to the PSI engine matches the
//! records it will actually receive.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Identifier ingestion failures
#[derive(Debug, Error)]
pub enum IdentifierError {
    /// Input file could not be opened
    #[error("failed to open identifier file {path}: {source}")]
    Open {
        /// Path that was opened
        path: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Reading input failed part way
    #[error("failed to read identifiers: {0}")]
    Read(#[from] std::io::Error),
}

/// Identifier type, from its line prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierKind {
    /// `e`: hashed email
    Email,
    /// `p`: hashed phone number
    PhoneNumber,
    /// `i4`: IPv4 address
    Ipv4,
    /// `i6`: IPv6 address
    Ipv6,
    /// `a`: Apple IDFA
    AppleIdfa,
    /// `g`: Google GAID
    GoogleGaid,
    /// `r`: Roku RIDA
    RokuRida,
    /// `s`: Samsung TIFA
    SamsungTifa,
    /// `f`: Amazon AFAI
    AmazonAfai,
    /// `n`: NetID
    NetId,
    /// `z`: postal code
    PostalCode,
    /// `id5`: ID5
    Id5,
    /// `utiq`: Utiq
    Utiq,
}

impl IdentifierKind {
    /// Line prefix, without the colon
    pub fn prefix(self) -> &'static str {
        match self {
            IdentifierKind::Email => "e",
            IdentifierKind::PhoneNumber => "p",
            IdentifierKind::Ipv4 => "i4",
            IdentifierKind::Ipv6 => "i6",
            IdentifierKind::AppleIdfa => "a",
            IdentifierKind::GoogleGaid => "g",
            IdentifierKind::RokuRida => "r",
            IdentifierKind::SamsungTifa => "s",
            IdentifierKind::AmazonAfai => "f",
            IdentifierKind::NetId => "n",
            IdentifierKind::PostalCode => "z",
            IdentifierKind::Id5 => "id5",
            IdentifierKind::Utiq => "utiq",
        }
    }

    /// Kind for a line prefix
    pub fn from_prefix(prefix: &str) -> Option<Self> {
        let kind = match prefix {
            "e" => IdentifierKind::Email,
            "p" => IdentifierKind::PhoneNumber,
            "i4" => IdentifierKind::Ipv4,
            "i6" => IdentifierKind::Ipv6,
            "a" => IdentifierKind::AppleIdfa,
            "g" => IdentifierKind::GoogleGaid,
            "r" => IdentifierKind::RokuRida,
            "s" => IdentifierKind::SamsungTifa,
            "f" => IdentifierKind::AmazonAfai,
            "n" => IdentifierKind::NetId,
            "z" => IdentifierKind::PostalCode,
            "id5" => IdentifierKind::Id5,
            "utiq" => IdentifierKind::Utiq,
            _ => return None,
        };
        Some(kind)
    }
}

impl fmt::Display for IdentifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Kind of an already trimmed identifier line, if it is usable
pub fn classify(line: &str) -> Option<IdentifierKind> {
    let (prefix, value) = line.split_once(':')?;
    if value.is_empty() {
        return None;
    }
    IdentifierKind::from_prefix(prefix)
}

/// Identifier counts per kind
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Insights {
    counts: BTreeMap<IdentifierKind, u64>,
}

impl Insights {
    /// Count for one kind
    pub fn get(&self, kind: IdentifierKind) -> u64 {
        self.counts.get(&kind).copied().unwrap_or(0)
    }

    /// Set the count for one kind
    pub fn set(&mut self, kind: IdentifierKind, count: u64) {
        self.counts.insert(kind, count);
    }

    fn increment(&mut self, kind: IdentifierKind) {
        *self.counts.entry(kind).or_insert(0) += 1;
    }

    /// Sum over all kinds
    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    /// Non-zero counts in kind order
    pub fn iter(&self) -> impl Iterator<Item = (IdentifierKind, u64)> + '_ {
        self.counts
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(kind, count)| (*kind, *count))
    }
}

impl fmt::Display for Insights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (kind, count) in self.iter() {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{kind}={count}")?;
            first = false;
        }
        Ok(())
    }
}

/// Deduplicated identifiers in first-seen order
#[derive(Debug, Clone, Default)]
pub struct IdentifierSet {
    records: Vec<String>,
    insights: Insights,
}

impl IdentifierSet {
    /// Build from in-memory lines
    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut builder = Builder::default();
        for line in lines {
            builder.push(line.as_ref());
        }
        builder.finish()
    }

    /// Read every line of `reader`
    pub async fn from_reader<R>(reader: R) -> Result<Self, IdentifierError>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut builder = Builder::default();
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            builder.push(&line);
        }
        Ok(builder.finish())
    }

    /// Number of distinct identifiers
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no identifier survived filtering
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Counts per kind
    pub fn insights(&self) -> &Insights {
        &self.insights
    }

    /// Identifier lines, prefix included
    pub fn records(&self) -> &[String] {
        &self.records
    }

    /// Hand the records to a consumer one at a time.
    ///
    /// A producer task pushes each record onto a capacity-1 channel, so it
    /// never runs more than one record ahead of the consumer. The producer
    /// stops early if the receiver is dropped.
    pub fn stream(self) -> (u64, mpsc::Receiver<Vec<u8>>, JoinHandle<()>) {
        let count = self.records.len() as u64;
        let (tx, rx) = mpsc::channel(1);

        let producer = tokio::spawn(async move {
            let mut sent = 0u64;
            for record in self.records {
                if tx.send(record.into_bytes()).await.is_err() {
                    debug!(sent, "Identifier consumer went away, stopping producer");
                    return;
                }
                sent += 1;
            }
            debug!(sent, "All identifiers handed over");
        });

        (count, rx, producer)
    }
}

#[derive(Default)]
struct Builder {
    seen: HashSet<String>,
    set: IdentifierSet,
    dropped: u64,
}

impl Builder {
    fn push(&mut self, raw: &str) {
        let line = raw.trim();
        if line.is_empty() {
            return;
        }
        let Some(kind) = classify(line) else {
            self.dropped += 1;
            return;
        };
        if self.seen.insert(line.to_string()) {
            self.set.records.push(line.to_string());
            self.set.insights.increment(kind);
        }
    }

    fn finish(self) -> IdentifierSet {
        if self.dropped > 0 {
            debug!(dropped = self.dropped, "Dropped unrecognized identifier lines");
        }
        self.set
    }
}

/// Read and classify identifiers from `reader`
pub async fn load_identifiers<R>(reader: R) -> Result<IdentifierSet, IdentifierError>
where
    R: AsyncBufRead + Unpin,
{
    let set = IdentifierSet::from_reader(reader).await?;
    info!(count = set.len(), breakdown = %set.insights(), "Loaded identifiers");
    Ok(set)
}

/// Read and classify identifiers from a file
pub async fn load_file(path: impl AsRef<Path>) -> Result<IdentifierSet, IdentifierError> {
    let path = path.as_ref();
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|source| IdentifierError::Open {
            path: path.display().to_string(),
            source,
        })?;
    load_identifiers(BufReader::new(file)).await
}
