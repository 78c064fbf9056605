//! Requests and Task Statuses
//!
//! A [`Request`] is immutable once created. Results travel back separately as
//! [`TaskStatus`] values correlated by [`RequestId`], so no request object is
//! shared across threads while it is being answered.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::StorageFault;

// =============================================================================
// Identifiers
// =============================================================================

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique request identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

impl RequestId {
    /// Allocate the next id.
    pub fn next() -> Self {
        Self(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Identifier of a client whose response sink is registered with the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(pub u64);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

// =============================================================================
// Content Hash
// =============================================================================

/// Content digest. The raw bytes are the index key.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentHash(Bytes);

impl ContentHash {
    /// SHA-256 digest of `data`.
    pub fn digest(data: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(&Sha256::digest(data)))
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Digest length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Check if the digest is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl std::fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short form is enough for log lines
        let hex = self.to_hex();
        write!(f, "{}", &hex[..hex.len().min(16)])
    }
}

impl From<Bytes> for ContentHash {
    fn from(b: Bytes) -> Self {
        Self(b)
    }
}

impl From<Vec<u8>> for ContentHash {
    fn from(v: Vec<u8>) -> Self {
        Self(Bytes::from(v))
    }
}

impl From<&[u8]> for ContentHash {
    fn from(s: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(s))
    }
}

// =============================================================================
// Requests
// =============================================================================

/// Request type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskKind {
    Put,
    Get,
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Put => write!(f, "put"),
            TaskKind::Get => write!(f, "get"),
        }
    }
}

/// What a request asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Store `data` under `hash`
    Put { hash: ContentHash, data: Bytes },
    /// Fetch the data stored under `hash`
    Get { hash: ContentHash },
}

/// A client request travelling from router to storage engine.
#[derive(Debug, Clone)]
pub struct Request {
    id: RequestId,
    origin: ClientId,
    submitted_at: Instant,
    op: Operation,
}

impl Request {
    /// Create a put request.
    pub fn put(origin: ClientId, hash: ContentHash, data: impl Into<Bytes>) -> Self {
        Self::new(
            origin,
            Operation::Put {
                hash,
                data: data.into(),
            },
        )
    }

    /// Create a get request.
    pub fn get(origin: ClientId, hash: ContentHash) -> Self {
        Self::new(origin, Operation::Get { hash })
    }

    fn new(origin: ClientId, op: Operation) -> Self {
        Self {
            id: RequestId::next(),
            origin,
            submitted_at: Instant::now(),
            op,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn origin(&self) -> ClientId {
        self.origin
    }

    pub fn submitted_at(&self) -> Instant {
        self.submitted_at
    }

    pub fn operation(&self) -> &Operation {
        &self.op
    }

    /// Content hash addressed by this request.
    pub fn hash(&self) -> &ContentHash {
        match &self.op {
            Operation::Put { hash, .. } | Operation::Get { hash } => hash,
        }
    }

    pub fn kind(&self) -> TaskKind {
        match self.op {
            Operation::Put { .. } => TaskKind::Put,
            Operation::Get { .. } => TaskKind::Get,
        }
    }

    /// Payload of a put request.
    pub fn data(&self) -> Option<&Bytes> {
        match &self.op {
            Operation::Put { data, .. } => Some(data),
            Operation::Get { .. } => None,
        }
    }
}

// =============================================================================
// Statuses
// =============================================================================

/// Result of one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Put completed; `deduplicated` when the hash was already stored
    Stored { deduplicated: bool },
    /// Get completed with the stored payload
    Found(Bytes),
    /// Get for a hash that was never stored
    NotFound,
    /// Disk failure while handling the batch
    Failed(StorageFault),
}

impl Outcome {
    /// True for `Stored` and `Found`.
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Stored { .. } | Outcome::Found(_))
    }
}

/// Completed request, delivered back to the originating client.
#[derive(Debug, Clone)]
pub struct TaskStatus {
    pub id: RequestId,
    pub origin: ClientId,
    pub hash: ContentHash,
    pub kind: TaskKind,
    pub outcome: Outcome,
    pub submitted_at: Instant,
    pub completed_at: Instant,
}

impl TaskStatus {
    /// Build the status answering `request`.
    pub fn answer(request: &Request, outcome: Outcome) -> Self {
        Self {
            id: request.id,
            origin: request.origin,
            hash: request.hash().clone(),
            kind: request.kind(),
            outcome,
            submitted_at: request.submitted_at,
            completed_at: Instant::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }

    /// Payload returned by a successful get.
    pub fn data(&self) -> Option<&Bytes> {
        match &self.outcome {
            Outcome::Found(data) => Some(data),
            _ => None,
        }
    }

    /// Time from submission to completion.
    pub fn latency(&self) -> Duration {
        self.completed_at.saturating_duration_since(self.submitted_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FaultKind;
    use crate::shard::BucketId;

    #[test]
    fn test_request_ids_are_unique() {
        let a = Request::get(ClientId(1), ContentHash::from(vec![1]));
        let b = Request::get(ClientId(1), ContentHash::from(vec![1]));
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_request_accessors() {
        let hash = ContentHash::digest(b"payload");
        let put = Request::put(ClientId(7), hash.clone(), &b"payload"[..]);
        assert_eq!(put.kind(), TaskKind::Put);
        assert_eq!(put.hash(), &hash);
        assert_eq!(put.data().map(|d| d.as_ref()), Some(&b"payload"[..]));
        assert_eq!(put.origin(), ClientId(7));

        let get = Request::get(ClientId(7), hash.clone());
        assert_eq!(get.kind(), TaskKind::Get);
        assert!(get.data().is_none());
    }

    #[test]
    fn test_digest_is_sha256() {
        let hash = ContentHash::digest(b"abc");
        assert_eq!(hash.len(), 32);
        assert_eq!(
            hash.to_hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(format!("{}", hash), "ba7816bf8f01cfea");
    }

    #[test]
    fn test_outcome_success() {
        assert!(Outcome::Stored {
            deduplicated: false
        }
        .is_success());
        assert!(Outcome::Found(Bytes::from_static(b"x")).is_success());
        assert!(!Outcome::NotFound.is_success());
        assert!(
            !Outcome::Failed(StorageFault::new(FaultKind::DataRead, BucketId(0), "x")).is_success()
        );
    }

    #[test]
    fn test_status_answers_request() {
        let request = Request::get(ClientId(2), ContentHash::from(vec![9, 9]));
        let status = TaskStatus::answer(&request, Outcome::Found(Bytes::from_static(b"hi")));

        assert_eq!(status.id, request.id());
        assert_eq!(status.origin, ClientId(2));
        assert_eq!(status.kind, TaskKind::Get);
        assert_eq!(status.data().map(|d| d.as_ref()), Some(&b"hi"[..]));
        assert!(status.completed_at >= status.submitted_at);
    }

    #[test]
    fn test_latency_spans_submission_to_answer() {
        let request = Request::get(ClientId(2), ContentHash::from(vec![1]));
        std::thread::sleep(Duration::from_millis(5));
        let status = TaskStatus::answer(&request, Outcome::NotFound);

        assert!(status.latency() >= Duration::from_millis(5));
        assert_eq!(status.latency(), status.completed_at - status.submitted_at);
    }
}
