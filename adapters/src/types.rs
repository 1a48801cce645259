//! Shared types for the adapter execution core

use crate::error::ErrorClass;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Connector kind (the protocol family behind the transport)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectorKind {
    /// Local filesystem
    File,
    /// FTP
    Ftp,
    /// SFTP
    Sftp,
    /// HTTP/REST
    Http,
    /// SOAP web service
    Soap,
    /// JDBC-style database
    Database,
    /// Message queue (JMS-style)
    MessageQueue,
    /// SAP IDOC/RFC
    Sap,
    /// Mail (SMTP/IMAP)
    Mail,
    /// OData service
    OData,
    /// Kafka
    Kafka,
    /// Third-party social/rate-limited API
    SocialApi,
    /// Custom transport
    Custom,
}

impl std::fmt::Display for ConnectorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectorKind::File => "FILE",
            ConnectorKind::Ftp => "FTP",
            ConnectorKind::Sftp => "SFTP",
            ConnectorKind::Http => "HTTP",
            ConnectorKind::Soap => "SOAP",
            ConnectorKind::Database => "DATABASE",
            ConnectorKind::MessageQueue => "MQ",
            ConnectorKind::Sap => "SAP",
            ConnectorKind::Mail => "MAIL",
            ConnectorKind::OData => "ODATA",
            ConnectorKind::Kafka => "KAFKA",
            ConnectorKind::SocialApi => "SOCIAL_API",
            ConnectorKind::Custom => "CUSTOM",
        };
        write!(f, "{}", s)
    }
}

/// A single record moving through an adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    /// Natural name/identity of the record (filename, message id, row key)
    pub name: String,
    /// Payload
    pub payload: serde_json::Value,
}

impl Record {
    /// Create a record
    pub fn new(name: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            payload,
        }
    }
}

/// Incremental-progress marker for a polling adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Cursor {
    /// Last-seen modification/event timestamp
    Timestamp(DateTime<Utc>),
    /// Monotonically increasing sequence/ID
    Sequence(u64),
    /// Opaque change-tracking token issued by the source system
    DeltaToken(String),
}

impl Cursor {
    /// Whether moving from `self` to `next` is a forward (or equal) move.
    ///
    /// Delta tokens are opaque and always accepted; a variant change is
    /// accepted too since it means the transport switched cursor form.
    pub fn allows_advance_to(&self, next: &Cursor) -> bool {
        match (self, next) {
            (Cursor::Timestamp(cur), Cursor::Timestamp(new)) => new >= cur,
            (Cursor::Sequence(cur), Cursor::Sequence(new)) => new >= cur,
            (Cursor::DeltaToken(_), Cursor::DeltaToken(_)) => true,
            _ => true,
        }
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cursor::Timestamp(t) => write!(f, "ts:{}", t.to_rfc3339()),
            Cursor::Sequence(n) => write!(f, "seq:{}", n),
            Cursor::DeltaToken(t) => write!(f, "delta:{}", t),
        }
    }
}

/// An ordered batch of records plus the cursor position that produced it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Batch {
    /// Batch ID
    pub batch_id: Uuid,
    /// Records in fetch/submission order
    pub records: Vec<Record>,
    /// Terminal cursor position of this batch (inbound only)
    pub end_cursor: Option<Cursor>,
    /// Created at
    pub created_at: DateTime<Utc>,
}

impl Batch {
    /// Create a batch from records
    pub fn new(records: Vec<Record>, end_cursor: Option<Cursor>) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            records,
            end_cursor,
            created_at: Utc::now(),
        }
    }

    /// Empty batch (nothing to fetch)
    pub fn empty() -> Self {
        Self::new(Vec::new(), None)
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the batch holds no records
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Result of a delivery commit at the target transport
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitResult {
    /// Records made visible at the target
    pub delivered: usize,
    /// External reference issued by the target, if any
    pub external_reference: Option<String>,
}

/// Downstream acknowledgement for a handed-off record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    /// Record accepted by the workflow engine
    Ack,
    /// Record refused; the batch hand-off fails
    Nack,
}

/// Operational status of an adapter instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdapterStatus {
    /// Polling/delivering normally
    Running,
    /// Retry budget exhausted; waiting out a backoff period
    Backoff,
    /// Error budget tripped or operator-disabled; requires re-arm
    Disabled,
}

/// Health snapshot for an adapter instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterHealth {
    /// Adapter instance ID
    pub adapter_id: String,
    /// Connector kind
    pub kind: ConnectorKind,
    /// Status
    pub status: AdapterStatus,
    /// Last error class, if any failure was seen
    pub last_error_class: Option<ErrorClass>,
    /// Reason recorded when disabled
    pub disabled_reason: Option<String>,
    /// Successful operations
    pub successful_operations: u64,
    /// Failed operations
    pub failed_operations: u64,
    /// Records suppressed by dedup
    pub records_deduped: u64,
    /// Current cursor position, if any
    pub cursor: Option<Cursor>,
    /// Dead-letter entries pending for this instance
    pub dead_letter_depth: usize,
    /// Snapshot time
    pub last_check: DateTime<Utc>,
}

impl AdapterHealth {
    /// Success rate over all operations
    pub fn success_rate(&self) -> f64 {
        let total = self.successful_operations + self.failed_operations;
        if total == 0 {
            return 1.0;
        }
        self.successful_operations as f64 / total as f64
    }
}
