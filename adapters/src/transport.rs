//! Collaborator seams: the protocol transport and the workflow-engine sink
//!
//! The core never inspects protocol-specific fields; each protocol supplies
//! one [`Transport`] implementation and the core drives it through this
//! capability interface alone.

use crate::error::Result;
use crate::types::{Acknowledgement, Batch, CommitResult, ConnectorKind, Cursor, Record};
use async_trait::async_trait;

/// Protocol transport capability, implemented once per protocol.
///
/// Sessions are opened by the transport but owned and pooled by the
/// [`ConnectionLeaseManager`](crate::pool::ConnectionLeaseManager); every
/// fetch/deliver call receives the leased session it must run on.
///
/// Delivery to file-style targets must follow the stage-then-rename
/// protocol: write under a temporary name in the target directory, verify,
/// then atomically rename to the final name. A partially written artifact
/// must never become visible to downstream readers.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Transport session/connection type, pooled by the lease manager
    type Session: Send + 'static;

    /// Open a new session to the external system
    async fn connect(&self) -> Result<Self::Session>;

    /// Fetch up to `max_items` records after `cursor` (inbound).
    ///
    /// An empty batch means nothing new; the cursor must not advance.
    /// A non-empty batch carries its terminal cursor position.
    async fn fetch(
        &self,
        session: &mut Self::Session,
        cursor: Option<&Cursor>,
        max_items: usize,
    ) -> Result<Batch>;

    /// Deliver a batch to the target system (outbound).
    ///
    /// When [`supports_atomic_batches`](Transport::supports_atomic_batches)
    /// is true the whole batch commits or none of it does; otherwise the
    /// executor calls this with single-record batches and tracks its own
    /// high-water mark.
    async fn deliver(&self, session: &mut Self::Session, batch: &Batch) -> Result<CommitResult>;

    /// Probe connectivity on an open session
    async fn test_connection(&self, session: &mut Self::Session) -> Result<()>;

    /// Whether `deliver` commits multi-record batches atomically
    fn supports_atomic_batches(&self) -> bool {
        false
    }

    /// Connector kind
    fn kind(&self) -> ConnectorKind;

    /// Transport name
    fn name(&self) -> &str;
}

/// The workflow engine receiving inbound records
#[async_trait]
pub trait Sink: Send + Sync {
    /// Hand one record to the workflow engine.
    ///
    /// `Err` is an infrastructure failure; [`Acknowledgement::Nack`] means
    /// the engine refused the record. Either fails the batch hand-off.
    async fn hand_off(&self, record: &Record) -> Result<Acknowledgement>;
}
