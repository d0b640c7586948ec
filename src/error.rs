//! Control-plane error taxonomy.
//!
//! Only control-plane operations return these; realtime operations report
//! transient faults as sentinel values (`None` / `false`) and protocol faults
//! are silently counted.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RtpError {
    /// A parameter failed validation; the system state is unchanged.
    #[error("invalid parameters: {0}")]
    InvalidParameters(&'static str),

    /// No free slot is left in the reader or writer table.
    #[error("slot table is full")]
    SlotTableFull,

    /// A reader or writer with this id already exists.
    #[error("a slot with this id already exists")]
    DuplicateId,

    /// A spinlock reached its loop upper bound.
    #[error("lock contended: spin loop upper bound reached")]
    LockContended,

    /// Socket open, bind or option failure.
    #[error("socket error: {0}")]
    Socket(#[from] io::Error),

    /// No slot with the given id exists.
    #[error("no slot with the given id")]
    NotFound,
}

pub type Result<T> = std::result::Result<T, RtpError>;
