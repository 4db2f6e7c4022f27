use crate::core::{DbError, ErrorCode, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::frame::FrameKind;

/// Propagation attribute of a `begin_transaction_with` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionAttribute {
    Required,
    #[default]
    RequiresNew,
    Supports,
    Mandatory,
    Never,
    NotSupported,
}

/// What a `begin_transaction_with` call does to the frame stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    /// Push a fresh frame of the given kind.
    NewFrame(FrameKind),
    /// Bump the depth of the frame on top of the stack.
    ReuseTop,
}

impl TransactionAttribute {
    pub const ALL: [TransactionAttribute; 6] = [
        TransactionAttribute::Required,
        TransactionAttribute::RequiresNew,
        TransactionAttribute::Supports,
        TransactionAttribute::Mandatory,
        TransactionAttribute::Never,
        TransactionAttribute::NotSupported,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionAttribute::Required => "REQUIRED",
            TransactionAttribute::RequiresNew => "REQUIRES_NEW",
            TransactionAttribute::Supports => "SUPPORTS",
            TransactionAttribute::Mandatory => "MANDATORY",
            TransactionAttribute::Never => "NEVER",
            TransactionAttribute::NotSupported => "NOT_SUPPORTED",
        }
    }

    /// Resolve this attribute against the kind of the frame currently on top
    /// of the stack, `None` when the stack is empty.
    pub fn resolve(&self, top: Option<FrameKind>) -> Result<Propagation> {
        use FrameKind::{PassThrough, Transaction};
        use Propagation::{NewFrame, ReuseTop};

        match (self, top) {
            (TransactionAttribute::Required, Some(Transaction)) => Ok(ReuseTop),
            (TransactionAttribute::Required, _) => Ok(NewFrame(Transaction)),

            (TransactionAttribute::RequiresNew, _) => Ok(NewFrame(Transaction)),

            (TransactionAttribute::Supports, None) => Ok(NewFrame(PassThrough)),
            (TransactionAttribute::Supports, Some(_)) => Ok(ReuseTop),

            (TransactionAttribute::Mandatory, Some(Transaction)) => Ok(ReuseTop),
            (TransactionAttribute::Mandatory, _) => Err(DbError::coded(
                ErrorCode::TransactionIsRequired,
                "MANDATORY propagation requires an active transaction",
            )),

            (TransactionAttribute::Never, None) => Ok(NewFrame(PassThrough)),
            (TransactionAttribute::Never, Some(Transaction)) => Err(DbError::coded(
                ErrorCode::TransactionIsNeverRequired,
                "NEVER propagation cannot run inside an active transaction",
            )),
            (TransactionAttribute::Never, Some(PassThrough)) => Ok(ReuseTop),

            (TransactionAttribute::NotSupported, _) => Ok(NewFrame(PassThrough)),
        }
    }
}

impl fmt::Display for TransactionAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
