// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! Service-call implementations distinguish two failure severities: a
//! *recoverable* condition is reported to the calling task as a status code
//! in R1 and execution continues, while an *unrecoverable* one faults the
//! task. This module keeps that split in the type system so each SVC body
//! can use `?` freely and a single wrapper applies the side effects.

use hsx_abi::{Code, FaultInfo, UsageError};

/// Outcome classification for an SVC implementation.
#[derive(Clone, Debug)]
pub enum SvcError {
    /// A recoverable error, indicated to the calling task by a status code
    /// in R1 (with R0 zeroed).
    Recoverable(Code),
    /// An unrecoverable error, translated into a fault against the calling
    /// task, which becomes FAILED and is no longer runnable.
    Fatal(FaultInfo),
}

impl From<FaultInfo> for SvcError {
    fn from(f: FaultInfo) -> Self {
        Self::Fatal(f)
    }
}

impl From<UsageError> for SvcError {
    fn from(e: UsageError) -> Self {
        Self::Fatal(e.into())
    }
}

impl From<Code> for SvcError {
    fn from(c: Code) -> Self {
        Self::Recoverable(c)
    }
}
