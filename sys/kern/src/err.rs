// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common error-handling support.
//!
//! This module is designed around the idea that kernel code spends too much
//! time handling and recording errors, and we ought to be able to separate
//! that concern using `Result`.

use abi::{FaultInfo, UsageError};

use kerncore::NextTask;

/// An error committed by user code when interacting with a syscall.
///
/// This is used internally as the returned error type for syscall
/// implementations.
#[derive(Clone, Debug)]
pub enum UserError {
    /// A recoverable error. Recoverable errors are indicated to the errant
    /// task by returning a response code (the `u32` field). They may still
    /// cause a context switch, however, as indicated by the `NextTask`.
    ///
    /// Timeouts, would-block misses, resource exhaustion, and dead handles
    /// all travel this path: the caller keeps running and decides what to do.
    Recoverable(u32, NextTask),
    /// An unrecoverable error. Unrecoverable errors are translated to faults
    /// against the errant task, which is marked faulted and no longer
    /// runnable.
    Unrecoverable(FaultInfo),
}

/// Convenience conversion from `FaultInfo`.
impl From<FaultInfo> for UserError {
    fn from(f: FaultInfo) -> Self {
        Self::Unrecoverable(f)
    }
}

/// Convenience conversion from `UsageError` (by way of `FaultInfo`).
impl From<UsageError> for UserError {
    fn from(f: UsageError) -> Self {
        Self::Unrecoverable(f.into())
    }
}
