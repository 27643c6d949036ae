// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Crate-level error type. Syscall-level modules (shm, uxsocket) return
// io::Result directly; everything above converts into this.

use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed adapter URL.
    #[error("URL parse error: {0}")]
    Parse(String),

    /// Intro exchange failed: version or protocol mismatch, short read, etc.
    #[error("protocol error: {0}")]
    Proto(String),

    /// Bump allocation in the shared memory pool ran past the end.
    /// Pool sizes are deterministic from channel parameters, so this is a bug
    /// in the caller's sizing, not a runtime condition to retry.
    #[error("shared memory pool exhausted: requested {requested} bytes, {available} left")]
    PoolExhausted { requested: usize, available: usize },

    /// The legacy barrier synchronization mode is still selectable for
    /// compatibility but no longer implemented.
    #[error("barrier sync mode is not supported; use per-channel sync")]
    BarrierUnsupported,
}

pub type Result<T> = std::result::Result<T, Error>;
