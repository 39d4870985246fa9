// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![cfg_attr(
    not(all(nexus_env = "os", target_arch = "riscv64", target_os = "none")),
    forbid(unsafe_code)
)]
#![deny(clippy::all, missing_docs)]
#![allow(unexpected_cfgs)]

//! CONTEXT: User-space process duplication with copy-on-write address-space sharing
//! OWNERS: @runtime
//! PUBLIC API: fork(), sfork(), duppage(), downgrade_to_cow(), cow_fault(), set_pgfault_handler(), upcall_entry(),
//!             EnvContext, Kernel (Syscalls + SelfMap + UserMemory)
//! DEPENDS_ON: nexus-abi, log, thiserror; parking_lot (backend-host)
//! INVARIANTS:
//!   - A page writable without COW is never mapped into two environments
//!   - Sharing a page downgrades every holder, including the sharer, to Present|User|COW
//!   - The exception stack page is private to each environment and never COW
//!   - Only write faults on COW pages are resolved; anything else aborts the environment
//!
//! The library never touches kernel state directly. Every mutation goes through
//! the [`sys::Syscalls`] seam and every inspection through the read-only
//! [`sys::SelfMap`] projection, so the same code runs against the in-memory
//! [`host`] kernel in tests and against the real kernel on the OS target.

pub mod cow;
pub mod duppage;
pub mod env;
pub mod fork;
pub mod pgfault;
pub mod sys;

#[cfg(feature = "backend-host")]
pub mod host;

#[cfg(all(nexus_env = "os", target_arch = "riscv64", target_os = "none"))]
pub mod os;

pub use cow::cow_fault;
pub use duppage::{downgrade_to_cow, duppage, DupKind};
pub use env::{EnvContext, PgfaultHandler};
pub use fork::{fork, mirror_address_space, sfork, ForkOutcome, ForkPhase, MirrorStats};
pub use pgfault::{deliver, set_pgfault_handler, upcall_entry, UPCALL_ENTRY};
pub use sys::{Kernel, MemFault, SelfMap, Syscalls, UserMemory};

use nexus_abi::{AbiError, EnvId};

/// Result alias for fork operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Errors produced while duplicating an environment or servicing its faults.
#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The kernel rejected a syscall.
    #[error("{op} failed: {err}")]
    Syscall {
        /// Syscall that failed.
        op: &'static str,
        /// Kernel rejection.
        err: AbiError,
    },
    /// A fault reached the COW handler without being a write.
    #[error("fault at {va:#x} was not a write")]
    NotWrite {
        /// Faulting address.
        va: usize,
    },
    /// A write fault hit a page that is not Present|User|COW.
    #[error("fault at {va:#x} hit a page that is not copy-on-write")]
    NotCow {
        /// Faulting address.
        va: usize,
    },
    /// A fault was delivered before any handler was registered.
    #[error("no page fault handler registered")]
    NoHandler,
    /// The kernel entered an upcall that is not this library's trampoline.
    #[error("fault upcall {0:#x} is not the library trampoline")]
    UnknownUpcall(usize),
    /// The environment descriptor carries no fault upcall to hand to a child.
    #[error("environment has no fault upcall registered")]
    NoUpcall,
    /// The environment table has no descriptor for the cached identity.
    #[error("environment {0} not found in the environment table")]
    UnknownEnv(EnvId),
    /// The same fault was raised again right after its handler returned.
    #[error("fault at {va:#x} persisted after being handled")]
    Unresolved {
        /// Faulting address.
        va: usize,
    },
    /// Copying a page into the scratch slot faulted.
    #[error("page copy at {va:#x} faulted")]
    CopyFault {
        /// Address that could not be accessed.
        va: usize,
    },
    /// The kernel destroyed the environment while delivering a fault.
    #[error("environment was destroyed by an unhandled fault")]
    Killed,
    /// Shared-memory fork is not available.
    #[error("shared fork is not implemented")]
    NotImplemented,
}

impl Error {
    /// Wraps a kernel rejection of `op`.
    pub fn syscall(op: &'static str) -> impl Fn(AbiError) -> Self {
        move |err| Self::Syscall { op, err }
    }

    /// Returns false only for errors the caller is expected to branch on.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::NotImplemented)
    }
}
