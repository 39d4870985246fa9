// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Kernel seam consumed by the fork library.
//!
//! [`Syscalls`] mutates environments and mappings, [`SelfMap`] is the
//! read-only projection of the caller's own page tables and of the
//! environment table, and [`UserMemory`] is plain access to the caller's
//! address space.

use nexus_abi::{
    pdx, pgnum, EnvId, EnvInfo, EnvStatus, Exofork, Pte, PteFlags, SysResult, UTrapframe, PGSIZE,
};

/// Environment and page syscalls.
///
/// `EnvId::CURRENT` names the caller wherever an environment is expected.
pub trait Syscalls {
    /// Identifier of the calling environment.
    fn getenvid(&self) -> SysResult<EnvId>;

    /// Creates a suspended register-level clone of the caller with an empty address space.
    fn exofork(&self) -> SysResult<Exofork>;

    /// Allocates a zeroed frame and maps it at `va` in `env`, replacing any prior mapping.
    fn page_alloc(&self, env: EnvId, va: usize, perm: PteFlags) -> SysResult<()>;

    /// Maps the frame behind `src_va` in `src` at `dst_va` in `dst`, replacing any prior mapping.
    fn page_map(
        &self,
        src: EnvId,
        src_va: usize,
        dst: EnvId,
        dst_va: usize,
        perm: PteFlags,
    ) -> SysResult<()>;

    /// Removes the mapping at `va` in `env`.
    fn page_unmap(&self, env: EnvId, va: usize) -> SysResult<()>;

    /// Sets the scheduling status of `env`.
    fn env_set_status(&self, env: EnvId, status: EnvStatus) -> SysResult<()>;

    /// Registers `entry` as the fault upcall of `env`.
    fn env_set_pgfault_upcall(&self, env: EnvId, entry: usize) -> SysResult<()>;

    /// Destroys `env`.
    fn env_destroy(&self, env: EnvId) -> SysResult<()>;
}

/// Read-only view of the caller's own translation tables and of the environment table.
pub trait SelfMap {
    /// Page-directory entry `pdx`.
    fn uvpd(&self, pdx: usize) -> Pte;

    /// Page-table entry for page number `pn`. Only meaningful when its directory entry is present.
    fn uvpt(&self, pn: usize) -> Pte;

    /// Descriptor in slot `index` of the environment table.
    fn env_info(&self, index: usize) -> Option<EnvInfo>;

    /// Entry mapping `va`, or [`Pte::EMPTY`] when its directory entry is absent.
    fn lookup(&self, va: usize) -> Pte {
        if !self.uvpd(pdx(va)).has(PteFlags::PRESENT) {
            return Pte::EMPTY;
        }
        self.uvpt(pgnum(va))
    }
}

/// Outcome of a user access the kernel could not satisfy directly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemFault {
    /// The kernel pushed `frame` on the exception stack and entered `entry`.
    Upcall {
        /// Registered upcall entry.
        entry: usize,
        /// Trapframe describing the fault.
        frame: UTrapframe,
    },
    /// No usable upcall or exception stack; the environment was destroyed.
    Killed,
}

/// Access to the caller's own address space.
pub trait UserMemory {
    /// Reads `buf.len()` bytes starting at `va`.
    fn load(&self, va: usize, buf: &mut [u8]) -> Result<(), MemFault>;

    /// Writes `bytes` starting at `va`.
    fn store(&self, va: usize, bytes: &[u8]) -> Result<(), MemFault>;

    /// Copies the page at `src` over the page at `dst`.
    fn copy_page(&self, dst: usize, src: usize) -> Result<(), MemFault> {
        let mut page = [0u8; PGSIZE];
        self.load(src, &mut page)?;
        self.store(dst, &page)
    }
}

/// Everything the fork library needs from the kernel.
pub trait Kernel: Syscalls + SelfMap + UserMemory {}

impl<T: Syscalls + SelfMap + UserMemory> Kernel for T {}
