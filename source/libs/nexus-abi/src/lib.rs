// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), no_std)]
#![cfg_attr(
    not(all(nexus_env = "os", target_arch = "riscv64", target_os = "none")),
    forbid(unsafe_code)
)]
#![deny(clippy::all, missing_docs)]
#![allow(unexpected_cfgs)]

//! CONTEXT: Environment and page-mapping ABI shared by the kernel and userland crates
//! OWNERS: @runtime
//! PUBLIC API: layout constants, PteFlags, Pte, FaultCode, UTrapframe, EnvId, EnvStatus, EnvInfo,
//!             Exofork, AbiError; OS-only syscalls: getenvid, exofork, page_*, env_*
//! DEPENDS_ON: no_std (OS), riscv ecall asm (OS), bitflags
//! INVARIANTS: UTrapframe image is 16 bytes LE; userspace wrappers map to stable kernel syscall IDs

use bitflags::bitflags;

// Address-space layout

/// Bytes mapped by a single page.
pub const PGSIZE: usize = 4096;
/// log2(PGSIZE).
pub const PGSHIFT: usize = 12;
/// Page-table entries per page table.
pub const NPTENTRIES: usize = 1024;
/// Page-directory entries per page directory.
pub const NPDENTRIES: usize = 1024;
/// Bytes mapped by one page-directory entry.
pub const PTSIZE: usize = PGSIZE * NPTENTRIES;
/// log2(PTSIZE).
pub const PDXSHIFT: usize = 22;

/// Read-only self-mapped page tables.
pub const UVPT: usize = 0xef40_0000;
/// Read-only self-mapped page directory.
pub const UVPD: usize = UVPT + (UVPT >> PGSHIFT) * 4;
/// Read-only environment table.
pub const UENVS: usize = 0xeec0_0000;
/// Top of the user-writable range; nothing at or above it may be mapped by userland.
pub const UTOP: usize = UENVS;
/// Top of the one-page user exception stack.
pub const UXSTACKTOP: usize = UTOP;
/// Top of the normal user stack (one guard page below the exception stack).
pub const USTACKTOP: usize = UTOP - 2 * PGSIZE;
/// Scratch range used for temporary page mappings.
pub const UTEMP: usize = 0x0040_0000;
/// Scratch slot used by the copy-on-write fault handler.
pub const PFTEMP: usize = UTEMP + PTSIZE - PGSIZE;

/// Capacity of the kernel environment table.
pub const NENV: usize = 1 << LOG2NENV;
const LOG2NENV: usize = 10;
/// Shift of the generation counter inside an [`EnvId`].
pub const ENVGENSHIFT: u32 = 12;

/// Page number containing `va`.
pub const fn pgnum(va: usize) -> usize {
    va >> PGSHIFT
}

/// Page-directory index of `va`.
pub const fn pdx(va: usize) -> usize {
    (va >> PDXSHIFT) & (NPDENTRIES - 1)
}

/// First virtual address of page `pn`.
pub const fn page_va(pn: usize) -> usize {
    pn << PGSHIFT
}

/// Rounds `va` down to the start of its page.
pub const fn round_down(va: usize) -> usize {
    va & !(PGSIZE - 1)
}

/// Returns true when `va` is page aligned.
pub const fn is_aligned(va: usize) -> bool {
    va % PGSIZE == 0
}

/// Index of `id` in the environment table.
pub const fn envx(id: EnvId) -> usize {
    id.0 as usize & (NENV - 1)
}

// Page-table entries

bitflags! {
    /// Permission bits carried by page-table and page-directory entries.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PteFlags: u32 {
        /// Entry maps a page.
        const PRESENT = 0x001;
        /// Page may be written.
        const WRITABLE = 0x002;
        /// Page is reachable from user mode.
        const USER = 0x004;
        /// Write-through caching.
        const PWT = 0x008;
        /// Caching disabled.
        const PCD = 0x010;
        /// Set by hardware on access.
        const ACCESSED = 0x020;
        /// Set by hardware on write.
        const DIRTY = 0x040;
        /// Software-available bit 0.
        const AVAIL0 = 0x200;
        /// Software-available bit 1, reserved for shared mappings.
        const SHARE = 0x400;
        /// Copy-on-write marker, carried in software-available bit 2.
        const COW = 0x800;
    }
}

impl PteFlags {
    /// Bits userland may pass to `page_alloc`/`page_map`.
    pub const SYSCALL: Self = Self::PRESENT
        .union(Self::WRITABLE)
        .union(Self::USER)
        .union(Self::AVAIL0)
        .union(Self::COW)
        .union(Self::SHARE);

    /// Present and user-accessible.
    pub const PU: Self = Self::PRESENT.union(Self::USER);
    /// Present, user-accessible and writable.
    pub const PUW: Self = Self::PU.union(Self::WRITABLE);
    /// Present, user-accessible, copy-on-write.
    pub const PU_COW: Self = Self::PU.union(Self::COW);
}

/// A page-table or page-directory entry as seen through the self-mapped tables.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Pte(u32);

impl Pte {
    /// The absent entry.
    pub const EMPTY: Self = Self(0);

    /// Builds an entry from a physical frame number and flags.
    pub const fn new(frame: u32, flags: PteFlags) -> Self {
        Self((frame << PGSHIFT) | flags.bits())
    }

    /// Wraps a raw entry.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw entry.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Physical frame number referenced by the entry.
    pub const fn frame(self) -> u32 {
        self.0 >> PGSHIFT
    }

    /// Permission bits of the entry, unknown bits dropped.
    pub const fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0 & (PGSIZE as u32 - 1))
    }

    /// Returns true when every bit of `flags` is set.
    pub const fn has(self, flags: PteFlags) -> bool {
        self.flags().contains(flags)
    }

    /// Present and user-accessible.
    pub const fn is_user_present(self) -> bool {
        self.has(PteFlags::PU)
    }
}

// Faults

bitflags! {
    /// Error code reported with a page fault.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct FaultCode: u32 {
        /// Fault was a protection violation (page was present).
        const PROTECTION = 0x1;
        /// Faulting access was a write.
        const WRITE = 0x2;
        /// Fault occurred in user mode.
        const USER = 0x4;
    }
}

/// Trapframe handed to the user fault upcall.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UTrapframe {
    /// Faulting virtual address.
    pub fault_va: usize,
    /// Fault error code.
    pub err: FaultCode,
}

impl UTrapframe {
    /// Size of the image the kernel pushes on the exception stack.
    pub const SIZE: usize = 16;

    /// Encodes the frame as pushed on the exception stack.
    pub fn to_le_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0..8].copy_from_slice(&(self.fault_va as u64).to_le_bytes());
        out[8..12].copy_from_slice(&self.err.bits().to_le_bytes());
        out
    }

    /// Decodes a frame previously produced by [`UTrapframe::to_le_bytes`].
    pub fn from_le_bytes(bytes: [u8; Self::SIZE]) -> Self {
        let mut va = [0u8; 8];
        va.copy_from_slice(&bytes[0..8]);
        let mut err = [0u8; 4];
        err.copy_from_slice(&bytes[8..12]);
        Self {
            fault_va: u64::from_le_bytes(va) as usize,
            err: FaultCode::from_bits_truncate(u32::from_le_bytes(err)),
        }
    }
}

// Environments

/// Environment identifier: generation in the high bits, table index in the low bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EnvId(u32);

impl EnvId {
    /// Names the calling environment in syscall arguments.
    pub const CURRENT: Self = Self(0);

    /// Builds an identifier from a generation and a table index.
    pub const fn new(generation: u32, index: usize) -> Self {
        Self((generation << ENVGENSHIFT) | (index as u32 & (NENV as u32 - 1)))
    }

    /// Wraps a raw identifier.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw identifier.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Returns true for the [`EnvId::CURRENT`] alias.
    pub const fn is_current(self) -> bool {
        self.0 == 0
    }
}

impl core::fmt::Display for EnvId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Scheduling status of an environment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnvStatus {
    /// Created but suspended; never scheduled until marked runnable.
    NotRunnable = 0,
    /// Eligible for scheduling.
    Runnable = 1,
    /// Currently executing.
    Running = 2,
    /// Being torn down.
    Dying = 3,
}

impl EnvStatus {
    /// Decodes a raw status value.
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::NotRunnable),
            1 => Some(Self::Runnable),
            2 => Some(Self::Running),
            3 => Some(Self::Dying),
            _ => None,
        }
    }
}

/// Read-only projection of one environment-table slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EnvInfo {
    /// Identifier of the environment occupying the slot.
    pub id: EnvId,
    /// Identifier of the environment that created it.
    pub parent_id: EnvId,
    /// Current status.
    pub status: EnvStatus,
    /// Registered fault upcall entry, if any.
    pub pgfault_upcall: Option<usize>,
}

/// Result of `exofork`, as observed by each of the two resumed flows.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Exofork {
    /// Observed by the creator: identifier of the new suspended clone.
    Parent(EnvId),
    /// Observed by the clone at its first resumed instruction.
    Child,
}

impl Exofork {
    /// Decodes the raw non-negative syscall return value.
    pub const fn from_raw(raw: usize) -> Self {
        if raw == 0 {
            Self::Child
        } else {
            Self::Parent(EnvId(raw as u32))
        }
    }
}

// Errors

/// Result returned by environment and page syscalls.
pub type SysResult<T> = core::result::Result<T, AbiError>;

/// Kernel rejections of environment and page syscalls.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbiError {
    /// Target environment does not exist or the caller may not touch it.
    BadEnv,
    /// Address, permission or status argument was invalid.
    Invalid,
    /// No physical frame (or page-table page) was available.
    NoMemory,
    /// Environment table is full.
    NoFreeEnv,
    /// Operation unsupported on the current build target.
    Unsupported,
}

impl AbiError {
    /// Decodes a raw syscall return, `None` when it denotes success.
    pub const fn from_raw(value: usize) -> Option<Self> {
        if (value as isize) >= 0 {
            return None;
        }
        match (value as isize).unsigned_abs() {
            2 => Some(Self::BadEnv),
            3 => Some(Self::Invalid),
            4 => Some(Self::NoMemory),
            5 => Some(Self::NoFreeEnv),
            _ => Some(Self::Unsupported),
        }
    }

    /// Negative value the kernel returns for this error.
    pub const fn to_raw(self) -> isize {
        match self {
            Self::BadEnv => -2,
            Self::Invalid => -3,
            Self::NoMemory => -4,
            Self::NoFreeEnv => -5,
            Self::Unsupported => -38,
        }
    }
}

impl core::fmt::Display for AbiError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let text = match self {
            Self::BadEnv => "bad environment",
            Self::Invalid => "invalid argument",
            Self::NoMemory => "out of memory",
            Self::NoFreeEnv => "out of environments",
            Self::Unsupported => "unsupported",
        };
        f.write_str(text)
    }
}

#[cfg(nexus_env = "os")]
mod os;
#[cfg(nexus_env = "os")]
pub use os::{
    env_destroy, env_set_pgfault_upcall, env_set_status, exofork, getenvid, page_alloc, page_map,
    page_unmap,
};
