// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Kernel seam backed by real syscalls and the kernel's read-only mappings.
//!
//! The kernel maps the caller's page directory at [`UVPD`], its page tables
//! at [`UVPT`] and the environment table at [`UENVS`], all read-only.

use core::ptr;

use nexus_abi::{
    EnvId, EnvInfo, EnvStatus, Exofork, Pte, PteFlags, SysResult, NENV, PGSIZE, UENVS, UVPD, UVPT,
};

use crate::sys::{MemFault, SelfMap, Syscalls, UserMemory};

/// Leading fields of a kernel environment descriptor, as mapped at [`UENVS`].
#[repr(C)]
#[derive(Clone, Copy)]
struct RawEnv {
    id: u32,
    parent_id: u32,
    status: u32,
    pgfault_upcall: usize,
}

const ENV_STRIDE: usize = 128;

/// Handle acting as the calling environment on the OS target.
#[derive(Clone, Copy, Debug, Default)]
pub struct OsKernel;

impl Syscalls for OsKernel {
    fn getenvid(&self) -> SysResult<EnvId> {
        nexus_abi::getenvid()
    }

    fn exofork(&self) -> SysResult<Exofork> {
        nexus_abi::exofork()
    }

    fn page_alloc(&self, env: EnvId, va: usize, perm: PteFlags) -> SysResult<()> {
        nexus_abi::page_alloc(env, va, perm)
    }

    fn page_map(
        &self,
        src: EnvId,
        src_va: usize,
        dst: EnvId,
        dst_va: usize,
        perm: PteFlags,
    ) -> SysResult<()> {
        nexus_abi::page_map(src, src_va, dst, dst_va, perm)
    }

    fn page_unmap(&self, env: EnvId, va: usize) -> SysResult<()> {
        nexus_abi::page_unmap(env, va)
    }

    fn env_set_status(&self, env: EnvId, status: EnvStatus) -> SysResult<()> {
        nexus_abi::env_set_status(env, status)
    }

    fn env_set_pgfault_upcall(&self, env: EnvId, entry: usize) -> SysResult<()> {
        nexus_abi::env_set_pgfault_upcall(env, entry)
    }

    fn env_destroy(&self, env: EnvId) -> SysResult<()> {
        nexus_abi::env_destroy(env)
    }
}

impl SelfMap for OsKernel {
    fn uvpd(&self, pdx: usize) -> Pte {
        // SAFETY: the directory self-map is always present and `pdx` indexes one page of entries.
        Pte::from_raw(unsafe { ptr::read_volatile((UVPD as *const u32).add(pdx)) })
    }

    fn uvpt(&self, pn: usize) -> Pte {
        // SAFETY: callers check the covering directory entry first, so the table page is mapped.
        Pte::from_raw(unsafe { ptr::read_volatile((UVPT as *const u32).add(pn)) })
    }

    fn env_info(&self, index: usize) -> Option<EnvInfo> {
        if index >= NENV {
            return None;
        }
        // SAFETY: the environment table is mapped read-only at UENVS for every environment.
        let raw = unsafe { ptr::read_volatile((UENVS + index * ENV_STRIDE) as *const RawEnv) };
        Some(EnvInfo {
            id: EnvId::from_raw(raw.id),
            parent_id: EnvId::from_raw(raw.parent_id),
            status: EnvStatus::from_raw(raw.status)?,
            pgfault_upcall: (raw.pgfault_upcall != 0).then_some(raw.pgfault_upcall),
        })
    }
}

impl UserMemory for OsKernel {
    fn load(&self, va: usize, buf: &mut [u8]) -> Result<(), MemFault> {
        // SAFETY: a fault on the source page is delivered to the registered upcall by the kernel.
        unsafe { ptr::copy_nonoverlapping(va as *const u8, buf.as_mut_ptr(), buf.len()) };
        Ok(())
    }

    fn store(&self, va: usize, bytes: &[u8]) -> Result<(), MemFault> {
        // SAFETY: a fault on the destination page is delivered to the registered upcall by the kernel.
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), va as *mut u8, bytes.len()) };
        Ok(())
    }

    fn copy_page(&self, dst: usize, src: usize) -> Result<(), MemFault> {
        // SAFETY: both addresses are page aligned and distinct; dst is a fresh writable frame.
        unsafe { ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, PGSIZE) };
        Ok(())
    }
}
