// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Raw environment and page syscalls (OS build).
//!
//! Off-target every wrapper returns [`AbiError::Unsupported`] so host builds
//! with `nexus_env = "os"` still type-check.

use crate::{AbiError, EnvId, EnvStatus, Exofork, PteFlags, SysResult};

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
const SYSCALL_GETENVID: usize = 40;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
const SYSCALL_EXOFORK: usize = 41;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
const SYSCALL_PAGE_ALLOC: usize = 42;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
const SYSCALL_PAGE_MAP: usize = 43;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
const SYSCALL_PAGE_UNMAP: usize = 44;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
const SYSCALL_ENV_SET_STATUS: usize = 45;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
const SYSCALL_ENV_SET_PGFAULT_UPCALL: usize = 46;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
const SYSCALL_ENV_DESTROY: usize = 47;

/// Returns the identifier of the calling environment.
pub fn getenvid() -> SysResult<EnvId> {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        let raw = unsafe { ecall0(SYSCALL_GETENVID) };
        decode_syscall(raw).map(|v| EnvId::from_raw(v as u32))
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        Err(AbiError::Unsupported)
    }
}

/// Creates a suspended register-level clone of the caller.
pub fn exofork() -> SysResult<Exofork> {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        let raw = unsafe {
            // SAFETY: no arguments; the kernel returns twice, once into each environment.
            ecall0(SYSCALL_EXOFORK)
        };
        decode_syscall(raw).map(Exofork::from_raw)
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        Err(AbiError::Unsupported)
    }
}

/// Allocates a zeroed frame and maps it at `va` in `env` with `perm`.
pub fn page_alloc(env: EnvId, va: usize, perm: PteFlags) -> SysResult<()> {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        let raw = unsafe {
            ecall3(SYSCALL_PAGE_ALLOC, env.raw() as usize, va, perm.bits() as usize)
        };
        decode_syscall(raw).map(|_| ())
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let _ = (env, va, perm);
        Err(AbiError::Unsupported)
    }
}

/// Maps the frame behind `src_va` in `src` at `dst_va` in `dst` with `perm`.
pub fn page_map(
    src: EnvId,
    src_va: usize,
    dst: EnvId,
    dst_va: usize,
    perm: PteFlags,
) -> SysResult<()> {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        let raw = unsafe {
            // SAFETY: all arguments are plain values validated by the kernel.
            ecall5(
                SYSCALL_PAGE_MAP,
                src.raw() as usize,
                src_va,
                dst.raw() as usize,
                dst_va,
                perm.bits() as usize,
            )
        };
        decode_syscall(raw).map(|_| ())
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let _ = (src, src_va, dst, dst_va, perm);
        Err(AbiError::Unsupported)
    }
}

/// Removes the mapping at `va` in `env`; absent mappings are not an error.
pub fn page_unmap(env: EnvId, va: usize) -> SysResult<()> {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        let raw = unsafe { ecall2(SYSCALL_PAGE_UNMAP, env.raw() as usize, va) };
        decode_syscall(raw).map(|_| ())
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let _ = (env, va);
        Err(AbiError::Unsupported)
    }
}

/// Sets the scheduling status of `env`.
pub fn env_set_status(env: EnvId, status: EnvStatus) -> SysResult<()> {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        let raw = unsafe {
            ecall2(SYSCALL_ENV_SET_STATUS, env.raw() as usize, status as usize)
        };
        decode_syscall(raw).map(|_| ())
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let _ = (env, status);
        Err(AbiError::Unsupported)
    }
}

/// Registers `entry` as the fault upcall of `env`.
pub fn env_set_pgfault_upcall(env: EnvId, entry: usize) -> SysResult<()> {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        let raw = unsafe { ecall2(SYSCALL_ENV_SET_PGFAULT_UPCALL, env.raw() as usize, entry) };
        decode_syscall(raw).map(|_| ())
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let _ = (env, entry);
        Err(AbiError::Unsupported)
    }
}

/// Destroys `env`. Does not return when `env` names the caller.
pub fn env_destroy(env: EnvId) -> SysResult<()> {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        let raw = unsafe { ecall1(SYSCALL_ENV_DESTROY, env.raw() as usize) };
        decode_syscall(raw).map(|_| ())
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let _ = env;
        Err(AbiError::Unsupported)
    }
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
fn decode_syscall(value: usize) -> SysResult<usize> {
    if let Some(err) = AbiError::from_raw(value) {
        Err(err)
    } else {
        Ok(value)
    }
}

// Architecture-specific ecall helpers (riscv64)

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
#[allow(unused_assignments)]
#[inline(always)]
unsafe fn ecall0(n: usize) -> usize {
    let mut r7 = n;
    let r0: usize;
    core::arch::asm!(
        "ecall",
        inout("a7") r7,
        lateout("a0") r0,
        clobber_abi("C"),
        options(nostack)
    );
    r0
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
#[allow(unused_assignments)]
#[inline(always)]
unsafe fn ecall1(n: usize, a0: usize) -> usize {
    let mut r0 = a0;
    let mut r7 = n;
    core::arch::asm!(
        "ecall",
        inout("a0") r0,
        inout("a7") r7,
        clobber_abi("C"),
        options(nostack)
    );
    r0
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
#[allow(unused_assignments)]
#[inline(always)]
unsafe fn ecall2(n: usize, a0: usize, a1: usize) -> usize {
    let mut r0 = a0;
    let mut r1 = a1;
    let mut r7 = n;
    core::arch::asm!(
        "ecall",
        inout("a0") r0,
        inout("a1") r1,
        inout("a7") r7,
        clobber_abi("C"),
        options(nostack)
    );
    r0
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
#[allow(unused_assignments)]
#[inline(always)]
unsafe fn ecall3(n: usize, a0: usize, a1: usize, a2: usize) -> usize {
    let mut r0 = a0;
    let mut r1 = a1;
    let mut r2 = a2;
    let mut r7 = n;
    core::arch::asm!(
        "ecall",
        inout("a0") r0,
        inout("a1") r1,
        inout("a2") r2,
        inout("a7") r7,
        clobber_abi("C"),
        options(nostack)
    );
    r0
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
#[allow(unused_assignments)]
#[inline(always)]
unsafe fn ecall5(n: usize, a0: usize, a1: usize, a2: usize, a3: usize, a4: usize) -> usize {
    let mut r0 = a0;
    let mut r1 = a1;
    let mut r2 = a2;
    let mut r3 = a3;
    let mut r4 = a4;
    let mut r7 = n;
    core::arch::asm!(
        "ecall",
        inout("a0") r0,
        inout("a1") r1,
        inout("a2") r2,
        inout("a3") r3,
        inout("a4") r4,
        inout("a7") r7,
        clobber_abi("C"),
        options(nostack)
    );
    r0
}
