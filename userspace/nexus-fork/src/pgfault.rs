// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Page fault handler registration and upcall dispatch.

use log::{debug, trace};
use nexus_abi::{EnvId, PteFlags, UTrapframe, PGSIZE, UXSTACKTOP};

use crate::env::{EnvContext, PgfaultHandler};
use crate::sys::Kernel;
use crate::{Error, Result};

/// Trampoline entry the simulated kernel reports on upcalls.
pub const UPCALL_ENTRY: usize = 0x0080_0020;

#[cfg(all(nexus_env = "os", target_arch = "riscv64", target_os = "none"))]
extern "C" {
    /// Assembly trampoline linked in by the runtime start code: switches to
    /// the exception stack frame and enters [`deliver`].
    fn _pgfault_upcall();
}

/// Entry point of the library's fault trampoline as registered with the kernel.
pub fn upcall_entry() -> usize {
    #[cfg(all(nexus_env = "os", target_arch = "riscv64", target_os = "none"))]
    {
        _pgfault_upcall as usize
    }
    #[cfg(not(all(nexus_env = "os", target_arch = "riscv64", target_os = "none")))]
    {
        UPCALL_ENTRY
    }
}

/// Installs `handler` as the environment's page fault handler.
///
/// The first registration also allocates the exception stack and registers
/// the trampoline with the kernel. Later calls only replace the handler.
pub fn set_pgfault_handler<K: Kernel>(
    ctx: &mut EnvContext<K>,
    handler: PgfaultHandler<K>,
) -> Result<()> {
    if ctx.handler().is_none() {
        ctx.sys()
            .page_alloc(EnvId::CURRENT, UXSTACKTOP - PGSIZE, PteFlags::PUW)
            .map_err(ctx.fatal("page_alloc"))?;
        ctx.sys()
            .env_set_pgfault_upcall(EnvId::CURRENT, upcall_entry())
            .map_err(ctx.fatal("env_set_pgfault_upcall"))?;
        debug!("env {}: exception stack and upcall installed", ctx.this_id());
    }
    ctx.set_handler(handler);
    Ok(())
}

/// User half of the trampoline: runs the registered handler for `frame`.
///
/// Any failure aborts the environment; a fault is never silently resumed.
pub fn deliver<K: Kernel>(ctx: &EnvContext<K>, entry: usize, frame: &UTrapframe) -> Result<()> {
    if entry != upcall_entry() {
        return Err(ctx.abort(Error::UnknownUpcall(entry)));
    }
    let handler = ctx.handler().ok_or_else(|| ctx.abort(Error::NoHandler))?;
    trace!("env {}: fault va={:#x} err={:?}", ctx.this_id(), frame.fault_va, frame.err);
    handler(ctx, frame).map_err(|err| ctx.abort(err))
}
