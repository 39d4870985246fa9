// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Page duplicator: mirrors one of the caller's mappings into a child.

use nexus_abi::{page_va, EnvId, PteFlags};

use crate::env::EnvContext;
use crate::sys::Kernel;
use crate::Result;

/// How a page was shared with the child.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DupKind {
    /// Writable or already COW: both sides now map it Present|User|COW.
    Cow,
    /// Read-only: the child maps it Present|User, the caller is unchanged.
    ReadOnly,
}

/// Maps the caller's page `pn` into `child` at the same address.
///
/// A kernel rejection is fatal: the caller is aborted before the error is
/// returned.
pub fn duppage<K: Kernel>(ctx: &EnvContext<K>, child: EnvId, pn: usize) -> Result<DupKind> {
    let va = page_va(pn);
    let pte = ctx.sys().lookup(va);
    if pte.has(PteFlags::WRITABLE) || pte.has(PteFlags::COW) {
        ctx.sys()
            .page_map(EnvId::CURRENT, va, child, va, PteFlags::PU_COW)
            .map_err(ctx.fatal("page_map"))?;
        // Mapping into the child may leave our own entry stale; both sides must end up COW.
        downgrade_to_cow(ctx, va)?;
        Ok(DupKind::Cow)
    } else {
        ctx.sys()
            .page_map(EnvId::CURRENT, va, child, va, PteFlags::PU)
            .map_err(ctx.fatal("page_map"))?;
        Ok(DupKind::ReadOnly)
    }
}

/// Re-maps the caller's page at `va` as Present|User|COW. Idempotent; failure is fatal.
pub fn downgrade_to_cow<K: Kernel>(ctx: &EnvContext<K>, va: usize) -> Result<()> {
    ctx.sys()
        .page_map(EnvId::CURRENT, va, EnvId::CURRENT, va, PteFlags::PU_COW)
        .map_err(ctx.fatal("page_map"))
}

#[cfg(all(test, feature = "backend-host"))]
mod tests {
    use super::*;
    use crate::host::{HostConfig, HostEnv, HostKernel, Injected};
    use crate::sys::Syscalls;
    use crate::Error;
    use nexus_abi::{pgnum, AbiError, EnvStatus, Exofork, UTEMP};

    const VA: usize = UTEMP + 0x40_0000;

    fn parent_and_child() -> (HostKernel, EnvContext<HostEnv>, EnvId) {
        let kernel = HostKernel::new(HostConfig::default());
        let ctx = EnvContext::start(kernel.boot().unwrap()).unwrap();
        let child = match ctx.sys().exofork().unwrap() {
            Exofork::Parent(id) => id,
            Exofork::Child => panic!("root environment is not a clone"),
        };
        (kernel, ctx, child)
    }

    #[test]
    fn writable_page_becomes_cow_on_both_sides() {
        let (kernel, ctx, child) = parent_and_child();
        ctx.sys().page_alloc(EnvId::CURRENT, VA, PteFlags::PUW).unwrap();

        assert_eq!(duppage(&ctx, child, pgnum(VA)).unwrap(), DupKind::Cow);

        let mine = kernel.pte(ctx.this_id(), VA);
        let theirs = kernel.pte(child, VA);
        assert_eq!(mine.flags(), PteFlags::PU_COW);
        assert_eq!(theirs.flags(), PteFlags::PU_COW);
        assert_eq!(mine.frame(), theirs.frame());
    }

    #[test]
    fn cow_page_stays_cow() {
        let (kernel, ctx, child) = parent_and_child();
        ctx.sys().page_alloc(EnvId::CURRENT, VA, PteFlags::PUW).unwrap();
        downgrade_to_cow(&ctx, VA).unwrap();

        assert_eq!(duppage(&ctx, child, pgnum(VA)).unwrap(), DupKind::Cow);
        assert_eq!(kernel.pte(ctx.this_id(), VA).flags(), PteFlags::PU_COW);
        assert_eq!(kernel.pte(child, VA).flags(), PteFlags::PU_COW);
    }

    #[test]
    fn read_only_page_is_shared_directly() {
        let (kernel, ctx, child) = parent_and_child();
        ctx.sys().page_alloc(EnvId::CURRENT, VA, PteFlags::PU).unwrap();

        assert_eq!(duppage(&ctx, child, pgnum(VA)).unwrap(), DupKind::ReadOnly);
        assert_eq!(kernel.pte(ctx.this_id(), VA).flags(), PteFlags::PU);
        assert_eq!(kernel.pte(child, VA).flags(), PteFlags::PU);
        assert_eq!(kernel.frame_of(child, VA), kernel.frame_of(ctx.this_id(), VA));
    }

    #[test]
    fn downgrade_is_idempotent() {
        let (kernel, ctx, _child) = parent_and_child();
        ctx.sys().page_alloc(EnvId::CURRENT, VA, PteFlags::PUW).unwrap();
        downgrade_to_cow(&ctx, VA).unwrap();
        let once = kernel.pte(ctx.this_id(), VA);
        downgrade_to_cow(&ctx, VA).unwrap();
        assert_eq!(kernel.pte(ctx.this_id(), VA), once);
        assert_eq!(once.flags(), PteFlags::PU_COW);
    }

    #[test]
    fn unmapped_page_aborts_the_caller() {
        let (kernel, ctx, child) = parent_and_child();
        assert_eq!(
            duppage(&ctx, child, pgnum(VA)),
            Err(Error::Syscall { op: "page_map", err: AbiError::Invalid })
        );
        assert_eq!(kernel.status(ctx.this_id()), Some(EnvStatus::Dying));
        assert_eq!(kernel.status(child), Some(EnvStatus::NotRunnable));
    }

    #[test]
    fn absent_directory_is_never_read_through() {
        let kernel = HostKernel::new(HostConfig::default());
        let ctx = EnvContext::start(Injected::new(kernel.boot().unwrap())).unwrap();
        let Exofork::Parent(child) = ctx.sys().exofork().unwrap() else {
            panic!("root environment is not a clone");
        };
        // Nothing is mapped in this directory span, so the entry must not be consulted.
        assert_eq!(
            duppage(&ctx, child, pgnum(VA)),
            Err(Error::Syscall { op: "page_map", err: AbiError::Invalid })
        );
    }
}
