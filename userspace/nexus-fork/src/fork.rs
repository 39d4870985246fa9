// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Fork orchestrator.
//!
//! Drives duplication of the calling environment:
//! `Idle -> HandlerRegistered -> ChildCreated -> AddressSpaceMirrored ->
//! ChildInitialized -> ChildRunnable`, with `ChildPath` taken by the clone
//! itself when it resumes out of `exofork`.
//!
//! A child left half-built by a failing step after creation is not torn
//! down; the caller is aborted instead.

use log::{debug, trace, warn};
use nexus_abi::{pgnum, EnvId, EnvStatus, Exofork, PteFlags, NPTENTRIES, PGSIZE, UXSTACKTOP};

use crate::cow::cow_fault;
use crate::duppage::{duppage, DupKind};
use crate::env::EnvContext;
use crate::pgfault::set_pgfault_handler;
use crate::sys::Kernel;
use crate::{Error, Result};

/// Which side of a fork the caller is on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForkOutcome {
    /// The original environment; carries the new child's identifier.
    Parent(EnvId),
    /// The clone, resuming for the first time.
    Child,
}

/// Progress of a fork, as logged at trace level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ForkPhase {
    /// Nothing done yet.
    Idle,
    /// COW handler installed as the fault handler.
    HandlerRegistered,
    /// Suspended clone exists.
    ChildCreated(EnvId),
    /// Every user page below the exception stack is mirrored.
    AddressSpaceMirrored(EnvId),
    /// Exception stack and upcall installed in the child.
    ChildInitialized(EnvId),
    /// Child released to the scheduler.
    ChildRunnable(EnvId),
    /// Running as the clone.
    ChildPath,
}

/// Pages mirrored into a child.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MirrorStats {
    /// Pages now shared copy-on-write.
    pub cow: usize,
    /// Read-only pages shared directly.
    pub shared_readonly: usize,
}

fn advance(phase: &mut ForkPhase, next: ForkPhase) {
    trace!("fork: {:?} -> {:?}", phase, next);
    *phase = next;
}

/// Duplicates the calling environment with copy-on-write sharing.
///
/// The parent observes [`ForkOutcome::Parent`]. The clone re-enters here as
/// its first resumed instruction (with the handler already inherited, so
/// registration does nothing), fixes its cached identity and observes
/// [`ForkOutcome::Child`].
///
/// A rejected `exofork` is returned to the caller. Any failure after the
/// child exists aborts the caller.
pub fn fork<K: Kernel>(ctx: &mut EnvContext<K>) -> Result<ForkOutcome> {
    let mut phase = ForkPhase::Idle;
    set_pgfault_handler(ctx, cow_fault::<K>)?;
    advance(&mut phase, ForkPhase::HandlerRegistered);

    let child = match ctx.sys().exofork() {
        Ok(Exofork::Parent(child)) => child,
        Ok(Exofork::Child) => {
            advance(&mut phase, ForkPhase::ChildPath);
            let me = ctx.refresh_this().map_err(|err| ctx.abort(err))?;
            debug!("fork: resumed as clone {}", me);
            return Ok(ForkOutcome::Child);
        }
        Err(err) => {
            warn!("fork: env {}: exofork rejected: {}", ctx.this_id(), err);
            return Err(Error::Syscall { op: "exofork", err });
        }
    };
    advance(&mut phase, ForkPhase::ChildCreated(child));

    // Mapping failures abort inside the duplicator.
    let stats = mirror_address_space(ctx, child)?;
    debug!(
        "fork: {} -> {}: {} cow, {} read-only",
        ctx.this_id(),
        child,
        stats.cow,
        stats.shared_readonly
    );
    advance(&mut phase, ForkPhase::AddressSpaceMirrored(child));

    ctx.sys()
        .page_alloc(child, UXSTACKTOP - PGSIZE, PteFlags::PUW)
        .map_err(ctx.fatal("page_alloc"))?;
    let upcall = ctx
        .this_env()
        .map_err(|err| ctx.abort(err))?
        .pgfault_upcall
        .ok_or_else(|| ctx.abort(Error::NoUpcall))?;
    ctx.sys()
        .env_set_pgfault_upcall(child, upcall)
        .map_err(ctx.fatal("env_set_pgfault_upcall"))?;
    advance(&mut phase, ForkPhase::ChildInitialized(child));

    ctx.sys()
        .env_set_status(child, EnvStatus::Runnable)
        .map_err(ctx.fatal("env_set_status"))?;
    advance(&mut phase, ForkPhase::ChildRunnable(child));

    Ok(ForkOutcome::Parent(child))
}

/// Mirrors every present user page below the exception stack into `child`.
///
/// The exception stack page is never touched here; it must be private to
/// each environment.
pub fn mirror_address_space<K: Kernel>(ctx: &EnvContext<K>, child: EnvId) -> Result<MirrorStats> {
    let sys = ctx.sys();
    let end = pgnum(UXSTACKTOP - PGSIZE);
    let mut stats = MirrorStats::default();
    let mut pn = 0;
    while pn < end {
        if !sys.uvpd(pn / NPTENTRIES).is_user_present() {
            pn = (pn / NPTENTRIES + 1) * NPTENTRIES;
            continue;
        }
        if sys.uvpt(pn).is_user_present() {
            match duppage(ctx, child, pn)? {
                DupKind::Cow => stats.cow += 1,
                DupKind::ReadOnly => stats.shared_readonly += 1,
            }
        }
        pn += 1;
    }
    Ok(stats)
}

/// Shared-memory fork. Not implemented: creates nothing, maps nothing.
pub fn sfork<K: Kernel>(ctx: &EnvContext<K>) -> Result<ForkOutcome> {
    debug!("sfork: env {}: not implemented", ctx.this_id());
    Err(Error::NotImplemented)
}

#[cfg(all(test, feature = "backend-host"))]
mod tests {
    use super::*;
    use crate::host::{HostConfig, HostEnv, HostKernel, Injected};
    use crate::pgfault::UPCALL_ENTRY;
    use crate::sys::Syscalls;
    use nexus_abi::{AbiError, UTEMP};

    const TEXT: usize = UTEMP + 0x40_0000;
    const DATA: usize = TEXT + 0x40_0000;

    fn boot(config: HostConfig) -> (HostKernel, EnvContext<HostEnv>) {
        let kernel = HostKernel::new(config);
        let ctx = EnvContext::start(kernel.boot().unwrap()).unwrap();
        (kernel, ctx)
    }

    #[test]
    fn mirror_counts_and_skips_exception_stack() {
        let (kernel, mut ctx) = boot(HostConfig::default());
        let sys = ctx.sys();
        sys.page_alloc(EnvId::CURRENT, TEXT, PteFlags::PU).unwrap();
        sys.page_alloc(EnvId::CURRENT, DATA, PteFlags::PUW).unwrap();
        sys.page_alloc(EnvId::CURRENT, DATA + PGSIZE, PteFlags::PUW).unwrap();
        set_pgfault_handler(&mut ctx, cow_fault::<HostEnv>).unwrap();

        let child = match ctx.sys().exofork().unwrap() {
            Exofork::Parent(id) => id,
            Exofork::Child => unreachable!(),
        };
        let stats = mirror_address_space(&ctx, child).unwrap();
        assert_eq!(stats, MirrorStats { cow: 2, shared_readonly: 1 });
        assert_eq!(kernel.frame_of(child, UXSTACKTOP - PGSIZE), None);
        assert_eq!(kernel.pte(ctx.this_id(), UXSTACKTOP - PGSIZE).flags(), PteFlags::PUW);
    }

    #[test]
    fn parent_path_releases_initialized_child() {
        let (kernel, mut ctx) = boot(HostConfig::default());
        ctx.sys().page_alloc(EnvId::CURRENT, DATA, PteFlags::PUW).unwrap();

        let child = match fork(&mut ctx).unwrap() {
            ForkOutcome::Parent(id) => id,
            ForkOutcome::Child => panic!("parent observed the child path"),
        };
        assert!(!child.is_current());
        assert_ne!(child, ctx.this_id());

        let info = kernel.info(child).unwrap();
        assert_eq!(info.status, EnvStatus::Runnable);
        assert_eq!(info.parent_id, ctx.this_id());
        assert_eq!(info.pgfault_upcall, Some(UPCALL_ENTRY));
        assert_eq!(kernel.pte(child, UXSTACKTOP - PGSIZE).flags(), PteFlags::PUW);
    }

    #[test]
    fn rejected_exofork_leaves_caller_alive() {
        let (kernel, mut ctx) = boot(HostConfig { max_envs: 1, ..HostConfig::default() });
        assert_eq!(
            fork(&mut ctx),
            Err(Error::Syscall { op: "exofork", err: AbiError::NoFreeEnv })
        );
        assert_eq!(kernel.status(ctx.this_id()), Some(EnvStatus::Runnable));
        assert_eq!(kernel.env_count(), 1);
    }

    #[test]
    fn exhausted_frames_abort_the_parent() {
        // Root data page + exception stack fit; the child's exception stack does not.
        let (kernel, mut ctx) = boot(HostConfig { max_frames: 2, ..HostConfig::default() });
        ctx.sys().page_alloc(EnvId::CURRENT, DATA, PteFlags::PUW).unwrap();
        assert_eq!(
            fork(&mut ctx),
            Err(Error::Syscall { op: "page_alloc", err: AbiError::NoMemory })
        );
        assert_eq!(kernel.status(ctx.this_id()), Some(EnvStatus::Dying));
        assert_eq!(kernel.env_count(), 2, "half-built child is not rolled back");
    }

    fn boot_injected(
        fail_on: Option<&'static str>,
        hide_upcall: bool,
    ) -> (HostKernel, EnvContext<Injected>) {
        let kernel = HostKernel::new(HostConfig::default());
        let mut env = Injected::new(kernel.boot().unwrap());
        env.fail_on = fail_on;
        env.hide_upcall = hide_upcall;
        let ctx = EnvContext::start(env).unwrap();
        ctx.sys().page_alloc(EnvId::CURRENT, DATA, PteFlags::PUW).unwrap();
        (kernel, ctx)
    }

    /// Asserts the caller died and its one child was left in place, suspended.
    fn assert_aborted_without_rollback(kernel: &HostKernel, parent: EnvId) -> EnvId {
        assert_eq!(kernel.status(parent), Some(EnvStatus::Dying));
        let children = kernel.children(parent);
        assert_eq!(children.len(), 1);
        assert_eq!(kernel.status(children[0]), Some(EnvStatus::NotRunnable));
        children[0]
    }

    #[test]
    fn failed_mirror_aborts_the_parent() {
        let (kernel, mut ctx) = boot_injected(Some("page_map"), false);
        let me = ctx.this_id();
        assert_eq!(
            fork(&mut ctx),
            Err(Error::Syscall { op: "page_map", err: AbiError::NoMemory })
        );
        let child = assert_aborted_without_rollback(&kernel, me);
        assert_eq!(kernel.frame_of(child, DATA), None);
    }

    #[test]
    fn failed_upcall_propagation_aborts_the_parent() {
        let (kernel, mut ctx) = boot_injected(Some("env_set_pgfault_upcall"), false);
        let me = ctx.this_id();
        assert_eq!(
            fork(&mut ctx),
            Err(Error::Syscall { op: "env_set_pgfault_upcall", err: AbiError::NoMemory })
        );
        let child = assert_aborted_without_rollback(&kernel, me);
        assert_eq!(kernel.info(child).unwrap().pgfault_upcall, None);
    }

    #[test]
    fn missing_upcall_aborts_the_parent() {
        let (kernel, mut ctx) = boot_injected(None, true);
        let me = ctx.this_id();
        assert_eq!(fork(&mut ctx), Err(Error::NoUpcall));
        let child = assert_aborted_without_rollback(&kernel, me);
        assert_eq!(kernel.pte(child, UXSTACKTOP - PGSIZE).flags(), PteFlags::PUW);
    }

    #[test]
    fn failed_release_aborts_the_parent() {
        let (kernel, mut ctx) = boot_injected(Some("env_set_status"), false);
        let me = ctx.this_id();
        assert_eq!(
            fork(&mut ctx),
            Err(Error::Syscall { op: "env_set_status", err: AbiError::NoMemory })
        );
        let child = assert_aborted_without_rollback(&kernel, me);
        assert_eq!(kernel.info(child).unwrap().pgfault_upcall, Some(UPCALL_ENTRY));
        assert_eq!(kernel.pte(child, DATA).flags(), PteFlags::PU_COW);
    }

    #[test]
    fn sfork_is_side_effect_free() {
        let (kernel, ctx) = boot(HostConfig::default());
        let before = kernel.env_count();
        let frames = kernel.frames_in_use();
        let err = sfork(&ctx).unwrap_err();
        assert_eq!(err, Error::NotImplemented);
        assert!(!err.is_fatal());
        assert_eq!(kernel.env_count(), before);
        assert_eq!(kernel.frames_in_use(), frames);
        assert_eq!(kernel.status(ctx.this_id()), Some(EnvStatus::Runnable));
    }
}
