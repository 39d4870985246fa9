// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-environment runtime context.
//!
//! Holds what a C runtime would keep in process globals: the cached
//! reference to the environment's own descriptor and the registered page
//! fault handler. A clone inherits both by value, so the cached descriptor
//! is stale in the clone until [`EnvContext::refresh_this`] runs.

use log::{debug, error};
use nexus_abi::{envx, AbiError, EnvId, EnvInfo};

use crate::pgfault;
use crate::sys::{Kernel, MemFault};
use crate::{Error, Result};

/// Page fault handler invoked through the upcall trampoline.
pub type PgfaultHandler<K> = fn(&EnvContext<K>, &nexus_abi::UTrapframe) -> Result<()>;

/// Runtime state of one environment.
pub struct EnvContext<K: Kernel> {
    sys: K,
    this: EnvId,
    handler: Option<PgfaultHandler<K>>,
}

impl<K: Kernel> EnvContext<K> {
    /// Resolves the environment's own identity once, at start.
    pub fn start(sys: K) -> Result<Self> {
        let this = sys.getenvid().map_err(Error::syscall("getenvid"))?;
        debug!("env {}: runtime context ready", this);
        Ok(Self { sys, this, handler: None })
    }

    /// The clone's view right after `exofork`: every cached field copied verbatim.
    ///
    /// The cached identity still names `self` until the clone calls
    /// [`EnvContext::refresh_this`].
    pub fn inherit(&self, sys: K) -> Self {
        Self { sys, this: self.this, handler: self.handler }
    }

    /// Syscall handle of this environment.
    pub fn sys(&self) -> &K {
        &self.sys
    }

    /// Cached identity.
    pub fn this_id(&self) -> EnvId {
        self.this
    }

    /// Descriptor slot the cached identity points at.
    pub fn this_env(&self) -> Result<EnvInfo> {
        self.sys.env_info(envx(self.this)).ok_or(Error::UnknownEnv(self.this))
    }

    /// Re-resolves the cached identity from the kernel.
    pub fn refresh_this(&mut self) -> Result<EnvId> {
        self.this = self.sys.getenvid().map_err(Error::syscall("getenvid"))?;
        Ok(self.this)
    }

    /// Currently registered page fault handler.
    pub fn handler(&self) -> Option<PgfaultHandler<K>> {
        self.handler
    }

    pub(crate) fn set_handler(&mut self, handler: PgfaultHandler<K>) {
        self.handler = Some(handler);
    }

    /// Reads from the environment's memory, servicing delivered faults.
    pub fn read(&self, va: usize, buf: &mut [u8]) -> Result<()> {
        let mut last = None;
        loop {
            match self.sys.load(va, buf) {
                Ok(()) => return Ok(()),
                Err(fault) => self.service(fault, &mut last)?,
            }
        }
    }

    /// Writes to the environment's memory, servicing delivered faults.
    pub fn write(&self, va: usize, bytes: &[u8]) -> Result<()> {
        let mut last = None;
        loop {
            match self.sys.store(va, bytes) {
                Ok(()) => return Ok(()),
                Err(fault) => self.service(fault, &mut last)?,
            }
        }
    }

    fn service(&self, fault: MemFault, last: &mut Option<usize>) -> Result<()> {
        match fault {
            MemFault::Killed => Err(Error::Killed),
            MemFault::Upcall { entry, frame } => {
                if *last == Some(frame.fault_va) {
                    return Err(self.abort(Error::Unresolved { va: frame.fault_va }));
                }
                *last = Some(frame.fault_va);
                pgfault::deliver(self, entry, &frame)
            }
        }
    }

    /// Fail-fast exit: logs `err`, destroys this environment and hands `err` back.
    pub fn abort(&self, err: Error) -> Error {
        error!("env {}: fatal: {}", self.this, err);
        if let Err(destroy) = self.sys.env_destroy(EnvId::CURRENT) {
            // Already dying.
            if destroy != AbiError::BadEnv {
                error!("env {}: env_destroy failed: {}", self.this, destroy);
            }
        }
        err
    }

    /// Adapter for `map_err` on syscalls whose failure is fatal.
    pub fn fatal(&self, op: &'static str) -> impl Fn(AbiError) -> Error + '_ {
        move |err| self.abort(Error::Syscall { op, err })
    }
}

#[cfg(all(test, feature = "backend-host"))]
mod tests {
    use super::*;
    use crate::host::{HostConfig, HostEnv, HostKernel};
    use crate::pgfault::set_pgfault_handler;
    use crate::sys::Syscalls;
    use nexus_abi::{EnvStatus, PteFlags, UTrapframe, UTEMP};

    const VA: usize = UTEMP + 0x40_0000;

    fn ignore(_: &EnvContext<HostEnv>, _: &UTrapframe) -> Result<()> {
        Ok(())
    }

    #[test]
    fn fault_left_in_place_is_fatal() {
        let kernel = HostKernel::new(HostConfig::default());
        let mut ctx = EnvContext::start(kernel.boot().unwrap()).unwrap();
        set_pgfault_handler(&mut ctx, ignore).unwrap();
        ctx.sys().page_alloc(EnvId::CURRENT, VA, PteFlags::PU).unwrap();

        assert_eq!(ctx.write(VA, b"x"), Err(Error::Unresolved { va: VA }));
        assert_eq!(kernel.status(ctx.this_id()), Some(EnvStatus::Dying));
    }

    #[test]
    fn unhandled_fault_reports_kill() {
        let kernel = HostKernel::new(HostConfig::default());
        let ctx = EnvContext::start(kernel.boot().unwrap()).unwrap();
        assert_eq!(ctx.write(VA, b"x"), Err(Error::Killed));
        assert_eq!(kernel.status(ctx.this_id()), Some(EnvStatus::Dying));
    }
}
