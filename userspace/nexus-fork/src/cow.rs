// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Copy-on-write fault handler.

use log::trace;
use nexus_abi::{round_down, EnvId, FaultCode, PteFlags, UTrapframe, PFTEMP};

use crate::env::EnvContext;
use crate::sys::Kernel;
use crate::{Error, Result};

/// Replaces the faulting COW page with a private writable copy.
///
/// The copy is staged at [`PFTEMP`] and only then moved over the faulting
/// address, so a failure before the remap leaves the live mapping intact.
/// The scratch slot is released before returning.
pub fn cow_fault<K: Kernel>(ctx: &EnvContext<K>, frame: &UTrapframe) -> Result<()> {
    let va = frame.fault_va;
    if !frame.err.contains(FaultCode::WRITE) {
        return Err(Error::NotWrite { va });
    }
    let sys = ctx.sys();
    if !sys.lookup(va).has(PteFlags::PU_COW) {
        return Err(Error::NotCow { va });
    }

    let page = round_down(va);
    sys.page_alloc(EnvId::CURRENT, PFTEMP, PteFlags::PUW)
        .map_err(Error::syscall("page_alloc"))?;
    sys.copy_page(PFTEMP, page).map_err(|_| Error::CopyFault { va: page })?;
    sys.page_map(EnvId::CURRENT, PFTEMP, EnvId::CURRENT, page, PteFlags::PUW)
        .map_err(Error::syscall("page_map"))?;
    sys.page_unmap(EnvId::CURRENT, PFTEMP).map_err(Error::syscall("page_unmap"))?;
    trace!("env {}: private copy of {:#x}", ctx.this_id(), page);
    Ok(())
}

#[cfg(all(test, feature = "backend-host"))]
mod tests {
    use super::*;
    use crate::host::{HostConfig, HostEnv, HostKernel};
    use crate::sys::{Syscalls, UserMemory};
    use nexus_abi::{PGSIZE, UTEMP};

    const PAGE: usize = UTEMP + 0x40_0000;

    fn boot() -> (HostKernel, EnvContext<HostEnv>) {
        let kernel = HostKernel::new(HostConfig::default());
        let ctx = EnvContext::start(kernel.boot().unwrap()).unwrap();
        (kernel, ctx)
    }

    fn write_fault(va: usize) -> UTrapframe {
        UTrapframe {
            fault_va: va,
            err: FaultCode::WRITE | FaultCode::USER | FaultCode::PROTECTION,
        }
    }

    #[test]
    fn rejects_read_faults() {
        let (_kernel, ctx) = boot();
        let frame = UTrapframe { fault_va: PAGE, err: FaultCode::USER };
        assert_eq!(cow_fault(&ctx, &frame), Err(Error::NotWrite { va: PAGE }));
    }

    #[test]
    fn rejects_pages_without_cow() {
        let (_kernel, ctx) = boot();
        ctx.sys().page_alloc(EnvId::CURRENT, PAGE, PteFlags::PU).unwrap();
        assert_eq!(cow_fault(&ctx, &write_fault(PAGE + 8)), Err(Error::NotCow { va: PAGE + 8 }));
        // Unmapped pages are rejected the same way.
        assert_eq!(
            cow_fault(&ctx, &write_fault(PAGE + PGSIZE)),
            Err(Error::NotCow { va: PAGE + PGSIZE })
        );
    }

    #[test]
    fn copies_and_remaps_privately() {
        let (kernel, ctx) = boot();
        let me = ctx.this_id();
        let sys = ctx.sys();
        sys.page_alloc(EnvId::CURRENT, PAGE, PteFlags::PUW).unwrap();
        sys.store(PAGE + 100, b"payload").unwrap();
        // Alias the page elsewhere so the old frame stays observable.
        sys.page_map(EnvId::CURRENT, PAGE, EnvId::CURRENT, PAGE + PGSIZE, PteFlags::PU_COW)
            .unwrap();
        sys.page_map(EnvId::CURRENT, PAGE, EnvId::CURRENT, PAGE, PteFlags::PU_COW).unwrap();
        let old = kernel.frame_of(me, PAGE).unwrap();

        cow_fault(&ctx, &write_fault(PAGE + 123)).unwrap();

        let pte = kernel.pte(me, PAGE);
        assert_eq!(pte.flags(), PteFlags::PUW);
        assert_ne!(pte.frame(), old);
        assert_eq!(kernel.frame_of(me, PAGE + PGSIZE), Some(old));
        assert_eq!(kernel.frame_of(me, PFTEMP), None, "scratch slot must be released");

        let mut copy = [0u8; 7];
        sys.load(PAGE + 100, &mut copy).unwrap();
        assert_eq!(&copy, b"payload");
        sys.store(PAGE + 100, b"changed").unwrap();
        sys.load(PAGE + PGSIZE + 100, &mut copy).unwrap();
        assert_eq!(&copy, b"payload");
    }
}
