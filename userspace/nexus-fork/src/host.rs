// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! In-memory kernel used by host-first tests.
//!
//! Models reference-counted physical frames, per-environment page tables,
//! the environment table and fault delivery through the registered upcall.
//! Every [`HostEnv`] handle issues syscalls as one environment.

use std::{boxed::Box, collections::BTreeMap, sync::Arc, vec::Vec};

use log::{debug, trace};
use nexus_abi::{
    envx, is_aligned, pgnum, AbiError, EnvId, EnvInfo, EnvStatus, Exofork, FaultCode, Pte,
    PteFlags, SysResult, UTrapframe, NENV, NPTENTRIES, PGSIZE, UTOP, UXSTACKTOP,
};
use parking_lot::Mutex;

use crate::sys::{MemFault, SelfMap, Syscalls, UserMemory};

/// Capacity limits of the simulated machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostConfig {
    /// Environment table slots (capped at [`NENV`]).
    pub max_envs: usize,
    /// Physical frames available for user pages.
    pub max_frames: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self { max_envs: 64, max_frames: 4096 }
    }
}

struct Frame {
    data: Box<[u8; PGSIZE]>,
    refs: usize,
}

struct Slot {
    id: EnvId,
    parent: EnvId,
    status: EnvStatus,
    upcall: Option<usize>,
    pages: BTreeMap<usize, Pte>,
    // Next exofork from this env is the clone's first resumed instruction.
    clone_pending: bool,
}

struct Machine {
    config: HostConfig,
    frames: Vec<Option<Frame>>,
    envs: Vec<Option<Slot>>,
    generation: u32,
}

impl Machine {
    fn new(config: HostConfig) -> Self {
        let slots = config.max_envs.min(NENV);
        Self {
            config,
            frames: Vec::new(),
            envs: (0..slots).map(|_| None).collect(),
            generation: 0,
        }
    }

    fn slot(&self, id: EnvId) -> Option<&Slot> {
        self.envs.get(envx(id))?.as_ref().filter(|slot| slot.id == id)
    }

    fn slot_mut(&mut self, id: EnvId) -> Option<&mut Slot> {
        self.envs.get_mut(envx(id))?.as_mut().filter(|slot| slot.id == id)
    }

    fn alive(&self, id: EnvId) -> bool {
        self.slot(id).is_some_and(|slot| slot.status != EnvStatus::Dying)
    }

    fn caller(&self, id: EnvId) -> SysResult<()> {
        if self.alive(id) {
            Ok(())
        } else {
            Err(AbiError::BadEnv)
        }
    }

    /// Validates `id` as a caller that is running past its clone point.
    fn enter(&mut self, id: EnvId) -> SysResult<()> {
        self.caller(id)?;
        self.settle(id);
        Ok(())
    }

    /// Any kernel interaction other than `exofork` means the clone already resumed.
    fn settle(&mut self, id: EnvId) {
        if let Some(slot) = self.slot_mut(id) {
            slot.clone_pending = false;
        }
    }

    /// Resolves `target` as seen by `caller`: itself or one of its direct children.
    fn resolve(&self, caller: EnvId, target: EnvId) -> SysResult<EnvId> {
        if target.is_current() {
            return Ok(caller);
        }
        let slot = self.slot(target).ok_or(AbiError::BadEnv)?;
        if slot.id == caller || slot.parent == caller {
            Ok(slot.id)
        } else {
            Err(AbiError::BadEnv)
        }
    }

    fn alloc_env(&mut self, parent: EnvId, status: EnvStatus) -> SysResult<EnvId> {
        let index = self.envs.iter().position(Option::is_none).ok_or(AbiError::NoFreeEnv)?;
        self.generation += 1;
        let id = EnvId::new(self.generation, index);
        self.envs[index] = Some(Slot {
            id,
            parent,
            status,
            upcall: None,
            pages: BTreeMap::new(),
            clone_pending: false,
        });
        Ok(id)
    }

    fn alloc_frame(&mut self) -> SysResult<u32> {
        let frame = Frame { data: Box::new([0u8; PGSIZE]), refs: 1 };
        if let Some(index) = self.frames.iter().position(Option::is_none) {
            self.frames[index] = Some(frame);
            return Ok(index as u32);
        }
        if self.frames.len() >= self.config.max_frames {
            return Err(AbiError::NoMemory);
        }
        self.frames.push(Some(frame));
        Ok(self.frames.len() as u32 - 1)
    }

    fn frame(&self, n: u32) -> Option<&Frame> {
        self.frames.get(n as usize)?.as_ref()
    }

    fn frame_mut(&mut self, n: u32) -> Option<&mut Frame> {
        self.frames.get_mut(n as usize)?.as_mut()
    }

    fn incref(&mut self, n: u32) {
        if let Some(frame) = self.frame_mut(n) {
            frame.refs += 1;
        }
    }

    fn decref(&mut self, n: u32) {
        let remaining = match self.frame_mut(n) {
            Some(frame) => {
                frame.refs -= 1;
                frame.refs
            }
            None => return,
        };
        if remaining == 0 {
            self.frames[n as usize] = None;
        }
    }

    /// Installs `pte` at page `pn` of `env`, dropping the reference held by any prior entry.
    fn install(&mut self, env: EnvId, pn: usize, pte: Pte) -> SysResult<()> {
        let slot = self.slot_mut(env).ok_or(AbiError::BadEnv)?;
        if let Some(old) = slot.pages.insert(pn, pte) {
            self.decref(old.frame());
        }
        Ok(())
    }

    fn remove(&mut self, env: EnvId, pn: usize) -> SysResult<()> {
        let slot = self.slot_mut(env).ok_or(AbiError::BadEnv)?;
        if let Some(old) = slot.pages.remove(&pn) {
            self.decref(old.frame());
        }
        Ok(())
    }

    fn destroy(&mut self, env: EnvId) {
        let Some(slot) = self.slot_mut(env) else {
            return;
        };
        slot.status = EnvStatus::Dying;
        slot.upcall = None;
        let pages = core::mem::take(&mut slot.pages);
        for pte in pages.values() {
            self.decref(pte.frame());
        }
        debug!("host: env {} destroyed", env);
    }

    fn entry(&self, env: EnvId, va: usize) -> Pte {
        if va >= UTOP {
            return Pte::EMPTY;
        }
        self.slot(env)
            .and_then(|slot| slot.pages.get(&pgnum(va)).copied())
            .unwrap_or(Pte::EMPTY)
    }

    /// Pushes a trapframe on the exception stack and reports the upcall, or kills `env`.
    fn fault(&mut self, env: EnvId, va: usize, err: FaultCode) -> MemFault {
        let frame = UTrapframe { fault_va: va, err };
        let upcall = self.slot(env).and_then(|slot| slot.upcall);
        let stack = self.entry(env, UXSTACKTOP - PGSIZE);
        match upcall {
            Some(entry) if stack.has(PteFlags::PUW) => {
                if let Some(page) = self.frame_mut(stack.frame()) {
                    page.data[PGSIZE - UTrapframe::SIZE..].copy_from_slice(&frame.to_le_bytes());
                }
                trace!("host: env {} fault va={:#x} err={:?}", env, va, err);
                MemFault::Upcall { entry, frame }
            }
            _ => {
                debug!("host: env {} has no usable upcall for fault at {:#x}", env, va);
                self.destroy(env);
                MemFault::Killed
            }
        }
    }
}

fn check_va(va: usize) -> SysResult<()> {
    if va < UTOP && is_aligned(va) {
        Ok(())
    } else {
        Err(AbiError::Invalid)
    }
}

fn check_perm(perm: PteFlags) -> SysResult<()> {
    if perm.contains(PteFlags::PU) && PteFlags::SYSCALL.contains(perm) {
        Ok(())
    } else {
        Err(AbiError::Invalid)
    }
}

/// Simulated kernel shared by all environment handles.
#[derive(Clone)]
pub struct HostKernel {
    machine: Arc<Mutex<Machine>>,
}

impl HostKernel {
    /// Creates an empty machine.
    pub fn new(config: HostConfig) -> Self {
        Self { machine: Arc::new(Mutex::new(Machine::new(config))) }
    }

    /// Creates the runnable root environment with an empty address space.
    pub fn boot(&self) -> SysResult<HostEnv> {
        let id = self.machine.lock().alloc_env(EnvId::CURRENT, EnvStatus::Runnable)?;
        debug!("host: booted env {}", id);
        Ok(HostEnv { machine: Arc::clone(&self.machine), id })
    }

    /// Handle for a runnable environment, as the scheduler would resume it.
    pub fn resume(&self, id: EnvId) -> SysResult<HostEnv> {
        let machine = self.machine.lock();
        match machine.slot(id).map(|slot| slot.status) {
            Some(EnvStatus::Runnable | EnvStatus::Running) => {
                Ok(HostEnv { machine: Arc::clone(&self.machine), id })
            }
            Some(EnvStatus::NotRunnable) => Err(AbiError::Invalid),
            Some(EnvStatus::Dying) | None => Err(AbiError::BadEnv),
        }
    }

    /// Occupied environment-table slots, dying environments included.
    pub fn env_count(&self) -> usize {
        self.machine.lock().envs.iter().filter(|slot| slot.is_some()).count()
    }

    /// Environments created by `parent`, in table order.
    pub fn children(&self, parent: EnvId) -> Vec<EnvId> {
        self.machine
            .lock()
            .envs
            .iter()
            .flatten()
            .filter(|slot| slot.parent == parent)
            .map(|slot| slot.id)
            .collect()
    }

    /// Status of `id`.
    pub fn status(&self, id: EnvId) -> Option<EnvStatus> {
        self.machine.lock().slot(id).map(|slot| slot.status)
    }

    /// Descriptor of `id`.
    pub fn info(&self, id: EnvId) -> Option<EnvInfo> {
        self.machine.lock().slot(id).map(info)
    }

    /// Entry mapping `va` in `id`.
    pub fn pte(&self, id: EnvId, va: usize) -> Pte {
        self.machine.lock().entry(id, va)
    }

    /// Physical frame behind `va` in `id`.
    pub fn frame_of(&self, id: EnvId, va: usize) -> Option<u32> {
        let pte = self.pte(id, va);
        pte.has(PteFlags::PRESENT).then(|| pte.frame())
    }

    /// Frames currently referenced by at least one mapping.
    pub fn frames_in_use(&self) -> usize {
        self.machine.lock().frames.iter().filter(|frame| frame.is_some()).count()
    }
}

fn info(slot: &Slot) -> EnvInfo {
    EnvInfo { id: slot.id, parent_id: slot.parent, status: slot.status, pgfault_upcall: slot.upcall }
}

/// Syscall handle bound to one simulated environment.
#[derive(Clone)]
pub struct HostEnv {
    machine: Arc<Mutex<Machine>>,
    id: EnvId,
}

impl HostEnv {
    /// Environment this handle acts as.
    pub fn id(&self) -> EnvId {
        self.id
    }
}

impl Syscalls for HostEnv {
    fn getenvid(&self) -> SysResult<EnvId> {
        self.machine.lock().enter(self.id)?;
        Ok(self.id)
    }

    /// A clone's first kernel interaction after being resumed stands in for
    /// its return from the creating `exofork`: if that interaction is an
    /// `exofork` it observes [`Exofork::Child`]. Any other syscall or memory
    /// access settles the clone, and its later `exofork` calls create
    /// children normally.
    fn exofork(&self) -> SysResult<Exofork> {
        let mut m = self.machine.lock();
        m.caller(self.id)?;
        if let Some(slot) = m.slot_mut(self.id) {
            if slot.clone_pending {
                slot.clone_pending = false;
                return Ok(Exofork::Child);
            }
        }
        let child = m.alloc_env(self.id, EnvStatus::NotRunnable)?;
        if let Some(slot) = m.slot_mut(child) {
            slot.clone_pending = true;
        }
        trace!("host: env {} exofork -> {}", self.id, child);
        Ok(Exofork::Parent(child))
    }

    fn page_alloc(&self, env: EnvId, va: usize, perm: PteFlags) -> SysResult<()> {
        let mut m = self.machine.lock();
        m.enter(self.id)?;
        let env = m.resolve(self.id, env)?;
        check_va(va)?;
        check_perm(perm)?;
        let frame = m.alloc_frame()?;
        m.install(env, pgnum(va), Pte::new(frame, perm))
    }

    fn page_map(
        &self,
        src: EnvId,
        src_va: usize,
        dst: EnvId,
        dst_va: usize,
        perm: PteFlags,
    ) -> SysResult<()> {
        let mut m = self.machine.lock();
        m.enter(self.id)?;
        let src = m.resolve(self.id, src)?;
        let dst = m.resolve(self.id, dst)?;
        check_va(src_va)?;
        check_va(dst_va)?;
        check_perm(perm)?;
        let pte = m.entry(src, src_va);
        if !pte.has(PteFlags::PRESENT) {
            return Err(AbiError::Invalid);
        }
        if perm.contains(PteFlags::WRITABLE) && !pte.has(PteFlags::WRITABLE) {
            return Err(AbiError::Invalid);
        }
        // Take the new reference first: src and dst may be the same entry.
        m.incref(pte.frame());
        m.install(dst, pgnum(dst_va), Pte::new(pte.frame(), perm))
    }

    fn page_unmap(&self, env: EnvId, va: usize) -> SysResult<()> {
        let mut m = self.machine.lock();
        m.enter(self.id)?;
        let env = m.resolve(self.id, env)?;
        check_va(va)?;
        m.remove(env, pgnum(va))
    }

    fn env_set_status(&self, env: EnvId, status: EnvStatus) -> SysResult<()> {
        let mut m = self.machine.lock();
        m.enter(self.id)?;
        let env = m.resolve(self.id, env)?;
        if !matches!(status, EnvStatus::Runnable | EnvStatus::NotRunnable) {
            return Err(AbiError::Invalid);
        }
        let slot = m.slot_mut(env).ok_or(AbiError::BadEnv)?;
        slot.status = status;
        Ok(())
    }

    fn env_set_pgfault_upcall(&self, env: EnvId, entry: usize) -> SysResult<()> {
        let mut m = self.machine.lock();
        m.enter(self.id)?;
        let env = m.resolve(self.id, env)?;
        let slot = m.slot_mut(env).ok_or(AbiError::BadEnv)?;
        slot.upcall = Some(entry);
        Ok(())
    }

    fn env_destroy(&self, env: EnvId) -> SysResult<()> {
        let mut m = self.machine.lock();
        m.enter(self.id)?;
        let env = m.resolve(self.id, env)?;
        m.destroy(env);
        Ok(())
    }
}

impl SelfMap for HostEnv {
    fn uvpd(&self, pdx: usize) -> Pte {
        let m = self.machine.lock();
        let Some(slot) = m.slot(self.id) else {
            return Pte::EMPTY;
        };
        let first = pdx * NPTENTRIES;
        if slot.pages.range(first..first + NPTENTRIES).next().is_some() {
            Pte::new(0, PteFlags::PUW)
        } else {
            Pte::EMPTY
        }
    }

    fn uvpt(&self, pn: usize) -> Pte {
        let m = self.machine.lock();
        m.slot(self.id)
            .and_then(|slot| slot.pages.get(&pn).copied())
            .unwrap_or(Pte::EMPTY)
    }

    fn env_info(&self, index: usize) -> Option<EnvInfo> {
        let m = self.machine.lock();
        m.envs.get(index)?.as_ref().map(info)
    }
}

impl UserMemory for HostEnv {
    fn load(&self, va: usize, buf: &mut [u8]) -> Result<(), MemFault> {
        let mut m = self.machine.lock();
        m.settle(self.id);
        let mut done = 0;
        while done < buf.len() {
            if !m.alive(self.id) {
                return Err(MemFault::Killed);
            }
            let at = va + done;
            let offset = at % PGSIZE;
            let len = (PGSIZE - offset).min(buf.len() - done);
            let pte = m.entry(self.id, at);
            if !pte.is_user_present() {
                return Err(m.fault(self.id, at, FaultCode::USER));
            }
            let page = m.frame(pte.frame()).ok_or(MemFault::Killed)?;
            buf[done..done + len].copy_from_slice(&page.data[offset..offset + len]);
            done += len;
        }
        Ok(())
    }

    fn store(&self, va: usize, bytes: &[u8]) -> Result<(), MemFault> {
        let mut m = self.machine.lock();
        m.settle(self.id);
        let mut done = 0;
        while done < bytes.len() {
            if !m.alive(self.id) {
                return Err(MemFault::Killed);
            }
            let at = va + done;
            let offset = at % PGSIZE;
            let len = (PGSIZE - offset).min(bytes.len() - done);
            let pte = m.entry(self.id, at);
            if !pte.has(PteFlags::PUW) {
                let mut err = FaultCode::WRITE | FaultCode::USER;
                if pte.has(PteFlags::PRESENT) {
                    err |= FaultCode::PROTECTION;
                }
                return Err(m.fault(self.id, at, err));
            }
            let page = m.frame_mut(pte.frame()).ok_or(MemFault::Killed)?;
            page.data[offset..offset + len].copy_from_slice(&bytes[done..done + len]);
            done += len;
        }
        Ok(())
    }
}

/// [`HostEnv`] wrapper with kernel misbehavior injected, for failure-path tests.
#[cfg(test)]
pub(crate) struct Injected {
    pub(crate) inner: HostEnv,
    /// Syscall rejected with `NoMemory` whenever it targets another environment.
    pub(crate) fail_on: Option<&'static str>,
    /// Environment table entries report no registered upcall.
    pub(crate) hide_upcall: bool,
}

#[cfg(test)]
impl Injected {
    pub(crate) fn new(inner: HostEnv) -> Self {
        Self { inner, fail_on: None, hide_upcall: false }
    }

    fn gate(&self, op: &'static str, target: EnvId) -> SysResult<()> {
        if self.fail_on == Some(op) && !target.is_current() && target != self.inner.id {
            return Err(AbiError::NoMemory);
        }
        Ok(())
    }
}

#[cfg(test)]
impl Syscalls for Injected {
    fn getenvid(&self) -> SysResult<EnvId> {
        self.inner.getenvid()
    }

    fn exofork(&self) -> SysResult<Exofork> {
        self.inner.exofork()
    }

    fn page_alloc(&self, env: EnvId, va: usize, perm: PteFlags) -> SysResult<()> {
        self.gate("page_alloc", env)?;
        self.inner.page_alloc(env, va, perm)
    }

    fn page_map(
        &self,
        src: EnvId,
        src_va: usize,
        dst: EnvId,
        dst_va: usize,
        perm: PteFlags,
    ) -> SysResult<()> {
        self.gate("page_map", dst)?;
        self.inner.page_map(src, src_va, dst, dst_va, perm)
    }

    fn page_unmap(&self, env: EnvId, va: usize) -> SysResult<()> {
        self.gate("page_unmap", env)?;
        self.inner.page_unmap(env, va)
    }

    fn env_set_status(&self, env: EnvId, status: EnvStatus) -> SysResult<()> {
        self.gate("env_set_status", env)?;
        self.inner.env_set_status(env, status)
    }

    fn env_set_pgfault_upcall(&self, env: EnvId, entry: usize) -> SysResult<()> {
        self.gate("env_set_pgfault_upcall", env)?;
        self.inner.env_set_pgfault_upcall(env, entry)
    }

    fn env_destroy(&self, env: EnvId) -> SysResult<()> {
        self.inner.env_destroy(env)
    }
}

#[cfg(test)]
impl SelfMap for Injected {
    fn uvpd(&self, pdx: usize) -> Pte {
        self.inner.uvpd(pdx)
    }

    fn uvpt(&self, pn: usize) -> Pte {
        // On the real kernel the table page behind an absent directory entry is unmapped.
        assert!(
            self.inner.uvpd(pn / NPTENTRIES).has(PteFlags::PRESENT),
            "uvpt read for page {pn:#x} without a present directory entry"
        );
        self.inner.uvpt(pn)
    }

    fn env_info(&self, index: usize) -> Option<EnvInfo> {
        let mut info = self.inner.env_info(index)?;
        if self.hide_upcall {
            info.pgfault_upcall = None;
        }
        Some(info)
    }
}

#[cfg(test)]
impl UserMemory for Injected {
    fn load(&self, va: usize, buf: &mut [u8]) -> Result<(), MemFault> {
        self.inner.load(va, buf)
    }

    fn store(&self, va: usize, bytes: &[u8]) -> Result<(), MemFault> {
        self.inner.store(va, bytes)
    }
}
