//! Environment table: allocation, id resolution, permission checks

extern crate alloc;

use alloc::vec::Vec;

use super::{Env, EnvId, EnvType};
use crate::error::{KernelError, Result};
use crate::mm::FrameNumber;

/// Default number of environment slots
pub const NENV: usize = 64;

/// Fixed-size table of environment slots
pub struct EnvTable {
    slots: Vec<Option<Env>>,
    /// Generation counter per slot; ids embed the generation so recycled
    /// slots never alias old ids
    gens: Vec<u32>,
    num_free: usize,
    log2nenv: u32,
}

impl EnvTable {
    /// `nenv` must be a power of two so ids decompose with a mask
    pub fn new(nenv: usize) -> Self {
        assert!(nenv.is_power_of_two() && nenv >= 2, "nenv must be a power of two");
        let mut slots = Vec::with_capacity(nenv);
        slots.resize_with(nenv, || None);
        Self {
            slots,
            gens: alloc::vec![0; nenv],
            num_free: nenv,
            log2nenv: nenv.trailing_zeros(),
        }
    }

    pub fn nenv(&self) -> usize {
        self.slots.len()
    }

    /// Environments currently allocated (any non-free status)
    pub fn live_count(&self) -> usize {
        self.slots.len() - self.num_free
    }

    fn index_of(&self, id: EnvId) -> usize {
        (id.as_u32() as usize) & (self.slots.len() - 1)
    }

    /// Allocate the lowest free slot. The caller supplies the freshly
    /// created page directory.
    pub fn alloc(&mut self, parent: EnvId, etype: EnvType, pgdir: FrameNumber) -> Result<EnvId> {
        let idx = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(KernelError::NoFreeEnv)?;
        self.gens[idx] += 1;
        let id = EnvId((self.gens[idx] << self.log2nenv) | idx as u32);
        self.slots[idx] = Some(Env::new(id, parent, etype, pgdir));
        self.num_free -= 1;
        Ok(id)
    }

    /// Release a slot. Address-space teardown is the kernel's job and must
    /// already have happened.
    pub fn free(&mut self, id: EnvId) {
        let idx = self.index_of(id);
        match &self.slots[idx] {
            Some(e) if e.id == id => {}
            Some(_) => panic!("freeing a recycled environment id"),
            None => panic!("freeing a free environment slot"),
        }
        self.slots[idx] = None;
        self.num_free += 1;
    }

    /// Resolve `id` to a live environment, `id` 0 meaning the caller.
    ///
    /// With `checkperm`, the caller must be the environment itself or its
    /// immediate parent.
    pub fn resolve(&self, caller: EnvId, id: EnvId, checkperm: bool) -> Result<EnvId> {
        let id = if id.is_null() { caller } else { id };
        let e = self.get(id).ok_or(KernelError::BadEnv)?;
        if checkperm && e.id != caller && e.parent != caller {
            return Err(KernelError::BadEnv);
        }
        Ok(e.id)
    }

    /// Live environment for `id`, if the generation still matches
    pub fn get(&self, id: EnvId) -> Option<&Env> {
        let idx = self.index_of(id);
        match &self.slots[idx] {
            Some(e) if e.id == id => Some(e),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, id: EnvId) -> Option<&mut Env> {
        let idx = self.index_of(id);
        match &mut self.slots[idx] {
            Some(e) if e.id == id => Some(e),
            _ => None,
        }
    }

    /// First live environment of the given type, lowest slot first
    pub fn find_by_type(&self, etype: EnvType) -> Option<EnvId> {
        self.slots
            .iter()
            .flatten()
            .find(|e| e.etype == etype)
            .map(|e| e.id)
    }

    /// Iterate over live environments
    pub fn iter(&self) -> impl Iterator<Item = &Env> {
        self.slots.iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Env> {
        self.slots.iter_mut().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> EnvTable {
        EnvTable::new(8)
    }

    fn dir() -> FrameNumber {
        FrameNumber::new(1)
    }

    #[test]
    fn ids_embed_generation_and_index() {
        let mut t = table();
        let a = t.alloc(EnvId::NULL, EnvType::User, dir()).unwrap();
        let b = t.alloc(EnvId::NULL, EnvType::User, dir()).unwrap();
        assert_ne!(a, b);
        assert_eq!(a.as_u32() & 7, 0);
        assert_eq!(b.as_u32() & 7, 1);
        assert!(!a.is_null());
        assert_eq!(t.live_count(), 2);
    }

    #[test]
    fn recycled_slot_gets_new_generation() {
        let mut t = table();
        let a = t.alloc(EnvId::NULL, EnvType::User, dir()).unwrap();
        t.free(a);
        let b = t.alloc(EnvId::NULL, EnvType::User, dir()).unwrap();
        assert_eq!(a.as_u32() & 7, b.as_u32() & 7);
        assert_ne!(a, b);
        assert!(t.get(a).is_none());
        assert!(t.get(b).is_some());
    }

    #[test]
    fn resolve_honors_permission_rule() {
        let mut t = table();
        let parent = t.alloc(EnvId::NULL, EnvType::User, dir()).unwrap();
        let child = t.alloc(parent, EnvType::User, dir()).unwrap();
        let stranger = t.alloc(EnvId::NULL, EnvType::User, dir()).unwrap();

        // 0 means the caller
        assert_eq!(t.resolve(parent, EnvId::NULL, true).unwrap(), parent);
        // parent may act on its child
        assert_eq!(t.resolve(parent, child, true).unwrap(), child);
        // child may not act on its parent
        assert_eq!(t.resolve(child, parent, true), Err(KernelError::BadEnv));
        // anyone may name anyone without checkperm
        assert_eq!(t.resolve(stranger, parent, false).unwrap(), parent);
    }

    #[test]
    fn exhaustion_yields_no_free_env() {
        let mut t = table();
        for _ in 0..8 {
            t.alloc(EnvId::NULL, EnvType::User, dir()).unwrap();
        }
        assert_eq!(
            t.alloc(EnvId::NULL, EnvType::User, dir()),
            Err(KernelError::NoFreeEnv)
        );
    }

    #[test]
    fn find_by_type_locates_the_page_server() {
        let mut t = table();
        t.alloc(EnvId::NULL, EnvType::User, dir()).unwrap();
        assert!(t.find_by_type(EnvType::PageServer).is_none());
        let srv = t.alloc(EnvId::NULL, EnvType::PageServer, dir()).unwrap();
        assert_eq!(t.find_by_type(EnvType::PageServer), Some(srv));
    }
}
