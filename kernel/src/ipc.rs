//! Page-granularity IPC
//!
//! A send carries a scalar value and, optionally, a grant of the page
//! mapped at the sender's `src_va`. When the target is not blocked in
//! receive, the sender parks itself at the tail of the target's
//! blocked-sender queue (strict FIFO) and its return value is written into
//! its saved register frame by the receive that eventually services it.

use crate::env::{EnvId, EnvStatus};
use crate::error::{KernelError, Result};
use crate::machine::Kernel;
use crate::mm::{page_table, PteFlags, VirtAddr, UTOP};
use crate::syscall::check_syscall_perm;

impl Kernel {
    /// Send `value` (and possibly the page at `src_va`) to `target`.
    ///
    /// `Ok(true)` means the caller is now parked on the target's queue and
    /// its return value is deferred. `Ok(false)` means the transfer
    /// completed immediately.
    pub(crate) fn ipc_send(
        &mut self,
        caller: EnvId,
        target: EnvId,
        value: u32,
        src_va: Option<VirtAddr>,
        perm_bits: u32,
    ) -> Result<bool> {
        let target = self.envs.resolve(caller, target, false)?;
        if self.envs.get(target).map(|e| e.status) == Some(EnvStatus::Dying) {
            return Err(KernelError::BadEnv);
        }

        // validate the offered page while the caller's tables are intact
        let (page, perm) = match src_va {
            None => (None, PteFlags::empty()),
            Some(va) => {
                if va.as_u32() >= UTOP || !va.is_page_aligned() {
                    return Err(KernelError::Inval);
                }
                let perm = check_syscall_perm(perm_bits)?;
                let caller_dir = self.envs.get(caller).ok_or(KernelError::BadEnv)?.pgdir;
                let Some((frame, slot)) = page_table::lookup(&self.phys, caller_dir, va) else {
                    return Err(KernelError::Inval);
                };
                if perm.contains(PteFlags::WRITABLE)
                    && slot.load(&self.phys) & PteFlags::WRITABLE.bits() == 0
                {
                    return Err(KernelError::Inval);
                }
                (Some(frame), perm)
            }
        };

        let recv_blocked = self.envs.get(target).map(|e| e.ipc_recving).unwrap_or(false);
        if !recv_blocked {
            // park the caller at the queue tail
            {
                let me = self
                    .envs
                    .get_mut(caller)
                    .expect("caller vanished during send");
                me.ipc_value_sending = value;
                me.ipc_perm_sending = perm;
                me.ipc_page_sending = page;
                me.ipc_sender_chain = None;
                me.status = EnvStatus::NotRunnable;
            }
            let head = self.envs.get(target).unwrap().ipc_blocked_sender;
            match head {
                None => {
                    self.envs.get_mut(target).unwrap().ipc_blocked_sender = Some(caller);
                }
                Some(mut tail) => {
                    loop {
                        let next = self.envs.get(tail).unwrap().ipc_sender_chain;
                        match next {
                            Some(n) => tail = n,
                            None => break,
                        }
                    }
                    self.envs.get_mut(tail).unwrap().ipc_sender_chain = Some(caller);
                }
            }
            return Ok(true);
        }

        // the target is waiting: deliver in place
        let (dst_dir, dst_va) = {
            let d = self.envs.get(target).unwrap();
            (d.pgdir, d.ipc_dstva)
        };
        let mut transferred = false;
        if let (Some(dva), Some(frame)) = (dst_va, page) {
            let mut charge = self.envs.get(target).unwrap().pages_charged;
            let Kernel { phys, frames, rmap, .. } = self;
            page_table::insert(phys, frames, rmap, dst_dir, frame, dva, perm, Some(&mut charge))?;
            self.envs.get_mut(target).unwrap().pages_charged = charge;
            transferred = true;
        }
        let d = self.envs.get_mut(target).unwrap();
        d.ipc_recving = false;
        d.ipc_from = caller;
        d.ipc_value = value;
        d.ipc_perm = if transferred { perm } else { PteFlags::empty() };
        d.tf.regs.eax = 0;
        d.status = EnvStatus::Runnable;
        Ok(false)
    }

    /// Receive a value (and possibly a page at `dst_va`).
    ///
    /// `Ok(true)` means the caller blocked with an empty queue; a future
    /// send will complete it. `Ok(false)` means a queued sender was
    /// serviced and the caller's IPC slots are filled. With `block` false
    /// an empty queue is `Err(IpcNotSend)` instead.
    pub(crate) fn ipc_recv(
        &mut self,
        caller: EnvId,
        dst_va: Option<VirtAddr>,
        block: bool,
    ) -> Result<bool> {
        if let Some(va) = dst_va {
            if va.as_u32() >= UTOP || !va.is_page_aligned() {
                return Err(KernelError::Inval);
            }
        }

        loop {
            let head = self.envs.get(caller).unwrap().ipc_blocked_sender;
            let Some(sid) = head else {
                if !block {
                    return Err(KernelError::IpcNotSend);
                }
                let me = self.envs.get_mut(caller).unwrap();
                me.ipc_recving = true;
                me.ipc_dstva = dst_va;
                me.status = EnvStatus::NotRunnable;
                return Ok(true);
            };

            // pop the head and make it runnable; if its transfer fails it
            // resumes with the error in its return register
            let (s_chain, s_page, s_value, s_perm) = {
                let s = self.envs.get(sid).expect("queued sender vanished");
                (
                    s.ipc_sender_chain,
                    s.ipc_page_sending,
                    s.ipc_value_sending,
                    s.ipc_perm_sending,
                )
            };
            self.envs.get_mut(caller).unwrap().ipc_blocked_sender = s_chain;
            {
                let s = self.envs.get_mut(sid).unwrap();
                s.ipc_sender_chain = None;
                s.status = EnvStatus::Runnable;
                s.ipc_page_sending = None;
            }

            let mut transferred = false;
            if let (Some(dva), Some(frame)) = (dst_va, s_page) {
                let (my_dir, mut charge) = {
                    let me = self.envs.get(caller).unwrap();
                    (me.pgdir, me.pages_charged)
                };
                let insert_res = {
                    let Kernel { phys, frames, rmap, .. } = self;
                    page_table::insert(phys, frames, rmap, my_dir, frame, dva, s_perm, Some(&mut charge))
                };
                match insert_res {
                    Ok(()) => {
                        self.envs.get_mut(caller).unwrap().pages_charged = charge;
                        transferred = true;
                    }
                    Err(e) => {
                        self.envs.get_mut(sid).unwrap().tf.regs.eax = e.to_errno() as u32;
                        continue;
                    }
                }
            }

            {
                let me = self.envs.get_mut(caller).unwrap();
                me.ipc_from = sid;
                me.ipc_value = s_value;
                me.ipc_perm = if transferred { s_perm } else { PteFlags::empty() };
            }
            self.envs.get_mut(sid).unwrap().tf.regs.eax = 0;
            return Ok(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::EnvType;
    use crate::machine::{Machine, MachineConfig};

    const UPW: u32 = 0x7;
    const UP: u32 = 0x5;

    fn machine() -> Machine {
        Machine::new(MachineConfig { npages: 64, nenv: 8 })
    }

    fn map_page(m: &Machine, id: EnvId, va: u32, perm: u32) {
        let r = m.with_kernel(|k| k.sys_page_alloc(id, EnvId::NULL, VirtAddr::new(va), perm));
        r.unwrap();
    }

    #[test]
    fn send_to_waiting_receiver_delivers_value() {
        let m = machine();
        let a = m.env_create(EnvType::User).unwrap();
        let b = m.env_create(EnvType::User).unwrap();

        // b blocks in receive first
        let blocked = m.with_kernel(|k| k.ipc_recv(b, None, true)).unwrap();
        assert!(blocked);
        assert_eq!(m.env_snapshot(b).unwrap().status, EnvStatus::NotRunnable);

        let blocked = m.with_kernel(|k| k.ipc_send(a, b, 42, None, 0)).unwrap();
        assert!(!blocked);

        let view = m.env_snapshot(b).unwrap();
        assert_eq!(view.status, EnvStatus::Runnable);
        assert_eq!(view.ipc_value, 42);
        assert_eq!(view.ipc_from, a);
        assert_eq!(view.eax, 0);
        assert!(view.ipc_perm.is_empty());
    }

    #[test]
    fn page_grant_maps_into_receiver() {
        let m = machine();
        let a = m.env_create(EnvType::User).unwrap();
        let b = m.env_create(EnvType::User).unwrap();
        map_page(&m, a, 0x40_0000, UPW);
        m.user_write_u32(a, VirtAddr::new(0x40_0000), 1234).unwrap();

        m.with_kernel(|k| k.ipc_recv(b, Some(VirtAddr::new(0x80_0000)), true)).unwrap();
        m.with_kernel(|k| k.ipc_send(a, b, 7, Some(VirtAddr::new(0x40_0000)), UPW))
            .unwrap();

        // same frame visible on both sides
        assert_eq!(m.user_read_u32(b, VirtAddr::new(0x80_0000)), Ok(1234));
        m.user_write_u32(b, VirtAddr::new(0x80_0000), 4321).unwrap();
        assert_eq!(m.user_read_u32(a, VirtAddr::new(0x40_0000)), Ok(4321));
        let view = m.env_snapshot(b).unwrap();
        assert!(view.ipc_perm.contains(PteFlags::WRITABLE));
        m.check_invariants();
    }

    #[test]
    fn send_without_receiver_queues_fifo() {
        let m = machine();
        let a = m.env_create(EnvType::User).unwrap();
        let b = m.env_create(EnvType::User).unwrap();
        let c = m.env_create(EnvType::User).unwrap();

        assert!(m.with_kernel(|k| k.ipc_send(a, c, 1, None, 0)).unwrap());
        assert!(m.with_kernel(|k| k.ipc_send(b, c, 2, None, 0)).unwrap());
        assert_eq!(m.env_snapshot(a).unwrap().status, EnvStatus::NotRunnable);
        m.check_invariants();

        // first recv services a, second services b
        assert!(!m.with_kernel(|k| k.ipc_recv(c, None, true)).unwrap());
        assert_eq!(m.env_snapshot(c).unwrap().ipc_value, 1);
        assert_eq!(m.env_snapshot(a).unwrap().status, EnvStatus::Runnable);
        assert_eq!(m.env_snapshot(a).unwrap().eax, 0);

        assert!(!m.with_kernel(|k| k.ipc_recv(c, None, true)).unwrap());
        assert_eq!(m.env_snapshot(c).unwrap().ipc_value, 2);
    }

    #[test]
    fn try_recv_does_not_block() {
        let m = machine();
        let a = m.env_create(EnvType::User).unwrap();
        assert_eq!(
            m.with_kernel(|k| k.ipc_recv(a, None, false)),
            Err(KernelError::IpcNotSend)
        );
        assert_eq!(m.env_snapshot(a).unwrap().status, EnvStatus::Runnable);
    }

    #[test]
    fn write_grant_of_readonly_page_is_invalid() {
        let m = machine();
        let a = m.env_create(EnvType::User).unwrap();
        let b = m.env_create(EnvType::User).unwrap();
        map_page(&m, a, 0x40_0000, UP);
        m.with_kernel(|k| k.ipc_recv(b, Some(VirtAddr::new(0x80_0000)), true)).unwrap();
        assert_eq!(
            m.with_kernel(|k| k.ipc_send(a, b, 0, Some(VirtAddr::new(0x40_0000)), UPW)),
            Err(KernelError::Inval)
        );
        // misaligned source
        assert_eq!(
            m.with_kernel(|k| k.ipc_send(a, b, 0, Some(VirtAddr::new(0x40_0004)), UP)),
            Err(KernelError::Inval)
        );
    }

    #[test]
    fn sender_offering_page_to_valueless_receiver_is_fine() {
        let m = machine();
        let a = m.env_create(EnvType::User).unwrap();
        let b = m.env_create(EnvType::User).unwrap();
        map_page(&m, a, 0x40_0000, UPW);
        m.with_kernel(|k| k.ipc_recv(b, None, true)).unwrap();
        m.with_kernel(|k| k.ipc_send(a, b, 9, Some(VirtAddr::new(0x40_0000)), UPW))
            .unwrap();
        let view = m.env_snapshot(b).unwrap();
        assert_eq!(view.ipc_value, 9);
        assert!(view.ipc_perm.is_empty(), "no page moved, perm must read 0");
    }

    #[test]
    fn destroying_receiver_wakes_senders_with_bad_env() {
        let m = machine();
        let a = m.env_create(EnvType::User).unwrap();
        let b = m.env_create(EnvType::User).unwrap();
        let c = m.env_create(EnvType::User).unwrap();
        assert!(m.with_kernel(|k| k.ipc_send(a, c, 1, None, 0)).unwrap());
        assert!(m.with_kernel(|k| k.ipc_send(b, c, 2, None, 0)).unwrap());

        m.with_kernel(|k| k.env_free(c));

        for id in [a, b] {
            let view = m.env_snapshot(id).unwrap();
            assert_eq!(view.status, EnvStatus::Runnable);
            assert_eq!(view.eax as i32, KernelError::BadEnv.to_errno());
        }
        m.check_invariants();
    }

    #[test]
    fn destroying_queued_sender_leaves_queue_intact() {
        let m = machine();
        let a = m.env_create(EnvType::User).unwrap();
        let b = m.env_create(EnvType::User).unwrap();
        let c = m.env_create(EnvType::User).unwrap();
        assert!(m.with_kernel(|k| k.ipc_send(a, c, 1, None, 0)).unwrap());
        assert!(m.with_kernel(|k| k.ipc_send(b, c, 2, None, 0)).unwrap());

        // a dies while queued; the queue must skip straight to b
        m.with_kernel(|k| k.env_free(a));
        m.check_invariants();
        assert!(!m.with_kernel(|k| k.ipc_recv(c, None, true)).unwrap());
        assert_eq!(m.env_snapshot(c).unwrap().ipc_value, 2);
    }

    #[test]
    fn recv_no_mem_fails_sender_and_tries_next() {
        // receiver with a full frame budget: the first sender's grant
        // cannot be mapped, the second (valueless) one succeeds
        let m = Machine::new(MachineConfig { npages: 16, nenv: 8 });
        let a = m.env_create(EnvType::User).unwrap();
        let b = m.env_create(EnvType::User).unwrap();
        let c = m.env_create(EnvType::User).unwrap();
        map_page(&m, a, 0x40_0000, UPW);

        assert!(m.with_kernel(|k| k.ipc_send(a, c, 1, Some(VirtAddr::new(0x40_0000)), UPW)).unwrap());
        assert!(m.with_kernel(|k| k.ipc_send(b, c, 2, None, 0)).unwrap());

        // drain the free list so the receiver's page-table allocation fails
        m.with_kernel(|k| loop {
            let Some(f) = k.frames.alloc(&mut k.phys, false) else { break };
            k.frames.incref(f);
        });

        assert!(!m.with_kernel(|k| k.ipc_recv(c, Some(VirtAddr::new(0x90_0000)), true)).unwrap());
        assert_eq!(m.env_snapshot(c).unwrap().ipc_value, 2);
        assert_eq!(
            m.env_snapshot(a).unwrap().eax as i32,
            KernelError::NoMem.to_errno()
        );
        assert_eq!(m.env_snapshot(a).unwrap().status, EnvStatus::Runnable);
    }
}
