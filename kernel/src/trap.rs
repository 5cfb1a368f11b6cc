//! Kernel trap paths: the timer interrupt and the user page-fault upcall
//!
//! A user-mode fault either reaches a registered upcall, with a fault
//! record pushed onto the user exception stack, or destroys the
//! environment. Kernel-mode faults cannot happen here: the simulated
//! kernel never runs through the guest page tables.

use crate::env::{EnvId, PushRegs};
use crate::machine::{Kernel, Machine};
use crate::mm::{page_table, FrameNumber, PteFlags, VirtAddr, PGSIZE, UXSTACKTOP};

/// Bytes of a fault record on the exception stack
pub const UTF_SIZE: usize = 52;

/// Fault record handed to the user upcall, laid out in guest memory from
/// low address up: fault_va, err, eight registers, eip, eflags, esp
#[derive(Debug, Clone, Copy)]
pub struct UTrapframe {
    pub fault_va: u32,
    pub err: u32,
    pub regs: PushRegs,
    pub eip: u32,
    pub eflags: u32,
    pub esp: u32,
}

/// Outcome of the kernel half of a user page fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultDisposition {
    /// The environment was redirected to its upcall; the record sits at
    /// `utf_va`
    Upcall { utf_va: VirtAddr },
    /// No upcall, unwritable exception stack, or exception-stack
    /// overflow: the environment is gone
    Destroyed,
}

impl Machine {
    /// The timer interrupt: age pages under the big kernel lock, then
    /// give up the CPU
    pub fn timer_tick(&self) {
        {
            let mut k = self.kernel();
            k.update_page_ages();
        }
        self.yield_now();
    }

    /// Kernel page-fault handler for a fault in `env` at `fault_va`.
    ///
    /// Builds the fault record directly below the exception-stack top, or
    /// below the trap-time esp with one scratch word when the fault is
    /// recursive, then points the environment at its upcall.
    pub fn page_fault(&self, env: EnvId, fault_va: VirtAddr, err: u32) -> FaultDisposition {
        let mut k = self.kernel();
        let Some(e) = k.envs.get(env) else {
            return FaultDisposition::Destroyed;
        };
        let dir = e.pgdir;
        let tf = e.tf;
        let upcall = e.pgfault_upcall;

        if upcall == 0 {
            log::info!(
                "[{:08x}] user fault va {:08x} ip {:08x}",
                env.as_u32(),
                fault_va.as_u32(),
                tf.eip
            );
            k.env_free(env);
            return FaultDisposition::Destroyed;
        }

        let xstack_base = UXSTACKTOP - PGSIZE as u32;
        let recursive = tf.esp >= xstack_base && tf.esp <= UXSTACKTOP - 1;
        let utf_va = if recursive {
            // one scratch word for the trap-return path
            tf.esp.wrapping_sub(4 + UTF_SIZE as u32)
        } else {
            UXSTACKTOP - UTF_SIZE as u32
        };
        let utf_va = VirtAddr::new(utf_va);

        if page_table::user_mem_check(
            &k.phys,
            dir,
            utf_va,
            UTF_SIZE,
            PteFlags::USER | PteFlags::WRITABLE,
        )
        .is_err()
        {
            log::info!(
                "[{:08x}] user fault va {:08x} with bad exception stack, destroying",
                env.as_u32(),
                fault_va.as_u32()
            );
            k.env_free(env);
            return FaultDisposition::Destroyed;
        }

        let utf = UTrapframe {
            fault_va: fault_va.as_u32(),
            err,
            regs: tf.regs,
            eip: tf.eip,
            eflags: tf.eflags,
            esp: tf.esp,
        };
        k.write_utf(dir, utf_va, &utf);

        let e = k.envs.get_mut(env).expect("faulting environment vanished");
        e.tf.eip = upcall;
        e.tf.esp = utf_va.as_u32();
        FaultDisposition::Upcall { utf_va }
    }

    /// Read a fault record back out of guest memory
    pub fn read_fault_frame(&self, env: EnvId, utf_va: VirtAddr) -> Option<UTrapframe> {
        let mut k = self.kernel();
        let dir = k.envs.get(env)?.pgdir;
        Some(k.read_utf(dir, utf_va))
    }

    /// Return from an upcall: restore the trap-time state saved in the
    /// record, popping it off the exception stack
    pub fn pop_fault_frame(&self, env: EnvId, utf_va: VirtAddr) {
        let mut k = self.kernel();
        let Some(e) = k.envs.get(env) else { return };
        let dir = e.pgdir;
        let utf = k.read_utf(dir, utf_va);
        let e = k.envs.get_mut(env).expect("environment vanished during upcall");
        e.tf.regs = utf.regs;
        e.tf.eip = utf.eip;
        e.tf.eflags = utf.eflags;
        e.tf.esp = utf.esp;
    }
}

impl Kernel {
    fn write_utf(&mut self, dir: FrameNumber, utf_va: VirtAddr, utf: &UTrapframe) {
        let words = [
            utf.fault_va,
            utf.err,
            utf.regs.edi,
            utf.regs.esi,
            utf.regs.ebp,
            utf.regs.oesp,
            utf.regs.ebx,
            utf.regs.edx,
            utf.regs.ecx,
            utf.regs.eax,
            utf.eip,
            utf.eflags,
            utf.esp,
        ];
        for (i, w) in words.iter().enumerate() {
            let va = VirtAddr::new(utf_va.as_u32() + (i as u32) * 4);
            self.write_user_u32(dir, va, *w)
                .expect("exception stack verified writable");
        }
    }

    fn read_utf(&mut self, dir: FrameNumber, utf_va: VirtAddr) -> UTrapframe {
        let mut words = [0u32; 13];
        for (i, w) in words.iter_mut().enumerate() {
            let va = VirtAddr::new(utf_va.as_u32() + (i as u32) * 4);
            *w = self
                .read_user_u32(dir, va)
                .expect("fault record must stay mapped");
        }
        UTrapframe {
            fault_va: words[0],
            err: words[1],
            regs: PushRegs {
                edi: words[2],
                esi: words[3],
                ebp: words[4],
                oesp: words[5],
                ebx: words[6],
                edx: words[7],
                ecx: words[8],
                eax: words[9],
            },
            eip: words[10],
            eflags: words[11],
            esp: words[12],
        }
    }
}
