//! Shared harness for the end-to-end paging scenarios: boots a machine,
//! runs the swap server and a timer ticker on their own threads, and
//! hands out user environments.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tellur_kernel::drivers::block::MemDisk;
use tellur_kernel::pageserv::{PageServer, PAGE_BLOCKS_OFFSET, PAGE_NBLOCKS};
use tellur_kernel::{EnvType, Machine, MachineConfig, PteFlags, UserEnv};

pub const UPW: u32 = PteFlags::PRESENT.bits() | PteFlags::USER.bits() | PteFlags::WRITABLE.bits();

/// Boot a machine with `npages` physical frames, a swap server with
/// `swap_slots` slots on its own thread, and a timer ticker driving the
/// ager.
pub fn boot(npages: usize, swap_slots: usize) -> Arc<Machine> {
    let machine = Arc::new(Machine::new(MachineConfig { npages, nenv: 64 }));
    machine.set_yield_hook(thread::yield_now);

    let server_id = machine.env_create(EnvType::PageServer).expect("env table full");
    {
        let m = machine.clone();
        thread::spawn(move || {
            let env = UserEnv::attach(m, server_id);
            let disk = MemDisk::new(PAGE_BLOCKS_OFFSET as usize + swap_slots);
            PageServer::with_capacity(env, Box::new(disk), swap_slots).serve();
        });
    }
    {
        let m = machine.clone();
        thread::spawn(move || loop {
            m.timer_tick();
            thread::sleep(Duration::from_micros(200));
        });
    }
    machine
}

/// Boot with the full swap partition
pub fn boot_full_swap(npages: usize) -> Arc<Machine> {
    boot(npages, PAGE_NBLOCKS)
}

/// Create a fresh user environment on this machine
pub fn user(machine: &Arc<Machine>) -> UserEnv {
    let id = machine.env_create(EnvType::User).expect("env table full");
    UserEnv::attach(machine.clone(), id)
}
