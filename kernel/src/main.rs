//! TellurOS demo: boot a machine, start the swap server, push a
//! workload through the pager, then hand the kernel monitor to stdin.

use std::io::{self, BufRead, Write as _};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tellur_kernel::drivers::block::MemDisk;
use tellur_kernel::pageserv::{PageServer, PAGE_BLOCKS_OFFSET, PAGE_NBLOCKS};
use tellur_kernel::user::{fork, paging};
use tellur_kernel::{EnvId, EnvType, Machine, MachineConfig, PteFlags, UserEnv, VirtAddr, PGSIZE};

const DEMO_BASE: u32 = 0x1000_0000;
const DEMO_PAGES: u32 = 700;

fn main() {
    let machine = Arc::new(Machine::new(MachineConfig {
        npages: 512,
        nenv: 64,
    }));
    machine.set_yield_hook(thread::yield_now);

    // the swap server owns the disk and loops on IPC forever
    let server_id = machine.env_create(EnvType::PageServer).expect("env table full");
    {
        let m = machine.clone();
        thread::spawn(move || {
            let env = UserEnv::attach(m, server_id);
            let disk = MemDisk::new(PAGE_BLOCKS_OFFSET as usize + PAGE_NBLOCKS);
            PageServer::new(env, Box::new(disk)).serve();
        });
    }

    // the timer: age pages a few hundred times a second
    {
        let m = machine.clone();
        thread::spawn(move || loop {
            m.timer_tick();
            thread::sleep(Duration::from_millis(2));
        });
    }

    // demo workload: allocate more pages than physical memory holds,
    // write each page's address into it, then read everything back
    let user_id = machine.env_create(EnvType::User).expect("env table full");
    let mut env = UserEnv::attach(machine.clone(), user_id);
    let perm = (PteFlags::PRESENT | PteFlags::USER | PteFlags::WRITABLE).bits();

    // a small footprint first, so the copy-on-write fork has room to pin
    // the shared frames
    for i in 0..16 {
        let va = VirtAddr::new(DEMO_BASE + i * PGSIZE as u32);
        paging::page_alloc(&mut env, EnvId::NULL, va, perm, true)
            .unwrap_or_else(|e| panic!("page_alloc {va:?}: {e}"));
        env.write_u32(va, va.as_u32());
    }
    let child = fork::fork(&mut env).expect("fork");
    println!("forked child {:08x}", child.as_u32());

    println!("allocating {DEMO_PAGES} pages on a 512-frame machine...");
    for i in 16..DEMO_PAGES {
        let va = VirtAddr::new(DEMO_BASE + i * PGSIZE as u32);
        paging::page_alloc(&mut env, EnvId::NULL, va, perm, true)
            .unwrap_or_else(|e| panic!("page_alloc {va:?}: {e}"));
        env.write_u32(va, va.as_u32());
    }
    let mut mismatches = 0;
    for i in 0..DEMO_PAGES {
        let va = VirtAddr::new(DEMO_BASE + i * PGSIZE as u32);
        if env.read_u32(va) != va.as_u32() {
            mismatches += 1;
        }
    }
    println!("readback complete, {mismatches} mismatches");

    if let Some(stats) = paging::get_paging_stats(&mut env) {
        println!(
            "paging stats: {} outs, {} ins, {} removes",
            stats.page_outs, stats.page_ins, stats.page_removes
        );
    }

    // interactive monitor over the demo environment's address space
    println!("entering the kernel monitor ('help' for commands, 'exit' to leave)");
    let stdin = io::stdin();
    loop {
        print!("K> ");
        io::stdout().flush().ok();
        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(_) => break,
        }
        let line = line.trim();
        if line == "exit" || line == "quit" {
            break;
        }
        print!("{}", machine.monitor_line(user_id, line));
    }
}
