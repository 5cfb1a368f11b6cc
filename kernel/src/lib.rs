//! TellurOS Kernel Library
//!
//! The virtual-memory and paging core of a teaching operating system,
//! built as a hosted simulation: physical memory is an in-process frame
//! arena, page tables live inside it exactly as on hardware, and the big
//! kernel lock is a real mutex. Environments are driven by host threads;
//! the scheduler is reduced to a yield hook and runnable-marking, which
//! is all the paging machinery ever needed from it.
//!
//! The main moving parts:
//! - [`mm`]: frame table, reverse map, two-level page tables, the ager
//! - [`env`], [`ipc`], [`syscall`]: environments and page-granting IPC
//! - [`user`]: the user-space runtime: safe allocation wrappers, the
//!   mapping directory, victim choice, copy-on-write fork
//! - [`pageserv`]: the swap server owning the backing store
//! - [`monitor`]: the interactive kernel monitor

#![no_std]

extern crate alloc;

pub mod drivers;
pub mod env;
pub mod error;
pub mod ipc;
pub mod machine;
pub mod mm;
pub mod monitor;
pub mod pageserv;
pub mod syscall;
pub mod trap;
pub mod user;

// Re-export the types nearly every consumer needs
pub use env::{EnvId, EnvStatus, EnvType};
pub use error::KernelError;
pub use machine::{Machine, MachineConfig};
pub use mm::{PteFlags, VirtAddr, PGSIZE, UTOP};
pub use syscall::{Syscall, SyscallReturn};
pub use user::UserEnv;
