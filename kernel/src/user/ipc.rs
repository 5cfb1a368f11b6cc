//! User-level IPC wrappers

use super::UserEnv;
use crate::env::{EnvId, EnvType};
use crate::error::{KernelError, Result};
use crate::mm::{PteFlags, VirtAddr};
use crate::syscall::Syscall;

/// Send `value` (and the page at `src_va`, if any) to `to`, blocking
/// until the transfer completes
pub fn ipc_send(
    env: &mut UserEnv,
    to: EnvId,
    value: u32,
    src_va: Option<VirtAddr>,
    perm: PteFlags,
) -> Result<()> {
    let r = env.syscall(Syscall::IpcSend {
        env: to,
        value,
        src_va,
        perm: perm.bits(),
    });
    if r < 0 {
        return Err(KernelError::from_errno(r).unwrap_or(KernelError::Inval));
    }
    Ok(())
}

/// Block until a value arrives. Returns (value, sender, page perm).
pub fn ipc_recv(env: &mut UserEnv, dst_va: Option<VirtAddr>) -> Result<(u32, EnvId, PteFlags)> {
    let r = env.syscall(Syscall::IpcRecv { dst_va });
    if r < 0 {
        return Err(KernelError::from_errno(r).unwrap_or(KernelError::Inval));
    }
    let view = env.snapshot();
    Ok((view.ipc_value, view.ipc_from, view.ipc_perm))
}

/// Non-blocking receive
pub fn ipc_try_recv(env: &mut UserEnv, dst_va: Option<VirtAddr>) -> Result<(u32, EnvId, PteFlags)> {
    let r = env.syscall(Syscall::IpcTryRecv { dst_va });
    if r < 0 {
        return Err(KernelError::from_errno(r).unwrap_or(KernelError::Inval));
    }
    let view = env.snapshot();
    Ok((view.ipc_value, view.ipc_from, view.ipc_perm))
}

/// Find a system environment by type (the swap server, mainly)
pub fn ipc_find_env(env: &UserEnv, etype: EnvType) -> Option<EnvId> {
    env.machine().find_env_of_type(etype)
}
