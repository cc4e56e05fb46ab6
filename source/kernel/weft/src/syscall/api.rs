// Copyright 2024 Weft Kernel Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Syscall handlers exposed to the dispatcher
//! OWNERS: @kernel-team
//! PUBLIC API: install_handlers(table), Context
//! DEPENDS_ON: task::ProcessTable, mm::AddressSpaceManager
//! INVARIANTS: Decode -> check -> execute; a rejected request changes no state

use super::{Args, Error, SyscallTable, SysResult};
use crate::mm::{AddressSpaceError, AddressSpaceManager, PageFlags};
use crate::task::ProcessTable;
use crate::trap::{INT_SYS_EXIT, INT_SYS_FORK, INT_SYS_GETPID, INT_SYS_PAGE_ALLOC, INT_SYS_YIELD};
use crate::types::{Pid, VirtAddr};

/// State a handler may touch.
pub struct Context<'a> {
    pub tasks: &'a mut ProcessTable,
    pub address_spaces: &'a mut AddressSpaceManager,
    /// Process that issued the call.
    pub current: Pid,
}

impl<'a> Context<'a> {
    pub fn new(tasks: &'a mut ProcessTable, address_spaces: &'a mut AddressSpaceManager, current: Pid) -> Self {
        Self { tasks, address_spaces, current }
    }
}

/// Registers the default set of syscall handlers.
pub fn install_handlers(table: &mut SyscallTable) {
    table.register(INT_SYS_GETPID, sys_getpid);
    table.register(INT_SYS_YIELD, sys_yield);
    table.register(INT_SYS_PAGE_ALLOC, sys_page_alloc);
    table.register(INT_SYS_FORK, sys_fork);
    table.register(INT_SYS_EXIT, sys_exit);
}

fn sys_getpid(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    Ok(ctx.current.as_index())
}

fn sys_yield(_ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    Err(Error::Reschedule)
}

#[derive(Copy, Clone)]
struct PageAllocArgs {
    va: usize,
}

impl PageAllocArgs {
    fn decode(args: &Args) -> Self {
        Self { va: args.get(0) }
    }

    fn check(&self, address_spaces: &AddressSpaceManager) -> Result<VirtAddr, Error> {
        VirtAddr::page_aligned(self.va)
            .filter(|va| address_spaces.layout().is_user(va.raw()))
            .ok_or_else(|| AddressSpaceError::InvalidAddress(self.va).into())
    }
}

fn sys_page_alloc(ctx: &mut Context<'_>, args: &Args) -> SysResult<usize> {
    let request = PageAllocArgs::decode(args);
    let va = request.check(ctx.address_spaces)?;
    let root = ctx
        .tasks
        .get(ctx.current)
        .and_then(|p| p.page_table())
        .ok_or(AddressSpaceError::InvalidAddress(request.va))?;
    let pn = ctx.address_spaces.map_page(root, va.raw(), ctx.current, PageFlags::USER_RW)?;
    log_trace!(target: "syscall", "page_alloc pid {} va={} -> {}", ctx.current, va, pn);
    Ok(0)
}

fn sys_fork(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    let child = ctx.tasks.fork(ctx.address_spaces, ctx.current)?;
    Ok(child.as_index())
}

fn sys_exit(ctx: &mut Context<'_>, _args: &Args) -> SysResult<usize> {
    ctx.tasks.exit(ctx.address_spaces, ctx.current);
    Err(Error::TaskExit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryLayout;
    use crate::mm::verify::check_virtual_memory;
    use crate::syscall::encode_error;
    use crate::task::{ImageLoader, ProgramImage};

    fn fixture() -> (AddressSpaceManager, ProcessTable, SyscallTable) {
        let mut mm = AddressSpaceManager::new(MemoryLayout::new()).expect("mm");
        let mut tasks = ProcessTable::new(4);
        let mut loader = ImageLoader::new().with_program(ProgramImage::new(0x10_0000).segment(0x10_0000, &[0xC3], 0x1000, false));
        tasks.setup(&mut mm, Pid::from_raw(1), 0, &mut loader).expect("setup");
        let mut table = SyscallTable::new();
        install_handlers(&mut table);
        (mm, tasks, table)
    }

    #[test]
    fn getpid_returns_caller() {
        let (mut mm, mut tasks, table) = fixture();
        let mut ctx = Context::new(&mut tasks, &mut mm, Pid::from_raw(1));
        assert_eq!(table.dispatch(INT_SYS_GETPID, &mut ctx, &Args::default()), Ok(1));
    }

    #[test]
    fn unregistered_number_is_invalid() {
        let (mut mm, mut tasks, table) = fixture();
        let mut ctx = Context::new(&mut tasks, &mut mm, Pid::from_raw(1));
        assert_eq!(table.dispatch(63, &mut ctx, &Args::default()), Err(Error::InvalidSyscall));
        assert_eq!(table.dispatch(500, &mut ctx, &Args::default()), Err(Error::InvalidSyscall));
    }

    #[test]
    fn page_alloc_maps_a_zeroed_user_page() {
        let (mut mm, mut tasks, table) = fixture();
        let mut ctx = Context::new(&mut tasks, &mut mm, Pid::from_raw(1));
        let args = Args::new([0x20_0000, 0, 0, 0, 0, 0]);
        assert_eq!(table.dispatch(INT_SYS_PAGE_ALLOC, &mut ctx, &args), Ok(0));
        let root = tasks.get(Pid::from_raw(1)).and_then(|p| p.page_table()).expect("root");
        let mapping = mm.lookup(root, 0x20_0000).expect("mapped");
        assert_eq!(mapping.flags, PageFlags::USER_RW);
        assert!(mm.memory().frame(mapping.pn).iter().all(|b| *b == 0));
        assert_eq!(check_virtual_memory(&mm, &tasks.views()), Ok(()));
    }

    #[test]
    fn page_alloc_rejections_change_nothing() {
        let (mut mm, mut tasks, table) = fixture();
        let before = mm.memory().snapshot();
        let mut ctx = Context::new(&mut tasks, &mut mm, Pid::from_raw(1));
        for (va, code) in [(0x20_0010usize, -22isize), (0x8_0000, -22), (0x30_0000, -22), (0x10_0000, -17)] {
            let err = table.dispatch(INT_SYS_PAGE_ALLOC, &mut ctx, &Args::new([va, 0, 0, 0, 0, 0]));
            assert_eq!(encode_error(err.expect_err("rejected")) as isize, code, "va {:#x}", va);
        }
        assert_eq!(mm.memory().snapshot(), before);
    }

    #[test]
    fn yield_and_exit_do_not_return_values() {
        let (mut mm, mut tasks, table) = fixture();
        let mut ctx = Context::new(&mut tasks, &mut mm, Pid::from_raw(1));
        assert_eq!(table.dispatch(INT_SYS_YIELD, &mut ctx, &Args::default()), Err(Error::Reschedule));
        assert_eq!(table.dispatch(INT_SYS_EXIT, &mut ctx, &Args::default()), Err(Error::TaskExit));
        assert_eq!(tasks.runnable_count(), 0);
    }
}
