// Copyright 2024 Weft Kernel Contributors
// SPDX-License-Identifier: Apache-2.0

//! End-to-end trap scenarios driven through `Kernel::exception` on the simulated machine.

use weft::hal::virt::SimMachine;
use weft::mm::{Owner, PAGE_SIZE};
use weft::task::{ImageLoader, ProcState, ProgramImage};
use weft::trap::{
    Registers, INT_PAGEFAULT, INT_SYS_EXIT, INT_SYS_FORK, INT_SYS_GETPID, INT_SYS_PAGE_ALLOC, INT_SYS_PANIC,
    INT_SYS_YIELD, INT_TIMER, PFERR_PRESENT, PFERR_USER, PFERR_WRITE,
};
use weft::{BootCommand, Kernel, KernelConfig, KernelPanic, Pid, Resume};

const ENOMEM: isize = -12;
const EAGAIN: isize = -11;
const EEXIST: isize = -17;
const EINVAL: isize = -22;

/// Program `p` occupies a read-only code page at `entry(p)` and a writable data page after it.
fn entry(program: usize) -> usize {
    0x10_0000 + program * 0x4_0000
}

fn data(program: usize) -> usize {
    entry(program) + PAGE_SIZE
}

fn programs() -> ImageLoader {
    (0..6).fold(ImageLoader::new(), |loader, p| {
        loader.with_program(
            ProgramImage::new(entry(p))
                .segment(entry(p), &[0xCD, 0x30, 0xEB, 0xFC], PAGE_SIZE, false)
                .segment(data(p), b"boom\0", PAGE_SIZE, true),
        )
    })
}

fn boot_with(config: KernelConfig, command: BootCommand) -> Kernel<SimMachine> {
    let mut kernel = Kernel::boot(config.with_invariant_checks(true), SimMachine::new(), &mut programs(), command)
        .expect("boot");
    assert!(matches!(kernel.start(), Resume::Run(_)));
    kernel
}

fn boot(command: BootCommand) -> Kernel<SimMachine> {
    boot_with(KernelConfig::new(), command)
}

fn pid(raw: u32) -> Pid {
    Pid::from_raw(raw)
}

fn regs_of(kernel: &Kernel<SimMachine>, who: Pid) -> Registers {
    *kernel.process(who).expect("process").registers()
}

/// Raises `intno` from the current process with `rdi` as first argument.
fn trap(kernel: &mut Kernel<SimMachine>, intno: u64, rdi: usize) -> Result<Resume, KernelPanic> {
    let mut regs = regs_of(kernel, kernel.current());
    regs.intno = intno;
    regs.rdi = rdi as u64;
    regs.err = 0;
    kernel.exception(&regs)
}

fn rax(kernel: &Kernel<SimMachine>, who: Pid) -> isize {
    regs_of(kernel, who).rax as isize
}

fn root(kernel: &Kernel<SimMachine>, who: Pid) -> weft::PageNumber {
    kernel.process(who).and_then(|p| p.page_table()).expect("page table")
}

#[test]
fn default_boot_runs_four_processes() {
    let kernel = boot(BootCommand::Default);
    for raw in 1..=4 {
        assert_eq!(kernel.tasks().state(pid(raw)), ProcState::Runnable);
        assert_eq!(regs_of(&kernel, pid(raw)).rip as usize, entry(raw as usize - 1));
    }
    assert_eq!(kernel.tasks().state(pid(5)), ProcState::Free);
    assert_eq!(kernel.current(), pid(1));
    assert_eq!(kernel.hal().active_page_table(), Some(root(&kernel, pid(1))));
    assert_eq!(kernel.check_virtual_memory(), Ok(()));
}

#[test]
fn boot_command_selects_fork_program() {
    let kernel = boot(BootCommand::parse(Some("forkexit")));
    assert_eq!(kernel.tasks().runnable_count(), 1);
    assert_eq!(regs_of(&kernel, pid(1)).rip as usize, entry(5));
}

#[test]
fn getpid_and_yield() {
    let mut kernel = boot(BootCommand::Default);
    assert_eq!(trap(&mut kernel, INT_SYS_GETPID, 0), Ok(Resume::Run(pid(1))));
    assert_eq!(rax(&kernel, pid(1)), 1);
    assert_eq!(trap(&mut kernel, INT_SYS_YIELD, 0), Ok(Resume::Run(pid(2))));
    assert_eq!(trap(&mut kernel, INT_SYS_GETPID, 0), Ok(Resume::Run(pid(2))));
    assert_eq!(rax(&kernel, pid(2)), 2);
}

#[test]
fn fork_copies_registers_and_shares_kernel_region() {
    let mut kernel = boot(BootCommand::Default);
    assert_eq!(trap(&mut kernel, INT_SYS_FORK, 0), Ok(Resume::Run(pid(1))));
    let child = pid(5);
    assert_eq!(rax(&kernel, pid(1)), 5);
    assert_eq!(rax(&kernel, child), 0);

    let (mut parent_regs, mut child_regs) = (regs_of(&kernel, pid(1)), regs_of(&kernel, child));
    parent_regs.rax = 0;
    child_regs.rax = 0;
    assert_eq!(parent_regs, child_regs);

    let mm = kernel.address_spaces();
    let (parent_root, child_root) = (root(&kernel, pid(1)), root(&kernel, child));
    assert_ne!(parent_root, child_root);
    for va in (0..mm.layout().proc_start).step_by(PAGE_SIZE) {
        assert_eq!(mm.translate(parent_root, va), mm.translate(child_root, va), "va {:#x}", va);
    }
    assert_eq!(kernel.check_virtual_memory(), Ok(()));
}

#[test]
fn forked_writable_pages_are_private() {
    let mut kernel = boot(BootCommand::Fork);
    let _ = trap(&mut kernel, INT_SYS_FORK, 0).expect("fork");
    let (parent, child) = (root(&kernel, pid(1)), root(&kernel, pid(2)));
    let va = data(4);

    kernel.address_spaces_mut().copy_to_user(child, va, b"kid!").expect("child write");
    let mut buf = [0u8; 4];
    kernel.address_spaces().copy_from_user(parent, va, &mut buf).expect("parent read");
    assert_eq!(&buf, b"boom");

    let mm = kernel.address_spaces();
    assert_ne!(mm.lookup(parent, va).map(|m| m.pn), mm.lookup(child, va).map(|m| m.pn));
    let code = mm.lookup(child, entry(4)).expect("code");
    assert_eq!(mm.lookup(parent, entry(4)).map(|m| m.pn), Some(code.pn));
    assert_eq!(mm.memory().refcount(code.pn), 2);
}

#[test]
fn child_exit_restores_page_state() {
    let mut kernel = boot(BootCommand::Fork);
    let before = kernel.address_spaces().memory().snapshot();
    let _ = trap(&mut kernel, INT_SYS_FORK, 0).expect("fork");
    assert_eq!(trap(&mut kernel, INT_TIMER, 0), Ok(Resume::Run(pid(2))));
    assert_eq!(trap(&mut kernel, INT_SYS_EXIT, 0), Ok(Resume::Run(pid(1))));
    assert_eq!(kernel.tasks().state(pid(2)), ProcState::Free);
    assert_eq!(kernel.address_spaces().memory().snapshot(), before);
    assert_eq!(kernel.check_virtual_memory(), Ok(()));
}

#[test]
fn parent_exit_hands_shared_code_to_child() {
    let mut kernel = boot(BootCommand::Fork);
    let _ = trap(&mut kernel, INT_SYS_FORK, 0).expect("fork");
    let code = kernel.address_spaces().lookup(root(&kernel, pid(1)), entry(4)).expect("code").pn;
    assert_eq!(trap(&mut kernel, INT_SYS_EXIT, 0), Ok(Resume::Run(pid(2))));
    let memory = kernel.address_spaces().memory();
    assert_eq!(memory.refcount(code), 1);
    assert_eq!(memory.owner(code), Owner::Process(pid(2)));
    assert_eq!(kernel.check_virtual_memory(), Ok(()));
}

#[test]
fn page_alloc_until_exhaustion() {
    let mut kernel = boot(BootCommand::Fork);
    let mut exhausted = false;
    let below = (0x10_0000..entry(4)).step_by(PAGE_SIZE);
    let above = (data(4) + PAGE_SIZE..0x2F_F000).step_by(PAGE_SIZE);
    for va in below.chain(above) {
        let before = kernel.address_spaces().memory().snapshot();
        assert_eq!(trap(&mut kernel, INT_SYS_PAGE_ALLOC, va), Ok(Resume::Run(pid(1))));
        match rax(&kernel, pid(1)) {
            0 => continue,
            ENOMEM => {
                assert_eq!(kernel.address_spaces().memory().snapshot(), before);
                exhausted = true;
                break;
            }
            other => panic!("unexpected result {} at {:#x}", other, va),
        }
    }
    assert!(exhausted);
    assert_eq!(kernel.address_spaces().memory().free_count(), 0);
    assert_eq!(kernel.check_virtual_memory(), Ok(()));
}

#[test]
fn page_alloc_rejects_bad_addresses() {
    let mut kernel = boot(BootCommand::Fork);
    let before = kernel.address_spaces().memory().snapshot();
    let layout = *kernel.address_spaces().layout();
    for (va, code) in [
        (0x28_0010, EINVAL),
        (layout.kernel_start, EINVAL),
        (layout.virtual_size, EINVAL),
        (entry(4), EEXIST),
    ] {
        let _ = trap(&mut kernel, INT_SYS_PAGE_ALLOC, va).expect("handled");
        assert_eq!(rax(&kernel, pid(1)), code, "va {:#x}", va);
    }
    assert_eq!(kernel.address_spaces().memory().snapshot(), before);
}

#[test]
fn fork_fails_when_table_full() {
    let mut kernel = boot_with(KernelConfig::new().with_nproc(3), BootCommand::Fork);
    let _ = trap(&mut kernel, INT_SYS_FORK, 0).expect("fork");
    assert_eq!(rax(&kernel, pid(1)), 2);
    let before = kernel.address_spaces().memory().snapshot();
    let _ = trap(&mut kernel, INT_SYS_FORK, 0).expect("fork");
    assert_eq!(rax(&kernel, pid(1)), EAGAIN);
    assert_eq!(kernel.address_spaces().memory().snapshot(), before);
}

#[test]
fn fork_out_of_memory_rolls_back() {
    let mut kernel = boot(BootCommand::Fork);
    let before = kernel.address_spaces().memory().snapshot();
    kernel.address_spaces_mut().memory_mut().fail_after(7);
    let _ = trap(&mut kernel, INT_SYS_FORK, 0).expect("fork");
    assert_eq!(rax(&kernel, pid(1)), ENOMEM);
    assert_eq!(kernel.tasks().state(pid(2)), ProcState::Free);
    assert_eq!(kernel.address_spaces().memory().snapshot(), before);
    assert!(kernel.address_spaces().memory().violations().is_empty());
}

#[test]
fn user_page_fault_breaks_only_the_faulting_process() {
    let mut kernel = boot(BootCommand::Default);
    kernel.hal_mut().set_fault_address(0x25_0000);
    let mut regs = regs_of(&kernel, pid(1));
    regs.intno = INT_PAGEFAULT;
    regs.err = PFERR_USER | PFERR_WRITE;
    assert_eq!(kernel.exception(&regs), Ok(Resume::Run(pid(2))));
    assert_eq!(kernel.tasks().state(pid(1)), ProcState::Broken);
    assert_eq!(kernel.check_virtual_memory(), Ok(()));
    for _ in 0..8 {
        match trap(&mut kernel, INT_TIMER, 0) {
            Ok(Resume::Run(next)) => assert_ne!(next, pid(1)),
            other => panic!("unexpected {:?}", other),
        }
    }
}

#[test]
fn kernel_page_fault_halts() {
    let mut kernel = boot(BootCommand::Default);
    kernel.hal_mut().set_fault_address(0x7_F000);
    let mut regs = regs_of(&kernel, pid(1));
    regs.intno = INT_PAGEFAULT;
    regs.err = PFERR_PRESENT | PFERR_WRITE;
    match kernel.exception(&regs) {
        Err(KernelPanic::KernelPageFault(fault)) => {
            assert_eq!(fault.addr, 0x7_F000);
            assert_eq!(fault.operation(), "write");
            assert_eq!(fault.problem(), "protection problem");
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(kernel.is_halted());
    assert_eq!(trap(&mut kernel, INT_SYS_GETPID, 0), Err(KernelPanic::Halted));
}

#[test]
fn unknown_trap_is_fatal() {
    let mut kernel = boot(BootCommand::Default);
    assert_eq!(trap(&mut kernel, 99, 0), Err(KernelPanic::UnexpectedTrap(99)));
    assert!(kernel.is_halted());
}

#[test]
fn panic_syscall_reports_user_message() {
    let mut kernel = boot(BootCommand::Default);
    assert_eq!(
        trap(&mut kernel, INT_SYS_PANIC, data(0)),
        Err(KernelPanic::PanicRequest { pid: pid(1), message: Some("boom".into()) })
    );

    let mut kernel = boot(BootCommand::Default);
    assert_eq!(trap(&mut kernel, INT_SYS_PANIC, 0), Err(KernelPanic::PanicRequest { pid: pid(1), message: None }));
}

#[test]
fn panic_message_stops_at_supervisor_pages() {
    let mut kernel = boot(BootCommand::Default);
    let kernel_page = weft::PageNumber::new(0x4_0000 / PAGE_SIZE);
    kernel.address_spaces_mut().memory_mut().frame_mut(kernel_page)[..6].copy_from_slice(b"secret");
    assert_eq!(
        trap(&mut kernel, INT_SYS_PANIC, 0x4_0000),
        Err(KernelPanic::PanicRequest { pid: pid(1), message: Some(String::new()) })
    );
}

#[test]
fn timer_round_robin_is_fair() {
    let mut kernel = boot(BootCommand::Default);
    let mut seen = Vec::new();
    for _ in 0..8 {
        match trap(&mut kernel, INT_TIMER, 0) {
            Ok(Resume::Run(next)) => seen.push(next.as_raw()),
            other => panic!("unexpected {:?}", other),
        }
    }
    assert_eq!(seen, [2, 3, 4, 1, 2, 3, 4, 1]);
    assert_eq!(kernel.scheduler().ticks(), 8);
}

#[test]
fn idle_until_abort() {
    let mut kernel = boot(BootCommand::Fork);
    assert_eq!(trap(&mut kernel, INT_SYS_EXIT, 0), Ok(Resume::Idle));
    assert_eq!(kernel.idle(), Resume::Idle);
    assert_eq!(kernel.check_virtual_memory(), Ok(()));
    kernel.hal_mut().request_abort();
    assert_eq!(kernel.idle(), Resume::Halted);
    assert!(kernel.is_halted());
}

#[test]
fn abort_during_trap_halts() {
    let mut kernel = boot(BootCommand::Default);
    kernel.hal_mut().request_abort();
    assert_eq!(trap(&mut kernel, INT_TIMER, 0), Ok(Resume::Halted));
    assert_eq!(trap(&mut kernel, INT_TIMER, 0), Err(KernelPanic::Halted));
}
