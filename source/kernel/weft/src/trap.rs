// Copyright 2024 Weft Kernel Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Trap frame layout, trap-number decoding and trap diagnostics
//! OWNERS: @kernel-team
//! PUBLIC API: Registers, TrapKind, PageFault, record(), last_trap(), recent_traps(), fmt_trap()
//! DEPENDS_ON: spin::Mutex (diagnostic ring only)
//! INVARIANTS: Register layout matches the entry stub; decoding is total (unknown numbers
//!             map to TrapKind::Unknown)

use core::fmt::{self, Write};

use spin::Mutex;

/// Hardware page fault vector.
pub const INT_PAGEFAULT: u64 = 14;
/// Timer interrupt vector.
pub const INT_TIMER: u64 = 32;
pub const INT_SYS_PANIC: u64 = 48;
pub const INT_SYS_GETPID: u64 = 49;
pub const INT_SYS_YIELD: u64 = 50;
pub const INT_SYS_PAGE_ALLOC: u64 = 51;
pub const INT_SYS_FORK: u64 = 52;
pub const INT_SYS_EXIT: u64 = 53;

/// Page-fault error code: the page was present (protection problem).
pub const PFERR_PRESENT: u64 = 0x1;
/// Page-fault error code: the access was a write.
pub const PFERR_WRITE: u64 = 0x2;
/// Page-fault error code: the access came from user mode.
pub const PFERR_USER: u64 = 0x4;

/// User code segment selector (RPL 3).
pub const SEGSEL_APP_CODE: u64 = 0x10 | 3;
/// User data segment selector (RPL 3).
pub const SEGSEL_APP_DATA: u64 = 0x20 | 3;
/// Interrupt-enable flag.
pub const RFLAGS_IF: u64 = 0x200;

/// Register state saved by the trap entry stub.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Registers {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub fs: u64,
    pub gs: u64,
    /// Trap number.
    pub intno: u64,
    /// Error code (page faults).
    pub err: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl Registers {
    /// Initial user-mode frame entering at `entry` with stack top `rsp`.
    pub fn user(entry: u64, rsp: u64) -> Self {
        Self {
            rip: entry,
            rsp,
            cs: SEGSEL_APP_CODE,
            ss: SEGSEL_APP_DATA,
            fs: SEGSEL_APP_DATA,
            gs: SEGSEL_APP_DATA,
            rflags: RFLAGS_IF,
            ..Self::default()
        }
    }

    /// Whether the frame was captured in user mode.
    pub fn from_user(&self) -> bool {
        self.cs & 3 == 3
    }
}

/// Decoded trap number.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrapKind {
    PageFault,
    Timer,
    SysPanic,
    SysGetPid,
    SysYield,
    SysPageAlloc,
    SysFork,
    SysExit,
    Unknown(u64),
}

impl TrapKind {
    pub const fn decode(intno: u64) -> Self {
        match intno {
            INT_PAGEFAULT => Self::PageFault,
            INT_TIMER => Self::Timer,
            INT_SYS_PANIC => Self::SysPanic,
            INT_SYS_GETPID => Self::SysGetPid,
            INT_SYS_YIELD => Self::SysYield,
            INT_SYS_PAGE_ALLOC => Self::SysPageAlloc,
            INT_SYS_FORK => Self::SysFork,
            INT_SYS_EXIT => Self::SysExit,
            other => Self::Unknown(other),
        }
    }

    /// Whether the trap is a system call routed through the syscall table.
    pub const fn is_syscall(self) -> bool {
        matches!(
            self,
            Self::SysGetPid | Self::SysYield | Self::SysPageAlloc | Self::SysFork | Self::SysExit
        )
    }
}

/// Decoded page fault.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageFault {
    pub addr: usize,
    pub rip: u64,
    pub write: bool,
    pub present: bool,
    pub user: bool,
}

impl PageFault {
    pub fn decode(regs: &Registers, addr: usize) -> Self {
        Self {
            addr,
            rip: regs.rip,
            write: regs.err & PFERR_WRITE != 0,
            present: regs.err & PFERR_PRESENT != 0,
            user: regs.err & PFERR_USER != 0,
        }
    }

    pub fn operation(&self) -> &'static str {
        if self.write {
            "write"
        } else {
            "read"
        }
    }

    pub fn problem(&self) -> &'static str {
        if self.present {
            "protection problem"
        } else {
            "missing page"
        }
    }
}

impl fmt::Display for PageFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x} ({} {}, rip={:#x})", self.addr, self.operation(), self.problem(), self.rip)
    }
}

// Diagnostics

static LAST_TRAP: Mutex<Option<Registers>> = Mutex::new(None);

const TRAP_RING_LEN: usize = 64;
static TRAP_RING: Mutex<TrapRing> = Mutex::new(TrapRing::new());

struct TrapRing {
    frames: [Option<Registers>; TRAP_RING_LEN],
    next: usize,
}

impl TrapRing {
    const fn new() -> Self {
        Self { frames: [None; TRAP_RING_LEN], next: 0 }
    }
}

/// Records `frame` as the last trap and pushes it into the ring.
pub fn record(frame: &Registers) {
    *LAST_TRAP.lock() = Some(*frame);
    let mut ring = TRAP_RING.lock();
    let slot = ring.next;
    ring.frames[slot] = Some(*frame);
    ring.next = (slot + 1) % TRAP_RING_LEN;
}

pub fn last_trap() -> Option<Registers> {
    *LAST_TRAP.lock()
}

/// Calls `f` with recorded frames, oldest first.
pub fn recent_traps(mut f: impl FnMut(&Registers)) {
    let ring = TRAP_RING.lock();
    for offset in 0..TRAP_RING_LEN {
        if let Some(frame) = &ring.frames[(ring.next + offset) % TRAP_RING_LEN] {
            f(frame);
        }
    }
}

/// Short human-readable name of a trap number.
pub fn describe(intno: u64) -> &'static str {
    match TrapKind::decode(intno) {
        TrapKind::PageFault => "page-fault",
        TrapKind::Timer => "timer",
        TrapKind::SysPanic => "sys_panic",
        TrapKind::SysGetPid => "sys_getpid",
        TrapKind::SysYield => "sys_yield",
        TrapKind::SysPageAlloc => "sys_page_alloc",
        TrapKind::SysFork => "sys_fork",
        TrapKind::SysExit => "sys_exit",
        TrapKind::Unknown(_) => "unknown",
    }
}

/// Formats the interesting part of a trap frame on one line.
pub fn fmt_trap(frame: &Registers, out: &mut impl Write) -> fmt::Result {
    write!(
        out,
        "trap {} ({}) err={:#x} rip={:#x} rsp={:#x} rax={:#x} rdi={:#x}",
        frame.intno,
        describe(frame.intno),
        frame.err,
        frame.rip,
        frame.rsp,
        frame.rax,
        frame.rdi
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_known_and_unknown_numbers() {
        assert_eq!(TrapKind::decode(14), TrapKind::PageFault);
        assert_eq!(TrapKind::decode(32), TrapKind::Timer);
        assert_eq!(TrapKind::decode(52), TrapKind::SysFork);
        assert_eq!(TrapKind::decode(7), TrapKind::Unknown(7));
        assert!(TrapKind::SysExit.is_syscall());
        assert!(!TrapKind::SysPanic.is_syscall());
    }

    #[test]
    fn page_fault_description_follows_error_code() {
        let regs = Registers { err: PFERR_USER | PFERR_WRITE, rip: 0x10_0040, ..Registers::default() };
        let fault = PageFault::decode(&regs, 0x20_0000);
        assert!(fault.user);
        assert_eq!(fault.operation(), "write");
        assert_eq!(fault.problem(), "missing page");
        let regs = Registers { err: PFERR_PRESENT, ..regs };
        let fault = PageFault::decode(&regs, 0x4_0000);
        assert!(!fault.user);
        assert_eq!(fault.operation(), "read");
        assert_eq!(fault.problem(), "protection problem");
    }

    #[test]
    fn user_frame_uses_application_selectors() {
        let regs = Registers::user(0x10_0000, 0x30_0000);
        assert!(regs.from_user());
        assert_eq!(regs.rflags & RFLAGS_IF, RFLAGS_IF);
        assert_eq!(regs.rax, 0);
    }

    #[test]
    fn records_last_trap() {
        let frame = Registers { intno: INT_SYS_GETPID, rip: 0xdead_0000, ..Registers::default() };
        record(&frame);
        assert!(last_trap().is_some());
        let mut seen = false;
        recent_traps(|f| seen |= f.rip == 0xdead_0000);
        assert!(seen);
        let mut line = alloc::string::String::new();
        fmt_trap(&frame, &mut line).expect("format");
        assert!(line.contains("sys_getpid"));
    }
}
