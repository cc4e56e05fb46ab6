// Copyright 2024 Weft Kernel Contributors
// SPDX-License-Identifier: Apache-2.0

//! Program loading into a freshly built address space.

extern crate alloc;

use alloc::vec::Vec;

use thiserror::Error;

use crate::config::MemoryLayout;
use crate::mm::{
    page_round_down, page_round_up, AddressSpaceError, AddressSpaceManager, AssignError, Owner,
    PageFlags, PAGE_SIZE,
};
use crate::types::{PageNumber, PhysAddr, Pid};

/// Errors reported by a [`ProgramLoader`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("no program number {0}")]
    UnknownProgram(usize),
    #[error("segment at {va:#x} is outside the process region")]
    BadSegment { va: usize },
    #[error("entry point {0:#x} is outside the loaded image")]
    BadEntry(usize),
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("address space: {0}")]
    AddressSpace(AddressSpaceError),
}

impl From<AddressSpaceError> for LoadError {
    fn from(value: AddressSpaceError) -> Self {
        match value {
            AddressSpaceError::OutOfMemory => Self::OutOfMemory,
            other => Self::AddressSpace(other),
        }
    }
}

/// Places program code and data into a prepared address space.
pub trait ProgramLoader {
    /// Loads `program` into `target` and returns the entry instruction pointer.
    fn load(&mut self, target: &mut LoadTarget<'_>, program: usize) -> Result<usize, LoadError>;
}

/// Address space being populated for one process.
pub struct LoadTarget<'a> {
    mm: &'a mut AddressSpaceManager,
    root: PageNumber,
    pid: Pid,
}

impl<'a> LoadTarget<'a> {
    pub(crate) fn new(mm: &'a mut AddressSpaceManager, root: PageNumber, pid: Pid) -> Self {
        Self { mm, root, pid }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn root(&self) -> PageNumber {
        self.root
    }

    pub fn layout(&self) -> MemoryLayout {
        *self.mm.layout()
    }

    pub fn is_mapped(&self, va: usize) -> bool {
        self.mm.lookup(self.root, va).is_some()
    }

    /// Backs the page at `va` with a zeroed physical page owned by the process.
    ///
    /// The identity physical page is used when it is free; otherwise any free page.
    pub fn place_page(&mut self, va: usize, flags: PageFlags) -> Result<PageNumber, LoadError> {
        let layout = self.mm.layout();
        if va % PAGE_SIZE != 0 || !layout.is_user(va) {
            return Err(LoadError::BadSegment { va });
        }
        let owner = Owner::Process(self.pid);
        let mem = self.mm.memory_mut();
        let pn = match mem.assign(PhysAddr::new(va), owner) {
            Ok(pn) => pn,
            Err(AssignError::Exhausted) => return Err(LoadError::OutOfMemory),
            Err(_) => mem.allocate(owner).map_err(|_| LoadError::OutOfMemory)?,
        };
        mem.frame_mut(pn).fill(0);
        if let Err(err) = self.mm.map(self.root, va, pn.addr(), PAGE_SIZE, flags, owner) {
            self.mm.memory_mut().release(pn);
            return Err(err.into());
        }
        Ok(pn)
    }

    /// Copies `bytes` to `va`; the pages must already be placed.
    pub fn write(&mut self, va: usize, bytes: &[u8]) -> Result<(), LoadError> {
        self.mm.copy_to_user(self.root, va, bytes).map_err(LoadError::from)
    }
}

/// One loadable segment of a program image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub va: usize,
    pub data: Vec<u8>,
    /// Bytes of memory covered; the part beyond `data` is zero-filled.
    pub mem_size: usize,
    pub writable: bool,
}

/// In-memory program image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgramImage {
    pub entry: usize,
    pub segments: Vec<Segment>,
}

impl ProgramImage {
    pub fn new(entry: usize) -> Self {
        Self { entry, segments: Vec::new() }
    }

    pub fn segment(mut self, va: usize, data: &[u8], mem_size: usize, writable: bool) -> Self {
        self.segments.push(Segment { va, data: data.to_vec(), mem_size: mem_size.max(data.len()), writable });
        self
    }
}

/// Loader serving a fixed set of in-memory images indexed by program number.
#[derive(Default)]
pub struct ImageLoader {
    programs: Vec<ProgramImage>,
}

impl ImageLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_program(mut self, image: ProgramImage) -> Self {
        self.programs.push(image);
        self
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    fn validate(image: &ProgramImage, layout: &MemoryLayout) -> Result<(), LoadError> {
        let stack = layout.virtual_size - PAGE_SIZE;
        for seg in &image.segments {
            let end = seg.va.checked_add(seg.mem_size).ok_or(LoadError::BadSegment { va: seg.va })?;
            if !layout.is_user(seg.va) || end > stack {
                return Err(LoadError::BadSegment { va: seg.va });
            }
        }
        let covered = image.segments.iter().any(|seg| image.entry >= seg.va && image.entry < seg.va + seg.mem_size);
        if !covered {
            return Err(LoadError::BadEntry(image.entry));
        }
        Ok(())
    }
}

impl ProgramLoader for ImageLoader {
    fn load(&mut self, target: &mut LoadTarget<'_>, program: usize) -> Result<usize, LoadError> {
        let image = self.programs.get(program).ok_or(LoadError::UnknownProgram(program))?;
        Self::validate(image, &target.layout())?;
        for seg in &image.segments {
            let mut flags = PageFlags::USER_RO;
            if seg.writable {
                flags |= PageFlags::WRITABLE;
            }
            let first = page_round_down(seg.va);
            let last = page_round_up(seg.va + seg.mem_size);
            for va in (first..last).step_by(PAGE_SIZE) {
                if !target.is_mapped(va) {
                    target.place_page(va, flags)?;
                }
            }
            target.write(seg.va, &seg.data)?;
        }
        log_debug!(target: "task", "loaded program {} for pid {} entry={:#x}", program, target.pid(), image.entry);
        Ok(image.entry)
    }
}
