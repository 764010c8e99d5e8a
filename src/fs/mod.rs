// The MIT License (MIT)
//
// Copyright (c) 2020, National Cybersecurity Agency of France (ANSSI)
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN
// THE SOFTWARE.

//! Sector-chain file system on top of the flash section registry.
//!
//! # High-level overview
//!
//! The file system is a flat namespace of variable-length byte files. Each
//! file is a singly-linked chain of sectors: the head sector carries a
//! file-node (name, size, generation counter) right after its header, and
//! every sector's `Next` field points at the following sector of the chain,
//! `0xFFFFFFFF` marking the end.
//!
//! Because NOR flash bits only move from 1 to 0 outside of a full sector
//! erase, mutation is arranged around one-way writes:
//!
//! * freeing a sector flips its status byte to `FREE_DIRTY` (all bits
//!   cleared) and defers the erase to the next allocation of that sector;
//! * chaining a freshly allocated sector onto its predecessor rewrites the
//!   predecessor's `Next` field, legal because that field still holds its
//!   erased all-ones value;
//! * replacing a file writes the complete new chain first and only then
//!   marks the old head `FREE_DIRTY`. A crash in between leaves two heads
//!   with the same name, and [`FileSystem::check`] keeps the one with the
//!   higher generation counter.
//!
//! A new file's file-node is written only when the file is closed, so a
//! half-created file is recognizable by its placeholder file-node (all-ones
//! `FileSize`) and is reclaimed by the checker.
//!
//! [`FileSystem::check`]: struct.FileSystem.html#method.check

mod tests;

use crate::filename;
use crate::flash::{Flash, IOError};
use crate::layout::{
    FileNode, SectorHeader, Status, CHECKSUM_UNUSED, END_OF_CHAIN, FILENODE_LEN, FORMAT_VERSION,
    HEADER_LEN, NEXT_OFFSET, SECTOR_KEY, STATUS_OFFSET,
};
use core::cmp;
use spin::Mutex;

/// Open for reading only.
pub const RDONLY: u32 = 0x0000;
/// Open for writing only.
pub const WRONLY: u32 = 0x0001;
/// Open for reading and writing.
pub const RDWR: u32 = 0x0002;
/// Create the file, replacing any existing file of the same name at close.
pub const CREATE: u32 = 0x0100;

/// Default capacity of the open-file table.
pub const MAX_FILE_DESCRIPTORS: usize = 2;

/// An error that can happen during a file system operation.
///
/// Every variant maps to a stable negative code through [`Error::code`], for
/// callers keeping the historical C-style surface.
///
/// [`Error::code`]: enum.Error.html#method.code
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Error {
    /// The open-file table is full.
    TooManyOpenFiles,

    /// Open without the create bit named a file that does not exist.
    FileDoesNotExist,

    /// The descriptor is out of range or not open.
    InvalidFileDescriptor,

    /// The file position does not fall inside the file.
    InvalidFilePosition,

    /// A sector index fell outside the managed media.
    InvalidSectorNumber,

    /// No free sector was available.
    OutOfSpace,

    /// Erase or rename named a file that does not exist.
    FileNotFound,

    /// The rename target name is already taken.
    NewNameExists,

    /// A flash IO error occured during the requested operation.
    Io(IOError),
}

impl Error {
    /// Returns the stable negative code for this error.
    ///
    /// Device errors from section drivers surface verbatim; other IO errors
    /// map to the invalid-sector code.
    pub fn code(&self) -> i32 {
        match *self {
            Error::TooManyOpenFiles => -1,
            Error::FileDoesNotExist => -2,
            Error::InvalidFileDescriptor => -3,
            Error::InvalidFilePosition => -4,
            Error::InvalidSectorNumber => -5,
            Error::OutOfSpace => -6,
            Error::FileNotFound => -7,
            Error::NewNameExists => -8,
            Error::Io(IOError::Device(code)) => code,
            Error::Io(_) => -5,
        }
    }
}

impl From<IOError> for Error {
    fn from(e: IOError) -> Error {
        match e {
            IOError::InvalidSector => Error::InvalidSectorNumber,
            other => Error::Io(other),
        }
    }
}

/// Space accounting queries accepted by [`FileSystem::space`].
///
/// [`FileSystem::space`]: struct.FileSystem.html#method.space
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Space {
    /// Sum of payload capacity over free sectors.
    FreeBytes,

    /// Number of free sectors.
    FreeSectors,

    /// Sum of payload capacity over all sectors.
    TotalBytes,

    /// Total number of sectors.
    TotalSectors,

    /// Erase every sector, used or not, returning the total payload
    /// capacity.
    EraseAll,
}

/// What a freshly allocated sector will hold.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum AllocKind {
    /// Data only; the sector joins an existing chain.
    Plain,

    /// Room is reserved for a file-node; the sector starts a chain.
    WithFilenode,
}

/// One open-file table entry.
#[derive(Clone)]
struct Descriptor {
    /// Whether this slot is taken.
    in_use: bool,

    /// Flags the file was opened with.
    flags: u32,

    /// Free the replaced file's chain when this file closes.
    delete_old: bool,

    /// Write the in-core file-node out when this file closes.
    write_fnode: bool,

    /// Head sector of this file's chain, once one exists.
    fnode_sector: Option<u32>,

    /// Head sector of the file being replaced, if any.
    old_fnode_sector: Option<u32>,

    /// Current position into the file.
    position: u32,

    /// In-core copy of the file-node.
    fnode: FileNode,
}

impl Default for Descriptor {
    fn default() -> Descriptor {
        Descriptor {
            in_use: false,
            flags: 0,
            delete_old: false,
            write_fnode: false,
            fnode_sector: None,
            old_fnode_sector: None,
            position: 0,
            fnode: FileNode::default(),
        }
    }
}

/// Process-wide health counters, refreshed by [`FileSystem::check`].
///
/// [`FileSystem::check`]: struct.FileSystem.html#method.check
#[derive(Default)]
struct Metrics {
    /// High-water mark of never-formatted sectors seen in one allocation
    /// scan.
    error_sector_count: u32,

    /// Sectors found reachable from more than one place.
    total_cross_chain: u32,
}

/// Mutable engine state, guarded as a whole.
struct State {
    /// The open-file table.
    descriptors: Vec<Descriptor>,

    /// Health counters.
    metrics: Metrics,
}

/// Classification bit: sector looks unusable and should be erased.
const CHECK_BAD: u8 = 0x01;
/// Classification bit: sector holds a valid file-node.
const CHECK_FNODE: u8 = 0x02;
/// Classification bit: sector is free (either flavour).
const CHECK_FREE: u8 = 0x04;
/// Classification bit: sector was reached through some chain.
const CHECK_INUSE: u8 = 0x08;

/// A mounted file system over a flash section registry.
///
/// Every public operation takes the internal state lock first and releases it
/// on all exit paths, so the engine is the sole mutator of its media for the
/// duration of an operation.
pub struct FileSystem<'a> {
    /// Reference towards the flash registry.
    flash: &'a Flash,

    /// State shared by all operations.
    state: Mutex<State>,
}

impl<'a> FileSystem<'a> {
    /// Mounts a file system over a registry, with the default open-file
    /// table capacity.
    pub fn new(flash: &Flash) -> FileSystem {
        FileSystem::with_table_size(flash, MAX_FILE_DESCRIPTORS)
    }

    /// Mounts a file system with room for `descriptors` simultaneously open
    /// files.
    pub fn with_table_size(flash: &Flash, descriptors: usize) -> FileSystem {
        debug!(
            "Mounting fs over {} sectors, {} descriptors",
            flash.total_sectors(),
            descriptors
        );
        FileSystem {
            flash,
            state: Mutex::new(State {
                descriptors: vec![Descriptor::default(); descriptors],
                metrics: Metrics::default(),
            }),
        }
    }

    /// Number of sectors found cross-linked by the last [`check`].
    ///
    /// [`check`]: #method.check
    pub fn cross_chain_count(&self) -> u32 {
        self.state.lock().metrics.total_cross_chain
    }

    /// High-water mark of never-formatted sectors handed out by the
    /// allocator.
    pub fn error_sector_count(&self) -> u32 {
        self.state.lock().metrics.error_sector_count
    }

    //
    // Sector IO helpers.
    //

    /// Reads the header of a sector.
    fn read_header(&self, sector: u32) -> Result<SectorHeader, Error> {
        let mut raw = [0u8; HEADER_LEN];
        get!(self.flash.read(sector, 0, &mut raw));
        Ok(SectorHeader::decode(&raw))
    }

    /// Reads the file-node stored after the header of a sector.
    fn read_filenode(&self, sector: u32) -> Result<FileNode, Error> {
        let mut raw = [0u8; FILENODE_LEN];
        get!(self.flash.read(sector, HEADER_LEN as u32, &mut raw));
        Ok(FileNode::decode(&raw))
    }

    /// Writes a file-node right after the header of a sector.
    fn write_filenode(&self, sector: u32, node: &FileNode) -> Result<(), Error> {
        get!(self.flash.write(sector, HEADER_LEN as u32, &node.encode()));
        Ok(())
    }

    /// Flips the status byte of a sector to `FREE_DIRTY`.
    ///
    /// `FREE_DIRTY` has every bit cleared, so this single-byte rewrite is
    /// legal from any in-use pre-image.
    fn mark_free_dirty(&self, sector: u32) -> Result<(), Error> {
        get!(self
            .flash
            .write(sector, STATUS_OFFSET as u32, &[Status::FreeDirty.raw()]));
        Ok(())
    }

    /// Points the `Next` field of a sector at its new successor.
    ///
    /// The field still holds its erased all-ones value, which is what makes
    /// this rewrite legal.
    fn patch_next(&self, sector: u32, next: u32) -> Result<(), Error> {
        get!(self
            .flash
            .write(sector, NEXT_OFFSET as u32, &next.to_le_bytes()));
        Ok(())
    }

    //
    // Free-sector allocator.
    //

    /// Scans for the first allocatable sector.
    ///
    /// A sector qualifies when it is formatted and free, or when it carries
    /// no sanity key at all (virgin media); the latter is tallied into the
    /// error-sector high-water mark but still handed out.
    fn find_free_sector(
        &self,
        metrics: &mut Metrics,
    ) -> Result<Option<(u32, SectorHeader, u32)>, Error> {
        let mut error_count = 0;
        for sector in 0..self.flash.total_sectors() {
            let header = get!(self.read_header(sector));
            let size = get!(self.flash.sector_size(sector));
            if header.is_formatted() {
                if header.status.is_free() {
                    return Ok(Some((sector, header, size)));
                }
            } else {
                error_count += 1;
                if error_count > metrics.error_sector_count {
                    metrics.error_sector_count = error_count;
                }
                return Ok(Some((sector, header, size)));
            }
        }
        Ok(None)
    }

    /// Allocates a sector: erases it and writes a fresh header.
    ///
    /// The erase count carries over from the previous header, or restarts at
    /// 1 on virgin media.
    fn allocate_sector(
        &self,
        metrics: &mut Metrics,
        kind: AllocKind,
    ) -> Result<(u32, SectorHeader), Error> {
        let (sector, old, size) = match get!(self.find_free_sector(metrics)) {
            Some(found) => found,
            None => return err!(Error::OutOfSpace),
        };
        let header = SectorHeader {
            key: SECTOR_KEY,
            next: END_OF_CHAIN,
            erase_count: if old.is_formatted() {
                old.erase_count.wrapping_add(1)
            } else {
                1
            },
            version: FORMAT_VERSION,
            status: match kind {
                AllocKind::Plain => Status::InUse,
                AllocKind::WithFilenode => Status::Filenode,
            },
            checksum: CHECKSUM_UNUSED,
            sector_length: size,
            data_offset: match kind {
                AllocKind::Plain => HEADER_LEN as u32,
                AllocKind::WithFilenode => (HEADER_LEN + FILENODE_LEN) as u32,
            },
        };
        debug!("Allocating sector {} as {:?}", sector, kind);
        get!(self.flash.erase(sector));
        get!(self.flash.write(sector, 0, &header.encode()));
        Ok((sector, header))
    }

    //
    // Chain manager.
    //

    /// Walks a chain until the sector containing `position`.
    ///
    /// Returns the sector, its header and the in-sector offset of the
    /// position. Walking off the end of the chain fails with
    /// [`Error::InvalidSectorNumber`].
    ///
    /// [`Error::InvalidSectorNumber`]: enum.Error.html
    fn locate_position(
        &self,
        head: u32,
        position: u32,
    ) -> Result<(u32, SectorHeader, u32), Error> {
        let mut sector = head;
        let mut count: u32 = 0;
        loop {
            let header = get!(self.read_header(sector));
            let capacity = header.payload_capacity();
            if position < count + capacity {
                return Ok((sector, header, header.data_offset + (position - count)));
            }
            count += capacity;
            if header.next == END_OF_CHAIN {
                return err!(Error::InvalidSectorNumber);
            }
            sector = header.next;
        }
    }

    /// Frees a whole chain by flipping every status byte to `FREE_DIRTY`.
    ///
    /// Returns the number of sectors touched. A second call over the same
    /// chain is a no-op on the media: the status bytes already hold zero.
    fn free_sectors(&self, head: u32) -> Result<u32, Error> {
        let mut sector = head;
        let mut freed = 0;
        while sector != END_OF_CHAIN {
            let header = get!(self.read_header(sector));
            get!(self.mark_free_dirty(sector));
            freed += 1;
            sector = header.next;
        }
        debug!("Freed a chain of {} sectors starting at {}", freed, head);
        Ok(freed)
    }

    /// Scans the media for the file-node carrying `name`.
    ///
    /// Name comparison is ASCII case-insensitive, and the wanted name goes
    /// through the same truncation as storage so over-long names keep
    /// matching what creation stored.
    fn locate_file_node(&self, name: &str) -> Result<Option<(FileNode, u32)>, Error> {
        let wanted_field = filename::encode(name);
        let wanted = filename::decode(&wanted_field);
        for sector in 0..self.flash.total_sectors() {
            let header = get!(self.read_header(sector));
            if header.status != Status::Filenode {
                continue;
            }
            let node = get!(self.read_filenode(sector));
            if filename::eq_ignore_case(node.name(), wanted) {
                return Ok(Some((node, sector)));
            }
        }
        Ok(None)
    }

    //
    // Open-file table.
    //

    /// Takes the first free descriptor slot, zero-initialized.
    fn get_descriptor(state: &mut State) -> Result<usize, Error> {
        for (fd, descriptor) in state.descriptors.iter_mut().enumerate() {
            if !descriptor.in_use {
                *descriptor = Descriptor::default();
                descriptor.in_use = true;
                return Ok(fd);
            }
        }
        err!(Error::TooManyOpenFiles)
    }

    /// Releases a descriptor slot.
    fn free_descriptor(state: &mut State, fd: usize) {
        state.descriptors[fd].in_use = false;
    }

    /// Checks a descriptor number and returns its entry.
    fn descriptor_mut(state: &mut State, fd: usize) -> Result<&mut Descriptor, Error> {
        match state.descriptors.get_mut(fd) {
            Some(descriptor) if descriptor.in_use => Ok(descriptor),
            _ => err!(Error::InvalidFileDescriptor),
        }
    }

    //
    // File operations.
    //

    /// Opens a file, returning a descriptor number.
    ///
    /// Without [`CREATE`], the file must exist. With [`CREATE`], a fresh
    /// generation of the file is started: nothing reaches the media until
    /// the first write, and an existing file of the same name keeps serving
    /// reads until the new file is closed.
    ///
    /// # Errors
    ///
    /// Errors if the open-file table is full, if the file is missing and
    /// [`CREATE`] was not given, or on flash IO failure.
    ///
    /// [`CREATE`]: constant.CREATE.html
    pub fn open(&self, name: &str, flags: u32, permissions: u8) -> Result<usize, Error> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let fd = get!(Self::get_descriptor(state));
        match self.open_impl(state, fd, name, flags, permissions) {
            Ok(()) => Ok(fd),
            Err(e) => {
                Self::free_descriptor(state, fd);
                err!(e)
            }
        }
    }

    /// The body of [`open`], separated so a failure can release the
    /// freshly taken descriptor.
    ///
    /// [`open`]: #method.open
    fn open_impl(
        &self,
        state: &mut State,
        fd: usize,
        name: &str,
        flags: u32,
        permissions: u8,
    ) -> Result<(), Error> {
        let located = get!(self.locate_file_node(name));
        let descriptor = &mut state.descriptors[fd];
        match located {
            Some((node, sector)) => {
                descriptor.fnode = node;
                descriptor.fnode_sector = Some(sector);
            }
            None => descriptor.fnode_sector = None,
        }

        // The create bit, not any non-zero flag, selects the create path.
        if flags & CREATE == 0 {
            if descriptor.fnode_sector.is_none() {
                return err!(Error::FileDoesNotExist);
            }
        } else {
            let mut create_count = 0;
            if let Some(old_sector) = descriptor.fnode_sector {
                // The replaced generation survives until the new file
                // closes.
                create_count = descriptor.fnode.count.wrapping_add(1);
                descriptor.delete_old = true;
                descriptor.old_fnode_sector = Some(old_sector);
            } else {
                descriptor.fnode = FileNode::new(name, permissions);
            }
            descriptor.fnode_sector = None;
            descriptor.fnode.file_size = 0;
            descriptor.fnode.permissions = permissions;
            descriptor.fnode.count = create_count;
        }

        descriptor.flags = flags;
        Ok(())
    }

    /// Closes a descriptor.
    ///
    /// For a newly created file this is the commit point: the file-node is
    /// written into the chain head, and only then is the replaced file's
    /// chain freed.
    ///
    /// # Errors
    ///
    /// Errors if the descriptor is not open or on flash IO failure; the
    /// descriptor stays open in the latter case.
    pub fn close(&self, fd: usize) -> Result<(), Error> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let (write_fnode, fnode_sector, delete_old, old_sector, fnode) = {
            let descriptor = get!(Self::descriptor_mut(state, fd));
            (
                descriptor.write_fnode,
                descriptor.fnode_sector,
                descriptor.delete_old,
                descriptor.old_fnode_sector,
                descriptor.fnode,
            )
        };

        if write_fnode {
            if let Some(sector) = fnode_sector {
                get!(self.write_filenode(sector, &fnode));
            }
        }
        if delete_old {
            if let Some(old) = old_sector {
                get!(self.free_sectors(old));
            }
        }

        Self::free_descriptor(state, fd);
        Ok(())
    }

    /// Reads from the current position into `buf`, returning the number of
    /// bytes read.
    ///
    /// Reads stop at end of file; the requested length is clamped to what is
    /// left.
    ///
    /// # Errors
    ///
    /// Errors if the descriptor is not open, if the position is at or past
    /// the end of the file, or on flash IO failure. The position keeps any
    /// progress made before a failure.
    pub fn read(&self, fd: usize, buf: &mut [u8]) -> Result<usize, Error> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let descriptor = get!(Self::descriptor_mut(state, fd));

        if descriptor.position >= descriptor.fnode.file_size {
            return err!(Error::InvalidFilePosition);
        }
        let head = match descriptor.fnode_sector {
            Some(sector) => sector,
            None => return err!(Error::InvalidFilePosition),
        };

        let left = (descriptor.fnode.file_size - descriptor.position) as usize;
        let mut n = cmp::min(buf.len(), left);
        let (mut sector, mut header, mut offset) =
            get!(self.locate_position(head, descriptor.position));
        let mut total = 0;
        while n > 0 {
            let remaining = header.sector_length.saturating_sub(offset) as usize;
            let take = cmp::min(remaining, n);
            get!(self
                .flash
                .read(sector, offset, &mut buf[total..total + take]));
            n -= take;
            total += take;
            descriptor.position += take as u32;
            if n == 0 {
                break;
            }
            if header.next == END_OF_CHAIN {
                return err!(Error::InvalidSectorNumber);
            }
            sector = header.next;
            header = get!(self.read_header(sector));
            offset = header.data_offset;
        }
        Ok(total)
    }

    /// Writes `buf` at the current position, returning the number of bytes
    /// written.
    ///
    /// The first write of a freshly created file allocates the chain head
    /// with room for the file-node; further sectors are allocated and
    /// chained on as the data outgrows each one.
    ///
    /// # Errors
    ///
    /// Errors if the descriptor is not open, if the media runs out of free
    /// sectors, or on flash IO failure. The position and in-core file size
    /// keep any progress made before a failure.
    pub fn write(&self, fd: usize, buf: &[u8]) -> Result<usize, Error> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if fd >= state.descriptors.len() || !state.descriptors[fd].in_use {
            return err!(Error::InvalidFileDescriptor);
        }
        let State {
            descriptors,
            metrics,
        } = state;
        let descriptor = &mut descriptors[fd];

        let (mut sector, mut header, mut offset) = match descriptor.fnode_sector {
            None => {
                // First write of a new file: the chain head is allocated
                // now, the file-node itself only at close.
                let (sector, header) =
                    get!(self.allocate_sector(metrics, AllocKind::WithFilenode));
                descriptor.write_fnode = true;
                descriptor.fnode_sector = Some(sector);
                (sector, header, header.data_offset)
            }
            Some(head) => get!(self.locate_position(head, descriptor.position)),
        };

        let mut n = buf.len();
        let mut total = 0;
        while n > 0 {
            let remaining = header.sector_length.saturating_sub(offset) as usize;
            let take = cmp::min(remaining, n);
            get!(self.flash.write(sector, offset, &buf[total..total + take]));
            n -= take;
            total += take;
            descriptor.position += take as u32;
            if descriptor.position > descriptor.fnode.file_size {
                descriptor.fnode.file_size = descriptor.position;
            }
            if n == 0 {
                break;
            }
            let (new_sector, new_header) = get!(self.allocate_sector(metrics, AllocKind::Plain));
            get!(self.patch_next(sector, new_sector));
            sector = new_sector;
            header = new_header;
            offset = HEADER_LEN as u32;
        }
        Ok(total)
    }

    /// Deletes a file by freeing its whole chain.
    ///
    /// # Errors
    ///
    /// Errors with [`Error::FileNotFound`] if no file carries `name`, or on
    /// flash IO failure.
    ///
    /// [`Error::FileNotFound`]: enum.Error.html
    pub fn erase(&self, name: &str) -> Result<(), Error> {
        let _guard = self.state.lock();
        match get!(self.locate_file_node(name)) {
            Some((_, sector)) => {
                get!(self.free_sectors(sector));
                Ok(())
            }
            None => err!(Error::FileNotFound),
        }
    }

    /// Renames a file.
    ///
    /// The name lives inside the head sector, which cannot be rewritten in
    /// place, so renaming moves the head: a new file-node sector of matching
    /// payload size is allocated, the head's data is copied across, the rest
    /// of the chain is reused as-is, and only then is the old head marked
    /// `FREE_DIRTY`. The generation counter is bumped on the new head so a
    /// crash in between leaves the checker a clear winner.
    ///
    /// # Errors
    ///
    /// Errors with [`Error::FileNotFound`] if `name` does not exist, with
    /// [`Error::NewNameExists`] if `new_name` does (names compare
    /// case-insensitively), with [`Error::OutOfSpace`] if no free sector of
    /// matching payload size is available, or on flash IO failure.
    ///
    /// [`Error::FileNotFound`]: enum.Error.html
    /// [`Error::NewNameExists`]: enum.Error.html
    /// [`Error::OutOfSpace`]: enum.Error.html
    pub fn rename(&self, name: &str, new_name: &str) -> Result<(), Error> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let (mut node, sector) = match get!(self.locate_file_node(name)) {
            Some(found) => found,
            None => return err!(Error::FileNotFound),
        };
        if get!(self.locate_file_node(new_name)).is_some() {
            return err!(Error::NewNameExists);
        }

        let old_header = get!(self.read_header(sector));
        let payload = old_header.payload_capacity();
        let tail = old_header.next;

        let (new_sector, new_header) =
            get!(self.allocate_sector(&mut state.metrics, AllocKind::WithFilenode));
        if payload != new_header.payload_capacity() {
            get!(self.free_sectors(new_sector));
            return err!(Error::OutOfSpace);
        }

        // Move the head sector's payload across in bounded chunks.
        let mut buffer = [0u8; 100];
        let mut offset = new_header.data_offset;
        let mut length = payload as usize;
        while length > 0 {
            let n = cmp::min(length, buffer.len());
            get!(self.flash.read(sector, offset, &mut buffer[..n]));
            get!(self.flash.write(new_sector, offset, &buffer[..n]));
            length -= n;
            offset += n as u32;
        }

        node.set_name(new_name);
        node.count = node.count.wrapping_add(1);
        get!(self.write_filenode(new_sector, &node));

        if tail != END_OF_CHAIN {
            get!(self.patch_next(new_sector, tail));
        }

        // The new head is fully on media; retiring the old one last keeps a
        // crash recoverable by duplicate resolution.
        get!(self.mark_free_dirty(sector));
        Ok(())
    }

    /// Produces the next directory entry at or after `*handle`, advancing
    /// the handle past it.
    ///
    /// Returns `Ok(None)` once the scan reaches the end of the media. A file
    /// still being created shows up under the synthetic name `"[New File]"`.
    ///
    /// # Errors
    ///
    /// Errors on flash IO failure.
    pub fn next_directory(&self, handle: &mut u32) -> Result<Option<FileNode>, Error> {
        let _guard = self.state.lock();
        let mut sector = *handle;
        while self.flash.is_valid(sector) {
            let header = get!(self.read_header(sector));
            if header.status == Status::Filenode {
                let mut node = get!(self.read_filenode(sector));
                *handle = sector + 1;
                if node.is_placeholder() {
                    node.set_name(filename::NEW_FILE_NAME);
                }
                return Ok(Some(node));
            }
            sector += 1;
        }
        Ok(None)
    }

    /// Answers a space accounting query, in bytes or sectors depending on
    /// the query.
    ///
    /// Payload capacity is counted as the sector size minus the header, and
    /// a sector is free when its status byte says so, whether or not it was
    /// ever formatted. [`Space::EraseAll`] erases the entire media.
    ///
    /// # Errors
    ///
    /// Errors on flash IO failure.
    ///
    /// [`Space::EraseAll`]: enum.Space.html
    pub fn space(&self, query: Space) -> Result<u64, Error> {
        let _guard = self.state.lock();
        let mut total: u64 = 0;
        for sector in 0..self.flash.total_sectors() {
            let size = get!(self.flash.sector_size(sector));
            let payload = u64::from(size).saturating_sub(HEADER_LEN as u64);
            match query {
                Space::EraseAll => {
                    get!(self.flash.erase(sector));
                    total += payload;
                }
                Space::TotalBytes => total += payload,
                Space::TotalSectors => total += 1,
                Space::FreeBytes | Space::FreeSectors => {
                    let header = get!(self.read_header(sector));
                    if header.status.is_free() {
                        total += if query == Space::FreeBytes { payload } else { 1 };
                    }
                }
            }
        }
        Ok(total)
    }

    //
    // Checker.
    //

    /// Checks and repairs the file system, returning the number of sectors
    /// modified.
    ///
    /// Three passes over a transient byte-per-sector classification map:
    /// classify every sector and walk every file-node's chain, reclaim
    /// sectors reachable from nowhere (bad ones are erased outright, the
    /// rest flipped to `FREE_DIRTY`), then resolve duplicate names by
    /// freeing the chain of the lower generation.
    ///
    /// # Errors
    ///
    /// Errors on flash IO failure.
    pub fn check(&self) -> Result<u32, Error> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.metrics.total_cross_chain = 0;
        state.metrics.error_sector_count = 0;

        let total = self.flash.total_sectors();
        let mut map = vec![0u8; total as usize];
        let mut fixed: u32 = 0;
        debug!("Checking fs: {} sectors", total);

        // Pass 1: classify every sector, walking each file chain.
        for sector in 0..total {
            let header = get!(self.read_header(sector));
            if !header.is_formatted() && !header.status.is_free() {
                map[sector as usize] |= CHECK_BAD;
            }
            match header.status {
                Status::Free | Status::FreeDirty => map[sector as usize] |= CHECK_FREE,
                Status::InUse => {}
                Status::Unknown(_) => {}
                Status::Filenode => {
                    let node = get!(self.read_filenode(sector));
                    if node.file_size == 0 || node.file_size == 0xFFFF_FFFF {
                        // A file that never finished being created.
                        map[sector as usize] |= CHECK_BAD;
                        continue;
                    }
                    map[sector as usize] |= CHECK_FNODE;
                    let mut next = header.next;
                    while next != END_OF_CHAIN && self.flash.is_valid(next) {
                        let entry = &mut map[next as usize];
                        if *entry & (CHECK_FREE | CHECK_FNODE | CHECK_BAD) != 0 {
                            state.metrics.total_cross_chain += 1;
                        }
                        if *entry & CHECK_INUSE != 0 {
                            // Already walked through here; following a
                            // cycle any further would never terminate.
                            break;
                        }
                        *entry |= CHECK_INUSE;
                        next = get!(self.read_header(next)).next;
                    }
                }
            }
        }

        // Pass 2: reclaim estranged sectors.
        for sector in 0..total {
            let flags = map[sector as usize];
            if flags & (CHECK_INUSE | CHECK_FNODE | CHECK_FREE) != 0 {
                continue;
            }
            if flags & CHECK_BAD == 0 {
                get!(self.mark_free_dirty(sector));
            } else {
                get!(self.flash.erase(sector));
            }
            fixed += 1;
        }

        // Pass 3: resolve duplicate names, keeping the higher generation.
        for sector in 0..total {
            let header = get!(self.read_header(sector));
            if header.status != Status::Filenode {
                continue;
            }
            let node = get!(self.read_filenode(sector));
            for other in sector + 1..total {
                let other_header = get!(self.read_header(other));
                if other_header.status != Status::Filenode {
                    continue;
                }
                let other_node = get!(self.read_filenode(other));
                if !filename::eq_ignore_case(node.name(), other_node.name()) {
                    continue;
                }
                debug!(
                    "Duplicate name in sectors {} and {} (counts {} / {})",
                    sector, other, node.count, other_node.count
                );
                if node.count < other_node.count {
                    fixed += get!(self.free_sectors(sector));
                    break;
                }
                fixed += get!(self.free_sectors(other));
            }
        }

        debug!(
            "Check done: {} fixed, {} cross-chained",
            fixed, state.metrics.total_cross_chain
        );
        Ok(fixed)
    }
}
