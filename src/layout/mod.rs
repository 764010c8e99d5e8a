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

//! On-media layout: sector headers and file-nodes.
//!
//! Every managed sector starts with a fixed-layout header, little-endian,
//! at offset 0:
//!
//! ```none
//! +--------+--------+------------+---------+--------+----------+--------------+------------+
//! |  Key   |  Next  | EraseCount | Version | Status | Checksum | SectorLength | DataOffset |
//! |  4 B   |  4 B   |    4 B     |   1 B   |  1 B   |   2 B    |     4 B      |    4 B     |
//! +--------+--------+------------+---------+--------+----------+--------------+------------+
//! ```
//!
//! `Key` is the sanity key `"mffs"`; a sector without it has never been
//! formatted by this engine. `Next` chains sectors into a file and is
//! `0xFFFFFFFF` at the end of a chain. `Status` encodes the sector lifecycle
//! with values chosen so that every legal transition only clears bits, as NOR
//! flash can only move bits from 1 to 0 between erases:
//!
//! ```none
//! FREE (0xFF) ---> IN_USE (0x0F) ------.
//!        \                             +---> FREE_DIRTY (0x00)
//!         `-----> IN_USE_FILENODE (0xF0)
//! ```
//!
//! Returning from `FREE_DIRTY` to `FREE` requires a full sector erase.
//!
//! A sector holding the start of a file carries a file-node immediately after
//! the header, and its `DataOffset` points past both:
//!
//! ```none
//! +-------------+------------+----------+----------+-------+
//! | Permissions |  Filename  | FileSize | DataTime | Count |
//! |     1 B     |    65 B    |   4 B    |   4 B    |  4 B  |
//! +-------------+------------+----------+----------+-------+
//! ```


use crate::filename;

/// Sanity key present at the start of every formatted sector (`"mffs"`).
pub const SECTOR_KEY: u32 = 0x6d66_6673;

/// On-media format version written into fresh headers.
pub const FORMAT_VERSION: u8 = 1;

/// `Next` value marking the end of a sector chain.
///
/// This is the erased state of the field, which is what allows chaining a
/// successor in later without a sector erase.
pub const END_OF_CHAIN: u32 = 0xFFFF_FFFF;

/// Size of the sector header on media.
pub const HEADER_LEN: usize = 24;

/// Size of the file-node record on media.
pub const FILENODE_LEN: usize = 78;

/// Byte offset of the `Next` field inside the header.
pub const NEXT_OFFSET: usize = 4;

/// Byte offset of the `Status` byte inside the header.
pub const STATUS_OFFSET: usize = 13;

/// Placeholder value of the reserved `SectorChecksum` field.
pub const CHECKSUM_UNUSED: u16 = 0xFFFF;

/// Lifecycle state encoded in a sector's `Status` byte.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Status {
    /// Erased and ready for allocation.
    Free,

    /// Logically free but physically still holding old data; needs an erase
    /// before reuse.
    FreeDirty,

    /// Holds file data and belongs to some chain.
    InUse,

    /// Holds a file-node after the header; the head of a file's chain.
    Filenode,

    /// Any other byte. Seen on media that was never formatted or has been
    /// corrupted.
    Unknown(u8),
}

impl Status {
    /// Decodes a raw status byte.
    pub fn from_raw(raw: u8) -> Status {
        match raw {
            0xFF => Status::Free,
            0x00 => Status::FreeDirty,
            0x0F => Status::InUse,
            0xF0 => Status::Filenode,
            other => Status::Unknown(other),
        }
    }

    /// Returns the on-media byte for this status.
    pub fn raw(self) -> u8 {
        match self {
            Status::Free => 0xFF,
            Status::FreeDirty => 0x00,
            Status::InUse => 0x0F,
            Status::Filenode => 0xF0,
            Status::Unknown(other) => other,
        }
    }

    /// Returns true for both flavours of free sector.
    pub fn is_free(self) -> bool {
        self == Status::Free || self == Status::FreeDirty
    }
}

/// The fixed-layout header at offset 0 of every managed sector.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct SectorHeader {
    /// Sanity key; [`SECTOR_KEY`] iff the sector has ever been formatted.
    ///
    /// [`SECTOR_KEY`]: constant.SECTOR_KEY.html
    pub key: u32,

    /// Global index of the next sector of this file, or [`END_OF_CHAIN`].
    ///
    /// [`END_OF_CHAIN`]: constant.END_OF_CHAIN.html
    pub next: u32,

    /// Number of erases this sector has gone through, kept for future wear
    /// balancing.
    pub erase_count: u32,

    /// On-media format version.
    pub version: u8,

    /// Sector lifecycle state.
    pub status: Status,

    /// Reserved checksum field, currently always [`CHECKSUM_UNUSED`].
    ///
    /// [`CHECKSUM_UNUSED`]: constant.CHECKSUM_UNUSED.html
    pub checksum: u16,

    /// Size of this sector in bytes, redundant with the section table so the
    /// media stays self-describing.
    pub sector_length: u32,

    /// Offset at which user data starts in this sector.
    pub data_offset: u32,
}

impl SectorHeader {
    /// Decodes a header from its on-media image.
    pub fn decode(raw: &[u8; HEADER_LEN]) -> SectorHeader {
        SectorHeader {
            key: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            next: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
            erase_count: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]),
            version: raw[12],
            status: Status::from_raw(raw[13]),
            checksum: u16::from_le_bytes([raw[14], raw[15]]),
            sector_length: u32::from_le_bytes([raw[16], raw[17], raw[18], raw[19]]),
            data_offset: u32::from_le_bytes([raw[20], raw[21], raw[22], raw[23]]),
        }
    }

    /// Encodes this header into its on-media image.
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut raw = [0u8; HEADER_LEN];
        raw[0..4].copy_from_slice(&self.key.to_le_bytes());
        raw[4..8].copy_from_slice(&self.next.to_le_bytes());
        raw[8..12].copy_from_slice(&self.erase_count.to_le_bytes());
        raw[12] = self.version;
        raw[13] = self.status.raw();
        raw[14..16].copy_from_slice(&self.checksum.to_le_bytes());
        raw[16..20].copy_from_slice(&self.sector_length.to_le_bytes());
        raw[20..24].copy_from_slice(&self.data_offset.to_le_bytes());
        raw
    }

    /// Returns whether the sanity key is present.
    pub fn is_formatted(&self) -> bool {
        self.key == SECTOR_KEY
    }

    /// Number of user-data bytes this sector can hold.
    ///
    /// Saturates to 0 on garbage headers whose `data_offset` exceeds the
    /// sector length.
    pub fn payload_capacity(&self) -> u32 {
        self.sector_length.saturating_sub(self.data_offset)
    }
}

/// The per-file metadata record stored right after the header in the first
/// sector of a file's chain.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct FileNode {
    /// Opaque permission bits; stored but not enforced.
    pub permissions: u8,

    /// NUL-terminated filename field.
    pub filename: [u8; filename::FILENAME_FIELD],

    /// Total bytes of user data in the file.
    pub file_size: u32,

    /// Reserved timestamp field; persisted but never set by the engine.
    pub data_time: u32,

    /// Generation counter, incremented each time a file of this name is
    /// recreated. Duplicate resolution keeps the highest.
    pub count: u32,
}

impl Default for FileNode {
    fn default() -> FileNode {
        FileNode {
            permissions: 0,
            filename: [0; filename::FILENAME_FIELD],
            file_size: 0,
            data_time: 0,
            count: 0,
        }
    }
}

impl FileNode {
    /// Builds the in-core file-node for a file about to be created.
    pub fn new(name: &str, permissions: u8) -> FileNode {
        FileNode {
            permissions,
            filename: filename::encode(name),
            file_size: 0,
            data_time: 0,
            count: 0,
        }
    }

    /// Decodes a file-node from its on-media image.
    pub fn decode(raw: &[u8; FILENODE_LEN]) -> FileNode {
        let mut node = FileNode::default();
        node.permissions = raw[0];
        node.filename.copy_from_slice(&raw[1..66]);
        node.file_size = u32::from_le_bytes([raw[66], raw[67], raw[68], raw[69]]);
        node.data_time = u32::from_le_bytes([raw[70], raw[71], raw[72], raw[73]]);
        node.count = u32::from_le_bytes([raw[74], raw[75], raw[76], raw[77]]);
        node
    }

    /// Encodes this file-node into its on-media image.
    pub fn encode(&self) -> [u8; FILENODE_LEN] {
        let mut raw = [0u8; FILENODE_LEN];
        raw[0] = self.permissions;
        raw[1..66].copy_from_slice(&self.filename);
        raw[66..70].copy_from_slice(&self.file_size.to_le_bytes());
        raw[70..74].copy_from_slice(&self.data_time.to_le_bytes());
        raw[74..78].copy_from_slice(&self.count.to_le_bytes());
        raw
    }

    /// Returns the name bytes, up to the NUL terminator.
    pub fn name(&self) -> &[u8] {
        filename::decode(&self.filename)
    }

    /// Replaces the name of this file-node.
    pub fn set_name(&mut self, name: &str) {
        self.filename = filename::encode(name);
    }

    /// Returns whether this file-node was read from a sector whose node has
    /// not been written yet: a file still being created when the media was
    /// last written.
    pub fn is_placeholder(&self) -> bool {
        self.filename[0] == 0xFF && self.file_size == 0xFFFF_FFFF
    }
}
