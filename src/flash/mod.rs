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

//! Low-level flash handling: the section registry.
//!
//! The managed media is one or more flash "sections", each a contiguous run
//! of same-sized sectors on one device with its own driver. Sections are kept
//! in declaration order and their sectors are numbered globally by
//! concatenation: section 0 occupies `[0, count0)`, section 1 occupies
//! `[count0, count0 + count1)`, and so on.
//!
//! The registry only translates global sector indices and dispatches to the
//! owning section's driver. It performs no caching: the drivers speak
//! directly to flash, and flash can be written from 1 to 0 at any bit level,
//! but writing from 0 to 1 requires erasing an entire sector.

mod tests;

/// Errors that can happen when performing IO on the flash.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum IOError {
    /// The global sector index falls outside every registered section.
    InvalidSector,

    /// The access would run past the end of the sector.
    OutOfBounds,

    /// A section driver reported a device-specific failure.
    ///
    /// The argument is the driver's negative error code, preserved verbatim.
    Device(i32),
}

/// Primitive operations a flash section driver provides.
///
/// Sector numbers given to a driver are device-relative: the section's
/// `start` plus the in-section index. Implementations must uphold the NOR
/// write contract: `write` may only move bits from 1 to 0, and `erase`
/// returns the whole sector to all-`0xFF`.
pub trait SectionDriver: Send + Sync {
    /// Reads `buf.len()` bytes starting at `offset` within `sector`.
    fn read(&self, sector: u32, offset: u32, buf: &mut [u8]) -> Result<(), IOError>;

    /// Writes `buf` starting at `offset` within `sector`.
    fn write(&self, sector: u32, offset: u32, buf: &[u8]) -> Result<(), IOError>;

    /// Erases `sector` back to all-`0xFF`.
    fn erase(&self, sector: u32) -> Result<(), IOError>;
}

/// One entry of the section table: a contiguous run of managed sectors on one
/// flash device.
pub struct Section {
    /// Device number this section lives on.
    device: u8,

    /// First managed sector, relative to the start of the device.
    start: u32,

    /// Number of sectors in this section.
    count: u32,

    /// Size of each sector in this section.
    sector_size: u32,

    /// Driver exposing the device's read/write/erase primitives.
    driver: Box<dyn SectionDriver>,
}

impl Section {
    /// Builds a section table entry.
    pub fn new(
        device: u8,
        start: u32,
        count: u32,
        sector_size: u32,
        driver: Box<dyn SectionDriver>,
    ) -> Section {
        Section {
            device,
            start,
            count,
            sector_size,
            driver,
        }
    }

    /// Returns the device number of this section.
    pub fn device(&self) -> u8 {
        self.device
    }

    /// Returns the sector size of this section.
    pub fn sector_size(&self) -> u32 {
        self.sector_size
    }

    /// Returns the number of sectors in this section.
    pub fn count(&self) -> u32 {
        self.count
    }
}

/// Main structure for dispatching sector IO across the section table.
pub struct Flash {
    /// Section table, in declaration order.
    sections: Vec<Section>,
}

impl Flash {
    /// Builds a registry over a section table.
    pub fn new(sections: Vec<Section>) -> Flash {
        Flash { sections }
    }

    /// Total number of managed sectors, across all sections.
    pub fn total_sectors(&self) -> u32 {
        self.sections.iter().map(|s| s.count).sum()
    }

    /// Returns whether a global sector index falls inside some section.
    pub fn is_valid(&self, sector: u32) -> bool {
        self.locate(sector).is_ok()
    }

    /// Returns the sector size of the section holding a global sector index.
    pub fn sector_size(&self, sector: u32) -> Result<u32, IOError> {
        let (section, _) = self.locate(sector)?;
        Ok(section.sector_size)
    }

    /// Translates a global sector index into its section and in-section
    /// index.
    fn locate(&self, sector: u32) -> Result<(&Section, u32), IOError> {
        let mut rel = sector;
        for section in &self.sections {
            if rel < section.count {
                return Ok((section, rel));
            }
            rel -= section.count;
        }
        Err(IOError::InvalidSector)
    }

    /// Checks an access against the bounds of a sector.
    fn check_bounds(section: &Section, offset: u32, len: usize) -> Result<(), IOError> {
        if u64::from(offset) + len as u64 > u64::from(section.sector_size) {
            return err!(IOError::OutOfBounds);
        }
        Ok(())
    }

    /// Reads `buf.len()` bytes at `offset` within a global sector.
    pub fn read(&self, sector: u32, offset: u32, buf: &mut [u8]) -> Result<(), IOError> {
        let (section, rel) = get!(self.locate(sector));
        get!(Self::check_bounds(section, offset, buf.len()));
        section.driver.read(section.start + rel, offset, buf)
    }

    /// Writes `buf` at `offset` within a global sector.
    ///
    /// The caller guarantees the write only moves bits from 1 to 0.
    pub fn write(&self, sector: u32, offset: u32, buf: &[u8]) -> Result<(), IOError> {
        let (section, rel) = get!(self.locate(sector));
        get!(Self::check_bounds(section, offset, buf.len()));
        section.driver.write(section.start + rel, offset, buf)
    }

    /// Erases a global sector back to all-`0xFF`.
    pub fn erase(&self, sector: u32) -> Result<(), IOError> {
        let (section, rel) = get!(self.locate(sector));
        section.driver.erase(section.start + rel)
    }
}
