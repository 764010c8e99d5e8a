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

//! RAM-backed emulation of a flash section, for host-side testing.
//!
//! The emulated media honours the NOR write contract: writes AND the new
//! bytes into the pre-image so bits only ever move from 1 to 0, and only a
//! full sector erase brings them back to 1. A fault-injecting wrapper allows
//! cutting the power between any two sector writes.


use crate::flash::{IOError, SectionDriver};
use spin::Mutex;
use std::sync::atomic::{AtomicIsize, Ordering};
use std::sync::Arc;

/// Device error code reported by [`FaultSection`] once its budget is spent.
///
/// [`FaultSection`]: struct.FaultSection.html
pub const POWER_LOST: i32 = -70;

/// A RAM-backed NOR flash section.
///
/// Cloning yields another handle onto the same sector images, so a test can
/// keep inspecting the media after moving a handle into the engine, or
/// rebuild a registry over the same media to emulate a reboot.
pub struct RamSection {
    /// Size of each emulated sector.
    sector_size: usize,

    /// Sector images, shared between clones.
    cells: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Clone for RamSection {
    fn clone(&self) -> RamSection {
        RamSection {
            sector_size: self.sector_size,
            cells: self.cells.clone(),
        }
    }
}

impl RamSection {
    /// Creates `count` erased sectors of `sector_size` bytes each.
    pub fn new(count: usize, sector_size: usize) -> RamSection {
        RamSection {
            sector_size,
            cells: Arc::new(Mutex::new(vec![vec![0xFF; sector_size]; count])),
        }
    }

    /// Returns a copy of a sector's current bytes.
    ///
    /// # Panics
    ///
    /// Panics if `sector` does not exist on this emulated device.
    pub fn snapshot(&self, sector: usize) -> Vec<u8> {
        self.cells.lock()[sector].clone()
    }

    /// Checks an access against the emulated device geometry.
    fn check(&self, sector: u32, offset: u32, len: usize) -> Result<(), IOError> {
        let cells = self.cells.lock();
        if sector as usize >= cells.len() {
            return err!(IOError::InvalidSector);
        }
        if offset as usize + len > self.sector_size {
            return err!(IOError::OutOfBounds);
        }
        Ok(())
    }
}

impl SectionDriver for RamSection {
    fn read(&self, sector: u32, offset: u32, buf: &mut [u8]) -> Result<(), IOError> {
        get!(self.check(sector, offset, buf.len()));
        let cells = self.cells.lock();
        let start = offset as usize;
        buf.copy_from_slice(&cells[sector as usize][start..start + buf.len()]);
        Ok(())
    }

    fn write(&self, sector: u32, offset: u32, buf: &[u8]) -> Result<(), IOError> {
        get!(self.check(sector, offset, buf.len()));
        let mut cells = self.cells.lock();
        let image = &mut cells[sector as usize];
        for (i, &b) in buf.iter().enumerate() {
            // NOR: bits can only be cleared until the next erase.
            image[offset as usize + i] &= b;
        }
        Ok(())
    }

    fn erase(&self, sector: u32) -> Result<(), IOError> {
        get!(self.check(sector, 0, 0));
        let mut cells = self.cells.lock();
        for b in cells[sector as usize].iter_mut() {
            *b = 0xFF;
        }
        Ok(())
    }
}

/// Wraps a driver and cuts the power after a configured number of writes.
///
/// Once the write budget is spent, every further write fails with
/// [`IOError::Device`]`(`[`POWER_LOST`]`)` while reads and erases keep
/// working, which places a crash point between any two sector writes.
///
/// [`IOError::Device`]: ../flash/enum.IOError.html
/// [`POWER_LOST`]: constant.POWER_LOST.html
pub struct FaultSection<D> {
    /// The wrapped driver.
    inner: D,

    /// Writes remaining before the emulated power loss.
    remaining: Arc<AtomicIsize>,
}

impl<D> FaultSection<D> {
    /// Wraps `inner` with an initially unlimited write budget.
    pub fn new(inner: D) -> FaultSection<D> {
        FaultSection {
            inner,
            remaining: Arc::new(AtomicIsize::new(isize::max_value())),
        }
    }

    /// Sets the number of writes that will still succeed.
    pub fn set_budget(&self, writes: isize) {
        self.remaining.store(writes, Ordering::SeqCst);
    }
}

impl<D: Clone> Clone for FaultSection<D> {
    fn clone(&self) -> FaultSection<D> {
        FaultSection {
            inner: self.inner.clone(),
            remaining: self.remaining.clone(),
        }
    }
}

impl<D: SectionDriver> SectionDriver for FaultSection<D> {
    fn read(&self, sector: u32, offset: u32, buf: &mut [u8]) -> Result<(), IOError> {
        self.inner.read(sector, offset, buf)
    }

    fn write(&self, sector: u32, offset: u32, buf: &[u8]) -> Result<(), IOError> {
        if self.remaining.fetch_sub(1, Ordering::SeqCst) <= 0 {
            return err!(IOError::Device(POWER_LOST));
        }
        self.inner.write(sector, offset, buf)
    }

    fn erase(&self, sector: u32) -> Result<(), IOError> {
        self.inner.erase(sector)
    }
}
