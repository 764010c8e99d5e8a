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

//! Minimal flash-resident file system for embedded devices.
//!
//! The crate stores a flat namespace of variable-length byte files on one or
//! more NOR/NAND flash regions, each region advertising its sector size and
//! primitive read/write/erase operations. Files are singly-linked chains of
//! fixed-size sectors; all mutation is arranged so that bits only ever move
//! from 1 to 0 between sector erases, and a checker pass repairs whatever a
//! power loss leaves behind.
//!
//! A volume is mounted in two steps: [`flash::Flash`] assembles the section
//! table into one global sector index space, and [`fs::FileSystem`] runs the
//! POSIX-like surface (open/close/read/write/erase/rename, directory
//! enumeration, space accounting and the checker) on top of it. Several
//! volumes can be mounted independently over disjoint section tables.
//!
//! [`emulator::RamSection`] provides a RAM-backed section driver honouring
//! the NOR write rules, for host-side tests.
//!
//! [`flash::Flash`]: flash/struct.Flash.html
//! [`fs::FileSystem`]: fs/struct.FileSystem.html
//! [`emulator::RamSection`]: emulator/struct.RamSection.html

#![warn(missing_docs)]

#[macro_use]
pub mod debug;

pub mod emulator;
pub mod filename;
pub mod flash;
pub mod fs;
pub mod layout;

pub use crate::flash::{Flash, IOError, Section, SectionDriver};
pub use crate::fs::{Error, FileSystem, Space};
pub use crate::layout::{FileNode, SectorHeader, Status};
