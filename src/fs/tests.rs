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

#![cfg(test)]
#![allow(unused_variables, unused_mut)]

use super::*;
#[cfg(test)]
use speculate::speculate;

use crate::emulator::{FaultSection, RamSection, POWER_LOST};
use crate::flash::{Section, SectionDriver};
use crate::layout;

/// Builds a single-section medium of erased RAM-backed flash.
fn media(count: u32, sector_size: u32) -> (RamSection, Flash) {
    let ram = RamSection::new(count as usize, sector_size as usize);
    let flash = Flash::new(vec![Section::new(
        0,
        0,
        count,
        sector_size,
        Box::new(ram.clone()),
    )]);
    (ram, flash)
}

/// Creates a file holding `data`.
fn store(fs: &FileSystem, name: &str, data: &[u8]) {
    let fd = fs.open(name, CREATE, 0).unwrap();
    assert_eq!(fs.write(fd, data).unwrap(), data.len());
    fs.close(fd).unwrap();
}

/// Reads `len` bytes back out of a file.
fn fetch(fs: &FileSystem, name: &str, len: usize) -> Vec<u8> {
    let fd = fs.open(name, RDONLY, 0).unwrap();
    let mut buf = vec![0u8; len];
    assert_eq!(fs.read(fd, &mut buf).unwrap(), len);
    fs.close(fd).unwrap();
    buf
}

/// Collects every directory entry as (name, size, count).
fn listing(fs: &FileSystem) -> Vec<(String, u32, u32)> {
    let mut handle = 0;
    let mut out = Vec::new();
    while let Some(node) = fs.next_directory(&mut handle).unwrap() {
        out.push((
            String::from_utf8_lossy(node.name()).into_owned(),
            node.file_size,
            node.count,
        ));
    }
    out
}

/// Decodes the header currently on an emulated sector.
fn header_of(ram: &RamSection, sector: usize) -> layout::SectorHeader {
    let image = ram.snapshot(sector);
    let mut raw = [0u8; layout::HEADER_LEN];
    raw.copy_from_slice(&image[..layout::HEADER_LEN]);
    layout::SectorHeader::decode(&raw)
}

speculate! {
    describe "files" {
        before {
            let (ram, flash) = media(8, 256);
            let fs = FileSystem::new(&flash);
            // 256-byte sectors: 154 payload bytes behind a filenode,
            // 232 behind a plain header.
        }

        it "reads back what was written" {
            let free_before = fs.space(Space::FreeBytes).unwrap();
            store(&fs, "a", b"hello");
            assert_eq!(fetch(&fs, "a", 5), b"hello");
            assert_eq!(fs.space(Space::FreeBytes).unwrap(), free_before - 232);
        }

        it "clamps reads to the end of the file" {
            store(&fs, "a", b"hello");
            let fd = fs.open("a", RDONLY, 0).unwrap();
            let mut buf = [0u8; 32];
            assert_eq!(fs.read(fd, &mut buf).unwrap(), 5);
            assert_eq!(&buf[..5], b"hello");
            assert_eq!(fs.read(fd, &mut buf), Err(Error::InvalidFilePosition));
            fs.close(fd).unwrap();
        }

        it "keeps its position across partial reads" {
            store(&fs, "a", b"hello");
            let fd = fs.open("a", RDONLY, 0).unwrap();
            let mut buf = [0u8; 2];
            assert_eq!(fs.read(fd, &mut buf).unwrap(), 2);
            assert_eq!(&buf, b"he");
            let mut buf = [0u8; 3];
            assert_eq!(fs.read(fd, &mut buf).unwrap(), 3);
            assert_eq!(&buf, b"llo");
            fs.close(fd).unwrap();
        }

        it "rejects operations on descriptors that are not open" {
            assert_eq!(fs.read(0, &mut [0u8; 1]), Err(Error::InvalidFileDescriptor));
            assert_eq!(fs.write(0, b"x"), Err(Error::InvalidFileDescriptor));
            assert_eq!(fs.close(7), Err(Error::InvalidFileDescriptor));
            assert_eq!(Error::InvalidFileDescriptor.code(), -3);
        }

        it "fails opening a missing file without the create bit" {
            let e = fs.open("nope", RDONLY, 0).unwrap_err();
            assert_eq!(e, Error::FileDoesNotExist);
            assert_eq!(e.code(), -2);
            // The descriptor taken for the attempt must have been released.
            assert_eq!(fs.open("nope", RDWR, 0), Err(Error::FileDoesNotExist));
            assert_eq!(fs.open("nope", WRONLY, 0), Err(Error::FileDoesNotExist));
        }

        it "runs out of descriptors at the table capacity" {
            store(&fs, "a", b"one");
            store(&fs, "b", b"two");
            let first = fs.open("a", RDONLY, 0).unwrap();
            let second = fs.open("b", RDONLY, 0).unwrap();
            assert_eq!(fs.open("a", RDONLY, 0), Err(Error::TooManyOpenFiles));
            fs.close(first).unwrap();
            let again = fs.open("a", RDONLY, 0).unwrap();
            fs.close(again).unwrap();
            fs.close(second).unwrap();
        }

        it "matches names case-insensitively" {
            store(&fs, "Readme.TXT", b"hi");
            assert_eq!(fetch(&fs, "readme.txt", 2), b"hi");
            assert_eq!(fetch(&fs, "README.txt", 2), b"hi");
        }
    }

    describe "chains" {
        before {
            let (ram, flash) = media(8, 128);
            let fs = FileSystem::new(&flash);
            // 128-byte sectors: 26 payload bytes behind the filenode,
            // 104 behind a plain header.
        }

        it "spans sectors and links them in order" {
            let data: Vec<u8> = (0..200).map(|x| x as u8).collect();
            store(&fs, "big", &data);
            assert_eq!(fetch(&fs, "big", 200), data);

            // 26 + 104 < 200 <= 26 + 104 + 104: three sectors, first-fit.
            assert_eq!(header_of(&ram, 0).status, layout::Status::Filenode);
            assert_eq!(header_of(&ram, 0).next, 1);
            assert_eq!(header_of(&ram, 1).status, layout::Status::InUse);
            assert_eq!(header_of(&ram, 1).next, 2);
            assert_eq!(header_of(&ram, 2).next, layout::END_OF_CHAIN);
            assert_eq!(fs.space(Space::FreeSectors).unwrap(), 5);
        }

        it "does not allocate a trailing sector on an exact fill" {
            let data = [0x55u8; 26];
            store(&fs, "fit", &data);
            assert_eq!(header_of(&ram, 0).next, layout::END_OF_CHAIN);
            assert_eq!(fs.space(Space::FreeSectors).unwrap(), 7);
        }

        it "survives a remount" {
            let data: Vec<u8> = (0..150).map(|x| (x * 3) as u8).collect();
            store(&fs, "keep", &data);
            drop(fs);
            let fs = FileSystem::new(&flash);
            assert_eq!(fetch(&fs, "keep", 150), data);
        }

        it "reports out of space when the media fills up" {
            let fd = fs.open("hog", CREATE, 0).unwrap();
            // 26 + 7 * 104 bytes fit; stop 10 short of that so the next
            // write spills past the last sector.
            let data = vec![0xA5u8; 26 + 7 * 104 - 10];
            assert_eq!(fs.write(fd, &data).unwrap(), data.len());
            assert_eq!(fs.write(fd, &[0xA5u8; 20]), Err(Error::OutOfSpace));
            assert_eq!(Error::OutOfSpace.code(), -6);
        }
    }

    describe "recreation" {
        before {
            let (ram, flash) = media(8, 256);
            let fs = FileSystem::new(&flash);
            store(&fs, "a", b"hello");
        }

        it "replaces the contents and frees the old chain at close" {
            store(&fs, "a", b"world");
            assert_eq!(fetch(&fs, "a", 5), b"world");
            assert_eq!(fs.check().unwrap(), 0);
            assert_eq!(listing(&fs), vec![("a".to_owned(), 5, 1)]);
        }

        it "serves the old generation until the new one closes" {
            let writer = fs.open("a", CREATE | WRONLY, 0).unwrap();
            fs.write(writer, b"world").unwrap();
            assert_eq!(fetch(&fs, "a", 5), b"hello");
            fs.close(writer).unwrap();
            assert_eq!(fetch(&fs, "a", 5), b"world");
        }

        it "does not recreate when opened without the create bit" {
            let fd = fs.open("a", RDWR, 0).unwrap();
            fs.close(fd).unwrap();
            assert_eq!(fetch(&fs, "a", 5), b"hello");
            assert_eq!(listing(&fs), vec![("a".to_owned(), 5, 0)]);
        }

        it "bumps the generation counter on every recreation" {
            store(&fs, "a", b"x");
            store(&fs, "a", b"y");
            assert_eq!(listing(&fs), vec![("a".to_owned(), 1, 2)]);
        }

        it "forgets a file recreated without any write" {
            let fd = fs.open("a", CREATE, 0).unwrap();
            fs.close(fd).unwrap();
            assert_eq!(fs.open("a", RDONLY, 0), Err(Error::FileDoesNotExist));
            assert_eq!(listing(&fs), vec![]);
        }
    }

    describe "erase" {
        before {
            let (ram, flash) = media(8, 256);
            let fs = FileSystem::new(&flash);
            store(&fs, "a", b"hello");
        }

        it "removes the file from the namespace" {
            fs.erase("a").unwrap();
            assert_eq!(fs.open("a", RDONLY, 0), Err(Error::FileDoesNotExist));
            assert_eq!(listing(&fs), vec![]);
            let e = fs.erase("a").unwrap_err();
            assert_eq!(e, Error::FileNotFound);
            assert_eq!(e.code(), -7);
        }

        it "leaves the sectors dirty for the allocator to recycle" {
            fs.erase("a").unwrap();
            assert_eq!(header_of(&ram, 0).status, layout::Status::FreeDirty);
            store(&fs, "b", b"y");
            let header = header_of(&ram, 0);
            assert_eq!(header.status, layout::Status::Filenode);
            assert_eq!(header.erase_count, 2);
            // Reuse starts from a real erase: the payload behind the new
            // data must be back to its erased state.
            let image = ram.snapshot(0);
            assert_eq!(image[header.data_offset as usize], b'y');
            assert_eq!(image[header.data_offset as usize + 1], 0xFF);
        }
    }

    describe "rename" {
        before {
            let (ram, flash) = media(8, 128);
            let fs = FileSystem::new(&flash);
        }

        it "moves the name while preserving the contents" {
            let data: Vec<u8> = (0..200).map(|x| x as u8).collect();
            store(&fs, "alpha", &data);
            fs.rename("alpha", "beta").unwrap();
            assert_eq!(fs.open("alpha", RDONLY, 0), Err(Error::FileDoesNotExist));
            assert_eq!(fetch(&fs, "beta", 200), data);
            assert_eq!(listing(&fs), vec![("beta".to_owned(), 200, 1)]);
            assert_eq!(fs.check().unwrap(), 0);
        }

        it "rejects an existing target name, whatever the case" {
            store(&fs, "alpha", b"1");
            store(&fs, "beta", b"2");
            let e = fs.rename("alpha", "BETA").unwrap_err();
            assert_eq!(e, Error::NewNameExists);
            assert_eq!(e.code(), -8);
            assert_eq!(fetch(&fs, "alpha", 1), b"1");
        }

        it "fails on a missing source" {
            assert_eq!(fs.rename("ghost", "beta"), Err(Error::FileNotFound));
        }
    }

    describe "directory" {
        before {
            let (ram, flash) = media(8, 256);
            let fs = FileSystem::new(&flash);
        }

        it "iterates entries in ascending sector order" {
            store(&fs, "one", b"1");
            store(&fs, "two", b"22");
            store(&fs, "three", b"333");
            let mut handle = 0;
            let mut names = Vec::new();
            while let Some(node) = fs.next_directory(&mut handle).unwrap() {
                names.push(String::from_utf8_lossy(node.name()).into_owned());
            }
            assert_eq!(names, vec!["one", "two", "three"]);
            assert_eq!(handle, 3);
            assert_eq!(fs.next_directory(&mut handle).unwrap(), None);
        }

        it "shows a file still being created as a placeholder" {
            let fd = fs.open("wip", CREATE, 0).unwrap();
            fs.write(fd, b"partial").unwrap();
            // The filenode is only written at close; on media the name
            // field still holds erased bytes.
            let entries = listing(&fs);
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].0, crate::filename::NEW_FILE_NAME);
            fs.close(fd).unwrap();
            assert_eq!(listing(&fs), vec![("wip".to_owned(), 7, 0)]);
        }
    }

    describe "space" {
        before {
            let (ram, flash) = media(8, 256);
            let fs = FileSystem::new(&flash);
        }

        it "tallies bytes and sectors consistently" {
            assert_eq!(fs.space(Space::TotalSectors).unwrap(), 8);
            assert_eq!(fs.space(Space::TotalBytes).unwrap(), 8 * 232);
            store(&fs, "a", &[0u8; 300]); // filenode sector + one plain sector
            assert_eq!(fs.space(Space::FreeSectors).unwrap(), 6);
            assert_eq!(fs.space(Space::FreeBytes).unwrap(), 6 * 232);
            assert_eq!(fs.space(Space::TotalBytes).unwrap(), 8 * 232);
        }

        it "counts dirty sectors as free" {
            store(&fs, "a", b"x");
            fs.erase("a").unwrap();
            assert_eq!(fs.space(Space::FreeSectors).unwrap(), 8);
        }

        it "erases everything on request" {
            store(&fs, "a", b"hello");
            store(&fs, "b", b"world");
            assert_eq!(fs.space(Space::EraseAll).unwrap(), 8 * 232);
            assert_eq!(listing(&fs), vec![]);
            assert_eq!(fs.space(Space::FreeBytes).unwrap(), 8 * 232);
            assert_eq!(fs.check().unwrap(), 0);
        }
    }

    describe "checker" {
        before {
            let (ram, flash) = media(8, 128);
            let fs = FileSystem::new(&flash);
        }

        it "finds nothing to fix on virgin media" {
            assert_eq!(fs.check().unwrap(), 0);
            assert_eq!(fs.cross_chain_count(), 0);
            assert_eq!(fs.error_sector_count(), 0);
        }

        it "reclaims the chain of an interrupted creation" {
            let fd = fs.open("tmp", CREATE, 0).unwrap();
            fs.write(fd, &[0x42u8; 60]).unwrap(); // filenode sector + 1 plain
            drop(fs);

            // Reboot without the close that would have written the filenode.
            let fs = FileSystem::new(&flash);
            assert_eq!(listing(&fs)[0].0, crate::filename::NEW_FILE_NAME);
            assert_eq!(fs.check().unwrap(), 2);
            assert_eq!(listing(&fs), vec![]);
            assert_eq!(fs.space(Space::FreeBytes).unwrap(), 8 * 104);
        }

        it "reclaims files whose size was never set" {
            let fd = fs.open("empty", CREATE, 0).unwrap();
            fs.write(fd, b"").unwrap();
            fs.close(fd).unwrap();
            assert_eq!(fs.check().unwrap(), 1);
            assert_eq!(listing(&fs), vec![]);
        }

        it "counts cross-linked sectors without touching them" {
            store(&fs, "a", b"hello");
            store(&fs, "b", b"there");
            // Corrupt b's chain to point into a's head. The Next field
            // still holds all-ones, so the driver accepts the patch.
            ram.write(1, layout::NEXT_OFFSET as u32, &0u32.to_le_bytes())
                .unwrap();
            assert_eq!(fs.check().unwrap(), 0);
            assert_eq!(fs.cross_chain_count(), 1);
            assert_eq!(fetch(&fs, "a", 5), b"hello");
        }

        it "erases sectors that are plain garbage" {
            // Scribble over a virgin sector: no key, and a status byte
            // that decodes to nothing meaningful.
            ram.write(3, 0, &[0x13u8; 16]).unwrap();
            assert_eq!(fs.check().unwrap(), 1);
            assert!(ram.snapshot(3).iter().all(|&b| b == 0xFF));
        }

        it "keeps the newest generation after a crashed replacement" {
            let ram = RamSection::new(8, 256);
            let fault = FaultSection::new(ram.clone());
            let flash = Flash::new(vec![Section::new(
                0,
                0,
                8,
                256,
                Box::new(fault.clone()),
            )]);
            let fs = FileSystem::new(&flash);
            store(&fs, "a", b"hello");

            // Replace "a", losing power after the new head's filenode is
            // written but before the old head is retired.
            let fd = fs.open("a", CREATE, 0).unwrap();
            fault.set_budget(3); // fresh header, data, filenode
            assert_eq!(fs.write(fd, b"world").unwrap(), 5);
            assert_eq!(
                fs.close(fd),
                Err(Error::Io(crate::flash::IOError::Device(POWER_LOST)))
            );
            drop(fs);
            drop(flash);

            // Reboot over the same media: two filenodes named "a".
            let flash = Flash::new(vec![Section::new(
                0,
                0,
                8,
                256,
                Box::new(ram.clone()),
            )]);
            let fs = FileSystem::new(&flash);
            assert_eq!(fs.check().unwrap(), 1);
            assert_eq!(listing(&fs), vec![("a".to_owned(), 5, 1)]);
            assert_eq!(fetch(&fs, "a", 5), b"world");
        }

        it "leaves both heads alive after a crashed rename" {
            let ram = RamSection::new(8, 256);
            let fault = FaultSection::new(ram.clone());
            let flash = Flash::new(vec![Section::new(
                0,
                0,
                8,
                256,
                Box::new(fault.clone()),
            )]);
            let fs = FileSystem::new(&flash);
            store(&fs, "old", b"data!");

            // Rename writes the fresh header, the copied payload (154
            // bytes, two 100-byte chunks), the filenode, then retires the
            // old head. Lose power on that last write.
            fault.set_budget(4);
            assert_eq!(
                fs.rename("old", "new"),
                Err(Error::Io(crate::flash::IOError::Device(POWER_LOST)))
            );
            drop(fs);
            drop(flash);

            let flash = Flash::new(vec![Section::new(
                0,
                0,
                8,
                256,
                Box::new(ram.clone()),
            )]);
            let fs = FileSystem::new(&flash);
            // The names differ, so duplicate resolution leaves both heads
            // in place; no data was lost and the stale name can simply be
            // erased.
            assert_eq!(fs.check().unwrap(), 0);
            assert_eq!(fetch(&fs, "new", 5), b"data!");
            assert_eq!(fetch(&fs, "old", 5), b"data!");
            fs.erase("old").unwrap();
            assert_eq!(listing(&fs), vec![("new".to_owned(), 5, 1)]);
        }
    }

    describe "allocator" {
        before {
            let (ram, flash) = media(4, 256);
            let fs = FileSystem::new(&flash);
        }

        it "hands out virgin sectors while tallying them" {
            assert_eq!(fs.error_sector_count(), 0);
            store(&fs, "a", b"x");
            assert_eq!(fs.error_sector_count(), 1);
            assert_eq!(header_of(&ram, 0).erase_count, 1);
        }

        it "reports out of space once every sector is taken" {
            store(&fs, "a", &[1u8; 154]);
            store(&fs, "b", &[2u8; 154]);
            store(&fs, "c", &[3u8; 154]);
            store(&fs, "d", &[4u8; 154]);
            let fd = fs.open("e", CREATE, 0).unwrap();
            assert_eq!(fs.write(fd, b"x"), Err(Error::OutOfSpace));
        }
    }
}
