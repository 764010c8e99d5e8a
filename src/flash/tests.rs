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
#![allow(unused_variables)]

use super::*;
#[cfg(test)]
use speculate::speculate;

use crate::emulator::RamSection;

speculate! {
    describe "registry" {
        before {
            // Two devices with different sector sizes: global indices 0-3
            // land on the first, 4-7 on the second.
            let small = RamSection::new(4, 128);
            let big = RamSection::new(4, 256);
            let flash = Flash::new(vec![
                Section::new(0, 0, 4, 128, Box::new(small.clone())),
                Section::new(1, 0, 4, 256, Box::new(big.clone())),
            ]);
        }

        it "concatenates sections into one global index space" {
            assert_eq!(flash.total_sectors(), 8);
            assert!(flash.is_valid(0));
            assert!(flash.is_valid(7));
            assert!(!flash.is_valid(8));
            assert_eq!(flash.sector_size(3).unwrap(), 128);
            assert_eq!(flash.sector_size(4).unwrap(), 256);
            assert_eq!(flash.sector_size(8), Err(IOError::InvalidSector));
        }

        it "dispatches IO to the owning section" {
            flash.write(5, 10, b"mark").unwrap();
            assert_eq!(&big.snapshot(1)[10..14], b"mark");
            assert!(small.snapshot(1).iter().all(|&b| b == 0xFF));

            let mut buf = [0u8; 4];
            flash.read(5, 10, &mut buf).unwrap();
            assert_eq!(&buf, b"mark");

            flash.erase(5).unwrap();
            assert!(big.snapshot(1).iter().all(|&b| b == 0xFF));
        }

        it "applies the start offset of a section" {
            let tail = RamSection::new(4, 128);
            let flash = Flash::new(vec![Section::new(2, 2, 2, 128, Box::new(tail.clone()))]);
            flash.write(0, 0, b"zz").unwrap();
            assert_eq!(&tail.snapshot(2)[..2], b"zz");
            assert!(tail.snapshot(0).iter().all(|&b| b == 0xFF));
        }

        it "rejects out-of-range accesses" {
            assert_eq!(flash.read(8, 0, &mut [0u8; 1]), Err(IOError::InvalidSector));
            assert_eq!(flash.write(8, 0, &[0]), Err(IOError::InvalidSector));
            assert_eq!(flash.erase(8), Err(IOError::InvalidSector));
            assert_eq!(flash.read(0, 120, &mut [0u8; 16]), Err(IOError::OutOfBounds));
            assert_eq!(flash.write(0, 128, &[0]), Err(IOError::OutOfBounds));
            // The same access fits the bigger sectors of the second section.
            flash.read(4, 120, &mut [0u8; 16]).unwrap();
        }

        it "only lets writes clear bits until the next erase" {
            flash.write(0, 0, &[0x0F]).unwrap();
            let mut buf = [0u8; 1];
            flash.read(0, 0, &mut buf).unwrap();
            assert_eq!(buf, [0x0F]);
            flash.write(0, 0, &[0xF0]).unwrap();
            flash.read(0, 0, &mut buf).unwrap();
            assert_eq!(buf, [0x00]);
            flash.erase(0).unwrap();
            flash.read(0, 0, &mut buf).unwrap();
            assert_eq!(buf, [0xFF]);
        }
    }
}
