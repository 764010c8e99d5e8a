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

//! On-media filename handling.
//!
//! Filenames live in a fixed-width, NUL-terminated field inside the file-node.
//! Name comparison is ASCII case-insensitive everywhere in the engine.

/// Maximum filename length, excluding the NUL terminator.
pub const MAX_FILENAME_LENGTH: usize = 64;

/// Width of the on-media filename field (name bytes plus NUL terminator).
pub const FILENAME_FIELD: usize = MAX_FILENAME_LENGTH + 1;

/// Display name substituted for a file-node whose name has not been written
/// yet (a file still being created).
pub const NEW_FILE_NAME: &str = "[New File]";

/// Encodes a name into the fixed on-media field.
///
/// Names longer than [`MAX_FILENAME_LENGTH`] are silently truncated. The
/// remainder of the field is zero, which keeps the terminator writable on
/// erased flash.
///
/// [`MAX_FILENAME_LENGTH`]: constant.MAX_FILENAME_LENGTH.html
pub fn encode(name: &str) -> [u8; FILENAME_FIELD] {
    let mut field = [0u8; FILENAME_FIELD];
    let bytes = name.as_bytes();
    let len = core::cmp::min(bytes.len(), MAX_FILENAME_LENGTH);
    field[..len].copy_from_slice(&bytes[..len]);
    field
}

/// Returns the name bytes of a filename field, up to its NUL terminator.
///
/// A field with no terminator (corrupt media) is returned whole.
pub fn decode(field: &[u8]) -> &[u8] {
    match field.iter().position(|&b| b == 0) {
        Some(n) => &field[..n],
        None => field,
    }
}

/// Compares two names, ASCII case-insensitively.
pub fn eq_ignore_case(a: &[u8], b: &[u8]) -> bool {
    a.eq_ignore_ascii_case(b)
}
