use std::io::{Read, Seek, SeekFrom};

use crate::errors::Result;
use crate::vsi::VsiFile;

const MASKED_BOXES: [&[u8; 4]; 2] = [b"pclr", b"cmap"];

/// Byte stream handed to the codec, backed by a [`VsiFile`].
///
/// The stream is rewound to the start of the resource on creation. Reads that
/// start at offset 0 hide the palette boxes from the codec, so tiles are always
/// returned as raw indices.
pub struct CodecStream<'f> {
    file: &'f mut VsiFile,
    length: u64,
}

impl<'f> CodecStream<'f> {
    pub fn new(file: &'f mut VsiFile) -> Result<Self> {
        let length = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(0))?;
        Ok(CodecStream { file, length })
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn tell(&mut self) -> u64 {
        self.file.tell().unwrap_or(self.length)
    }

    /// Read up to `buf.len()` bytes, `None` at end of stream or on error.
    pub fn read(&mut self, buf: &mut [u8]) -> Option<usize> {
        let offset_before = self.tell();
        let n = match self.file.read(buf) {
            Ok(0) | Err(_) => return None,
            Ok(n) => n,
        };
        if offset_before == 0 && n >= 4 {
            mask_palette_boxes(&mut buf[..n]);
        }
        Some(n)
    }

    /// Fill `buf` completely, `false` if the stream ends first.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> bool {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read(&mut buf[filled..]) {
                Some(n) => filled += n,
                None => return false,
            }
        }
        true
    }

    pub fn seek(&mut self, offset: u64) -> bool {
        self.file.seek(SeekFrom::Start(offset)).is_ok()
    }

    /// Move `n` bytes forward (or backward), returning `n`.
    pub fn skip(&mut self, n: i64) -> i64 {
        let target = self.tell().saturating_add_signed(n);
        // A failed skip surfaces on the next read.
        let _ = self.file.seek(SeekFrom::Start(target));
        n
    }
}

fn mask_palette_boxes(buf: &mut [u8]) {
    for i in 0..=buf.len() - 4 {
        if MASKED_BOXES.iter().any(|name| buf[i..i + 4] == name[..]) {
            buf[i..i + 4].copy_from_slice(b"XXXX");
        }
    }
}
