//! Virtual file access
//!
//! Resources are addressed by name. Names starting with `/vsimem/` refer to
//! in-memory files registered with [`create_mem_file`]; everything else is
//! opened from disk. Every call to [`open`] yields an independent handle with
//! its own position, which is what lets prefetch workers read concurrently.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::RwLock;

use crate::errors::{Jp2Error, Result};

const MEM_PREFIX: &str = "/vsimem/";

static MEM_FILES: Lazy<RwLock<HashMap<PathBuf, Arc<[u8]>>>> = Lazy::new(Default::default);

fn is_mem_path(path: &Path) -> bool {
    path.starts_with(MEM_PREFIX)
}

/// Creates a new in-memory file from a given buffer.
///
/// An existing file of the same name is replaced; handles already opened on
/// it keep reading the old content.
pub fn create_mem_file<P: AsRef<Path>>(file_name: P, data: Vec<u8>) -> Result<()> {
    let file_name = file_name.as_ref();
    if !is_mem_path(file_name) {
        return Err(Jp2Error::BadArgument(format!(
            "In-memory file names must start with {MEM_PREFIX}: {}",
            file_name.display()
        )));
    }
    MEM_FILES
        .write()
        .insert(file_name.to_path_buf(), Arc::from(data));
    Ok(())
}

/// Unlink a file in the memory filesystem.
pub fn unlink_mem_file<P: AsRef<Path>>(file_name: P) -> Result<()> {
    let file_name = file_name.as_ref();
    match MEM_FILES.write().remove(file_name) {
        Some(_) => Ok(()),
        None => Err(Jp2Error::Open {
            name: file_name.display().to_string(),
            source: io::ErrorKind::NotFound.into(),
        }),
    }
}

/// Copies the bytes of the in-memory file `file_name`.
pub fn get_mem_file_bytes<P: AsRef<Path>>(file_name: P) -> Result<Vec<u8>> {
    let file_name = file_name.as_ref();
    MEM_FILES
        .read()
        .get(file_name)
        .map(|data| data.to_vec())
        .ok_or_else(|| Jp2Error::Open {
            name: file_name.display().to_string(),
            source: io::ErrorKind::NotFound.into(),
        })
}

enum Handle {
    Disk(BufReader<File>),
    Memory(Cursor<Arc<[u8]>>),
}

/// A read-only, seekable handle on a named resource.
pub struct VsiFile {
    name: String,
    handle: Handle,
}

/// Open `name` for reading.
pub fn open<P: AsRef<Path>>(name: P) -> Result<VsiFile> {
    let path = name.as_ref();
    let display = path.display().to_string();
    let handle = if is_mem_path(path) {
        let data = MEM_FILES.read().get(path).cloned();
        match data {
            Some(data) => Handle::Memory(Cursor::new(data)),
            None => {
                return Err(Jp2Error::Open {
                    name: display,
                    source: io::ErrorKind::NotFound.into(),
                })
            }
        }
    } else {
        let file = File::open(path).map_err(|source| Jp2Error::Open {
            name: display.clone(),
            source,
        })?;
        Handle::Disk(BufReader::new(file))
    };
    Ok(VsiFile {
        name: display,
        handle,
    })
}

impl VsiFile {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current offset from the start of the resource.
    pub fn tell(&mut self) -> io::Result<u64> {
        self.stream_position()
    }

    /// Total length in bytes. The current position is preserved.
    pub fn length(&mut self) -> io::Result<u64> {
        let position = self.tell()?;
        let length = self.seek(SeekFrom::End(0))?;
        self.seek(SeekFrom::Start(position))?;
        Ok(length)
    }
}

impl Read for VsiFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.handle {
            Handle::Disk(reader) => reader.read(buf),
            Handle::Memory(cursor) => cursor.read(buf),
        }
    }
}

impl Seek for VsiFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match &mut self.handle {
            Handle::Disk(reader) => reader.seek(pos),
            Handle::Memory(cursor) => cursor.seek(pos),
        }
    }
}

impl std::fmt::Debug for VsiFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VsiFile").field("name", &self.name).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn create_and_retrieve_mem_file() {
        let file_name = "/vsimem/525ebf24-a030-4677-bb4e-a921741cabe0";

        create_mem_file(file_name, vec![1_u8, 2, 3, 4]).unwrap();

        let bytes = get_mem_file_bytes(file_name).unwrap();
        assert_eq!(bytes, vec![1_u8, 2, 3, 4]);

        unlink_mem_file(file_name).unwrap();
        assert!(get_mem_file_bytes(file_name).is_err());
    }

    #[test]
    fn mem_file_name_must_be_prefixed() {
        assert!(matches!(
            create_mem_file("not-a-vsimem-name", vec![]),
            Err(Jp2Error::BadArgument(_))
        ));
    }

    #[test]
    fn unable_to_unlink_missing_mem_file() {
        let err = unlink_mem_file("/vsimem/no-such-file").unwrap_err();
        assert!(matches!(err, Jp2Error::Open { .. }));
    }

    #[test]
    fn handles_are_independent() {
        let file_name = "/vsimem/independent-handles";
        create_mem_file(file_name, (0..16).collect()).unwrap();

        let mut a = open(file_name).unwrap();
        let mut b = open(file_name).unwrap();
        a.seek(SeekFrom::Start(10)).unwrap();

        let mut byte = [0_u8; 1];
        b.read_exact(&mut byte).unwrap();
        assert_eq!(byte[0], 0);
        a.read_exact(&mut byte).unwrap();
        assert_eq!(byte[0], 10);
        assert_eq!(a.tell().unwrap(), 11);
        assert_eq!(a.length().unwrap(), 16);
        assert_eq!(a.tell().unwrap(), 11);

        // unlinking does not invalidate open handles
        unlink_mem_file(file_name).unwrap();
        a.read_exact(&mut byte).unwrap();
        assert_eq!(byte[0], 11);
        assert!(open(file_name).is_err());
    }

    #[test]
    fn open_disk_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"\xff\x4f\xff\x51").unwrap();
        file.flush().unwrap();

        let mut handle = open(file.path()).unwrap();
        assert_eq!(handle.length().unwrap(), 4);
        let mut content = Vec::new();
        handle.read_to_end(&mut content).unwrap();
        assert_eq!(content, b"\xff\x4f\xff\x51");

        assert!(matches!(
            open(file.path().with_extension("missing")),
            Err(Jp2Error::Open { .. })
        ));
    }
}
