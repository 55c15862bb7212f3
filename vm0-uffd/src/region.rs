use std::fs::File;
use std::os::fd::AsFd;

use nix::errno::Errno;
use nix::unistd::{Whence, lseek};
use serde::{Deserialize, Serialize};

/// A guest memory region as reported by the VMM during the handshake.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct MemoryRegion {
    pub base: u64,
    pub size: u64,
    pub offset: u64,
    pub page_size: u64,
}

impl MemoryRegion {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.base + self.size
    }
}

/// A non-hole byte range within the memory file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub offset: u64,
    pub len: u64,
}

/// Walk the whole file once with `SEEK_DATA`/`SEEK_HOLE` to build the list
/// of non-hole extents (§4.5 "Preload" step 4). Sparse files produced by
/// the snapshot maker's hole-punch pass read as a handful of extents
/// rather than one giant data range.
pub fn scan_extents(file: &File, total_len: u64) -> std::io::Result<Vec<Extent>> {
    if total_len == 0 {
        return Ok(Vec::new());
    }

    let fd = file.as_fd();
    let mut extents = Vec::new();
    let mut cursor: i64 = 0;

    while (cursor as u64) < total_len {
        let data_start = match lseek(fd, cursor, Whence::SeekData) {
            Ok(o) => o,
            Err(Errno::ENXIO) => break,
            Err(e) => return Err(e.into()),
        };

        let data_end = match lseek(fd, data_start, Whence::SeekHole) {
            Ok(o) => o,
            Err(Errno::ENXIO) => total_len as i64,
            Err(e) => return Err(e.into()),
        };

        extents.push(Extent {
            offset: data_start as u64,
            len: (data_end - data_start) as u64,
        });
        cursor = data_end;
    }

    Ok(extents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::fcntl::{FallocateFlags, fallocate};
    use std::io::{Seek, SeekFrom, Write};

    #[test]
    fn region_contains_checks_bounds() {
        let region = MemoryRegion {
            base: 0x1000,
            size: 0x2000,
            offset: 0,
            page_size: 4096,
        };
        assert!(region.contains(0x1000));
        assert!(region.contains(0x2fff));
        assert!(!region.contains(0x3000));
        assert!(!region.contains(0x0fff));
    }

    #[test]
    fn scan_extents_finds_data_around_a_punched_hole() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("{e}"));
        let path = dir.path().join("mem");

        let chunk = 1024 * 1024;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap_or_else(|e| panic!("{e}"));
        file.write_all(&vec![7u8; chunk]).unwrap_or_else(|e| panic!("{e}"));
        file.write_all(&vec![0u8; chunk]).unwrap_or_else(|e| panic!("{e}"));
        file.write_all(&vec![7u8; chunk]).unwrap_or_else(|e| panic!("{e}"));
        file.seek(SeekFrom::Start(0)).unwrap_or_else(|e| panic!("{e}"));

        fallocate(
            file.as_fd(),
            FallocateFlags::FALLOC_FL_PUNCH_HOLE | FallocateFlags::FALLOC_FL_KEEP_SIZE,
            chunk as i64,
            chunk as i64,
        )
        .unwrap_or_else(|e| panic!("{e}"));

        let len = file.metadata().unwrap_or_else(|e| panic!("{e}")).len();
        let extents = scan_extents(&file, len).unwrap_or_else(|e| panic!("{e}"));

        assert!(!extents.is_empty());
        assert!(extents.iter().any(|e| e.offset == 0));
        let total_data: u64 = extents.iter().map(|e| e.len).sum();
        assert!(total_data < len, "hole-punched region should not appear as data");
    }

    #[test]
    fn scan_extents_on_empty_file_is_empty() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("{e}"));
        let path = dir.path().join("mem");
        let file = std::fs::File::create(&path).unwrap_or_else(|e| panic!("{e}"));
        assert!(scan_extents(&file, 0).unwrap_or_else(|e| panic!("{e}")).is_empty());
    }
}
