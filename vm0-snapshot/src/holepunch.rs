use std::io::{Read, Seek, SeekFrom};
use std::os::fd::AsFd;
use std::path::Path;

use nix::fcntl::{FallocateFlags, fallocate};

const CHUNK_SIZE: usize = 1024 * 1024;

/// Scan `path` in 1 MiB chunks and punch a hole over every chunk that is
/// entirely zero. Non-fatal to the caller by design (§4.4 edge cases):
/// restore still works against a dense memory file, merely slower.
///
/// Returns the number of chunks punched.
pub fn punch_zero_chunks(path: &Path) -> std::io::Result<u64> {
    let mut file = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
    let len = file.metadata()?.len();

    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut offset: u64 = 0;
    let mut punched = 0u64;

    while offset < len {
        let want = CHUNK_SIZE.min((len - offset) as usize);
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf[..want])?;

        if buf[..want].iter().all(|&b| b == 0) {
            fallocate(
                file.as_fd(),
                FallocateFlags::FALLOC_FL_PUNCH_HOLE | FallocateFlags::FALLOC_FL_KEEP_SIZE,
                offset as i64,
                want as i64,
            )
            .map_err(std::io::Error::from)?;
            punched += 1;
        }

        offset += want as u64;
    }

    Ok(punched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn punches_zero_chunks_and_skips_data_chunks() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("{e}"));
        let path = dir.path().join("mem");

        let mut file = std::fs::File::create(&path).unwrap_or_else(|e| panic!("{e}"));
        file.write_all(&vec![0u8; CHUNK_SIZE]).unwrap_or_else(|e| panic!("{e}"));
        file.write_all(&vec![7u8; CHUNK_SIZE]).unwrap_or_else(|e| panic!("{e}"));
        drop(file);

        let punched = punch_zero_chunks(&path).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(punched, 1);

        // Logical size must be unchanged.
        let meta = std::fs::metadata(&path).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(meta.len(), (CHUNK_SIZE * 2) as u64);
    }

    #[test]
    fn handles_a_trailing_partial_chunk() {
        let dir = tempfile::tempdir().unwrap_or_else(|e| panic!("{e}"));
        let path = dir.path().join("mem");

        let mut file = std::fs::File::create(&path).unwrap_or_else(|e| panic!("{e}"));
        file.write_all(&vec![0u8; CHUNK_SIZE + 100]).unwrap_or_else(|e| panic!("{e}"));
        drop(file);

        let punched = punch_zero_chunks(&path).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(punched, 2);
    }
}
