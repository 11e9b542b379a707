//! Read-only memory-mapped view of an on-disk text file. Used by the
//! devices-file and environ-file readers, and by the cgroup `tasks`
//! reader.

use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr;

use libc;
use log::info;

use super::err::{Error, Result};

pub struct MapFile {
    filename: PathBuf,
    base: *mut libc::c_void,
    size: usize,
    _file: std::fs::File,
}

impl MapFile {
    /// Open and map `path`. An empty file maps to an empty `MapFile`
    /// rather than failing; `quiet` suppresses the informational log
    /// message for that case (used by the cgroup tasks reader, which
    /// treats an empty `tasks` file as routine).
    pub fn open<P: AsRef<Path>>(path: P, quiet: bool) -> Result<Self> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|e| Error::file("open", path, e))?;
        let meta = file.metadata().map_err(|e| Error::file("fstat", path, e))?;
        let size = meta.len() as usize;

        if size == 0 {
            if !quiet {
                info!("file {} is empty", path.display());
            }
            return Ok(MapFile {
                filename: path.to_path_buf(),
                base: ptr::null_mut(),
                size: 0,
                _file: file,
            });
        }

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::last_file_error("mmap", path));
        }

        Ok(MapFile {
            filename: path.to_path_buf(),
            base,
            size,
            _file: file,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        if self.size == 0 {
            &[]
        } else {
            unsafe { std::slice::from_raw_parts(self.base as *const u8, self.size) }
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        std::str::from_utf8(self.as_bytes()).map_err(|_| Error::parse("not utf-8", &self.filename))
    }

    /// Lines, tolerant of a missing trailing newline on the last line.
    pub fn lines(&self) -> Result<std::str::Lines<'_>> {
        Ok(self.as_str()?.lines())
    }
}

impl Drop for MapFile {
    fn drop(&mut self) {
        if self.size > 0 {
            unsafe {
                libc::munmap(self.base, self.size);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn maps_content() {
        let mut tmp = tempfile();
        tmp.1.write_all(b"line one\nline two\n").unwrap();
        let map = MapFile::open(&tmp.0, false).unwrap();
        let lines: Vec<&str> = map.lines().unwrap().collect();
        assert_eq!(lines, vec!["line one", "line two"]);
    }

    #[test]
    fn empty_file_is_empty() {
        let tmp = tempfile();
        let map = MapFile::open(&tmp.0, true).unwrap();
        assert!(map.is_empty());
        assert_eq!(map.lines().unwrap().count(), 0);
    }

    fn tempfile() -> (PathBuf, std::fs::File) {
        let path = std::env::temp_dir().join(format!("isolate-mapfile-test-{}", std::process::id()));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .unwrap();
        (path, file)
    }
}
