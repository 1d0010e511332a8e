//! Generic regular-file adapter used by the daemon's `file_open` command:
//! a mode bitmap, seek-whence enum, and shell-style path globbing used
//! both here (to resolve a pattern to one real path) and by the
//! permit system (to check a user's file-glob grants).

use std::{
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use bitflags::bitflags;

use crate::error::{Error, ErrorKind, Result};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileMode: u32 {
        const READ   = 1 << 0;
        const WRITE  = 1 << 1;
        const RW     = Self::READ.bits() | Self::WRITE.bits();
        const APPEND = 1 << 2;
        const CREATE = 1 << 3;
        const TRUNC  = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Start,
    Current,
    End,
}

#[derive(Debug)]
pub struct FileHandle {
    file: File,
    pub mode: FileMode,
}

impl FileHandle {
    pub fn open(path: impl AsRef<Path>, mode: FileMode) -> Result<Self> {
        if !mode.intersects(FileMode::READ | FileMode::WRITE) {
            return Err(Error::new(ErrorKind::BadFileMode, "mode must include READ and/or WRITE"));
        }
        let file = OpenOptions::new()
            .read(mode.contains(FileMode::READ))
            .write(mode.contains(FileMode::WRITE))
            .append(mode.contains(FileMode::APPEND))
            .create(mode.contains(FileMode::CREATE))
            .truncate(mode.contains(FileMode::TRUNC))
            .open(path.as_ref())
            .map_err(|e| Error::with_source(ErrorKind::FileOpenFailed, "opening file", e))?;
        Ok(Self { file, mode })
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.mode.contains(FileMode::READ) {
            return Err(Error::new(ErrorKind::BadFileMode, "handle is not readable"));
        }
        self.file
            .read(buf)
            .map_err(|e| Error::with_source(ErrorKind::BadFileParam, "read failed", e))
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if !self.mode.contains(FileMode::WRITE) {
            return Err(Error::new(ErrorKind::BadFileMode, "handle is not writable"));
        }
        self.file
            .write(buf)
            .map_err(|e| Error::with_source(ErrorKind::BadFileParam, "write failed", e))
    }

    pub fn seek(&mut self, whence: Whence, offset: i64) -> Result<u64> {
        let pos = match whence {
            Whence::Start => SeekFrom::Start(offset.max(0) as u64),
            Whence::Current => SeekFrom::Current(offset),
            Whence::End => SeekFrom::End(offset),
        };
        self.file
            .seek(pos)
            .map_err(|e| Error::with_source(ErrorKind::BadFileSeek, "seek failed", e))
    }
}

/// Resolves a shell-style glob against the filesystem, returning every
/// matching path. Used both to open `file_open("*.log")`-style patterns
/// and, by the daemon's permit system, to check a requested path
/// against a user's glob grant.
pub fn glob_match(pattern: &str, candidate: &str) -> bool {
    glob_match_bytes(pattern.as_bytes(), candidate.as_bytes())
}

fn glob_match_bytes(pattern: &[u8], text: &[u8]) -> bool {
    match (pattern.first(), text.first()) {
        (None, None) => true,
        (Some(b'*'), _) => {
            glob_match_bytes(&pattern[1..], text)
                || (!text.is_empty() && glob_match_bytes(pattern, &text[1..]))
        }
        (Some(b'?'), Some(_)) => glob_match_bytes(&pattern[1..], &text[1..]),
        (Some(&p), Some(&t)) if p == t => glob_match_bytes(&pattern[1..], &text[1..]),
        _ => false,
    }
}

/// Expands a glob to the set of paths on disk that currently match it,
/// for `file_open` with a non-literal pattern.
pub fn expand(pattern: &str) -> Result<Vec<PathBuf>> {
    let path = Path::new(pattern);
    let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
    let file_pattern = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::new(ErrorKind::NoFileMatch, "invalid glob pattern"))?;

    let entries = std::fs::read_dir(dir)
        .map_err(|e| Error::with_source(ErrorKind::NoFileMatch, "listing directory", e))?;
    let mut matches = Vec::new();
    for entry in entries.flatten() {
        if let Some(name) = entry.file_name().to_str() {
            if glob_match(file_pattern, name) {
                matches.push(entry.path());
            }
        }
    }
    if matches.is_empty() {
        return Err(Error::new(ErrorKind::NoFileMatch, format!("no file matches '{pattern}'")));
    }
    matches.sort();
    Ok(matches)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matches_star_and_question_mark() {
        assert!(glob_match("*.log", "daemon.log"));
        assert!(!glob_match("*.log", "daemon.txt"));
        assert!(glob_match("line?.txt", "line5.txt"));
        assert!(!glob_match("line?.txt", "line55.txt"));
    }

    #[test]
    fn expand_finds_matching_files_in_a_temp_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.log"), b"").unwrap();
        std::fs::write(dir.path().join("b.log"), b"").unwrap();
        std::fs::write(dir.path().join("c.txt"), b"").unwrap();
        let pattern = dir.path().join("*.log");
        let matches = expand(pattern.to_str().unwrap()).unwrap();
        assert_eq!(matches.len(), 2);
    }

    #[test]
    fn mode_without_read_or_write_is_rejected() {
        let err = FileHandle::open("/dev/null", FileMode::APPEND).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadFileMode);
    }
}
