//! Permit file and shared-secret file parsing (§4.4, §9).
//!
//! Permit file is INI-style with two sections:
//!   `[perms]` lines `user=cmdlist` (comma-separated command numbers)
//!   `[files]` lines `user=glob rwbits` (one glob-permit per line; a
//!   user may repeat across multiple lines to grant several globs)

use std::{collections::HashMap, fs, path::Path};

use gpio_core::bus::file::glob_match;
use gpio_core::{Error, ErrorKind, Result};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileRw: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

#[derive(Debug, Clone)]
struct FilePermit {
    glob: String,
    rw: FileRw,
}

#[derive(Debug, Default)]
struct UserPermit {
    commands: std::collections::HashSet<u32>,
    files: Vec<FilePermit>,
}

/// Parsed permit file plus the shared-secret table, held for the life
/// of the daemon process.
#[derive(Default)]
pub struct PermitSet {
    users: HashMap<String, UserPermit>,
    secrets: HashMap<String, String>,
    default_commands: std::collections::HashSet<u32>,
}

impl PermitSet {
    /// A daemon started with no `--permit-file` grants the built-in
    /// user `""` every command (§4.4: "configurable at daemon start";
    /// the unconfigured default is permissive, matching a trusted
    /// single-operator SBC).
    pub fn open_default() -> Self {
        let mut s = Self::default();
        s.default_commands = (0..=127).collect();
        s
    }

    pub fn load(permit_path: &Path, secret_path: Option<&Path>) -> Result<Self> {
        let mut set = Self::default();
        let text = fs::read_to_string(permit_path).map_err(|e| {
            Error::with_source(ErrorKind::NoFileAccess, "reading permit file", e)
        })?;
        set.parse_permits(&text)?;
        if let Some(path) = secret_path {
            let text = fs::read_to_string(path)
                .map_err(|e| Error::with_source(ErrorKind::NoFileAccess, "reading secret file", e))?;
            set.parse_secrets(&text);
        }
        Ok(set)
    }

    fn parse_permits(&mut self, text: &str) -> Result<()> {
        let mut section = "";
        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            if line.starts_with('[') && line.ends_with(']') {
                section = &line[1..line.len() - 1];
                continue;
            }
            let Some((user, rest)) = line.split_once('=') else {
                return Err(Error::new(
                    ErrorKind::BadFileParam,
                    format!("permit file line {}: missing '='", lineno + 1),
                ));
            };
            let user = user.trim().to_string();
            let entry = self.users.entry(user).or_default();
            match section {
                "perms" => {
                    for tok in rest.split(',') {
                        let tok = tok.trim();
                        if tok.is_empty() {
                            continue;
                        }
                        let code: u32 = tok.parse().map_err(|_| {
                            Error::new(ErrorKind::BadFileParam, format!("bad command code {tok:?}"))
                        })?;
                        entry.commands.insert(code);
                    }
                }
                "files" => {
                    let mut parts = rest.split_whitespace();
                    let glob = parts
                        .next()
                        .ok_or_else(|| Error::new(ErrorKind::BadFileParam, "missing glob"))?
                        .to_string();
                    let rwbits = parts.next().unwrap_or("r");
                    let mut rw = FileRw::empty();
                    if rwbits.contains('r') {
                        rw |= FileRw::READ;
                    }
                    if rwbits.contains('w') {
                        rw |= FileRw::WRITE;
                    }
                    entry.files.push(FilePermit { glob, rw });
                }
                _ => {
                    return Err(Error::new(
                        ErrorKind::BadFileParam,
                        format!("permit file line {}: unknown section", lineno + 1),
                    ))
                }
            }
        }
        Ok(())
    }

    fn parse_secrets(&mut self, text: &str) {
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((user, secret)) = line.split_once('=') {
                self.secrets.insert(user.trim().to_string(), secret.trim().to_string());
            }
        }
    }

    pub fn allows(&self, user: &str, command: u32) -> bool {
        match self.users.get(user) {
            Some(p) => p.commands.contains(&command),
            None => self.default_commands.contains(&command),
        }
    }

    pub fn allows_path(&self, user: &str, path: &str, need: FileRw) -> bool {
        match self.users.get(user) {
            Some(p) => p.files.iter().any(|f| f.rw.contains(need) && glob_match(&f.glob, path)),
            None => false,
        }
    }

    /// Checks a shared-secret file entry during `set_user` (§4.4). A
    /// user with no secret entry is accepted unauthenticated, matching
    /// the built-in `""` default user.
    pub fn check_secret(&self, user: &str, offered: &str) -> bool {
        match self.secrets.get(user) {
            Some(expected) => expected == offered,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn perms_section_grants_listed_commands_only() {
        let mut set = PermitSet::default();
        set.parse_permits("[perms]\nalice=0,1,2\n").unwrap();
        assert!(set.allows("alice", 1));
        assert!(!set.allows("alice", 9));
    }

    #[test]
    fn files_section_matches_glob_and_rw_bits() {
        let mut set = PermitSet::default();
        set.parse_permits("[files]\nalice=/home/alice/* rw\nalice=/etc/* r\n").unwrap();
        assert!(set.allows_path("alice", "/home/alice/data.txt", FileRw::WRITE));
        assert!(set.allows_path("alice", "/etc/hosts", FileRw::READ));
        assert!(!set.allows_path("alice", "/etc/hosts", FileRw::WRITE));
    }

    #[test]
    fn unknown_user_falls_back_to_daemon_default() {
        let mut set = PermitSet::default();
        set.default_commands.insert(5);
        assert!(set.allows("nobody", 5));
        assert!(!set.allows("nobody", 6));
    }

    #[test]
    fn secret_file_rejects_wrong_password() {
        let mut set = PermitSet::default();
        set.parse_secrets("alice=hunter2\n");
        assert!(set.check_secret("alice", "hunter2"));
        assert!(!set.check_secret("alice", "wrong"));
        assert!(set.check_secret("bob", "anything"));
    }
}
