//! Description of the isolated process to create.

use std::ffi::{CString, OsString};
use std::fmt;
use std::os::unix::ffi::OsStrExt;

use minibox_core::error::{BoxError, Result};
use nix::sched::CloneFlags;
use nix::unistd::{getgid, getuid};

/// Namespaces the container process gets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceSet {
    pub pid: bool,
    pub uts: bool,
    pub net: bool,
    pub user: bool,
    pub mount: bool,
}

impl Default for NamespaceSet {
    fn default() -> Self {
        Self {
            pid: true,
            uts: true,
            net: true,
            user: true,
            mount: true,
        }
    }
}

impl NamespaceSet {
    /// Convert to CloneFlags for clone().
    pub fn to_clone_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::empty();

        if self.pid {
            flags |= CloneFlags::CLONE_NEWPID;
        }
        if self.uts {
            flags |= CloneFlags::CLONE_NEWUTS;
        }
        if self.net {
            flags |= CloneFlags::CLONE_NEWNET;
        }
        if self.user {
            flags |= CloneFlags::CLONE_NEWUSER;
        }
        if self.mount {
            flags |= CloneFlags::CLONE_NEWNS;
        }

        flags
    }
}

/// One line of `/proc/<pid>/uid_map` or `gid_map`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMap {
    /// First id inside the namespace
    pub inside: u32,
    /// First id on the host
    pub outside: u32,
    pub count: u32,
}

impl IdMap {
    /// Map namespace root to `host_id`.
    pub fn root_to(host_id: u32) -> Self {
        Self {
            inside: 0,
            outside: host_id,
            count: 1,
        }
    }
}

impl fmt::Display for IdMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {} {}", self.inside, self.outside, self.count)
    }
}

/// Everything needed to start the re-executed `child` process.
#[derive(Debug, Clone)]
pub struct IsolationRequest {
    pub namespaces: NamespaceSet,
    pub uid_map: IdMap,
    pub gid_map: IdMap,
    /// Write "deny" to setgroups before the gid map
    pub deny_setgroups: bool,
    /// Make the process a session leader
    pub new_session: bool,
    /// Full argv of the re-executed process
    pub argv: Vec<String>,
    /// Environment; `None` passes the current environment through
    pub env: Option<Vec<(String, String)>>,
}

impl IsolationRequest {
    /// Request mapping namespace root to the invoking user.
    pub fn for_current_user(argv: Vec<String>, env: Option<Vec<(String, String)>>) -> Self {
        Self {
            namespaces: NamespaceSet::default(),
            uid_map: IdMap::root_to(getuid().as_raw()),
            gid_map: IdMap::root_to(getgid().as_raw()),
            deny_setgroups: true,
            new_session: true,
            argv,
            env,
        }
    }

    /// argv as C strings for execve.
    pub fn argv_cstrings(&self) -> Result<Vec<CString>> {
        if self.argv.is_empty() {
            return Err(BoxError::NamespaceSetup("empty child argv".to_string()));
        }
        self.argv.iter().map(|a| cstring(a.as_bytes())).collect()
    }

    /// Environment as `KEY=VALUE` C strings for execve.
    pub fn env_cstrings(&self) -> Result<Vec<CString>> {
        match &self.env {
            Some(vars) => vars
                .iter()
                .map(|(k, v)| cstring(format!("{}={}", k, v).as_bytes()))
                .collect(),
            None => std::env::vars_os()
                .map(|(k, v)| {
                    let mut pair = OsString::from(k);
                    pair.push("=");
                    pair.push(v);
                    cstring(pair.as_bytes())
                })
                .collect(),
        }
    }
}

pub(crate) fn cstring(bytes: &[u8]) -> Result<CString> {
    CString::new(bytes).map_err(|_| {
        BoxError::NamespaceSetup(format!(
            "argument contains a NUL byte: {}",
            String::from_utf8_lossy(bytes)
        ))
    })
}
