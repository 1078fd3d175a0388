//! Steps the child runs inside its fresh namespaces.
//!
//! The bootstrap is a plain list of steps ending in an exec that replaces
//! the process image. Nothing runs after a successful exec, so the child
//! never owns cleanup; unmounting and rootfs removal belong to the parent.

use std::convert::Infallible;
use std::ffi::{CString, OsString};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use minibox_core::error::{BoxError, Result};
use nix::mount::{mount, MsFlags};
use nix::unistd::{chdir, chroot, execve, sethostname};

use super::request::cstring;

/// PATH used when the environment has none.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// One setup action inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapStep {
    /// Stop mount events from propagating back to the host
    PrivateMounts,
    SetHostname(String),
    Chroot(PathBuf),
    Chdir(PathBuf),
    EnsureDir(PathBuf),
    /// Mount a fresh procfs on /proc
    MountProc,
}

impl BootstrapStep {
    fn apply(&self) -> Result<()> {
        tracing::debug!(step = ?self, "Bootstrap step");
        match self {
            BootstrapStep::PrivateMounts => mount(
                None::<&str>,
                "/",
                None::<&str>,
                MsFlags::MS_REC | MsFlags::MS_PRIVATE,
                None::<&str>,
            )
            .map_err(|e| setup_error("make mounts private", e)),
            BootstrapStep::SetHostname(name) => {
                sethostname(name.as_str()).map_err(|e| setup_error("sethostname", e))
            }
            BootstrapStep::Chroot(root) => {
                chroot(root.as_path()).map_err(|e| setup_error(&format!("chroot {}", root.display()), e))
            }
            BootstrapStep::Chdir(dir) => {
                chdir(dir.as_path()).map_err(|e| setup_error(&format!("chdir {}", dir.display()), e))
            }
            BootstrapStep::EnsureDir(dir) => std::fs::create_dir_all(dir).map_err(|e| {
                BoxError::NamespaceSetup(format!("mkdir {}: {}", dir.display(), e))
            }),
            BootstrapStep::MountProc => mount(
                Some("proc"),
                "/proc",
                Some("proc"),
                MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
                None::<&str>,
            )
            .map_err(|e| setup_error("mount /proc", e)),
        }
    }
}

/// The command that finally replaces the child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecTarget {
    pub argv: Vec<String>,
    /// Environment as raw pairs; values need not be UTF-8
    pub env: Vec<(OsString, OsString)>,
}

impl ExecTarget {
    /// PATH value from the target environment. A non-UTF-8 PATH is ignored.
    pub fn path_var(&self) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == "PATH")
            .and_then(|(_, v)| v.to_str())
    }

    /// Resolve the executable under `/` and exec it. Only returns on error.
    fn exec(&self) -> Result<Infallible> {
        let program = self
            .argv
            .first()
            .ok_or_else(|| BoxError::ExecResolution("no command given".to_string()))?;
        let resolved = resolve_executable(program, self.path_var(), Path::new("/"))?;

        let path = cstring(resolved.as_os_str().as_bytes())?;
        let mut argv: Vec<CString> = vec![path.clone()];
        for arg in &self.argv[1..] {
            argv.push(cstring(arg.as_bytes())?);
        }
        let env = self
            .env
            .iter()
            .map(|(k, v)| {
                let mut pair = k.clone();
                pair.push("=");
                pair.push(v);
                cstring(pair.as_bytes())
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(program = %resolved.display(), "Executing container command");
        execve(&path, &argv, &env).map_err(|e| {
            BoxError::ExecResolution(format!("execve {}: {}", resolved.display(), e))
        })
    }
}

/// Ordered setup of the container followed by exec.
#[derive(Debug, Clone)]
pub struct ContainerBootstrap {
    steps: Vec<BootstrapStep>,
    target: ExecTarget,
}

impl ContainerBootstrap {
    /// Standard sequence: hostname, chroot, `/` as cwd, fresh `/proc`, then
    /// the optional working directory.
    pub fn new(
        rootfs: impl Into<PathBuf>,
        hostname: impl Into<String>,
        working_dir: Option<&str>,
        target: ExecTarget,
    ) -> Self {
        let mut steps = vec![
            BootstrapStep::PrivateMounts,
            BootstrapStep::SetHostname(hostname.into()),
            BootstrapStep::Chroot(rootfs.into()),
            BootstrapStep::Chdir(PathBuf::from("/")),
            BootstrapStep::EnsureDir(PathBuf::from("/proc")),
            BootstrapStep::MountProc,
        ];
        if let Some(dir) = working_dir.filter(|d| !d.is_empty() && *d != "/") {
            steps.push(BootstrapStep::EnsureDir(PathBuf::from(dir)));
            steps.push(BootstrapStep::Chdir(PathBuf::from(dir)));
        }
        Self { steps, target }
    }

    pub fn steps(&self) -> &[BootstrapStep] {
        &self.steps
    }

    pub fn target(&self) -> &ExecTarget {
        &self.target
    }

    /// Run every step, then replace the process. Never returns on success.
    pub fn run(self) -> Result<Infallible> {
        for step in &self.steps {
            step.apply()?;
        }
        self.target.exec()
    }
}

/// Find `program` the way a shell would, inside `root`. Returns the path as
/// seen from inside the container.
pub fn resolve_executable(program: &str, path_var: Option<&str>, root: &Path) -> Result<PathBuf> {
    if program.is_empty() {
        return Err(BoxError::ExecResolution("empty command".to_string()));
    }

    if program.contains('/') {
        let candidate = root.join(program.trim_start_matches('/'));
        if is_executable(&candidate) {
            return Ok(PathBuf::from(program));
        }
        return Err(BoxError::ExecResolution(format!(
            "{}: no such executable",
            program
        )));
    }

    let path_var = path_var.filter(|p| !p.is_empty()).unwrap_or(DEFAULT_PATH);
    for dir in path_var.split(':').filter(|d| !d.is_empty()) {
        let candidate = root.join(dir.trim_start_matches('/')).join(program);
        if is_executable(&candidate) {
            return Ok(Path::new(dir).join(program));
        }
    }

    Err(BoxError::ExecResolution(format!(
        "{}: not found in PATH {}",
        program, path_var
    )))
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

fn setup_error(what: &str, err: nix::Error) -> BoxError {
    BoxError::NamespaceSetup(format!("{}: {}", what, err))
}
