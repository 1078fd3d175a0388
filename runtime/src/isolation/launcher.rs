//! Parent side of container creation.
//!
//! The parent clones a child into new namespaces. The child blocks on a pipe
//! until the parent has written its id maps and wired its network, then
//! re-executes this binary with the `child` directive. The parent forwards
//! interrupts to the child's process group and reaps it.

use std::ffi::{c_char, CString};
use std::os::fd::{AsRawFd, OwnedFd};

use minibox_core::error::{BoxError, Result};
use nix::fcntl::OFlag;
use nix::sched::clone;
use nix::sys::signal::{kill, killpg, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{pipe2, Pid};

use super::request::IsolationRequest;
use crate::network::{NetworkBridge, NetworkSetup};

const CHILD_STACK_SIZE: usize = 1024 * 1024;

/// Re-executed image; stays valid even if the binary is replaced on disk.
const SELF_EXE: &str = "/proc/self/exe";

/// A running container.
#[derive(Debug)]
pub struct ContainerProcess {
    pid: Pid,
    network: Option<NetworkSetup>,
}

impl ContainerProcess {
    /// Host PID of the container init.
    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    pub fn network(&self) -> Option<&NetworkSetup> {
        self.network.as_ref()
    }

    /// Send SIGINT to the container's process group on every host interrupt.
    pub fn forward_interrupts(&self) -> tokio::task::JoinHandle<()> {
        let pid = self.pid;
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                tracing::debug!(pid = pid.as_raw(), "Forwarding interrupt to container");
                if let Err(e) = killpg(pid, Signal::SIGINT) {
                    tracing::debug!(error = %e, "Failed to forward interrupt");
                    break;
                }
            }
        })
    }

    /// Wait for the container to exit. A non-zero exit is an error.
    pub async fn wait(&self) -> Result<()> {
        let pid = self.pid;
        let status = tokio::task::spawn_blocking(move || loop {
            match waitpid(pid, None) {
                Err(nix::errno::Errno::EINTR) => continue,
                other => break other,
            }
        })
        .await
        .map_err(|e| BoxError::Other(format!("wait task failed: {}", e)))?
        .map_err(|e| BoxError::Other(format!("waitpid {}: {}", pid, e)))?;

        match status {
            WaitStatus::Exited(_, 0) => {
                tracing::info!(pid = pid.as_raw(), "Container exited");
                Ok(())
            }
            WaitStatus::Exited(_, code) => Err(BoxError::ContainerFailed {
                status: format!("exit code {}", code),
            }),
            WaitStatus::Signaled(_, signal, _) => Err(BoxError::ContainerFailed {
                status: format!("killed by {:?}", signal),
            }),
            other => Err(BoxError::ContainerFailed {
                status: format!("{:?}", other),
            }),
        }
    }
}

/// Starts isolated container processes.
#[derive(Debug, Clone, Default)]
pub struct IsolationLauncher {
    bridge: Option<NetworkBridge>,
}

impl IsolationLauncher {
    /// `bridge` wires the container network before the child is released;
    /// `None` leaves the network namespace empty.
    pub fn new(bridge: Option<NetworkBridge>) -> Self {
        Self { bridge }
    }

    pub fn bridge(&self) -> Option<&NetworkBridge> {
        self.bridge.as_ref()
    }

    /// Launch, forward interrupts, and wait for exit.
    pub async fn run(&self, request: &IsolationRequest) -> Result<()> {
        let process = self.launch(request).await?;
        let forwarder = process.forward_interrupts();
        let result = process.wait().await;
        forwarder.abort();
        result
    }

    /// Create the child and release it once its namespaces are configured.
    pub async fn launch(&self, request: &IsolationRequest) -> Result<ContainerProcess> {
        let (pid, release) = spawn_held_child(request)?;
        tracing::info!(pid = pid.as_raw(), "Container process created");

        if let Err(e) = write_id_maps(pid, request) {
            abort_child(pid);
            return Err(e);
        }

        let network = match &self.bridge {
            Some(bridge) => match bridge.connect(pid.as_raw() as u32).await {
                Ok(setup) => Some(setup),
                Err(e) => {
                    self.abort_launch(pid).await;
                    return Err(e);
                }
            },
            None => None,
        };

        self.release(pid, release).await?;
        Ok(ContainerProcess { pid, network })
    }

    /// Let the held child proceed to exec. On failure the launch is undone.
    async fn release(&self, pid: Pid, release: OwnedFd) -> Result<()> {
        if let Err(e) = nix::unistd::write(&release, &[1u8]) {
            self.abort_launch(pid).await;
            return Err(BoxError::NamespaceSetup(format!(
                "failed to release child: {}",
                e
            )));
        }
        Ok(())
    }

    /// Kill the held child and remove whatever network wiring exists.
    async fn abort_launch(&self, pid: Pid) {
        abort_child(pid);
        if let Some(bridge) = &self.bridge {
            if let Err(e) = bridge.teardown().await {
                tracing::warn!(error = %e, "Network cleanup failed");
            }
        }
    }
}

/// Clone the child into its namespaces. It waits on the returned pipe end
/// before exec.
fn spawn_held_child(request: &IsolationRequest) -> Result<(Pid, OwnedFd)> {
    let exe = CString::new(SELF_EXE).map_err(|e| BoxError::Other(e.to_string()))?;
    let argv = request.argv_cstrings()?;
    let env = request.env_cstrings()?;
    let argv_ptrs = null_terminated(&argv);
    let env_ptrs = null_terminated(&env);

    let (hold_rx, hold_tx) = pipe2(OFlag::O_CLOEXEC)
        .map_err(|e| BoxError::NamespaceSetup(format!("pipe: {}", e)))?;

    let rx = hold_rx.as_raw_fd();
    let tx = hold_tx.as_raw_fd();
    let new_session = request.new_session;
    let exe_ptr = exe.as_ptr();
    let argv_ptr = argv_ptrs.as_ptr();
    let env_ptr = env_ptrs.as_ptr();

    // Runs in the copied address space of a multi-threaded parent: only
    // async-signal-safe calls until execve.
    let child_main = Box::new(move || -> isize {
        unsafe {
            libc::close(tx);
            let mut byte = 0u8;
            let n = loop {
                let r = libc::read(rx, &mut byte as *mut u8 as *mut libc::c_void, 1);
                if r < 0 && std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                break r;
            };
            if n != 1 {
                libc::_exit(1);
            }
            if new_session && libc::setsid() < 0 {
                libc::_exit(1);
            }
            libc::execve(exe_ptr, argv_ptr, env_ptr);
            libc::_exit(127)
        }
    });

    let mut stack = vec![0u8; CHILD_STACK_SIZE];
    let flags = request.namespaces.to_clone_flags();
    let pid = unsafe { clone(child_main, &mut stack, flags, Some(Signal::SIGCHLD as i32)) }
        .map_err(|e| BoxError::NamespaceSetup(format!("clone: {}", e)))?;

    drop(hold_rx);
    Ok((pid, hold_tx))
}

/// Configure the user namespace of `pid` from the host side.
fn write_id_maps(pid: Pid, request: &IsolationRequest) -> Result<()> {
    if !request.namespaces.user {
        return Ok(());
    }

    let proc_dir = format!("/proc/{}", pid);
    let write = |file: &str, content: String| {
        std::fs::write(format!("{}/{}", proc_dir, file), &content).map_err(|e| {
            BoxError::NamespaceSetup(format!("write {}/{}: {}", proc_dir, file, e))
        })
    };

    if request.deny_setgroups {
        write("setgroups", "deny".to_string())?;
    }
    write("uid_map", request.uid_map.to_string())?;
    write("gid_map", request.gid_map.to_string())?;

    tracing::debug!(
        pid = pid.as_raw(),
        uid_map = %request.uid_map.to_string().trim_end(),
        gid_map = %request.gid_map.to_string().trim_end(),
        "Wrote id maps"
    );
    Ok(())
}

/// Kill a held child and reap it.
fn abort_child(pid: Pid) {
    if let Err(e) = kill(pid, Signal::SIGKILL) {
        tracing::warn!(pid = pid.as_raw(), error = %e, "Failed to kill container process");
        return;
    }
    loop {
        match waitpid(pid, None) {
            Err(nix::errno::Errno::EINTR) => continue,
            _ => break,
        }
    }
}

fn null_terminated(items: &[CString]) -> Vec<*const c_char> {
    items
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}
