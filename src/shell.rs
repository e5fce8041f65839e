//! Contract with the host-process bridge
//!
//! The install argument names a live shell command in the host process; the
//! bridge resolves it and hands out the fds behind it. `None` stands for the
//! bridge's "absent" (-1) answers.

use std::os::fd::OwnedFd;

/// Opaque handle to a resolved shell command.
#[derive(Clone, Debug)]
pub struct ShellHandle(pub u64);

pub trait ShellCommandConnector: Send + Sync {
    /// Resolve the install argument to a live shell command.
    fn lookup_shell_command(&self, args: &str) -> Option<ShellHandle>;

    /// The install's single piped input.
    fn get_stdin(&self, cmd: &ShellHandle) -> Option<OwnedFd>;

    /// A file staged next to the shell command.
    fn get_local_file(&self, cmd: &ShellHandle, path: &str) -> Option<OwnedFd>;
}
