//! Command execution inside jails via jail_attach(2)
//!
//! Instead of spawning jexec(8), the child process attaches to the jail
//! with the native syscall and execs the command directly, with stdout and
//! stderr captured through pipes. A passthru variant hands the controlling
//! tty to the command for interactive sessions.

use crate::error::{Error, Result};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{close, fork, pipe, ForkResult};
use std::ffi::CString;
use std::io::Read;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::process::Command;

// FreeBSD jail syscall missing from the libc crate
unsafe extern "C" {
    fn jail_attach(jid: libc::c_int) -> libc::c_int;
}

/// Output of a command executed in a jail
#[derive(Debug)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Execute a command inside a jail, capturing its output
///
/// `env` is applied in the child before the command runs.
pub fn jexec_with_output(
    jid: i32,
    command: &[String],
    env: &[(String, String)],
) -> Result<ExecOutput> {
    if command.is_empty() {
        return Err(Error::CommandFailure {
            command: "jexec".to_string(),
            message: "empty command".to_string(),
        });
    }

    let (stdout_read, stdout_write) = pipe().map_err(|e| Error::CommandFailure {
        command: "jexec".to_string(),
        message: format!("failed to create stdout pipe: {}", e),
    })?;
    let (stderr_read, stderr_write) = pipe().map_err(|e| Error::CommandFailure {
        command: "jexec".to_string(),
        message: format!("failed to create stderr pipe: {}", e),
    })?;

    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            close(stdout_write.as_raw_fd()).ok();
            close(stderr_write.as_raw_fd()).ok();

            let stdout = read_fd_to_end(stdout_read.as_raw_fd());
            close(stdout_read.as_raw_fd()).ok();
            let stderr = read_fd_to_end(stderr_read.as_raw_fd());
            close(stderr_read.as_raw_fd()).ok();

            match waitpid(child, None) {
                Ok(WaitStatus::Exited(_, exit_code)) => Ok(ExecOutput {
                    exit_code,
                    stdout,
                    stderr,
                }),
                Ok(WaitStatus::Signaled(_, signal, _)) => Err(Error::CommandFailure {
                    command: format!("jexec {} {:?}", jid, command),
                    message: format!("process killed by signal {:?}", signal),
                }),
                Ok(status) => Err(Error::CommandFailure {
                    command: format!("jexec {} {:?}", jid, command),
                    message: format!("unexpected wait status: {:?}", status),
                }),
                Err(e) => Err(Error::CommandFailure {
                    command: format!("jexec {} {:?}", jid, command),
                    message: format!("waitpid failed: {}", e),
                }),
            }
        }
        Ok(ForkResult::Child) => {
            close(stdout_read.as_raw_fd()).ok();
            close(stderr_read.as_raw_fd()).ok();

            unsafe {
                libc::dup2(stdout_write.as_raw_fd(), 1);
                libc::dup2(stderr_write.as_raw_fd(), 2);
            }
            close(stdout_write.as_raw_fd()).ok();
            close(stderr_write.as_raw_fd()).ok();

            let result = unsafe { jail_attach(jid) };
            if result != 0 {
                eprintln!(
                    "jail_attach({}) failed: {}",
                    jid,
                    std::io::Error::last_os_error()
                );
                std::process::exit(1);
            }

            // SAFETY: single-threaded forked child
            for (key, value) in env {
                unsafe { std::env::set_var(key, value) };
            }

            let mut args: Vec<CString> = Vec::new();
            for arg in command {
                match CString::new(arg.as_str()) {
                    Ok(s) => args.push(s),
                    Err(e) => {
                        eprintln!("invalid argument string: {}", e);
                        std::process::exit(1);
                    }
                }
            }

            let mut arg_ptrs: Vec<*const libc::c_char> =
                args.iter().map(|s| s.as_ptr()).collect();
            arg_ptrs.push(std::ptr::null());

            unsafe {
                libc::execvp(args[0].as_ptr(), arg_ptrs.as_ptr());
            }

            eprintln!("execvp failed: {}", std::io::Error::last_os_error());
            std::process::exit(127);
        }
        Err(e) => Err(Error::CommandFailure {
            command: "jexec".to_string(),
            message: format!("fork failed: {}", e),
        }),
    }
}

/// Execute a command inside a jail with the controlling tty attached
///
/// Used for interactive consoles; output goes straight to the user.
pub fn jexec_passthru(jid: i32, command: &[String], env: &[(String, String)]) -> Result<i32> {
    if command.is_empty() {
        return Err(Error::CommandFailure {
            command: "jexec".to_string(),
            message: "empty command".to_string(),
        });
    }

    let mut jexec = Command::new("/usr/sbin/jexec");
    jexec.arg(jid.to_string()).args(command);
    for (key, value) in env {
        jexec.env(key, value);
    }

    let status = jexec.status().map_err(|e| Error::CommandFailure {
        command: format!("jexec {} {:?}", jid, command),
        message: e.to_string(),
    })?;

    Ok(status.code().unwrap_or(-1))
}

fn read_fd_to_end(fd: RawFd) -> Vec<u8> {
    let mut buffer = Vec::new();
    let mut file = unsafe { std::fs::File::from_raw_fd(fd) };
    file.read_to_end(&mut buffer).ok();
    std::mem::forget(file); // the caller closes the fd
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore] // Requires a running jail with JID 1
    fn test_jexec_basic() {
        let output = jexec_with_output(
            1,
            &["echo".to_string(), "hello".to_string()],
            &[],
        )
        .unwrap();
        assert_eq!(output.exit_code, 0);
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "hello");
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(jexec_with_output(1, &[], &[]).is_err());
        assert!(jexec_passthru(1, &[], &[]).is_err());
    }
}
