//! Fatal boot failures end here.

use crate::BootError;
use nix::errno::Errno;
use nix::unistd::execv;
use std::ffi::CString;
use std::os::fd::AsRawFd;
use std::time::Duration;

const CONSOLE: &str = "/dev/console";
const SHELL: &str = "/bin/sh";

// linux/asm-generic/ioctls.h
const TIOCSCTTY: libc::c_ulong = 0x540E;

/// Report `err` on the console and replace this process with a shell on
/// the console. Never returns; if the shell cannot be started the process
/// sleeps forever so PID 1 does not exit.
pub fn rescue_shell(err: &BootError) -> ! {
    tracing::error!("boot halted: {}", err);
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        tracing::error!("  caused by: {}", cause);
        source = cause.source();
    }

    eprintln!();
    eprintln!("*** guestboot: boot failed ***");
    eprintln!("*** {} ***", err);
    eprintln!("*** dropping to a rescue shell ***");
    eprintln!();

    attach_console();

    let e = exec_shell(SHELL);
    eprintln!("guestboot: exec {} failed: {}", SHELL, e);

    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}

/// Replace this process with `shell`. Only returns on failure.
fn exec_shell(shell: &str) -> Errno {
    let Ok(path) = CString::new(shell) else {
        return Errno::EINVAL;
    };
    let Err(e) = execv(&path, &[&path]);
    e
}

/// Make the console our controlling terminal and standard streams.
/// Best effort.
fn attach_console() {
    let console = match std::fs::OpenOptions::new().read(true).write(true).open(CONSOLE) {
        Ok(file) => file,
        Err(e) => {
            eprintln!("guestboot: open {}: {}", CONSOLE, e);
            return;
        }
    };

    let fd = console.as_raw_fd();
    unsafe {
        libc::setsid();
        libc::ioctl(fd, TIOCSCTTY as _, 0);
        libc::dup2(fd, 0);
        libc::dup2(fd, 1);
        libc::dup2(fd, 2);
    }
}
