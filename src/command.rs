//! External commands
//!
//! Mount, unmount and secure-erase commands are configured as templates,
//! expanded here and run through `/bin/sh` with a time limit.

use std::io::{self, Read};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Exit status and merged stdout/stderr of a finished command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when killed by a signal or the time limit
    pub status: Option<i32>,
    pub output: String,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Expand `%x` codes in a command template.
///
/// `codes` maps the character after `%` to its replacement. `%%` is a
/// literal percent sign; unknown codes are kept as written.
pub fn expand_template(template: &str, codes: &[(char, &str)]) -> String {
    let mut expanded = String::with_capacity(template.len());
    let mut chars = template.chars();

    while let Some(c) = chars.next() {
        if c != '%' {
            expanded.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => expanded.push('%'),
            Some(code) => match codes.iter().find(|(k, _)| *k == code) {
                Some((_, value)) => expanded.push_str(value),
                None => {
                    expanded.push('%');
                    expanded.push(code);
                }
            },
            None => expanded.push('%'),
        }
    }

    expanded
}

/// Run a shell command line, killing it if `limit` elapses.
pub fn run_command(command_line: &str, limit: Option<Duration>) -> io::Result<CommandOutput> {
    log::debug!("running: {}", command_line);

    let mut child = Command::new("/bin/sh")
        .arg("-c")
        .arg(format!("exec 2>&1\n{}", command_line))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .process_group(0)
        .spawn()?;

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "command stdout not captured"))?;
    let reader = thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stdout.read_to_end(&mut buf);
        buf
    });

    let deadline = limit.map(|limit| Instant::now() + limit);
    let mut timed_out = false;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            log::warn!("command timed out, killing: {}", command_line);
            timed_out = true;
            kill_process_group(child.id());
            break child.wait()?;
        }
        thread::sleep(POLL_INTERVAL);
    };

    let output = reader.join().unwrap_or_default();
    let output = String::from_utf8_lossy(&output).into_owned();
    log::debug!("command exited with {:?}: {}", status.code(), output.trim_end());

    Ok(CommandOutput {
        status: status.code(),
        output,
        timed_out,
    })
}

fn kill_process_group(pid: u32) {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) has no memory-safety preconditions; the child was
    // started as leader of its own process group.
    unsafe {
        libc::kill(-pid, libc::SIGKILL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_template() {
        let codes = [('a', "/dev/sdb1"), ('m', "/mnt/usb")];
        assert_eq!(
            expand_template("/bin/mount %a %m", &codes),
            "/bin/mount /dev/sdb1 /mnt/usb"
        );
        assert_eq!(expand_template("100%% %z", &codes), "100% %z");
        assert_eq!(expand_template("trailing %", &codes), "trailing %");
    }

    #[test]
    fn test_run_command_output_and_status() {
        let out = run_command("echo hello; echo oops >&2; exit 3", None).unwrap();
        assert_eq!(out.status, Some(3));
        assert!(out.output.contains("hello"));
        assert!(out.output.contains("oops"));
        assert!(!out.success());
    }

    #[test]
    fn test_run_command_timeout() {
        let started = Instant::now();
        let out = run_command("sleep 5", Some(Duration::from_millis(200))).unwrap();
        assert!(out.timed_out);
        assert!(!out.success());
        assert!(started.elapsed() < Duration::from_secs(4));
    }
}
