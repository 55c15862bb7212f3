//! Privileged shell-out wrapper.
//!
//! Always a direct `Command::new(program).arg(...)` invocation with
//! positional arguments — never an interpolated shell string — so a path
//! containing shell metacharacters cannot escape into command injection.

use tokio::process::Command;
use tracing::trace;

use crate::error::ImageError;

#[derive(Debug, Clone, Copy)]
pub enum Privilege {
    Sudo,
    User,
}

fn format_command_display(program: &str, args: &[&str], privilege: Privilege) -> String {
    let mut parts = Vec::with_capacity(args.len() + 2);
    if matches!(privilege, Privilege::Sudo) {
        parts.push("sudo");
    }
    parts.push(program);
    parts.extend_from_slice(args);
    parts.join(" ")
}

/// Execute a command, returning trimmed stdout on success.
pub async fn exec(program: &str, args: &[&str], privilege: Privilege) -> Result<String, ImageError> {
    let cmd_display = format_command_display(program, args, privilege);
    trace!(command = %cmd_display, "exec");

    let output = match privilege {
        Privilege::Sudo => {
            let mut sudo_args = vec![program];
            sudo_args.extend_from_slice(args);
            Command::new("sudo").args(&sudo_args).output().await
        }
        Privilege::User => Command::new(program).args(args).output().await,
    }
    .map_err(|e| ImageError::Command {
        command: cmd_display.clone(),
        detail: e.to_string(),
    })?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(ImageError::Command {
            command: cmd_display,
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_command_display_user() {
        let display = format_command_display("mkfs.ext4", &["-F", "-q", "/tmp/x"], Privilege::User);
        assert_eq!(display, "mkfs.ext4 -F -q /tmp/x");
    }

    #[test]
    fn format_command_display_sudo() {
        let display = format_command_display("mount", &["-o", "loop"], Privilege::Sudo);
        assert_eq!(display, "sudo mount -o loop");
    }

    #[tokio::test]
    async fn exec_returns_trimmed_stdout() {
        let output = exec("echo", &["hello"], Privilege::User)
            .await
            .unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(output, "hello");
    }

    #[tokio::test]
    async fn exec_returns_error_on_failure() {
        let err = exec("false", &[], Privilege::User).await.unwrap_err();
        assert!(matches!(err, ImageError::Command { .. }));
    }
}
