//! Named commands executed inside the host application.
//!
//! Commands travel as Lisp expressions of the form
//!
//! ```text
//! (command "_NETLOAD" "/opt/hostdrive/bin/hostdrive")
//! ```
//!
//! where every argument is a double-quoted string literal with C-style
//! escapes. The leading underscore selects the global (untranslated)
//! command name.
//!
//! [`InboxCommandRunner`] delivers an expression as a single datagram to
//! the host's inbox socket, `<temp>/hostdrive-<pid>.inbox`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::debug;

use super::{CommandRunner, ProcessError, ProcessHandle, ProcessResult};

/// Loads a plugin module into the host.
pub const NET_LOAD: &str = "NETLOAD";

/// Asks the host to connect back to an IPC endpoint and serve a session.
pub const CREATE_ENDPOINT_AND_WAIT: &str = "CREATEENDPOINTANDWAIT";

/// A command addressed to the host by its global name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCommand {
    pub global_name: String,
    pub arguments: Vec<String>,
}

impl HostCommand {
    pub fn new(global_name: impl Into<String>, arguments: Vec<String>) -> Self {
        Self {
            global_name: global_name.into(),
            arguments,
        }
    }

    /// `NETLOAD <path>`
    pub fn net_load(path: &Path) -> Self {
        Self::new(NET_LOAD, vec![path.to_string_lossy().into_owned()])
    }

    /// `CREATEENDPOINTANDWAIT <port> <correlation id> <watchdog ms>`
    pub fn create_endpoint_and_wait(
        port_name: &str,
        correlation_id: &str,
        watchdog_timeout: Duration,
    ) -> Self {
        Self::new(
            CREATE_ENDPOINT_AND_WAIT,
            vec![
                port_name.to_string(),
                correlation_id.to_string(),
                watchdog_timeout.as_millis().to_string(),
            ],
        )
    }

    /// Renders the command as a newline-terminated Lisp expression.
    pub fn to_lisp(&self) -> String {
        let mut out = String::from("(command ");
        out.push_str(&quote(&format!("_{}", self.global_name)));
        for arg in &self.arguments {
            out.push(' ');
            out.push_str(&quote(arg));
        }
        out.push_str(")\n");
        out
    }

    /// Parses an expression produced by [`to_lisp`](Self::to_lisp).
    pub fn parse(expression: &str) -> ProcessResult<Self> {
        let malformed = |why: &str| {
            ProcessError::InvalidArgument(format!(
                "Malformed command ({}): {}",
                why,
                expression.trim()
            ))
        };

        let body = expression
            .trim()
            .strip_prefix('(')
            .and_then(|s| s.strip_suffix(')'))
            .ok_or_else(|| malformed("not a list"))?;
        let rest = body
            .trim_start()
            .strip_prefix("command")
            .ok_or_else(|| malformed("missing 'command'"))?;

        let mut literals = Vec::new();
        let mut chars = rest.chars().peekable();
        loop {
            while chars.next_if(|c| c.is_whitespace()).is_some() {}
            match chars.next() {
                None => break,
                Some('"') => {
                    let literal = read_literal(&mut chars).map_err(|e| malformed(e.as_str()))?;
                    literals.push(literal);
                }
                Some(c) => {
                    let why = format!("unexpected '{}'", c);
                    return Err(malformed(why.as_str()));
                }
            }
        }

        let mut literals = literals.into_iter();
        let name = literals.next().ok_or_else(|| malformed("no command name"))?;
        let name = name.strip_prefix('_').unwrap_or(&name).to_string();
        if name.is_empty() {
            return Err(malformed("empty command name"));
        }

        Ok(Self::new(name, literals.collect()))
    }
}

impl fmt::Display for HostCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.global_name)?;
        for arg in &self.arguments {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Wraps `s` in double quotes, escaping it as a C string literal.
pub fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '\0' => out.push_str("\\0"),
            '\u{07}' => out.push_str("\\a"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0C}' => out.push_str("\\f"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{0B}' => out.push_str("\\v"),
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            c if c.is_control() => out.push_str(&format!("\\u{:04X}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn read_literal(chars: &mut impl Iterator<Item = char>) -> Result<String, String> {
    let mut out = String::new();
    loop {
        match chars.next() {
            None => return Err("unterminated string".to_string()),
            Some('"') => return Ok(out),
            Some('\\') => {
                let escaped = match chars.next() {
                    Some('0') => '\0',
                    Some('a') => '\u{07}',
                    Some('b') => '\u{08}',
                    Some('f') => '\u{0C}',
                    Some('n') => '\n',
                    Some('r') => '\r',
                    Some('t') => '\t',
                    Some('v') => '\u{0B}',
                    Some('u') => {
                        let hex: String = chars.by_ref().take(4).collect();
                        u32::from_str_radix(&hex, 16)
                            .ok()
                            .filter(|_| hex.len() == 4)
                            .and_then(char::from_u32)
                            .ok_or_else(|| format!("bad unicode escape '\\u{}'", hex))?
                    }
                    Some(c @ ('\'' | '"' | '\\')) => c,
                    Some(c) => return Err(format!("unknown escape '\\{}'", c)),
                    None => return Err("unterminated escape".to_string()),
                };
                out.push(escaped);
            }
            Some(c) => out.push(c),
        }
    }
}

/// Path of the command inbox for host process `pid` inside `dir`.
pub fn inbox_path(dir: &Path, pid: u32) -> PathBuf {
    dir.join(format!("hostdrive-{}.inbox", pid))
}

/// Delivers commands to the host's inbox socket.
#[derive(Debug, Clone)]
pub struct InboxCommandRunner {
    inbox_dir: PathBuf,
}

impl InboxCommandRunner {
    /// Runner looking for inboxes in `inbox_dir`.
    pub fn with_dir(inbox_dir: impl Into<PathBuf>) -> Self {
        Self {
            inbox_dir: inbox_dir.into(),
        }
    }

    pub fn inbox_dir(&self) -> &Path {
        &self.inbox_dir
    }
}

impl Default for InboxCommandRunner {
    fn default() -> Self {
        Self::with_dir(std::env::temp_dir())
    }
}

impl CommandRunner for InboxCommandRunner {
    #[cfg(unix)]
    fn run(&self, command: &HostCommand, process: &dyn ProcessHandle) -> ProcessResult<()> {
        use std::io::ErrorKind;
        use std::os::unix::net::UnixDatagram;

        let inbox = inbox_path(&self.inbox_dir, process.id());
        if !inbox.exists() {
            return Err(ProcessError::NotReady(format!(
                "no command inbox at {}",
                inbox.display()
            )));
        }

        let socket = UnixDatagram::unbound()?;
        let expression = command.to_lisp();
        debug!("Sending to {}: {}", inbox.display(), expression.trim_end());

        socket
            .send_to(expression.as_bytes(), &inbox)
            .map(|_| ())
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound | ErrorKind::ConnectionRefused => {
                    ProcessError::NotReady(format!("{}: {}", inbox.display(), e))
                }
                _ => ProcessError::CommandFailed(format!("{}: {}", command.global_name, e)),
            })
    }

    #[cfg(not(unix))]
    fn run(&self, command: &HostCommand, _process: &dyn ProcessHandle) -> ProcessResult<()> {
        Err(ProcessError::NotSupported(format!(
            "Cannot deliver {} on this platform",
            command.global_name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_net_load_expression() {
        let cmd = HostCommand::net_load(Path::new("/opt/hostdrive/hostdrive"));
        assert_eq!(
            cmd.to_lisp(),
            "(command \"_NETLOAD\" \"/opt/hostdrive/hostdrive\")\n"
        );
    }

    #[test]
    fn test_endpoint_command_arguments() {
        let cmd = HostCommand::create_endpoint_and_wait(
            "127.0.0.1:40000",
            "0f8fad5b",
            Duration::from_secs(120),
        );
        assert_eq!(cmd.global_name, CREATE_ENDPOINT_AND_WAIT);
        assert_eq!(cmd.arguments, vec!["127.0.0.1:40000", "0f8fad5b", "120000"]);
        assert_eq!(cmd.to_string(), "CREATEENDPOINTANDWAIT 127.0.0.1:40000 0f8fad5b 120000");
    }

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote("C:\\acad \"2024\""), "\"C:\\\\acad \\\"2024\\\"\"");
        assert_eq!(quote("a\tb\nc"), "\"a\\tb\\nc\"");
        assert_eq!(quote("it's"), "\"it\\'s\"");
        assert_eq!(quote("\u{1B}"), "\"\\u001B\"");
        assert_eq!(quote("\0\u{07}\u{0B}"), "\"\\0\\a\\v\"");
    }

    #[test]
    fn test_parse_reads_escaped_arguments() {
        let cmd = HostCommand::new(
            "NETLOAD",
            vec!["C:\\Program Files\\\"x\"\n\u{1B}".to_string(), String::new()],
        );
        let parsed = HostCommand::parse(&cmd.to_lisp()).unwrap();
        assert_eq!(parsed, cmd);
    }

    #[test]
    fn test_parse_tolerates_spacing_and_missing_underscore() {
        let parsed = HostCommand::parse("  ( command   \"FOO\"\t\"bar\" )  ").unwrap();
        assert_eq!(parsed.global_name, "FOO");
        assert_eq!(parsed.arguments, vec!["bar"]);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in [
            "command \"_X\"",
            "(defun \"_X\")",
            "(command \"_X\" bare)",
            "(command \"_X)",
            "(command \"_X\" \"\\q\")",
            "(command)",
            "(command \"_\")",
        ] {
            let err = HostCommand::parse(bad).unwrap_err();
            assert!(
                matches!(err, ProcessError::InvalidArgument(_)),
                "expected rejection of {}",
                bad
            );
        }
    }

    #[test]
    fn test_inbox_path() {
        assert_eq!(
            inbox_path(Path::new("/tmp"), 314),
            PathBuf::from("/tmp/hostdrive-314.inbox")
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_missing_inbox_is_not_ready() {
        use crate::process::testing::{FakeHandle, FakeProcess};

        let dir = tempfile::tempdir().unwrap();
        let runner = InboxCommandRunner::with_dir(dir.path());
        let handle = FakeHandle(FakeProcess::new(999_999));

        let err = runner
            .run(&HostCommand::net_load(Path::new("/x")), &handle)
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[cfg(unix)]
    #[test]
    fn test_command_delivered_to_inbox() {
        use crate::process::testing::{FakeHandle, FakeProcess};
        use std::os::unix::net::UnixDatagram;

        let dir = tempfile::tempdir().unwrap();
        let inbox = UnixDatagram::bind(inbox_path(dir.path(), 1234)).unwrap();
        let runner = InboxCommandRunner::with_dir(dir.path());
        let handle = FakeHandle(FakeProcess::new(1234));

        let sent = HostCommand::net_load(Path::new("/opt/plugin"));
        runner.run(&sent, &handle).unwrap();

        let mut buf = [0u8; 1024];
        let n = inbox.recv(&mut buf).unwrap();
        let received = HostCommand::parse(std::str::from_utf8(&buf[..n]).unwrap()).unwrap();
        assert_eq!(received, sent);
    }
}
