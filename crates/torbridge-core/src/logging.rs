//! Logging helpers that keep key material and full onion addresses out of
//! log output.
//!
//! The library only emits `tracing` events; installing a subscriber is up to
//! the binary (see the `torbridge` CLI).

use std::fmt;

/// A wrapper that redacts sensitive data when displayed.
pub struct Redacted<T>(pub T);

impl<T> fmt::Display for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T> fmt::Debug for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

/// Redact an onion address, keeping the first 4 and last 10 characters
/// (the tail includes the `.onion` suffix when present).
pub struct RedactedOnion<'a>(pub &'a str);

impl fmt::Display for RedactedOnion<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.0;
        if s.len() > 14 && s.is_ascii() {
            write!(f, "{}...{}", &s[..4], &s[s.len() - 10..])
        } else {
            write!(f, "[REDACTED ONION]")
        }
    }
}

impl fmt::Debug for RedactedOnion<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Redact a hex string, showing only its length.
pub struct RedactedHex<'a>(pub &'a str);

impl fmt::Display for RedactedHex<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} hex chars]", self.0.len())
    }
}

impl fmt::Debug for RedactedHex<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Control commands carrying secrets, logged by verb only.
const SECRET_COMMANDS: &[&str] = &["AUTHENTICATE", "ADD_ONION"];

/// Render a control command for logs, dropping arguments of commands that
/// carry credentials or keys.
pub fn command_for_log(cmd: &str) -> String {
    let verb = cmd.split_whitespace().next().unwrap_or("");
    if SECRET_COMMANDS.iter().any(|s| verb.eq_ignore_ascii_case(s)) {
        format!("{} [REDACTED]", verb)
    } else {
        cmd.trim_end().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redacted_display() {
        let secret = Redacted("my_secret_password");
        assert_eq!(format!("{}", secret), "[REDACTED]");
        assert_eq!(format!("{:?}", secret), "[REDACTED]");
    }

    #[test]
    fn test_redacted_onion() {
        let onion = RedactedOnion("abcd1234567890abcdefghijklmnopqrstuvwxyz1234567890abcd.onion");
        let displayed = format!("{}", onion);
        assert!(displayed.starts_with("abcd..."));
        assert!(displayed.ends_with(".onion"));

        assert_eq!(format!("{}", RedactedOnion("short")), "[REDACTED ONION]");
    }

    #[test]
    fn test_redacted_hex() {
        assert_eq!(format!("{}", RedactedHex("deadbeef")), "[8 hex chars]");
    }

    #[test]
    fn test_command_for_log() {
        assert_eq!(command_for_log("AUTHENTICATE abcdef\r\n"), "AUTHENTICATE [REDACTED]");
        assert_eq!(
            command_for_log("ADD_ONION ED25519-V3:secret Port=80,127.0.0.1:80"),
            "ADD_ONION [REDACTED]"
        );
        assert_eq!(command_for_log("GETINFO version\r\n"), "GETINFO version");
    }
}
