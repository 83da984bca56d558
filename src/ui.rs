//! User-facing progress output.

use std::fmt::Debug;
use std::io::{self, Write};

/// Sink for progress and error messages shown to the person running a build.
pub trait Ui: Debug + Send + Sync {
    /// Announces a new phase of the build.
    fn say(&self, message: &str);
    /// Reports detail within the current phase.
    fn message(&self, message: &str);
    /// Reports a failure.
    fn error(&self, message: &str);
}

/// [`Ui`] writing to the terminal: progress to stdout, errors to stderr.
#[derive(Clone, Copy, Debug, Default)]
pub struct TerminalUi;

impl Ui for TerminalUi {
    fn say(&self, message: &str) {
        write_say(io::stdout(), message);
    }

    fn message(&self, message: &str) {
        write_message(io::stdout(), message);
    }

    fn error(&self, message: &str) {
        write_say(io::stderr(), message);
    }
}

fn write_say(mut target: impl Write, message: &str) {
    writeln!(target, "==> {message}").ok();
}

fn write_message(mut target: impl Write, message: &str) {
    for line in message.lines() {
        writeln!(target, "    {line}").ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(write: fn(&mut Vec<u8>, &str), message: &str) -> String {
        let mut buf = Vec::new();
        write(&mut buf, message);
        String::from_utf8(buf).expect("utf8")
    }

    #[test]
    fn say_prefixes_arrow() {
        let rendered = render(|buf, msg| write_say(buf, msg), "Creating instance...");
        assert_eq!(rendered, "==> Creating instance...\n");
    }

    #[test]
    fn message_indents_every_line() {
        let rendered = render(|buf, msg| write_message(buf, msg), "one\ntwo");
        assert_eq!(rendered, "    one\n    two\n");
    }
}
