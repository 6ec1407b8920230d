//! Launch command parsing.
//!
//! A launch command is a single string such as
//! `npx -y @modelcontextprotocol/server-memory` or
//! `uv --directory /srv/project run main.py`. It is split on whitespace; the
//! first token is the executable and the rest are its arguments.

use std::fmt;
use std::str::FromStr;

use super::errors::McpError;

/// An executable plus its ordered arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    program: String,
    args: Vec<String>,
}

impl LaunchCommand {
    /// Parse a raw command string.
    ///
    /// At least one argument is required: a bare executable almost always
    /// means the script path was dropped from a "command + script" pair.
    pub fn parse(raw: &str) -> Result<Self, McpError> {
        let mut tokens = raw.split_whitespace().map(str::to_string);

        let program = tokens.next().ok_or_else(|| McpError::InvalidCommand {
            command: raw.to_string(),
            reason: "command is empty".into(),
        })?;

        let args: Vec<String> = tokens.collect();
        if args.is_empty() {
            return Err(McpError::InvalidCommand {
                command: raw.to_string(),
                reason: "provide both the command and the server script or package".into(),
            });
        }

        Ok(Self { program, args })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Short name used in log fields and error messages.
    ///
    /// The last path component of the final argument, which is usually the
    /// script or package being served.
    pub fn server_name(&self) -> &str {
        self.args
            .last()
            .and_then(|a| a.rsplit(['/', '\\']).next())
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.program)
    }
}

impl FromStr for LaunchCommand {
    type Err = McpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for LaunchCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}
