use std::fmt;

use domshell_shell::Command;

/// Authorization class of a command, derived from its verb alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecurityTier {
    Read,
    Navigate,
    Write,
    Sensitive,
}

impl SecurityTier {
    pub fn for_verb(verb: &str) -> Option<SecurityTier> {
        let tier = match verb {
            "ls" | "cd" | "pwd" | "cat" | "text" | "grep" | "find" | "tree" | "refresh"
            | "whoami" | "env" | "export" | "unset" | "help" => SecurityTier::Read,
            "navigate" | "open" => SecurityTier::Navigate,
            "click" | "focus" | "type" => SecurityTier::Write,
            "cookies" => SecurityTier::Sensitive,
            _ => return None,
        };
        Some(tier)
    }

    pub fn for_command(cmd: &Command) -> SecurityTier {
        // every canonical verb is classified above
        SecurityTier::for_verb(cmd.verb()).unwrap_or(SecurityTier::Sensitive)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityTier::Read => "read",
            SecurityTier::Navigate => "navigate",
            SecurityTier::Write => "write",
            SecurityTier::Sensitive => "sensitive",
        }
    }
}

impl fmt::Display for SecurityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
