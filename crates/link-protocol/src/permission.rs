use std::fmt;

use crate::value::Value;

/// Permission levels, ordered from least to most privileged.  `Never`
/// sorts last but grants nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Permission {
    None,
    List,
    Read,
    Write,
    Config,
    Never,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::None => "none",
            Permission::List => "list",
            Permission::Read => "read",
            Permission::Write => "write",
            Permission::Config => "config",
            Permission::Never => "never",
        }
    }

    /// Case-insensitive parse; unknown strings yield `None`.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Some(Permission::None),
            "list" => Some(Permission::List),
            "read" => Some(Permission::Read),
            "write" => Some(Permission::Write),
            "config" => Some(Permission::Config),
            "never" => Some(Permission::Never),
            _ => None,
        }
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        value.as_str().and_then(Self::parse)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Permission> for Value {
    fn from(p: Permission) -> Self {
        Value::String(p.as_str().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!(Permission::parse("Write"), Some(Permission::Write));
        assert_eq!(Permission::parse("CONFIG"), Some(Permission::Config));
        assert_eq!(Permission::parse("root"), None);
    }

    #[test]
    fn ordering() {
        assert!(Permission::Read < Permission::Write);
        assert!(Permission::Write < Permission::Config);
    }
}
