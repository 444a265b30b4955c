use crate::stats::StatRow;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Enable,
    Disable,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Enable => "enable",
            Action::Disable => "disable",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `<enable|disable> server <group>/<name>` control line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlCommand {
    pub action: Action,
    pub group: String,
    pub name: String,
}

impl ControlCommand {
    /// Flips the row's state: a server reporting `UP` is disabled, anything
    /// else is enabled.
    pub fn toggle(row: &StatRow) -> Self {
        let action = if row.is_up() {
            Action::Disable
        } else {
            Action::Enable
        };
        Self {
            action,
            group: row.group().to_string(),
            name: row.name().to_string(),
        }
    }

    pub fn to_line(&self) -> String {
        format!("{self}\n")
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} server {}/{}", self.action, self.group, self.name)
    }
}
