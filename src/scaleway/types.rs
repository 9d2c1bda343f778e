//! Typed views of the identifiers, states, and actions the Instances API
//! exchanges as plain strings.

use std::fmt;

/// Server identifier assigned by Scaleway.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct InstanceId(String);

/// Availability zone such as `fr-par-1`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Zone(String);

macro_rules! string_newtype {
    ($name:ident) => {
        impl $name {
            pub(crate) const fn as_str(&self) -> &str {
                self.0.as_str()
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_newtype!(InstanceId);
string_newtype!(Zone);

/// Power state of a server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum ServerState {
    Running,
    Starting,
    Stopped,
    Stopping,
    Locked,
    Other(String),
}

impl ServerState {
    pub(crate) fn as_str(&self) -> &str {
        match self {
            Self::Running => "running",
            Self::Starting => "starting",
            Self::Stopped => "stopped",
            Self::Stopping => "stopping",
            Self::Locked => "locked",
            Self::Other(raw) => raw,
        }
    }
}

impl From<&str> for ServerState {
    fn from(value: &str) -> Self {
        match value {
            "running" => Self::Running,
            "starting" => Self::Starting,
            "stopped" => Self::Stopped,
            "stopping" => Self::Stopping,
            "locked" => Self::Locked,
            other => Self::Other(other.to_owned()),
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Action the API currently accepts for a server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) enum ServerAction {
    PowerOn,
    PowerOff,
    Terminate,
    Other(String),
}

impl ServerAction {
    pub(crate) fn as_str(&self) -> &str {
        match self {
            Self::PowerOn => "poweron",
            Self::PowerOff => "poweroff",
            Self::Terminate => "terminate",
            Self::Other(raw) => raw,
        }
    }
}

impl From<&str> for ServerAction {
    fn from(value: &str) -> Self {
        match value {
            "poweron" => Self::PowerOn,
            "poweroff" => Self::PowerOff,
            "terminate" => Self::Terminate,
            other => Self::Other(other.to_owned()),
        }
    }
}
