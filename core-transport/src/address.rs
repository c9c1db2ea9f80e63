use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use core_runtime::config::BridgeConfig;

use crate::error::TransportError;

const UNIX_SCHEME: &str = "unix:";

/// Location of a bus socket, written `unix:path=/run/user/5000/.name`.
///
/// Extra `key=value` pairs after the path (as in `unix:path=/x,guid=...`) are
/// accepted and ignored.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BusAddress {
    path: PathBuf,
}

impl BusAddress {
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Address of a named bus under the configured runtime directory.
    pub fn for_name(config: &BridgeConfig, name: &str) -> Self {
        Self::unix(config.socket_path(name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}path={}", UNIX_SCHEME, self.path.display())
    }
}

impl FromStr for BusAddress {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TransportError::InvalidAddress(s.to_string());

        let params = s.strip_prefix(UNIX_SCHEME).ok_or_else(invalid)?;
        let path = params
            .split(',')
            .filter_map(|pair| pair.split_once('='))
            .find_map(|(key, value)| (key == "path").then_some(value))
            .filter(|path| !path.is_empty())
            .ok_or_else(invalid)?;

        Ok(Self::unix(path))
    }
}
