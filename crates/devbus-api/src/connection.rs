// ── Connection specification ──
//
// Parses `TANGO_HOST`-style strings (`host:port` or `host:port,host:port,...`)
// into an immutable `ConnectionSpec`, and builds the location strings the
// transport uses to reach the database or any other device.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Serialize;

use crate::error::Error;

/// Environment variable holding the database address.
pub const TANGO_HOST_ENV: &str = "TANGO_HOST";

/// Object name of the database device on the authority.
pub const DB_OBJECT_NAME: &str = "database";

const DEVICE_SCHEME: &str = "tango://";

/// A resolved database connection target.
///
/// `hosts` and `ports` are parallel lists. A remote spec always carries at
/// least one pair; a file-backed spec carries none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionSpec {
    pub hosts: Vec<String>,
    pub ports: Vec<String>,
    pub is_multi_host: bool,
    pub is_file_backed: bool,
    pub file_path: Option<PathBuf>,
}

impl ConnectionSpec {
    /// Resolve an optional connection string. `None` means the variable was
    /// never set, which is a configuration error.
    pub fn resolve(spec: Option<&str>) -> Result<Self, Error> {
        match spec {
            Some(s) => s.parse(),
            None => Err(Error::InvalidSpec {
                spec: String::new(),
                reason: format!("{TANGO_HOST_ENV} is not set"),
            }),
        }
    }

    /// Resolve from the process environment.
    pub fn from_env() -> Result<Self, Error> {
        let value = std::env::var(TANGO_HOST_ENV).ok();
        Self::resolve(value.as_deref())
    }

    /// A spec that routes every property call to a local resource file.
    pub fn file(path: impl AsRef<Path>) -> Self {
        Self {
            hosts: Vec::new(),
            ports: Vec::new(),
            is_multi_host: false,
            is_file_backed: true,
            file_path: Some(path.as_ref().to_path_buf()),
        }
    }

    /// Ordered `(host, port)` pairs.
    pub fn endpoints(&self) -> impl Iterator<Item = Endpoint> + '_ {
        self.hosts
            .iter()
            .zip(&self.ports)
            .map(|(host, port)| Endpoint::new(host, port))
    }

    /// `host:port` of the first endpoint, as used to qualify device names.
    pub fn primary_host_port(&self) -> Option<String> {
        self.endpoints().next().map(|e| e.to_string())
    }

    /// Location of the database device.
    pub fn db_location(&self) -> Location {
        Location {
            endpoints: self.endpoints().collect(),
            object: DB_OBJECT_NAME.to_owned(),
        }
    }

    /// Location of an arbitrary device. Fully qualified names
    /// (`tango://host:port/a/b/c`) carry their own endpoint.
    pub fn device_location(&self, device: &str) -> Result<Location, Error> {
        if device.starts_with(DEVICE_SCHEME) {
            return Location::parse_qualified(device);
        }
        Ok(Location {
            endpoints: self.endpoints().collect(),
            object: device.to_owned(),
        })
    }
}

impl FromStr for ConnectionSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(invalid(s, "empty specification"));
        }

        let is_multi_host = trimmed.contains(',');
        let mut hosts = Vec::new();
        let mut ports = Vec::new();

        for segment in trimmed.split(',') {
            let endpoint = parse_segment(s, segment.trim())?;
            hosts.push(endpoint.host);
            ports.push(endpoint.port);
        }

        Ok(Self {
            hosts,
            ports,
            is_multi_host,
            is_file_backed: false,
            file_path: None,
        })
    }
}

/// One `host:port` pair. The port is a decimal number; the host may not
/// contain a colon.
fn parse_segment(spec: &str, segment: &str) -> Result<Endpoint, Error> {
    let Some((host, port)) = segment.rsplit_once(':') else {
        return Err(invalid(spec, format!("'{segment}' is not of the form host:port")));
    };
    if host.is_empty() {
        return Err(invalid(spec, format!("'{segment}' has no host")));
    }
    if host.contains(':') {
        return Err(invalid(spec, format!("'{segment}' has more than one ':'")));
    }
    if port.is_empty() {
        return Err(invalid(spec, format!("'{segment}' has no port")));
    }
    if !port.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid(spec, format!("'{segment}' has a non-numeric port")));
    }
    Ok(Endpoint::new(host, port))
}

fn invalid(spec: &str, reason: impl Into<String>) -> Error {
    Error::InvalidSpec {
        spec: spec.to_owned(),
        reason: reason.into(),
    }
}

// ── Endpoint ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Endpoint {
    pub host: String,
    pub port: String,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: port.into(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// ── Location ────────────────────────────────────────────────────────

/// Where a request goes: an ordered list of alternative endpoints plus the
/// object name on the peer. The transport tries endpoints in order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Location {
    pub endpoints: Vec<Endpoint>,
    pub object: String,
}

impl Location {
    pub fn new(endpoints: Vec<Endpoint>, object: impl Into<String>) -> Self {
        Self {
            endpoints,
            object: object.into(),
        }
    }

    fn parse_qualified(name: &str) -> Result<Self, Error> {
        let rest = name.strip_prefix(DEVICE_SCHEME).unwrap_or(name);
        let Some((authority, object)) = rest.split_once('/') else {
            return Err(invalid(name, "qualified device name has no object part"));
        };
        let endpoint = parse_segment(name, authority)?;
        Ok(Self {
            endpoints: vec![endpoint],
            object: object.to_owned(),
        })
    }

    pub fn is_multi_host(&self) -> bool {
        self.endpoints.len() > 1
    }
}

impl fmt::Display for Location {
    /// Single endpoint: `tango://host:port/object`.
    /// Several: `corbaloc:iiop:h1:p1,iiop:h2:p2/object`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.endpoints.as_slice() {
            [] => f.write_str(&self.object),
            [single] => write!(f, "{DEVICE_SCHEME}{single}/{}", self.object),
            many => {
                f.write_str("corbaloc:")?;
                for (i, endpoint) in many.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "iiop:{endpoint}")?;
                }
                write!(f, "/{}", self.object)
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::reason::Reason;

    #[test]
    fn single_host() {
        let spec: ConnectionSpec = "hostA:10000".parse().unwrap();
        assert_eq!(
            spec,
            ConnectionSpec {
                hosts: vec!["hostA".into()],
                ports: vec!["10000".into()],
                is_multi_host: false,
                is_file_backed: false,
                file_path: None,
            }
        );
    }

    #[test]
    fn multi_host_keeps_order() {
        let spec: ConnectionSpec = "hostA:10000,hostB:10001".parse().unwrap();
        assert!(spec.is_multi_host);
        assert_eq!(spec.hosts, vec!["hostA", "hostB"]);
        assert_eq!(spec.ports, vec!["10000", "10001"]);
    }

    #[test]
    fn missing_colon_is_a_config_error() {
        let err = "hostA".parse::<ConnectionSpec>().unwrap_err();
        assert_eq!(err.reason(), Reason::TangoHostNotSet);
    }

    #[test]
    fn empty_host_or_port_rejected() {
        assert!(":10000".parse::<ConnectionSpec>().is_err());
        assert!("hostA:".parse::<ConnectionSpec>().is_err());
        assert!("hostA:1,:2".parse::<ConnectionSpec>().is_err());
        assert!("hostA:1,hostB".parse::<ConnectionSpec>().is_err());
    }

    #[test]
    fn extra_colon_or_word_port_rejected() {
        for input in ["hostA:10000:extra", "hostA:abc", "hostA:10000,hostB:1x"] {
            let err = input.parse::<ConnectionSpec>().unwrap_err();
            assert_eq!(err.reason(), Reason::TangoHostNotSet, "{input}");
        }
        assert!(
            "hostA:10000:extra"
                .parse::<ConnectionSpec>()
                .unwrap_err()
                .to_string()
                .contains("more than one ':'")
        );
    }

    #[test]
    fn absent_spec_rejected() {
        assert!(ConnectionSpec::resolve(None).is_err());
    }

    #[test]
    fn resolution_is_idempotent() {
        for input in ["hostA:10000", "a:1,b:2,c:3"] {
            let first = ConnectionSpec::resolve(Some(input)).unwrap();
            let second = ConnectionSpec::resolve(Some(input)).unwrap();
            assert_eq!(first, second);
        }
    }

    #[test]
    fn location_strings() {
        let single: ConnectionSpec = "db:10000".parse().unwrap();
        assert_eq!(single.db_location().to_string(), "tango://db:10000/database");

        let multi: ConnectionSpec = "db1:10000,db2:10001".parse().unwrap();
        assert_eq!(
            multi.db_location().to_string(),
            "corbaloc:iiop:db1:10000,iiop:db2:10001/database"
        );
    }

    #[test]
    fn qualified_device_names_carry_their_endpoint() {
        let spec: ConnectionSpec = "db:10000".parse().unwrap();
        let loc = spec
            .device_location("tango://other:20000/sys/access_control/1")
            .unwrap();
        assert_eq!(loc.endpoints, vec![Endpoint::new("other", "20000")]);
        assert_eq!(loc.object, "sys/access_control/1");

        let plain = spec.device_location("a/b/c").unwrap();
        assert_eq!(plain.endpoints, vec![Endpoint::new("db", "10000")]);
    }
}
