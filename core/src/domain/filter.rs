//! Port allow-list filter.

use std::collections::BTreeSet;
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Optional allow-list of individual ports and inclusive ranges.
///
/// An inactive filter (no entries) allows every port. Parsed from strings such
/// as `"22,8000-8005 9000"`; tokens are separated by commas or whitespace, and
/// whitespace around a range's `-` is ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortFilter {
    ports: BTreeSet<u16>,
    ranges: Vec<RangeInclusive<u16>>,
}

impl PortFilter {
    /// A filter that allows every port.
    pub fn allow_all() -> Self {
        Self::default()
    }

    /// Parse an allow-list specification.
    ///
    /// Fails on non-numeric tokens, port `0`, values above 65535 and
    /// inverted ranges.
    pub fn parse(spec: &str) -> Result<Self> {
        let mut filter = Self::default();
        let spec = spec.split('-').map(str::trim).collect::<Vec<_>>().join("-");

        for token in spec
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|t| !t.is_empty())
        {
            match token.split_once('-') {
                Some((start, end)) => {
                    let start = parse_port(start, token)?;
                    let end = parse_port(end, token)?;
                    if start > end {
                        return Err(Error::Config(format!(
                            "Inverted port range in filter: {}",
                            token
                        )));
                    }
                    filter.ranges.push(start..=end);
                }
                None => {
                    filter.ports.insert(parse_port(token, token)?);
                }
            }
        }

        Ok(filter)
    }

    /// Check if the filter has any entries.
    pub fn is_active(&self) -> bool {
        !self.ports.is_empty() || !self.ranges.is_empty()
    }

    /// Check if a port passes the filter.
    pub fn matches(&self, port: u16) -> bool {
        if !self.is_active() {
            return true;
        }
        self.ports.contains(&port) || self.ranges.iter().any(|r| r.contains(&port))
    }
}

fn parse_port(value: &str, token: &str) -> Result<u16> {
    let port: u16 = value.trim().parse().map_err(|_| {
        Error::Config(format!("Invalid port filter entry: {}", token))
    })?;
    if port == 0 {
        return Err(Error::Config(format!(
            "Port 0 is not allowed in filter: {}",
            token
        )));
    }
    Ok(port)
}

impl FromStr for PortFilter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for PortFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_active() {
            return write!(f, "all ports");
        }
        let entries: Vec<String> = self
            .ports
            .iter()
            .map(|p| p.to_string())
            .chain(self.ranges.iter().map(|r| format!("{}-{}", r.start(), r.end())))
            .collect();
        write!(f, "{}", entries.join(","))
    }
}
