//! Broker service URLs: `pulsar://host[:port][,host[:port]...]` or `pulsar+ssl://...`.

use std::fmt;
use std::str::FromStr;

use crate::core::error::ClientError;

pub const DEFAULT_PORT: u16 = 6650;
pub const DEFAULT_TLS_PORT: u16 = 6651;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Plain,
    Tls,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Plain => "pulsar",
            Scheme::Tls => "pulsar+ssl",
        }
    }

    fn default_port(self) -> u16 {
        match self {
            Scheme::Plain => DEFAULT_PORT,
            Scheme::Tls => DEFAULT_TLS_PORT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// A parsed service URL. Holds at least one host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceUrl {
    scheme: Scheme,
    hosts: Vec<HostPort>,
}

impl ServiceUrl {
    pub fn parse(raw: &str) -> Result<Self, ClientError> {
        let invalid = |reason: &str| ClientError::InvalidServiceUrl {
            url: raw.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, rest) = raw
            .split_once("://")
            .ok_or_else(|| invalid("missing `://`"))?;
        let scheme = match scheme {
            "pulsar" => Scheme::Plain,
            "pulsar+ssl" => Scheme::Tls,
            _ => return Err(invalid("scheme must be `pulsar` or `pulsar+ssl`")),
        };

        // Anything after the authority (path, query) is ignored.
        let authority = rest.split(['/', '?']).next().unwrap_or_default();
        if authority.is_empty() {
            return Err(invalid("no host given"));
        }

        let hosts = authority
            .split(',')
            .map(|entry| parse_host_port(entry, scheme.default_port()).map_err(|r| invalid(r)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { scheme, hosts })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn hosts(&self) -> &[HostPort] {
        &self.hosts
    }
}

impl FromStr for ServiceUrl {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ServiceUrl::parse(s)
    }
}

impl fmt::Display for ServiceUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.scheme.as_str())?;
        for (i, host) in self.hosts.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{host}")?;
        }
        Ok(())
    }
}

fn parse_host_port(entry: &str, default_port: u16) -> Result<HostPort, &'static str> {
    if entry.is_empty() {
        return Err("empty host entry");
    }

    // Bracketed IPv6: [::1]:6650
    if let Some(stripped) = entry.strip_prefix('[') {
        let (host, tail) = stripped.split_once(']').ok_or("unterminated `[`")?;
        if host.is_empty() {
            return Err("empty host entry");
        }
        let port = match tail {
            "" => default_port,
            t => parse_port(t.strip_prefix(':').ok_or("junk after `]`")?)?,
        };
        return Ok(HostPort {
            host: host.to_string(),
            port,
        });
    }

    let (host, port) = match entry.rsplit_once(':') {
        Some((host, port)) => (host, parse_port(port)?),
        None => (entry, default_port),
    };
    if host.is_empty() || host.contains(':') {
        return Err("invalid host");
    }

    Ok(HostPort {
        host: host.to_string(),
        port,
    })
}

fn parse_port(raw: &str) -> Result<u16, &'static str> {
    match raw.parse::<u16>() {
        Ok(0) | Err(_) => Err("port must be a number between 1 and 65535"),
        Ok(port) => Ok(port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_host() {
        let url = ServiceUrl::parse("pulsar://localhost:6650").unwrap();
        assert_eq!(url.scheme(), Scheme::Plain);
        assert_eq!(
            url.hosts(),
            &[HostPort {
                host: "localhost".into(),
                port: 6650
            }]
        );
    }

    #[test]
    fn applies_default_ports() {
        let url = ServiceUrl::parse("pulsar://broker-1").unwrap();
        assert_eq!(url.hosts()[0].port, DEFAULT_PORT);

        let url = ServiceUrl::parse("pulsar+ssl://broker-1/").unwrap();
        assert_eq!(url.scheme(), Scheme::Tls);
        assert_eq!(url.hosts()[0].port, DEFAULT_TLS_PORT);
    }

    #[test]
    fn parses_host_lists_and_ipv6() {
        let url = ServiceUrl::parse("pulsar://a:1,b,[::1]:7000").unwrap();
        let rendered: Vec<String> = url.hosts().iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["a:1", "b:6650", "[::1]:7000"]);
        assert_eq!(url.to_string(), "pulsar://a:1,b:6650,[::1]:7000");
    }

    #[test]
    fn rejects_malformed_urls() {
        for raw in [
            "localhost:6650",
            "http://localhost:6650",
            "pulsar://",
            "pulsar://host:notaport",
            "pulsar://host:0",
            "pulsar://a,,b",
            "pulsar://[::1",
        ] {
            let err = ServiceUrl::parse(raw).unwrap_err();
            assert!(
                matches!(err, ClientError::InvalidServiceUrl { .. }),
                "{raw} should be rejected, got {err:?}"
            );
        }
    }
}
