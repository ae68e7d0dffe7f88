use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::{Error, ErrorKind, Result};

#[derive(
    Serialize, Deserialize, JsonSchema, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Ssl,
    Udp,
}

impl Protocol {
    #[must_use]
    pub fn is_secure(self) -> bool {
        matches!(self, Protocol::Ssl)
    }

    #[must_use]
    pub fn is_datagram(self) -> bool {
        matches!(self, Protocol::Udp)
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Protocol::Tcp => "tcp",
            Protocol::Ssl => "ssl",
            Protocol::Udp => "udp",
        })
    }
}

/// Address of a server-side transport endpoint.
#[derive(
    Serialize, Deserialize, JsonSchema, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub struct Endpoint {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    /// Connection timeout in milliseconds, -1 for none.
    pub timeout: i32,
    pub compress: bool,
}

impl Endpoint {
    #[must_use]
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::new(Protocol::Tcp, host, port)
    }

    #[must_use]
    pub fn new(protocol: Protocol, host: impl Into<String>, port: u16) -> Self {
        Self {
            protocol,
            host: host.into(),
            port,
            timeout: -1,
            compress: false,
        }
    }

    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.protocol.is_secure()
    }

    #[must_use]
    pub fn is_datagram(&self) -> bool {
        self.protocol.is_datagram()
    }

    #[must_use]
    pub fn with_timeout(&self, timeout: i32) -> Self {
        Self {
            timeout,
            ..self.clone()
        }
    }

    #[must_use]
    pub fn with_compress(&self, compress: bool) -> Self {
        Self {
            compress,
            ..self.clone()
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -h {} -p {}", self.protocol, self.host, self.port)?;
        if self.timeout != -1 {
            write!(f, " -t {}", self.timeout)?;
        }
        if self.compress {
            write!(f, " -z")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |m: String| Error::new(ErrorKind::InvalidArgument, m);

        let mut tokens = s.split_whitespace();
        let protocol = match tokens.next() {
            Some("tcp" | "default") => Protocol::Tcp,
            Some("ssl") => Protocol::Ssl,
            Some("udp") => Protocol::Udp,
            Some(other) => return Err(invalid(format!("unknown protocol `{other}` in `{s}`"))),
            None => return Err(invalid("empty endpoint".to_string())),
        };

        let mut endpoint = Endpoint::new(protocol, "", 0);
        let mut port = None;
        while let Some(option) = tokens.next() {
            let mut argument = |name: &str| {
                tokens
                    .next()
                    .ok_or_else(|| invalid(format!("no argument for {name} in `{s}`")))
            };
            match option {
                "-h" => endpoint.host = argument("-h")?.to_string(),
                "-p" => {
                    let value = argument("-p")?;
                    port = Some(
                        value
                            .parse()
                            .map_err(|_| invalid(format!("invalid port `{value}` in `{s}`")))?,
                    );
                }
                "-t" => {
                    let value = argument("-t")?;
                    endpoint.timeout = if value == "infinite" {
                        -1
                    } else {
                        value
                            .parse()
                            .map_err(|_| invalid(format!("invalid timeout `{value}` in `{s}`")))?
                    };
                }
                "-z" => endpoint.compress = true,
                other => return Err(invalid(format!("unknown option `{other}` in `{s}`"))),
            }
        }

        if endpoint.host.is_empty() {
            return Err(invalid(format!("no host in `{s}`")));
        }
        endpoint.port = port.ok_or_else(|| invalid(format!("no port in `{s}`")))?;
        Ok(endpoint)
    }
}
