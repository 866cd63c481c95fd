//! Compound addresses for application entities in a network.
//!
//! A DICOM node is reached through a socket address,
//! optionally qualified by the application entity title
//! to be named in the association request.
//! The serialized syntax is `{ae_title}@{host}:{port}`.

use std::{
    net::{AddrParseError, SocketAddr, ToSocketAddrs},
    str::FromStr,
};

/// An address to a DICOM node:
/// a socket address,
/// possibly qualified with an application entity title.
///
/// # Example
///
/// ```
/// # use netdicom_ul::AeAddr;
/// # use std::net::SocketAddr;
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let addr: AeAddr = "STORE-SCP@127.0.0.1:104".parse()?;
/// assert_eq!(addr.ae_title(), Some("STORE-SCP"));
/// assert_eq!(addr.socket_addr(), SocketAddr::from(([127, 0, 0, 1], 104)));
///
/// // the AE title may be missing
/// let addr: AeAddr = "192.168.1.99:1045".parse()?;
/// assert_eq!(addr.ae_title(), None);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AeAddr {
    ae_title: Option<String>,
    socket_addr: SocketAddr,
}

impl AeAddr {
    /// Create an address with an application entity title.
    pub fn new(ae_title: impl Into<String>, socket_addr: SocketAddr) -> Self {
        AeAddr {
            ae_title: Some(ae_title.into()),
            socket_addr,
        }
    }

    /// Create an address containing only a socket address.
    pub fn new_socket_addr(socket_addr: SocketAddr) -> Self {
        AeAddr {
            ae_title: None,
            socket_addr,
        }
    }

    /// The application entity title portion, if present.
    pub fn ae_title(&self) -> Option<&str> {
        self.ae_title.as_deref()
    }

    /// The socket address portion.
    pub fn socket_addr(&self) -> SocketAddr {
        self.socket_addr
    }

    /// The application entity title, or `fallback` when absent.
    pub fn ae_title_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.ae_title.as_deref().unwrap_or(fallback)
    }
}

/// This conversion provides an address without an AE title.
impl From<SocketAddr> for AeAddr {
    fn from(socket_addr: SocketAddr) -> Self {
        AeAddr {
            ae_title: None,
            socket_addr,
        }
    }
}

impl FromStr for AeAddr {
    type Err = AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('@') {
            Some((ae_title, address)) => Ok(AeAddr {
                ae_title: Some(ae_title.to_string()),
                socket_addr: address.parse()?,
            }),
            None => Ok(AeAddr {
                ae_title: None,
                socket_addr: s.parse()?,
            }),
        }
    }
}

impl ToSocketAddrs for AeAddr {
    type Iter = std::option::IntoIter<SocketAddr>;

    fn to_socket_addrs(&self) -> std::io::Result<Self::Iter> {
        self.socket_addr.to_socket_addrs()
    }
}

impl std::fmt::Display for AeAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ae_title) = &self.ae_title {
            f.write_str(ae_title)?;
            f.write_str("@")?;
        }
        std::fmt::Display::fmt(&self.socket_addr, f)
    }
}

#[cfg(test)]
mod tests {
    use super::AeAddr;
    use std::net::SocketAddr;

    #[test]
    fn parses_full_address() {
        let addr: AeAddr = "MAIN-PACS@10.0.0.7:11112".parse().unwrap();
        assert_eq!(addr.ae_title(), Some("MAIN-PACS"));
        assert_eq!(
            addr.socket_addr(),
            SocketAddr::from(([10, 0, 0, 7], 11112))
        );
        assert_eq!(addr.to_string(), "MAIN-PACS@10.0.0.7:11112");
    }

    #[test]
    fn parses_bare_socket_address() {
        let addr: AeAddr = "127.0.0.1:104".parse().unwrap();
        assert_eq!(addr.ae_title(), None);
        assert_eq!(addr.ae_title_or("ANY-SCP"), "ANY-SCP");
        assert_eq!(addr.to_string(), "127.0.0.1:104");
    }

    #[test]
    fn refuses_malformed_socket_address() {
        assert!("SCP@not-an-address".parse::<AeAddr>().is_err());
        assert!("SCP@127.0.0.1".parse::<AeAddr>().is_err());
    }
}
