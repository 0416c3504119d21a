use crate::error;
use std::path::PathBuf;

pub type Result<T> = ::std::result::Result<T, error::Error>;

#[macro_export]
macro_rules! io_err {
    ($kind:ident, $msg:expr) => {
        ::std::io::Error::new(::std::io::ErrorKind::$kind, $msg)
    };
}

#[macro_export]
macro_rules! res {
    ($err:expr) => {
        Err(From::from($err))
    };
}

pub fn parse_proto(arg: &str) -> Option<(&str, &str, &str)> {
    let mut split = arg.split('!');
    let (proto, addr, port) = (split.next()?, split.next()?, split.next()?);

    Some((proto, addr, port))
}

/// Where to listen or dial.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Address {
    /// `host:port`
    Tcp(String),
    /// Path of a Unix domain socket
    Unix(PathBuf),
}

impl Address {
    /// Parse `tcp!host!port`, `unix!path!suffix` or a bare `host:port`.
    pub fn parse(arg: &str) -> Result<Address> {
        match parse_proto(arg) {
            Some(("tcp", host, port)) => Ok(Address::Tcp(format!("{}:{}", host, port))),
            Some(("unix", path, _)) => Ok(Address::Unix(PathBuf::from(path))),
            Some(_) => res!(io_err!(InvalidInput, "Protocol not supported")),
            None if !arg.is_empty() && !arg.contains('!') => Ok(Address::Tcp(arg.to_owned())),
            None => res!(io_err!(InvalidInput, "Invalid protocol or address")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_addresses() {
        assert_eq!(
            Address::parse("tcp!127.0.0.1!7070").unwrap(),
            Address::Tcp("127.0.0.1:7070".to_owned())
        );
        assert_eq!(
            Address::parse("unix!/tmp/netfs.sock!0").unwrap(),
            Address::Unix(PathBuf::from("/tmp/netfs.sock"))
        );
        assert_eq!(
            Address::parse("localhost:7070").unwrap(),
            Address::Tcp("localhost:7070".to_owned())
        );
        assert!(Address::parse("udp!127.0.0.1!7070").is_err());
        assert!(Address::parse("tcp!127.0.0.1").is_err());
        assert!(Address::parse("").is_err());
    }
}
