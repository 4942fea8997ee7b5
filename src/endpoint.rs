//! Endpoint addressing and URI parsing (§6 "Endpoints").
//!
//! An [`Endpoint`] names where a socket connects to or binds on: an IPv4/IPv6 address
//! plus port, or a Unix-domain socket path. [`Uri`] decomposes the wider textual form
//! (`scheme://user@host:port/path?query#fragment`) that configuration and discovery
//! layers pass around, with percent-encoding for the pieces that need it.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// Where a socket connects to or binds on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Ip(SocketAddr),
    Local(String),
}

impl Endpoint {
    pub fn tcp(addr: impl Into<SocketAddr>) -> Endpoint {
        Endpoint::Ip(addr.into())
    }

    pub fn local(path: impl Into<String>) -> Endpoint {
        Endpoint::Local(path.into())
    }

    pub fn is_ip(&self) -> bool {
        matches!(self, Endpoint::Ip(_))
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Endpoint::Local(_))
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match self {
            Endpoint::Ip(addr) => Some(addr.ip()),
            Endpoint::Local(_) => None,
        }
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            Endpoint::Ip(addr) => Some(addr.port()),
            Endpoint::Local(_) => None,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Ip(addr) => write!(f, "{}", addr),
            Endpoint::Local(path) => write!(f, "unix:{}", path),
        }
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Endpoint {
        Endpoint::Ip(addr)
    }
}

/// A decomposed URI: `scheme://[user@]host[:port][/path][?query][#fragment]`.
///
/// Percent-encoding is applied to the authority's user component and decoded back out
/// of the path, query and fragment on parse, matching the default (non form-data)
/// encoding rules of standard URI syntax.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Uri {
    pub scheme: Option<String>,
    pub user: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub path: String,
    pub query: Option<String>,
    pub fragment: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UriParseError;

impl fmt::Display for UriParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed uri")
    }
}

impl std::error::Error for UriParseError {}

impl FromStr for Uri {
    type Err = UriParseError;

    fn from_str(input: &str) -> Result<Uri, UriParseError> {
        let mut uri = Uri::default();
        let mut rest = input;

        if let Some(idx) = rest.find("://") {
            uri.scheme = Some(rest[..idx].to_string());
            rest = &rest[idx + 3..];
        }

        let (authority, after_authority) = split_authority(rest);
        rest = after_authority;

        if !authority.is_empty() {
            let (user, host_port) = match authority.find('@') {
                Some(idx) => (Some(decode(&authority[..idx])?), &authority[idx + 1..]),
                None => (None, authority),
            };
            uri.user = user;

            let (host, port) = split_host_port(host_port)?;
            if !host.is_empty() {
                uri.host = Some(host.to_string());
            }
            uri.port = port;
        }

        if let Some(idx) = rest.find('#') {
            uri.fragment = Some(decode(&rest[idx + 1..])?);
            rest = &rest[..idx];
        }

        if let Some(idx) = rest.find('?') {
            uri.query = Some(decode(&rest[idx + 1..])?);
            rest = &rest[..idx];
        }

        uri.path = decode(rest)?;

        Ok(uri)
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(scheme) = &self.scheme {
            write!(f, "{}://", scheme)?;
        }
        if let Some(user) = &self.user {
            write!(f, "{}@", encode(user))?;
        }
        if let Some(host) = &self.host {
            write!(f, "{}", host)?;
        }
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        write!(f, "{}", encode_path(&self.path))?;
        if let Some(query) = &self.query {
            write!(f, "?{}", encode_query_or_fragment(query))?;
        }
        if let Some(fragment) = &self.fragment {
            write!(f, "#{}", encode_query_or_fragment(fragment))?;
        }
        Ok(())
    }
}

/// Splits off the authority (up to the next `/`, `?` or `#`, or the whole rest of the
/// string if the input has no scheme and no such delimiter). Schemeless inputs like a
/// bare `host:port` are treated as authority-only, matching `getaddrinfo`-style usage.
fn split_authority(rest: &str) -> (&str, &str) {
    match rest.find(|c| c == '/' || c == '?' || c == '#') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, ""),
    }
}

fn split_host_port(host_port: &str) -> Result<(&str, Option<u16>), UriParseError> {
    if let Some(stripped) = host_port.strip_prefix('[') {
        // IPv6 literal: `[::1]:8080`.
        let end = stripped.find(']').ok_or(UriParseError)?;
        let host = &host_port[..end + 2];
        let after = &stripped[end + 1..];
        let port = match after.strip_prefix(':') {
            Some(p) if !p.is_empty() => Some(p.parse().map_err(|_| UriParseError)?),
            _ => None,
        };
        return Ok((host, port));
    }

    match host_port.rfind(':') {
        Some(idx) => {
            let host = &host_port[..idx];
            let port_str = &host_port[idx + 1..];
            if port_str.is_empty() {
                Ok((host, None))
            } else {
                Ok((host, Some(port_str.parse().map_err(|_| UriParseError)?)))
            }
        }
        None => Ok((host_port, None)),
    }
}

fn is_unreserved(ch: u8) -> bool {
    ch.is_ascii_alphanumeric() || matches!(ch, b'-' | b'.' | b'_' | b'~')
}

fn is_sub_delim(ch: u8) -> bool {
    matches!(
        ch,
        b'!' | b'$' | b'&' | b'\'' | b'(' | b')' | b'*' | b'+' | b',' | b';' | b'='
    )
}

/// `pchar` per standard URI syntax: unreserved / pct-encoded / sub-delims / `:` / `@`.
fn is_pchar(ch: u8) -> bool {
    is_unreserved(ch) || is_sub_delim(ch) || matches!(ch, b':' | b'@')
}

fn encode_with(input: &str, is_safe: impl Fn(u8) -> bool) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        if is_safe(byte) {
            out.push(byte as char);
        } else {
            out.push('%');
            out.push_str(&format!("{:02X}", byte));
        }
    }
    out
}

/// Encodes a component with no structural delimiters of its own (authority's user).
fn encode(input: &str) -> String {
    encode_with(input, is_unreserved)
}

/// Encodes a path, leaving `/` (segment separator) and `pchar` unescaped.
fn encode_path(input: &str) -> String {
    encode_with(input, |ch| is_pchar(ch) || ch == b'/')
}

/// Encodes a query or fragment, leaving `/`, `?` and `pchar` unescaped.
fn encode_query_or_fragment(input: &str) -> String {
    encode_with(input, |ch| is_pchar(ch) || ch == b'/' || ch == b'?')
}

fn decode(input: &str) -> Result<String, UriParseError> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = input.get(i + 1..i + 3).ok_or(UriParseError)?;
                let value = u8::from_str_radix(hex, 16).map_err(|_| UriParseError)?;
                out.push(value);
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).map_err(|_| UriParseError)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn endpoint_display_formats_ip_and_local() {
        let ip: Endpoint = "127.0.0.1:9000".parse::<SocketAddr>().unwrap().into();
        assert_eq!(ip.to_string(), "127.0.0.1:9000");

        let local = Endpoint::local("/tmp/hive.sock");
        assert_eq!(local.to_string(), "unix:/tmp/hive.sock");
        assert!(local.is_local());
        assert_eq!(local.port(), None);
    }

    #[test]
    fn uri_parses_scheme_authority_path_query_fragment() {
        let uri: Uri = "tcp://alice@example.com:1234/a/b?x=1&y=2#frag".parse().unwrap();
        assert_eq!(uri.scheme.as_deref(), Some("tcp"));
        assert_eq!(uri.user.as_deref(), Some("alice"));
        assert_eq!(uri.host.as_deref(), Some("example.com"));
        assert_eq!(uri.port, Some(1234));
        assert_eq!(uri.path, "/a/b");
        assert_eq!(uri.query.as_deref(), Some("x=1&y=2"));
        assert_eq!(uri.fragment.as_deref(), Some("frag"));
    }

    #[test]
    fn uri_parses_bare_host_port_with_no_scheme() {
        let uri: Uri = "example.com:9000".parse().unwrap();
        assert_eq!(uri.scheme, None);
        assert_eq!(uri.host.as_deref(), Some("example.com"));
        assert_eq!(uri.port, Some(9000));
        assert_eq!(uri.path, "");
    }

    #[test]
    fn uri_parses_ipv6_literal_authority() {
        let uri: Uri = "tcp://[::1]:7000/".parse().unwrap();
        assert_eq!(uri.host.as_deref(), Some("[::1]"));
        assert_eq!(uri.port, Some(7000));
    }

    #[test]
    fn uri_decodes_percent_encoded_path() {
        let uri: Uri = "tcp://host/a%20b".parse().unwrap();
        assert_eq!(uri.path, "/a b");
    }

    #[test]
    fn uri_roundtrips_through_display() {
        let original = "tcp://example.com:80/path?q=1#f";
        let uri: Uri = original.parse().unwrap();
        assert_eq!(uri.to_string(), original);
    }
}
