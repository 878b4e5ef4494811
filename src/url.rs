//! LDAP URLs (RFC 4516)

use std::{fmt, str::FromStr};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::{
    error::Error,
    filter::{parse_filter, Filter},
    model::SearchScope,
};

pub const DEFAULT_PORT: u16 = 389;
pub const DEFAULT_SECURE_PORT: u16 = 636;
const DEFAULT_HOST: &str = "localhost";

/// Parsed `ldap://host:port/dn?attributes?scope?filter?extensions` URL
#[derive(Debug, Clone, PartialEq)]
pub struct LdapUrl {
    /// True for the `ldaps` scheme
    pub secure: bool,
    pub host: String,
    pub port: u16,
    /// Percent-decoded base DN, empty when absent
    pub dn: String,
    pub attributes: Vec<String>,
    pub scope: Option<SearchScope>,
    pub filter: Option<Filter>,
    /// Non-critical extensions as (type, value) pairs
    pub extensions: Vec<(String, Option<String>)>,
}

fn invalid(url: &str, reason: &str) -> Error {
    Error::InvalidUrl(format!("{}: {}", url, reason))
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn decode_percent_component(url: &str, input: &str) -> Result<String, Error> {
    if !input.contains('%') {
        return Ok(input.to_owned());
    }

    let bytes = input.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut index = 0;

    while index < bytes.len() {
        if bytes[index] == b'%' {
            let hi = bytes.get(index + 1).copied().and_then(hex_value);
            let lo = bytes.get(index + 2).copied().and_then(hex_value);
            match hi.zip(lo) {
                Some((hi, lo)) => {
                    decoded.push((hi << 4) | lo);
                    index += 3;
                    continue;
                }
                None => return Err(invalid(url, "invalid percent encoding")),
            }
        }
        decoded.push(bytes[index]);
        index += 1;
    }

    String::from_utf8(decoded).map_err(|_| invalid(url, "percent encoding is not valid UTF-8"))
}

fn encode_percent_component(input: &str, extra: &[u8]) -> String {
    let mut out = String::with_capacity(input.len());
    for b in input.bytes() {
        if b.is_ascii_graphic() && b != b'%' && b != b'?' && !extra.contains(&b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

impl LdapUrl {
    pub fn parse(url: &str) -> Result<Self, Error> {
        static URL_RE: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r"^(?i:(ldaps?))://([^/?#]*)(?:/([^?#]*)(?:\?([^?#]*)(?:\?([^?#]*)(?:\?([^?#]*)(?:\?([^?#]*))?)?)?)?)?$")
                .unwrap()
        });

        let caps = URL_RE
            .captures(url)
            .ok_or_else(|| invalid(url, "not an LDAP URL"))?;

        let secure = caps[1].eq_ignore_ascii_case("ldaps");
        let default_port = if secure { DEFAULT_SECURE_PORT } else { DEFAULT_PORT };
        let (host, port) = Self::parse_host_port(url, &caps[2], default_port)?;

        let component = |i: usize| caps.get(i).map(|m| m.as_str()).unwrap_or_default();

        let dn = decode_percent_component(url, component(3))?;

        let attributes = component(4)
            .split(',')
            .filter(|a| !a.is_empty())
            .map(|a| decode_percent_component(url, a))
            .collect::<Result<Vec<_>, _>>()?;

        let scope = match component(5).to_ascii_lowercase().as_str() {
            "" => None,
            "base" => Some(SearchScope::BaseObject),
            "one" => Some(SearchScope::SingleLevel),
            "sub" => Some(SearchScope::WholeSubtree),
            _ => return Err(invalid(url, "invalid scope")),
        };

        let filter = match decode_percent_component(url, component(6))? {
            f if f.is_empty() => None,
            f => Some(parse_filter(&f).map_err(|e| invalid(url, &e.to_string()))?),
        };

        let mut extensions = Vec::new();
        for ext in component(7).split(',').filter(|e| !e.is_empty()) {
            if ext.starts_with('!') {
                return Err(invalid(url, "unsupported critical extension"));
            }
            let (name, value) = match ext.split_once('=') {
                Some((name, value)) => (name, Some(decode_percent_component(url, value)?)),
                None => (ext, None),
            };
            extensions.push((decode_percent_component(url, name)?, value));
        }

        Ok(LdapUrl {
            secure,
            host,
            port,
            dn,
            attributes,
            scope,
            filter,
            extensions,
        })
    }

    fn parse_host_port(url: &str, hostport: &str, default_port: u16) -> Result<(String, u16), Error> {
        let (host, port) = if let Some(rest) = hostport.strip_prefix('[') {
            let end = rest.find(']').ok_or_else(|| invalid(url, "unterminated IPv6 address"))?;
            let port = &rest[end + 1..];
            let port = match port.strip_prefix(':') {
                Some(port) => port,
                None if port.is_empty() => "",
                None => return Err(invalid(url, "invalid host")),
            };
            (&rest[..end], port)
        } else {
            match hostport.rsplit_once(':') {
                Some((host, port)) => (host, port),
                None => (hostport, ""),
            }
        };

        let host = decode_percent_component(url, host)?;
        let port = if port.is_empty() {
            default_port
        } else {
            port.parse::<u16>().map_err(|_| invalid(url, "invalid port"))?
        };

        Ok((if host.is_empty() { DEFAULT_HOST.to_owned() } else { host }, port))
    }
}

impl FromStr for LdapUrl {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LdapUrl::parse(s)
    }
}

impl fmt::Display for LdapUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.secure { "ldaps" } else { "ldap" };
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}/", scheme, self.host, self.port)?;
        } else {
            write!(f, "{}://{}:{}/", scheme, self.host, self.port)?;
        }
        f.write_str(&encode_percent_component(&self.dn, b""))?;

        let scope = self.scope.map(|s| match s {
            SearchScope::BaseObject => "base",
            SearchScope::SingleLevel => "one",
            SearchScope::WholeSubtree => "sub",
        });
        let filter = self.filter.as_ref().map(|f| encode_percent_component(&f.to_string(), b""));
        let extensions = self
            .extensions
            .iter()
            .map(|(name, value)| match value {
                Some(value) => format!("{}={}", name, encode_percent_component(value, b",")),
                None => name.clone(),
            })
            .collect::<Vec<_>>();

        let trailing = [
            self.attributes
                .iter()
                .map(|a| encode_percent_component(a, b","))
                .collect::<Vec<_>>()
                .join(","),
            scope.unwrap_or_default().to_owned(),
            filter.unwrap_or_default(),
            extensions.join(","),
        ];
        let used = trailing.iter().rposition(|c| !c.is_empty()).map(|i| i + 1).unwrap_or(0);
        for component in &trailing[..used] {
            write!(f, "?{}", component)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let url = LdapUrl::parse("ldap://").unwrap();
        assert_eq!(url.host, "localhost");
        assert_eq!(url.port, 389);
        assert!(url.dn.is_empty());
        assert!(!url.secure);

        let url = LdapUrl::parse("ldaps://ldap.example.com/").unwrap();
        assert_eq!(url.host, "ldap.example.com");
        assert_eq!(url.port, 636);
        assert!(url.secure);
    }

    #[test]
    fn test_full_url() {
        let url = LdapUrl::parse("ldap://ldap.example.com:1389/o=University%20of%20Michigan,c=US?cn,mail?one?(cn=Babs*)")
            .unwrap();
        assert_eq!(url.port, 1389);
        assert_eq!(url.dn, "o=University of Michigan,c=US");
        assert_eq!(url.attributes, vec!["cn", "mail"]);
        assert_eq!(url.scope, Some(SearchScope::SingleLevel));
        assert_eq!(url.filter, Some(parse_filter("(cn=Babs*)").unwrap()));

        let again = LdapUrl::parse(&url.to_string()).unwrap();
        assert_eq!(again, url);
    }

    #[test]
    fn test_ipv6_and_extensions() {
        let url = LdapUrl::parse("ldap://[::1]:10389/o=test????bindname=cn%3Dadmin").unwrap();
        assert_eq!(url.host, "::1");
        assert_eq!(url.port, 10389);
        assert_eq!(url.extensions, vec![("bindname".to_owned(), Some("cn=admin".to_owned()))]);
        assert_eq!(url.to_string(), "ldap://[::1]:10389/o=test????bindname=cn=admin");
    }

    #[test]
    fn test_rejects_malformed() {
        for url in [
            "http://host/",
            "ldap://host:port/",
            "ldap://host:70000/",
            "ldap://host/o=x??subtree",
            "ldap://host/o=x???(cn=a",
            "ldap://host/o=x????!critical",
            "ldap://host/o=x?????",
            "ldap://host/o=%zz",
        ] {
            assert!(matches!(LdapUrl::parse(url), Err(Error::InvalidUrl(_))), "url {}", url);
        }
    }

    #[test]
    fn test_display_omits_trailing_components() {
        let url = LdapUrl::parse("ldap://host/o=x??sub").unwrap();
        assert_eq!(url.to_string(), "ldap://host:389/o=x??sub");
    }
}
