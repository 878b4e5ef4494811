//! LDAP connection options

use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

#[cfg(feature = "tls-native-tls")]
pub use native_tls::{Certificate, Identity};

use crate::{
    error::Error,
    message::Control,
    model::{BinaryAttributes, DerefAliases},
    socket::SocketFactory,
};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_REFERRAL_HOP_LIMIT: usize = 10;

/// What to do when the server answers with a referral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReferralMode {
    /// Return what was received; referral objects are read as plain entries
    #[default]
    Ignore,
    /// Chase referrals automatically
    Follow,
    /// Hand the referral to the caller as [`Error::Referral`]
    Throw,
}

/// Transport security of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecurityProtocol {
    Plain,
    Tls,
    StartTls,
}

/// Simple bind credentials
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new<U: Into<String>, P: Into<String>>(username: U, password: P) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// TLS options
#[derive(Clone)]
pub struct TlsOptions {
    #[cfg(feature = "tls-native-tls")]
    pub(crate) ca_certs: Vec<Certificate>,
    pub(crate) verify_hostname: bool,
    pub(crate) verify_certs: bool,
    #[cfg(feature = "tls-native-tls")]
    pub(crate) identity: Option<Identity>,
    pub(crate) domain_name: Option<String>,
}

impl Default for TlsOptions {
    fn default() -> Self {
        Self {
            #[cfg(feature = "tls-native-tls")]
            ca_certs: Vec::new(),
            verify_hostname: true,
            verify_certs: true,
            #[cfg(feature = "tls-native-tls")]
            identity: None,
            domain_name: None,
        }
    }
}

impl fmt::Debug for TlsOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("TlsOptions");
        #[cfg(feature = "tls-native-tls")]
        s.field("ca_certs", &self.ca_certs.len())
            .field("identity", &self.identity.is_some());
        s.field("verify_hostname", &self.verify_hostname)
            .field("verify_certs", &self.verify_certs)
            .field("domain_name", &self.domain_name)
            .finish()
    }
}

impl TlsOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(feature = "tls-native-tls")]
    /// Add CA root certificate to use during TLS handshake
    pub fn ca_cert(mut self, cert: Certificate) -> Self {
        self.ca_certs.push(cert);
        self
    }

    #[cfg(feature = "tls-native-tls")]
    /// Set client identity for mutual TLS authentication
    pub fn identity(mut self, identity: Identity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Specify custom domain name to use for SNI match. The default is the connection host name
    pub fn domain_name<S: AsRef<str>>(mut self, domain_name: S) -> Self {
        self.domain_name = Some(domain_name.as_ref().to_owned());
        self
    }

    /// Enable or disable host name validation in the server certificate.
    /// By default host name validation is enabled.
    /// This option is only used when certificate verification is enabled.
    pub fn verify_hostname(mut self, flag: bool) -> Self {
        self.verify_hostname = flag;
        self
    }

    /// Enable or disable server certificate validation.
    /// By default server certificate validation is enabled.
    pub fn verify_certs(mut self, flag: bool) -> Self {
        self.verify_certs = flag;
        self
    }
}

/// Client environment: every knob consumed by the connection, operation and referral layers.
///
/// Typed setters cover the known settings. [`LdapOptions::set_property`] accepts the same
/// settings by string key and validates the value immediately; unknown keys are kept in an
/// extension map for provider-specific use.
#[derive(Debug, Clone)]
pub struct LdapOptions {
    pub referral: ReferralMode,
    pub referral_hop_limit: usize,
    pub deref_aliases: DerefAliases,
    pub types_only: bool,
    /// Page size of batched searches
    pub batch_size: u32,
    pub binary_attributes: BinaryAttributes,
    /// Controls sent with the bind performed when a connection is opened
    pub connect_controls: Vec<Control>,
    /// Controls attached to every request
    pub request_controls: Vec<Control>,
    pub security: Option<SecurityProtocol>,
    pub socket_factory: Option<Arc<dyn SocketFactory>>,
    pub tls: TlsOptions,
    pub credentials: Option<Credentials>,
    pub connect_timeout: Duration,
    pub operation_timeout: Option<Duration>,
    pub extensions: HashMap<String, String>,
}

impl Default for LdapOptions {
    fn default() -> Self {
        Self {
            referral: ReferralMode::default(),
            referral_hop_limit: DEFAULT_REFERRAL_HOP_LIMIT,
            deref_aliases: DerefAliases::Always,
            types_only: false,
            batch_size: 1,
            binary_attributes: BinaryAttributes::default(),
            connect_controls: Vec::new(),
            request_controls: Vec::new(),
            security: None,
            socket_factory: None,
            tls: TlsOptions::default(),
            credentials: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            operation_timeout: None,
            extensions: HashMap::new(),
        }
    }
}

pub mod keys {
    pub const REFERRAL: &str = "ldap.referral";
    pub const REFERRAL_LIMIT: &str = "ldap.referral.limit";
    pub const DEREF_ALIASES: &str = "ldap.derefAliases";
    pub const TYPES_ONLY: &str = "ldap.typesOnly";
    pub const BATCH_SIZE: &str = "ldap.batchSize";
    pub const BINARY_ATTRIBUTES: &str = "ldap.attributes.binary";
    pub const SECURITY_PROTOCOL: &str = "ldap.security.protocol";
    pub const CONNECT_TIMEOUT: &str = "ldap.connect.timeout";
    pub const OPERATION_TIMEOUT: &str = "ldap.operation.timeout";
}

fn config_error(key: &str, value: &str) -> Error {
    Error::Config(format!("invalid value for {}: {:?}", key, value))
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, Error> {
    value.trim().parse().map_err(|_| config_error(key, value))
}

impl LdapOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn referral(mut self, mode: ReferralMode) -> Self {
        self.referral = mode;
        self
    }

    /// Maximum number of referral hops chased in follow mode
    pub fn referral_hop_limit(mut self, limit: usize) -> Self {
        self.referral_hop_limit = limit;
        self
    }

    pub fn deref_aliases(mut self, deref: DerefAliases) -> Self {
        self.deref_aliases = deref;
        self
    }

    pub fn types_only(mut self, flag: bool) -> Self {
        self.types_only = flag;
        self
    }

    pub fn batch_size(mut self, size: u32) -> Self {
        self.batch_size = size;
        self
    }

    /// Declare additional binary attributes on top of the well-known ones
    pub fn binary_attributes<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.binary_attributes = BinaryAttributes::with_names(names);
        self
    }

    pub fn connect_controls(mut self, controls: Vec<Control>) -> Self {
        self.connect_controls = controls;
        self
    }

    pub fn request_controls(mut self, controls: Vec<Control>) -> Self {
        self.request_controls = controls;
        self
    }

    pub fn security(mut self, protocol: SecurityProtocol) -> Self {
        self.security = Some(protocol);
        self
    }

    /// Override the socket factory. An override always takes precedence over the URL scheme.
    pub fn socket_factory(mut self, factory: Arc<dyn SocketFactory>) -> Self {
        self.socket_factory = Some(factory);
        self
    }

    pub fn tls_options(mut self, options: TlsOptions) -> Self {
        self.tls = options;
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    /// Set a setting by its string key, validating the value now rather than at use
    pub fn set_property<K, V>(&mut self, key: K, value: V) -> Result<(), Error>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let (key, value) = (key.as_ref(), value.as_ref());
        match key {
            keys::REFERRAL => {
                self.referral = match value {
                    "ignore" => ReferralMode::Ignore,
                    "follow" => ReferralMode::Follow,
                    "throw" => ReferralMode::Throw,
                    _ => return Err(config_error(key, value)),
                }
            }
            keys::REFERRAL_LIMIT => self.referral_hop_limit = parse_number(key, value)?,
            keys::DEREF_ALIASES => {
                self.deref_aliases = match value {
                    "never" => DerefAliases::Never,
                    "searching" => DerefAliases::InSearching,
                    "finding" => DerefAliases::FindingBaseObj,
                    "always" => DerefAliases::Always,
                    _ => return Err(config_error(key, value)),
                }
            }
            keys::TYPES_ONLY => {
                self.types_only = match value.to_ascii_lowercase().as_str() {
                    "true" => true,
                    "false" => false,
                    _ => return Err(config_error(key, value)),
                }
            }
            keys::BATCH_SIZE => self.batch_size = parse_number(key, value)?,
            keys::BINARY_ATTRIBUTES => {
                self.binary_attributes = BinaryAttributes::with_names(value.split_whitespace());
            }
            keys::SECURITY_PROTOCOL => {
                self.security = match value.to_ascii_lowercase().as_str() {
                    "" | "none" => None,
                    "plain" => Some(SecurityProtocol::Plain),
                    "ssl" | "tls" => Some(SecurityProtocol::Tls),
                    "starttls" => Some(SecurityProtocol::StartTls),
                    _ => return Err(config_error(key, value)),
                }
            }
            keys::CONNECT_TIMEOUT => {
                self.connect_timeout = Duration::from_millis(parse_number(key, value)?);
            }
            keys::OPERATION_TIMEOUT => {
                self.operation_timeout = match parse_number::<u64>(key, value)? {
                    0 => None,
                    millis => Some(Duration::from_millis(millis)),
                }
            }
            _ => {
                self.extensions.insert(key.to_owned(), value.to_owned());
            }
        }
        Ok(())
    }

    /// Merged environment: the given properties override, everything else falls back to `self`
    pub fn with_properties<I, K, V>(&self, properties: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut merged = self.clone();
        for (key, value) in properties {
            merged.set_property(key, value)?;
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = LdapOptions::new();
        assert_eq!(options.referral, ReferralMode::Ignore);
        assert_eq!(options.referral_hop_limit, 10);
        assert_eq!(options.deref_aliases, DerefAliases::Always);
        assert_eq!(options.batch_size, 1);
        assert_eq!(options.connect_timeout, Duration::from_secs(10));
        assert!(options.operation_timeout.is_none());
    }

    #[test]
    fn test_set_property() {
        let mut options = LdapOptions::new();
        options.set_property(keys::REFERRAL, "follow").unwrap();
        options.set_property(keys::BATCH_SIZE, "100").unwrap();
        options.set_property(keys::DEREF_ALIASES, "never").unwrap();
        options.set_property(keys::BINARY_ATTRIBUTES, "objectGUID objectSid").unwrap();
        options.set_property(keys::OPERATION_TIMEOUT, "2500").unwrap();
        options.set_property("vendor.custom", "x").unwrap();

        assert_eq!(options.referral, ReferralMode::Follow);
        assert_eq!(options.batch_size, 100);
        assert_eq!(options.deref_aliases, DerefAliases::Never);
        assert!(options.binary_attributes.is_binary("objectsid"));
        assert!(options.binary_attributes.is_binary("photo"));
        assert_eq!(options.operation_timeout, Some(Duration::from_millis(2500)));
        assert_eq!(options.extensions.get("vendor.custom").map(String::as_str), Some("x"));
    }

    #[test]
    fn test_invalid_values_rejected_eagerly() {
        let mut options = LdapOptions::new();
        for (key, value) in [
            (keys::BATCH_SIZE, "ten"),
            (keys::REFERRAL, "chase"),
            (keys::TYPES_ONLY, "yes"),
            (keys::REFERRAL_LIMIT, "-1"),
            (keys::SECURITY_PROTOCOL, "quantum"),
        ] {
            assert!(matches!(options.set_property(key, value), Err(Error::Config(_))), "{}", key);
        }
        assert_eq!(options.batch_size, 1);
    }

    #[test]
    fn test_security_protocol_property() {
        let mut options = LdapOptions::new();
        options.set_property(keys::SECURITY_PROTOCOL, "Plain").unwrap();
        assert_eq!(options.security, Some(SecurityProtocol::Plain));

        options.set_property(keys::SECURITY_PROTOCOL, "starttls").unwrap();
        assert_eq!(options.security, Some(SecurityProtocol::StartTls));

        options.set_property(keys::SECURITY_PROTOCOL, "none").unwrap();
        assert_eq!(options.security, None);
    }

    #[test]
    fn test_merged_environment() {
        let base = LdapOptions::new()
            .referral(ReferralMode::Throw)
            .credentials(Credentials::new("cn=admin", "secret"));
        let merged = base.with_properties([(keys::REFERRAL, "follow")]).unwrap();

        assert_eq!(merged.referral, ReferralMode::Follow);
        assert_eq!(merged.credentials, base.credentials);
        assert_eq!(base.referral, ReferralMode::Throw);
        assert!(!format!("{:?}", merged.credentials).contains("secret"));
    }
}
