//! Data structures

use std::{collections::HashSet, convert::TryFrom};

use bytes::Bytes;

use crate::{
    ber::DecodeError,
    message::{Control, LdapResult},
    ops::{PartialAttribute, SearchResultEntry},
    SearchRequestBuilder,
};

pub use crate::ops::SearchRequest;

/// Search scope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SearchScope {
    BaseObject = 0,
    SingleLevel = 1,
    WholeSubtree = 2,
}

impl TryFrom<u32> for SearchScope {
    type Error = DecodeError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SearchScope::BaseObject),
            1 => Ok(SearchScope::SingleLevel),
            2 => Ok(SearchScope::WholeSubtree),
            _ => Err(DecodeError::InvalidValue("scope")),
        }
    }
}

/// Alias dereferencing policy of a search
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DerefAliases {
    Never = 0,
    InSearching = 1,
    FindingBaseObj = 2,
    Always = 3,
}

impl TryFrom<u32> for DerefAliases {
    type Error = DecodeError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(DerefAliases::Never),
            1 => Ok(DerefAliases::InSearching),
            2 => Ok(DerefAliases::FindingBaseObj),
            3 => Ok(DerefAliases::Always),
            _ => Err(DecodeError::InvalidValue("derefAliases")),
        }
    }
}

/// Kind of a single modification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeOperation {
    Add = 0,
    Delete = 1,
    Replace = 2,
    Increment = 3,
}

impl TryFrom<u32> for ChangeOperation {
    type Error = DecodeError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ChangeOperation::Add),
            1 => Ok(ChangeOperation::Delete),
            2 => Ok(ChangeOperation::Replace),
            3 => Ok(ChangeOperation::Increment),
            _ => Err(DecodeError::InvalidValue("operation")),
        }
    }
}

impl SearchRequest {
    /// Create search request builder
    pub fn builder() -> SearchRequestBuilder {
        SearchRequestBuilder::new()
    }

    /// Create search request to query root DSE object
    pub fn root_dse() -> Self {
        Self::builder().build_with_filter(crate::filter::Filter::Present("objectClass".into()))
    }
}

/// Attributes whose values are never converted to strings
const DEFAULT_BINARY_ATTRIBUTES: &[&str] = &[
    "userpassword",
    "javaserializeddata",
    "jpegphoto",
    "audio",
    "photo",
    "personalsignature",
    "thumbnailphoto",
    "thumbnaillogo",
    "usercertificate",
    "cacertificate",
    "certificaterevocationlist",
    "authorityrevocationlist",
    "crosscertificatepair",
    "x500uniqueidentifier",
];

/// Binary attribute classifier: the well-known binary attributes, any name with
/// a `;binary` option, plus user-declared names. Matching is case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryAttributes {
    names: HashSet<String>,
}

impl Default for BinaryAttributes {
    fn default() -> Self {
        Self {
            names: DEFAULT_BINARY_ATTRIBUTES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl BinaryAttributes {
    /// Default set extended with additional attribute names
    pub fn with_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut attrs = Self::default();
        attrs
            .names
            .extend(names.into_iter().map(|n| n.as_ref().to_ascii_lowercase()));
        attrs
    }

    pub fn is_binary(&self, name: &str) -> bool {
        let name = name.to_ascii_lowercase();
        if name.ends_with(";binary") {
            return true;
        }
        let base = name.split(';').next().unwrap_or_default();
        self.names.contains(base)
    }
}

/// Single attribute value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    Binary(Bytes),
    Text(String),
}

impl AttributeValue {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            AttributeValue::Binary(b) => b,
            AttributeValue::Text(s) => s.as_bytes(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::Binary(_) => None,
            AttributeValue::Text(s) => Some(s),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(s: &str) -> Self {
        AttributeValue::Text(s.to_owned())
    }
}

impl From<String> for AttributeValue {
    fn from(s: String) -> Self {
        AttributeValue::Text(s)
    }
}

impl From<Bytes> for AttributeValue {
    fn from(b: Bytes) -> Self {
        AttributeValue::Binary(b)
    }
}

impl From<Vec<u8>> for AttributeValue {
    fn from(b: Vec<u8>) -> Self {
        AttributeValue::Binary(b.into())
    }
}

impl From<AttributeValue> for Bytes {
    fn from(v: AttributeValue) -> Self {
        match v {
            AttributeValue::Binary(b) => b,
            AttributeValue::Text(s) => s.into(),
        }
    }
}

/// LDAP attribute definition
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attribute {
    /// Attribute name
    pub name: String,
    /// Attribute values
    pub values: Vec<AttributeValue>,
    binary: bool,
}

impl Attribute {
    pub fn new<S, I, V>(name: S, values: I) -> Self
    where
        S: Into<String>,
        I: IntoIterator<Item = V>,
        V: Into<AttributeValue>,
    {
        let name = name.into();
        let binary = BinaryAttributes::default().is_binary(&name);
        Self {
            name,
            values: values.into_iter().map(Into::into).collect(),
            binary,
        }
    }

    /// Build from wire form. All values start out as raw bytes.
    pub fn from_raw(raw: PartialAttribute, binary: &BinaryAttributes) -> Self {
        Self {
            binary: binary.is_binary(&raw.attr_type),
            name: raw.attr_type,
            values: raw.vals.into_iter().map(AttributeValue::Binary).collect(),
        }
    }

    pub fn is_binary(&self) -> bool {
        self.binary
    }

    /// Reinterpret values of a non-binary attribute as text. Binary attributes are left alone.
    pub fn convert_to_strings(&mut self) {
        if self.binary {
            return;
        }
        for value in self.values.iter_mut() {
            if let AttributeValue::Binary(bytes) = value {
                *value = AttributeValue::Text(String::from_utf8_lossy(bytes).into_owned());
            }
        }
    }
}

impl From<Attribute> for PartialAttribute {
    fn from(attr: Attribute) -> Self {
        PartialAttribute::new(attr.name, attr.values)
    }
}

pub type Attributes = Vec<Attribute>;

/// Entry returned by a search
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchEntry {
    pub dn: String,
    pub attributes: Attributes,
    /// Controls attached to the entry PDU
    pub controls: Vec<Control>,
}

impl SearchEntry {
    pub fn from_raw(raw: SearchResultEntry, controls: Option<Vec<Control>>, binary: &BinaryAttributes) -> Self {
        Self {
            dn: raw.object_name,
            attributes: raw
                .attributes
                .into_iter()
                .map(|a| Attribute::from_raw(a, binary))
                .collect(),
            controls: controls.unwrap_or_default(),
        }
    }

    /// Find attribute by name, case-insensitive
    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name.eq_ignore_ascii_case(name))
    }

    pub fn convert_to_strings(&mut self) {
        self.attributes.iter_mut().for_each(Attribute::convert_to_strings);
    }
}

/// Accumulated outcome of a search
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchResult {
    pub entries: Vec<SearchEntry>,
    /// Continuation references received instead of entries
    pub references: Vec<String>,
    pub result: LdapResult,
    /// Controls of the terminating PDU
    pub controls: Vec<Control>,
}

impl SearchResult {
    pub(crate) fn empty() -> Self {
        Self {
            entries: Vec::new(),
            references: Vec::new(),
            result: LdapResult::success(),
            controls: Vec::new(),
        }
    }
}
