//! Protocol operations (RFC 4511 section 4.2 - 4.14)

use bytes::Bytes;

use crate::{
    ber::{BerDecode, BerEncode, BerReader, BerWriter, DecodeError, Tag},
    filter::{AttributeValueAssertion, Filter},
    message::{tags, LdapResult, ProtocolOp, ResultCode},
    model::{ChangeOperation, DerefAliases, SearchScope},
    url::LdapUrl,
};

/// Request/response pair with a single response PDU
pub trait Operation: Clone + Send + Sync + 'static {
    /// Operation-specific payload of a successful response
    type Output: Send;

    const REQUEST_TAG: u32;
    const RESPONSE_TAG: u32;

    fn into_protocol_op(self) -> ProtocolOp;

    /// Split the paired response into its result and payload, `None` for any other PDU
    fn parse_response(op: ProtocolOp) -> Option<(LdapResult, Self::Output)>;

    fn is_success(code: ResultCode) -> bool {
        code == ResultCode::Success
    }

    /// Rebuild the request for a referral target. A non-empty URL DN replaces the target entry.
    fn rewrite_for_referral(self, url: &LdapUrl) -> Self;
}

fn referral_dn(current: String, url: &LdapUrl) -> String {
    if url.dn.is_empty() {
        current
    } else {
        url.dn.clone()
    }
}

/// Attribute type with a set of values, as carried in entries and modifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialAttribute {
    pub attr_type: String,
    pub vals: Vec<Bytes>,
}

impl PartialAttribute {
    pub fn new<S, I, V>(attr_type: S, vals: I) -> Self
    where
        S: Into<String>,
        I: IntoIterator<Item = V>,
        V: Into<Bytes>,
    {
        Self {
            attr_type: attr_type.into(),
            vals: vals.into_iter().map(Into::into).collect(),
        }
    }
}

impl BerEncode for PartialAttribute {
    fn encode_ber(&self, w: &mut BerWriter) {
        w.write_sequence(|w| {
            w.write_octet_string(Tag::OCTET_STRING, self.attr_type.as_bytes());
            w.write_constructed(Tag::SET, |w| {
                for val in &self.vals {
                    w.write_octet_string(Tag::OCTET_STRING, val);
                }
            });
        });
    }
}

impl BerDecode for PartialAttribute {
    fn decode_ber(r: &mut BerReader<'_>) -> Result<Self, DecodeError> {
        let mut seq = r.read_sequence()?;
        let attr_type = seq.read_string(Tag::OCTET_STRING)?;
        let mut set = seq.read_constructed(Tag::SET)?;
        let mut vals = Vec::new();
        while !set.is_empty() {
            vals.push(set.read_bytes(Tag::OCTET_STRING)?);
        }
        seq.finish()?;
        Ok(PartialAttribute { attr_type, vals })
    }
}

fn encode_attribute_list(w: &mut BerWriter, attrs: &[PartialAttribute]) {
    w.write_sequence(|w| {
        for attr in attrs {
            attr.encode_ber(w);
        }
    });
}

fn decode_attribute_list(r: &mut BerReader<'_>) -> Result<Vec<PartialAttribute>, DecodeError> {
    let mut seq = r.read_sequence()?;
    let mut attrs = Vec::new();
    while !seq.is_empty() {
        attrs.push(seq.read()?);
    }
    Ok(attrs)
}

/// Bind credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authentication {
    Simple(Bytes),
    Sasl { mechanism: String, credentials: Option<Bytes> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindRequest {
    pub version: u8,
    pub name: String,
    pub authentication: Authentication,
}

impl BindRequest {
    /// LDAPv3 simple bind
    pub fn simple<N: Into<String>, P: AsRef<str>>(name: N, password: P) -> Self {
        Self {
            version: 3,
            name: name.into(),
            authentication: Authentication::Simple(Bytes::copy_from_slice(password.as_ref().as_bytes())),
        }
    }

    /// LDAPv3 SASL bind
    pub fn sasl<M: Into<String>>(mechanism: M, credentials: Option<Bytes>) -> Self {
        Self {
            version: 3,
            name: String::new(),
            authentication: Authentication::Sasl {
                mechanism: mechanism.into(),
                credentials,
            },
        }
    }
}

impl BerEncode for BindRequest {
    fn encode_ber(&self, w: &mut BerWriter) {
        w.write_constructed(Tag::application(tags::BIND_REQUEST), |w| {
            w.write_integer(Tag::INTEGER, self.version as i64);
            w.write_octet_string(Tag::OCTET_STRING, self.name.as_bytes());
            match self.authentication {
                Authentication::Simple(ref password) => w.write_octet_string(Tag::context(0), password),
                Authentication::Sasl {
                    ref mechanism,
                    ref credentials,
                } => w.write_constructed(Tag::context(3), |w| {
                    w.write_octet_string(Tag::OCTET_STRING, mechanism.as_bytes());
                    if let Some(creds) = credentials {
                        w.write_octet_string(Tag::OCTET_STRING, creds);
                    }
                }),
            }
        });
    }
}

impl BerDecode for BindRequest {
    fn decode_ber(r: &mut BerReader<'_>) -> Result<Self, DecodeError> {
        let mut seq = r.read_constructed(Tag::application(tags::BIND_REQUEST))?;
        let version = u8::try_from(seq.read_integer(Tag::INTEGER)?).map_err(|_| DecodeError::InvalidValue("version"))?;
        let name = seq.read_string(Tag::OCTET_STRING)?;
        let authentication = match seq.peek_tag()? {
            Some(tag) if tag == Tag::context(0) => Authentication::Simple(seq.read_bytes(Tag::context(0))?),
            Some(tag) if tag == Tag::context(3).constructed() => {
                let mut sasl = seq.read_constructed(Tag::context(3))?;
                let mechanism = sasl.read_string(Tag::OCTET_STRING)?;
                let credentials = sasl.read_optional(Tag::OCTET_STRING, |r| r.read_bytes(Tag::OCTET_STRING))?;
                sasl.finish()?;
                Authentication::Sasl { mechanism, credentials }
            }
            _ => return Err(DecodeError::InvalidValue("AuthenticationChoice")),
        };
        seq.finish()?;
        Ok(BindRequest {
            version,
            name,
            authentication,
        })
    }
}

impl Operation for BindRequest {
    type Output = Option<Bytes>;

    const REQUEST_TAG: u32 = tags::BIND_REQUEST;
    const RESPONSE_TAG: u32 = tags::BIND_RESPONSE;

    fn into_protocol_op(self) -> ProtocolOp {
        ProtocolOp::BindRequest(self)
    }

    fn parse_response(op: ProtocolOp) -> Option<(LdapResult, Self::Output)> {
        match op {
            ProtocolOp::BindResponse(resp) => Some((resp.result, resp.server_sasl_creds)),
            _ => None,
        }
    }

    fn rewrite_for_referral(self, _url: &LdapUrl) -> Self {
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindResponse {
    pub result: LdapResult,
    pub server_sasl_creds: Option<Bytes>,
}

impl BerEncode for BindResponse {
    fn encode_ber(&self, w: &mut BerWriter) {
        w.write_constructed(Tag::application(tags::BIND_RESPONSE), |w| {
            self.result.encode_components(w);
            if let Some(ref creds) = self.server_sasl_creds {
                w.write_octet_string(Tag::context(7), creds);
            }
        });
    }
}

impl BerDecode for BindResponse {
    fn decode_ber(r: &mut BerReader<'_>) -> Result<Self, DecodeError> {
        let mut seq = r.read_constructed(Tag::application(tags::BIND_RESPONSE))?;
        let result = LdapResult::decode_components(&mut seq)?;
        let server_sasl_creds = seq.read_optional(Tag::context(7), |r| r.read_bytes(Tag::context(7)))?;
        seq.finish()?;
        Ok(BindResponse {
            result,
            server_sasl_creds,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub base_object: String,
    pub scope: SearchScope,
    pub deref_aliases: DerefAliases,
    pub size_limit: u32,
    pub time_limit: u32,
    pub types_only: bool,
    pub filter: Filter,
    pub attributes: Vec<String>,
}

impl SearchRequest {
    /// Rebuild the search for a referral target: the URL's DN, scope, filter and attributes
    /// override the original ones when present
    pub fn rewrite_for_referral(mut self, url: &LdapUrl) -> Self {
        self.base_object = referral_dn(self.base_object, url);
        if let Some(scope) = url.scope {
            self.scope = scope;
        }
        if let Some(ref filter) = url.filter {
            self.filter = filter.clone();
        }
        if !url.attributes.is_empty() {
            self.attributes = url.attributes.clone();
        }
        self
    }
}

impl BerEncode for SearchRequest {
    fn encode_ber(&self, w: &mut BerWriter) {
        w.write_constructed(Tag::application(tags::SEARCH_REQUEST), |w| {
            w.write_octet_string(Tag::OCTET_STRING, self.base_object.as_bytes());
            w.write_enumerated(self.scope as u32);
            w.write_enumerated(self.deref_aliases as u32);
            w.write_integer(Tag::INTEGER, self.size_limit as i64);
            w.write_integer(Tag::INTEGER, self.time_limit as i64);
            w.write_boolean(Tag::BOOLEAN, self.types_only);
            self.filter.encode_ber(w);
            w.write_sequence(|w| {
                for attr in &self.attributes {
                    w.write_octet_string(Tag::OCTET_STRING, attr.as_bytes());
                }
            });
        });
    }
}

impl BerDecode for SearchRequest {
    fn decode_ber(r: &mut BerReader<'_>) -> Result<Self, DecodeError> {
        let mut seq = r.read_constructed(Tag::application(tags::SEARCH_REQUEST))?;
        let base_object = seq.read_string(Tag::OCTET_STRING)?;
        let scope = SearchScope::try_from(seq.read_enumerated()?)?;
        let deref_aliases = DerefAliases::try_from(seq.read_enumerated()?)?;
        let size_limit = seq.read_u32(Tag::INTEGER)?;
        let time_limit = seq.read_u32(Tag::INTEGER)?;
        let types_only = seq.read_boolean(Tag::BOOLEAN)?;
        let filter = seq.read()?;
        let mut attrs = seq.read_sequence()?;
        let mut attributes = Vec::new();
        while !attrs.is_empty() {
            attributes.push(attrs.read_string(Tag::OCTET_STRING)?);
        }
        seq.finish()?;
        Ok(SearchRequest {
            base_object,
            scope,
            deref_aliases,
            size_limit,
            time_limit,
            types_only,
            filter,
            attributes,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResultEntry {
    pub object_name: String,
    pub attributes: Vec<PartialAttribute>,
}

impl BerEncode for SearchResultEntry {
    fn encode_ber(&self, w: &mut BerWriter) {
        w.write_constructed(Tag::application(tags::SEARCH_RESULT_ENTRY), |w| {
            w.write_octet_string(Tag::OCTET_STRING, self.object_name.as_bytes());
            encode_attribute_list(w, &self.attributes);
        });
    }
}

impl BerDecode for SearchResultEntry {
    fn decode_ber(r: &mut BerReader<'_>) -> Result<Self, DecodeError> {
        let mut seq = r.read_constructed(Tag::application(tags::SEARCH_RESULT_ENTRY))?;
        let object_name = seq.read_string(Tag::OCTET_STRING)?;
        let attributes = decode_attribute_list(&mut seq)?;
        seq.finish()?;
        Ok(SearchResultEntry { object_name, attributes })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub operation: ChangeOperation,
    pub modification: PartialAttribute,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyRequest {
    pub object: String,
    pub changes: Vec<Change>,
}

impl BerEncode for ModifyRequest {
    fn encode_ber(&self, w: &mut BerWriter) {
        w.write_constructed(Tag::application(tags::MODIFY_REQUEST), |w| {
            w.write_octet_string(Tag::OCTET_STRING, self.object.as_bytes());
            w.write_sequence(|w| {
                for change in &self.changes {
                    w.write_sequence(|w| {
                        w.write_enumerated(change.operation as u32);
                        change.modification.encode_ber(w);
                    });
                }
            });
        });
    }
}

impl BerDecode for ModifyRequest {
    fn decode_ber(r: &mut BerReader<'_>) -> Result<Self, DecodeError> {
        let mut seq = r.read_constructed(Tag::application(tags::MODIFY_REQUEST))?;
        let object = seq.read_string(Tag::OCTET_STRING)?;
        let mut list = seq.read_sequence()?;
        let mut changes = Vec::new();
        while !list.is_empty() {
            let mut change = list.read_sequence()?;
            let operation = ChangeOperation::try_from(change.read_enumerated()?)?;
            let modification = change.read()?;
            change.finish()?;
            changes.push(Change {
                operation,
                modification,
            });
        }
        seq.finish()?;
        Ok(ModifyRequest { object, changes })
    }
}

impl Operation for ModifyRequest {
    type Output = ();

    const REQUEST_TAG: u32 = tags::MODIFY_REQUEST;
    const RESPONSE_TAG: u32 = tags::MODIFY_RESPONSE;

    fn into_protocol_op(self) -> ProtocolOp {
        ProtocolOp::ModifyRequest(self)
    }

    fn parse_response(op: ProtocolOp) -> Option<(LdapResult, Self::Output)> {
        match op {
            ProtocolOp::ModifyResponse(result) => Some((result, ())),
            _ => None,
        }
    }

    fn rewrite_for_referral(mut self, url: &LdapUrl) -> Self {
        self.object = referral_dn(self.object, url);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddRequest {
    pub entry: String,
    pub attributes: Vec<PartialAttribute>,
}

impl AddRequest {
    pub fn new<S: Into<String>>(entry: S, attributes: Vec<PartialAttribute>) -> Self {
        Self {
            entry: entry.into(),
            attributes,
        }
    }
}

impl BerEncode for AddRequest {
    fn encode_ber(&self, w: &mut BerWriter) {
        w.write_constructed(Tag::application(tags::ADD_REQUEST), |w| {
            w.write_octet_string(Tag::OCTET_STRING, self.entry.as_bytes());
            encode_attribute_list(w, &self.attributes);
        });
    }
}

impl BerDecode for AddRequest {
    fn decode_ber(r: &mut BerReader<'_>) -> Result<Self, DecodeError> {
        let mut seq = r.read_constructed(Tag::application(tags::ADD_REQUEST))?;
        let entry = seq.read_string(Tag::OCTET_STRING)?;
        let attributes = decode_attribute_list(&mut seq)?;
        seq.finish()?;
        Ok(AddRequest { entry, attributes })
    }
}

impl Operation for AddRequest {
    type Output = ();

    const REQUEST_TAG: u32 = tags::ADD_REQUEST;
    const RESPONSE_TAG: u32 = tags::ADD_RESPONSE;

    fn into_protocol_op(self) -> ProtocolOp {
        ProtocolOp::AddRequest(self)
    }

    fn parse_response(op: ProtocolOp) -> Option<(LdapResult, Self::Output)> {
        match op {
            ProtocolOp::AddResponse(result) => Some((result, ())),
            _ => None,
        }
    }

    fn rewrite_for_referral(mut self, url: &LdapUrl) -> Self {
        self.entry = referral_dn(self.entry, url);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelRequest {
    pub entry: String,
}

impl DelRequest {
    pub fn new<S: Into<String>>(entry: S) -> Self {
        Self { entry: entry.into() }
    }
}

impl BerEncode for DelRequest {
    fn encode_ber(&self, w: &mut BerWriter) {
        w.write_octet_string(Tag::application(tags::DEL_REQUEST), self.entry.as_bytes());
    }
}

impl BerDecode for DelRequest {
    fn decode_ber(r: &mut BerReader<'_>) -> Result<Self, DecodeError> {
        Ok(DelRequest {
            entry: r.read_string(Tag::application(tags::DEL_REQUEST))?,
        })
    }
}

impl Operation for DelRequest {
    type Output = ();

    const REQUEST_TAG: u32 = tags::DEL_REQUEST;
    const RESPONSE_TAG: u32 = tags::DEL_RESPONSE;

    fn into_protocol_op(self) -> ProtocolOp {
        ProtocolOp::DelRequest(self)
    }

    fn parse_response(op: ProtocolOp) -> Option<(LdapResult, Self::Output)> {
        match op {
            ProtocolOp::DelResponse(result) => Some((result, ())),
            _ => None,
        }
    }

    fn rewrite_for_referral(mut self, url: &LdapUrl) -> Self {
        self.entry = referral_dn(self.entry, url);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModifyDnRequest {
    pub entry: String,
    pub new_rdn: String,
    pub delete_old_rdn: bool,
    pub new_superior: Option<String>,
}

impl ModifyDnRequest {
    pub fn new<E: Into<String>, R: Into<String>>(entry: E, new_rdn: R, delete_old_rdn: bool) -> Self {
        Self {
            entry: entry.into(),
            new_rdn: new_rdn.into(),
            delete_old_rdn,
            new_superior: None,
        }
    }

    pub fn new_superior<S: Into<String>>(mut self, superior: S) -> Self {
        self.new_superior = Some(superior.into());
        self
    }
}

impl BerEncode for ModifyDnRequest {
    fn encode_ber(&self, w: &mut BerWriter) {
        w.write_constructed(Tag::application(tags::MODIFY_DN_REQUEST), |w| {
            w.write_octet_string(Tag::OCTET_STRING, self.entry.as_bytes());
            w.write_octet_string(Tag::OCTET_STRING, self.new_rdn.as_bytes());
            w.write_boolean(Tag::BOOLEAN, self.delete_old_rdn);
            if let Some(ref superior) = self.new_superior {
                w.write_octet_string(Tag::context(0), superior.as_bytes());
            }
        });
    }
}

impl BerDecode for ModifyDnRequest {
    fn decode_ber(r: &mut BerReader<'_>) -> Result<Self, DecodeError> {
        let mut seq = r.read_constructed(Tag::application(tags::MODIFY_DN_REQUEST))?;
        let entry = seq.read_string(Tag::OCTET_STRING)?;
        let new_rdn = seq.read_string(Tag::OCTET_STRING)?;
        let delete_old_rdn = seq.read_boolean(Tag::BOOLEAN)?;
        let new_superior = seq.read_optional(Tag::context(0), |r| r.read_string(Tag::context(0)))?;
        seq.finish()?;
        Ok(ModifyDnRequest {
            entry,
            new_rdn,
            delete_old_rdn,
            new_superior,
        })
    }
}

impl Operation for ModifyDnRequest {
    type Output = ();

    const REQUEST_TAG: u32 = tags::MODIFY_DN_REQUEST;
    const RESPONSE_TAG: u32 = tags::MODIFY_DN_RESPONSE;

    fn into_protocol_op(self) -> ProtocolOp {
        ProtocolOp::ModifyDnRequest(self)
    }

    fn parse_response(op: ProtocolOp) -> Option<(LdapResult, Self::Output)> {
        match op {
            ProtocolOp::ModifyDnResponse(result) => Some((result, ())),
            _ => None,
        }
    }

    fn rewrite_for_referral(mut self, url: &LdapUrl) -> Self {
        self.entry = referral_dn(self.entry, url);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompareRequest {
    pub entry: String,
    pub ava: AttributeValueAssertion,
}

impl CompareRequest {
    pub fn new<E, A, V>(entry: E, attribute: A, value: V) -> Self
    where
        E: Into<String>,
        A: Into<String>,
        V: Into<Bytes>,
    {
        Self {
            entry: entry.into(),
            ava: AttributeValueAssertion::new(attribute, value),
        }
    }
}

impl BerEncode for CompareRequest {
    fn encode_ber(&self, w: &mut BerWriter) {
        w.write_constructed(Tag::application(tags::COMPARE_REQUEST), |w| {
            w.write_octet_string(Tag::OCTET_STRING, self.entry.as_bytes());
            self.ava.encode_as(Tag::SEQUENCE, w);
        });
    }
}

impl BerDecode for CompareRequest {
    fn decode_ber(r: &mut BerReader<'_>) -> Result<Self, DecodeError> {
        let mut seq = r.read_constructed(Tag::application(tags::COMPARE_REQUEST))?;
        let entry = seq.read_string(Tag::OCTET_STRING)?;
        let ava = AttributeValueAssertion::decode_as(Tag::SEQUENCE, &mut seq)?;
        seq.finish()?;
        Ok(CompareRequest { entry, ava })
    }
}

impl Operation for CompareRequest {
    /// True if the entry holds the asserted value
    type Output = bool;

    const REQUEST_TAG: u32 = tags::COMPARE_REQUEST;
    const RESPONSE_TAG: u32 = tags::COMPARE_RESPONSE;

    fn into_protocol_op(self) -> ProtocolOp {
        ProtocolOp::CompareRequest(self)
    }

    fn parse_response(op: ProtocolOp) -> Option<(LdapResult, Self::Output)> {
        match op {
            ProtocolOp::CompareResponse(result) => {
                let matched = result.result_code == ResultCode::CompareTrue;
                Some((result, matched))
            }
            _ => None,
        }
    }

    fn is_success(code: ResultCode) -> bool {
        matches!(code, ResultCode::CompareTrue | ResultCode::CompareFalse)
    }

    fn rewrite_for_referral(mut self, url: &LdapUrl) -> Self {
        self.entry = referral_dn(self.entry, url);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedRequest {
    pub request_name: String,
    pub request_value: Option<Bytes>,
}

impl ExtendedRequest {
    pub fn new<S: Into<String>>(request_name: S, request_value: Option<Bytes>) -> Self {
        Self {
            request_name: request_name.into(),
            request_value,
        }
    }
}

impl BerEncode for ExtendedRequest {
    fn encode_ber(&self, w: &mut BerWriter) {
        w.write_constructed(Tag::application(tags::EXTENDED_REQUEST), |w| {
            w.write_octet_string(Tag::context(0), self.request_name.as_bytes());
            if let Some(ref value) = self.request_value {
                w.write_octet_string(Tag::context(1), value);
            }
        });
    }
}

impl BerDecode for ExtendedRequest {
    fn decode_ber(r: &mut BerReader<'_>) -> Result<Self, DecodeError> {
        let mut seq = r.read_constructed(Tag::application(tags::EXTENDED_REQUEST))?;
        let request_name = seq.read_string(Tag::context(0))?;
        let request_value = seq.read_optional(Tag::context(1), |r| r.read_bytes(Tag::context(1)))?;
        seq.finish()?;
        Ok(ExtendedRequest {
            request_name,
            request_value,
        })
    }
}

impl Operation for ExtendedRequest {
    type Output = ExtendedResponse;

    const REQUEST_TAG: u32 = tags::EXTENDED_REQUEST;
    const RESPONSE_TAG: u32 = tags::EXTENDED_RESPONSE;

    fn into_protocol_op(self) -> ProtocolOp {
        ProtocolOp::ExtendedReq(self)
    }

    fn parse_response(op: ProtocolOp) -> Option<(LdapResult, Self::Output)> {
        match op {
            ProtocolOp::ExtendedResp(resp) => Some((resp.result.clone(), resp)),
            _ => None,
        }
    }

    fn rewrite_for_referral(self, _url: &LdapUrl) -> Self {
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtendedResponse {
    pub result: LdapResult,
    pub response_name: Option<String>,
    pub response_value: Option<Bytes>,
}

impl BerEncode for ExtendedResponse {
    fn encode_ber(&self, w: &mut BerWriter) {
        w.write_constructed(Tag::application(tags::EXTENDED_RESPONSE), |w| {
            self.result.encode_components(w);
            if let Some(ref name) = self.response_name {
                w.write_octet_string(Tag::context(10), name.as_bytes());
            }
            if let Some(ref value) = self.response_value {
                w.write_octet_string(Tag::context(11), value);
            }
        });
    }
}

impl BerDecode for ExtendedResponse {
    fn decode_ber(r: &mut BerReader<'_>) -> Result<Self, DecodeError> {
        let mut seq = r.read_constructed(Tag::application(tags::EXTENDED_RESPONSE))?;
        let result = LdapResult::decode_components(&mut seq)?;
        let response_name = seq.read_optional(Tag::context(10), |r| r.read_string(Tag::context(10)))?;
        let response_value = seq.read_optional(Tag::context(11), |r| r.read_bytes(Tag::context(11)))?;
        seq.finish()?;
        Ok(ExtendedResponse {
            result,
            response_name,
            response_value,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntermediateResponse {
    pub response_name: Option<String>,
    pub response_value: Option<Bytes>,
}

impl BerEncode for IntermediateResponse {
    fn encode_ber(&self, w: &mut BerWriter) {
        w.write_constructed(Tag::application(tags::INTERMEDIATE_RESPONSE), |w| {
            if let Some(ref name) = self.response_name {
                w.write_octet_string(Tag::context(0), name.as_bytes());
            }
            if let Some(ref value) = self.response_value {
                w.write_octet_string(Tag::context(1), value);
            }
        });
    }
}

impl BerDecode for IntermediateResponse {
    fn decode_ber(r: &mut BerReader<'_>) -> Result<Self, DecodeError> {
        let mut seq = r.read_constructed(Tag::application(tags::INTERMEDIATE_RESPONSE))?;
        let response_name = seq.read_optional(Tag::context(0), |r| r.read_string(Tag::context(0)))?;
        let response_value = seq.read_optional(Tag::context(1), |r| r.read_bytes(Tag::context(1)))?;
        seq.finish()?;
        Ok(IntermediateResponse {
            response_name,
            response_value,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        ber,
        filter::parse_filter,
        message::{Control, LdapMessage},
    };

    fn round_trip(msg: LdapMessage) {
        let bytes = ber::encode(&msg);
        let decoded: LdapMessage = ber::decode(&bytes).unwrap();
        assert_eq!(decoded, msg, "round trip of {:?}", msg.protocol_op.tag());
    }

    #[test]
    fn test_operations_round_trip() {
        let result = LdapResult::new(ResultCode::NoSuchObject, "o=apache", "no such entry");
        let ops = vec![
            ProtocolOp::BindRequest(BindRequest::simple("cn=admin", "secret")),
            ProtocolOp::BindRequest(BindRequest::sasl("EXTERNAL", None)),
            ProtocolOp::BindResponse(BindResponse {
                result: LdapResult::success(),
                server_sasl_creds: Some(Bytes::from_static(b"creds")),
            }),
            ProtocolOp::UnbindRequest,
            ProtocolOp::SearchRequest(SearchRequest {
                base_object: "o=apache".into(),
                scope: SearchScope::SingleLevel,
                deref_aliases: DerefAliases::Always,
                size_limit: 100,
                time_limit: 30,
                types_only: true,
                filter: parse_filter("(&(objectClass=person)(|(cn=a*)(!(sn=b))))").unwrap(),
                attributes: vec!["cn".into(), "mail".into()],
            }),
            ProtocolOp::SearchResEntry(SearchResultEntry {
                object_name: "cn=a,o=apache".into(),
                attributes: vec![PartialAttribute::new("cn", [Bytes::from_static(b"a")])],
            }),
            ProtocolOp::SearchResRef(vec!["ldap://other/o=apache".into()]),
            ProtocolOp::SearchResDone(result.clone()),
            ProtocolOp::ModifyRequest(ModifyRequest {
                object: "cn=a,o=apache".into(),
                changes: vec![
                    Change {
                        operation: ChangeOperation::Replace,
                        modification: PartialAttribute::new("mail", [Bytes::from_static(b"a@apache.org")]),
                    },
                    Change {
                        operation: ChangeOperation::Delete,
                        modification: PartialAttribute::new("phone", Vec::<Bytes>::new()),
                    },
                ],
            }),
            ProtocolOp::ModifyResponse(result.clone()),
            ProtocolOp::AddRequest(AddRequest::new(
                "cn=b,o=apache",
                vec![PartialAttribute::new(
                    "objectClass",
                    [Bytes::from_static(b"top"), Bytes::from_static(b"person")],
                )],
            )),
            ProtocolOp::AddResponse(LdapResult::success()),
            ProtocolOp::DelRequest(DelRequest::new("cn=b,o=apache")),
            ProtocolOp::DelResponse(result.clone()),
            ProtocolOp::ModifyDnRequest(ModifyDnRequest::new("cn=b,o=apache", "cn=c", true).new_superior("ou=x,o=apache")),
            ProtocolOp::ModifyDnResponse(LdapResult::success()),
            ProtocolOp::CompareRequest(CompareRequest::new("cn=b,o=apache", "sn", Bytes::from_static(b"b"))),
            ProtocolOp::CompareResponse(LdapResult::new(ResultCode::CompareTrue, "", "")),
            ProtocolOp::AbandonRequest(300),
            ProtocolOp::ExtendedReq(ExtendedRequest::new("1.3.6.1.4.1.4203.1.11.3", None)),
            ProtocolOp::ExtendedResp(ExtendedResponse {
                result: LdapResult::success(),
                response_name: None,
                response_value: Some(Bytes::from_static(b"dn:cn=admin")),
            }),
            ProtocolOp::IntermediateResp(IntermediateResponse {
                response_name: Some("1.2.3".into()),
                response_value: None,
            }),
        ];

        for (id, op) in ops.into_iter().enumerate() {
            round_trip(LdapMessage::new(id as u32 + 1, op.clone()));
            round_trip(LdapMessage::new(id as u32 + 1, op).with_controls(vec![Control::new("1.2.840.113556.1.4.319", false, None)]));
        }
    }

    #[test]
    fn test_compare_outcome() {
        let (result, matched) =
            CompareRequest::parse_response(ProtocolOp::CompareResponse(LdapResult::new(ResultCode::CompareFalse, "", "")))
                .unwrap();
        assert!(!matched);
        assert!(CompareRequest::is_success(result.result_code));
        assert!(!DelRequest::is_success(ResultCode::CompareTrue));
        assert!(DelRequest::parse_response(ProtocolOp::AddResponse(LdapResult::success())).is_none());
    }

    #[test]
    fn test_referral_rewrite() {
        let url = LdapUrl::parse("ldap://other.example.com/ou=people,o=apache").unwrap();
        let req = DelRequest::new("cn=x,o=apache").rewrite_for_referral(&url);
        assert_eq!(req.entry, "ou=people,o=apache");

        let url = LdapUrl::parse("ldap://other.example.com").unwrap();
        let req = DelRequest::new("cn=x,o=apache").rewrite_for_referral(&url);
        assert_eq!(req.entry, "cn=x,o=apache");

        let url = LdapUrl::parse("ldap://other.example.com/o=ref??sub?(cn=z)").unwrap();
        let search = SearchRequest {
            base_object: "o=apache".into(),
            scope: SearchScope::SingleLevel,
            deref_aliases: DerefAliases::Never,
            size_limit: 0,
            time_limit: 0,
            types_only: false,
            filter: parse_filter("(objectClass=*)").unwrap(),
            attributes: vec!["cn".into()],
        }
        .rewrite_for_referral(&url);
        assert_eq!(search.base_object, "o=ref");
        assert_eq!(search.scope, SearchScope::WholeSubtree);
        assert_eq!(search.filter, parse_filter("(cn=z)").unwrap());
        assert_eq!(search.attributes, vec!["cn".to_string()]);
    }

    #[test]
    fn test_cross_check_search_with_rasn() {
        let req = SearchRequest {
            base_object: "o=apache".into(),
            scope: SearchScope::SingleLevel,
            deref_aliases: DerefAliases::Never,
            size_limit: 10,
            time_limit: 0,
            types_only: false,
            filter: parse_filter("(objectClass=*)").unwrap(),
            attributes: vec!["cn".into()],
        };
        let bytes = ber::encode(&LdapMessage::new(2, ProtocolOp::SearchRequest(req)));
        let decoded = rasn::ber::decode::<rasn_ldap::LdapMessage>(&bytes).unwrap();
        match decoded.protocol_op {
            rasn_ldap::ProtocolOp::SearchRequest(req) => {
                assert_eq!(req.base_object.0, "o=apache");
                assert_eq!(req.size_limit, 10);
                assert_eq!(req.filter, rasn_ldap::Filter::Present("objectClass".into()));
            }
            other => panic!("unexpected operation {:?}", other),
        }
    }
}
