//! LDAP message envelope, controls and result codes (RFC 4511 section 4.1)

use std::fmt;

use bytes::Bytes;

use crate::{
    ber::{BerDecode, BerEncode, BerReader, BerWriter, DecodeError, Tag},
    ops::*,
};

/// Application tag numbers of the protocol operations
pub mod tags {
    pub const BIND_REQUEST: u32 = 0;
    pub const BIND_RESPONSE: u32 = 1;
    pub const UNBIND_REQUEST: u32 = 2;
    pub const SEARCH_REQUEST: u32 = 3;
    pub const SEARCH_RESULT_ENTRY: u32 = 4;
    pub const SEARCH_RESULT_DONE: u32 = 5;
    pub const MODIFY_REQUEST: u32 = 6;
    pub const MODIFY_RESPONSE: u32 = 7;
    pub const ADD_REQUEST: u32 = 8;
    pub const ADD_RESPONSE: u32 = 9;
    pub const DEL_REQUEST: u32 = 10;
    pub const DEL_RESPONSE: u32 = 11;
    pub const MODIFY_DN_REQUEST: u32 = 12;
    pub const MODIFY_DN_RESPONSE: u32 = 13;
    pub const COMPARE_REQUEST: u32 = 14;
    pub const COMPARE_RESPONSE: u32 = 15;
    pub const ABANDON_REQUEST: u32 = 16;
    pub const SEARCH_RESULT_REFERENCE: u32 = 19;
    pub const EXTENDED_REQUEST: u32 = 23;
    pub const EXTENDED_RESPONSE: u32 = 24;
    pub const INTERMEDIATE_RESPONSE: u32 = 25;
}

const CONTROLS_TAG: Tag = Tag::context(0).constructed();
const REFERRAL_TAG: Tag = Tag::context(3).constructed();

macro_rules! result_codes {
    ($($name:ident = $code:literal,)*) => {
        /// LDAP result code. Codes not listed in RFC 4511 are kept verbatim in `Unknown`.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum ResultCode {
            $($name,)*
            Unknown(u32),
        }

        impl From<u32> for ResultCode {
            fn from(code: u32) -> Self {
                match code {
                    $($code => ResultCode::$name,)*
                    other => ResultCode::Unknown(other),
                }
            }
        }

        impl From<ResultCode> for u32 {
            fn from(code: ResultCode) -> u32 {
                match code {
                    $(ResultCode::$name => $code,)*
                    ResultCode::Unknown(other) => other,
                }
            }
        }
    };
}

result_codes! {
    Success = 0,
    OperationsError = 1,
    ProtocolError = 2,
    TimeLimitExceeded = 3,
    SizeLimitExceeded = 4,
    CompareFalse = 5,
    CompareTrue = 6,
    AuthMethodNotSupported = 7,
    StrongerAuthRequired = 8,
    PartialResults = 9,
    Referral = 10,
    AdminLimitExceeded = 11,
    UnavailableCriticalExtension = 12,
    ConfidentialityRequired = 13,
    SaslBindInProgress = 14,
    NoSuchAttribute = 16,
    UndefinedAttributeType = 17,
    InappropriateMatching = 18,
    ConstraintViolation = 19,
    AttributeOrValueExists = 20,
    InvalidAttributeSyntax = 21,
    NoSuchObject = 32,
    AliasProblem = 33,
    InvalidDnSyntax = 34,
    AliasDereferencingProblem = 36,
    InappropriateAuthentication = 48,
    InvalidCredentials = 49,
    InsufficientAccessRights = 50,
    Busy = 51,
    Unavailable = 52,
    UnwillingToPerform = 53,
    LoopDetect = 54,
    NamingViolation = 64,
    ObjectClassViolation = 65,
    NotAllowedOnNonLeaf = 66,
    NotAllowedOnRdn = 67,
    EntryAlreadyExists = 68,
    ObjectClassModsProhibited = 69,
    AffectsMultipleDsas = 71,
    Other = 80,
}

impl ResultCode {
    pub fn code(self) -> u32 {
        self.into()
    }
}

impl fmt::Display for ResultCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Request or response control
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Control {
    pub control_type: String,
    pub criticality: bool,
    pub control_value: Option<Bytes>,
}

impl Control {
    pub fn new<S: Into<String>>(control_type: S, criticality: bool, control_value: Option<Bytes>) -> Self {
        Self {
            control_type: control_type.into(),
            criticality,
            control_value,
        }
    }
}

impl BerEncode for Control {
    fn encode_ber(&self, w: &mut BerWriter) {
        w.write_sequence(|w| {
            w.write_octet_string(Tag::OCTET_STRING, self.control_type.as_bytes());
            // DEFAULT FALSE is omitted
            if self.criticality {
                w.write_boolean(Tag::BOOLEAN, true);
            }
            if let Some(ref value) = self.control_value {
                w.write_octet_string(Tag::OCTET_STRING, value);
            }
        });
    }
}

impl BerDecode for Control {
    fn decode_ber(r: &mut BerReader<'_>) -> Result<Self, DecodeError> {
        let mut seq = r.read_sequence()?;
        let control_type = seq.read_string(Tag::OCTET_STRING)?;
        let criticality = seq
            .read_optional(Tag::BOOLEAN, |r| r.read_boolean(Tag::BOOLEAN))?
            .unwrap_or(false);
        let control_value = seq.read_optional(Tag::OCTET_STRING, |r| r.read_bytes(Tag::OCTET_STRING))?;
        seq.finish()?;
        Ok(Control {
            control_type,
            criticality,
            control_value,
        })
    }
}

/// Common trailing fields of every LDAP response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapResult {
    pub result_code: ResultCode,
    pub matched_dn: String,
    pub diagnostic_message: String,
    pub referrals: Option<Vec<String>>,
}

impl LdapResult {
    pub fn new<D, M>(result_code: ResultCode, matched_dn: D, diagnostic_message: M) -> Self
    where
        D: Into<String>,
        M: Into<String>,
    {
        Self {
            result_code,
            matched_dn: matched_dn.into(),
            diagnostic_message: diagnostic_message.into(),
            referrals: None,
        }
    }

    pub fn success() -> Self {
        Self::new(ResultCode::Success, "", "")
    }

    pub fn with_referrals<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.referrals = Some(urls.into_iter().map(Into::into).collect());
        self
    }

    /// Referral code with at least one URL
    pub fn is_referral(&self) -> bool {
        self.result_code == ResultCode::Referral && self.referrals.as_ref().is_some_and(|r| !r.is_empty())
    }

    /// Write the components inside an already opened response element
    pub(crate) fn encode_components(&self, w: &mut BerWriter) {
        w.write_enumerated(self.result_code.code());
        w.write_octet_string(Tag::OCTET_STRING, self.matched_dn.as_bytes());
        w.write_octet_string(Tag::OCTET_STRING, self.diagnostic_message.as_bytes());
        if let Some(ref referrals) = self.referrals {
            w.write_constructed(REFERRAL_TAG, |w| {
                for url in referrals {
                    w.write_octet_string(Tag::OCTET_STRING, url.as_bytes());
                }
            });
        }
    }

    pub(crate) fn decode_components(r: &mut BerReader<'_>) -> Result<Self, DecodeError> {
        let result_code = r.read_enumerated()?.into();
        let matched_dn = r.read_string(Tag::OCTET_STRING)?;
        let diagnostic_message = r.read_string(Tag::OCTET_STRING)?;
        let referrals = r.read_optional(REFERRAL_TAG, |r| {
            let mut seq = r.read_constructed(REFERRAL_TAG)?;
            let mut urls = Vec::new();
            while !seq.is_empty() {
                urls.push(seq.read_string(Tag::OCTET_STRING)?);
            }
            Ok(urls)
        })?;
        Ok(LdapResult {
            result_code,
            matched_dn,
            diagnostic_message,
            referrals,
        })
    }

    pub(crate) fn encode_as(&self, tag: u32, w: &mut BerWriter) {
        w.write_constructed(Tag::application(tag), |w| self.encode_components(w));
    }

    pub(crate) fn decode_as(tag: u32, r: &mut BerReader<'_>) -> Result<Self, DecodeError> {
        let mut seq = r.read_constructed(Tag::application(tag))?;
        let result = Self::decode_components(&mut seq)?;
        seq.finish()?;
        Ok(result)
    }
}

/// The protocolOp CHOICE of an LDAP message
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolOp {
    BindRequest(BindRequest),
    BindResponse(BindResponse),
    UnbindRequest,
    SearchRequest(SearchRequest),
    SearchResEntry(SearchResultEntry),
    SearchResDone(LdapResult),
    SearchResRef(Vec<String>),
    ModifyRequest(ModifyRequest),
    ModifyResponse(LdapResult),
    AddRequest(AddRequest),
    AddResponse(LdapResult),
    DelRequest(DelRequest),
    DelResponse(LdapResult),
    ModifyDnRequest(ModifyDnRequest),
    ModifyDnResponse(LdapResult),
    CompareRequest(CompareRequest),
    CompareResponse(LdapResult),
    AbandonRequest(u32),
    ExtendedReq(ExtendedRequest),
    ExtendedResp(ExtendedResponse),
    IntermediateResp(IntermediateResponse),
}

impl ProtocolOp {
    /// Application tag number of this operation
    pub fn tag(&self) -> u32 {
        match self {
            ProtocolOp::BindRequest(_) => tags::BIND_REQUEST,
            ProtocolOp::BindResponse(_) => tags::BIND_RESPONSE,
            ProtocolOp::UnbindRequest => tags::UNBIND_REQUEST,
            ProtocolOp::SearchRequest(_) => tags::SEARCH_REQUEST,
            ProtocolOp::SearchResEntry(_) => tags::SEARCH_RESULT_ENTRY,
            ProtocolOp::SearchResDone(_) => tags::SEARCH_RESULT_DONE,
            ProtocolOp::SearchResRef(_) => tags::SEARCH_RESULT_REFERENCE,
            ProtocolOp::ModifyRequest(_) => tags::MODIFY_REQUEST,
            ProtocolOp::ModifyResponse(_) => tags::MODIFY_RESPONSE,
            ProtocolOp::AddRequest(_) => tags::ADD_REQUEST,
            ProtocolOp::AddResponse(_) => tags::ADD_RESPONSE,
            ProtocolOp::DelRequest(_) => tags::DEL_REQUEST,
            ProtocolOp::DelResponse(_) => tags::DEL_RESPONSE,
            ProtocolOp::ModifyDnRequest(_) => tags::MODIFY_DN_REQUEST,
            ProtocolOp::ModifyDnResponse(_) => tags::MODIFY_DN_RESPONSE,
            ProtocolOp::CompareRequest(_) => tags::COMPARE_REQUEST,
            ProtocolOp::CompareResponse(_) => tags::COMPARE_RESPONSE,
            ProtocolOp::AbandonRequest(_) => tags::ABANDON_REQUEST,
            ProtocolOp::ExtendedReq(_) => tags::EXTENDED_REQUEST,
            ProtocolOp::ExtendedResp(_) => tags::EXTENDED_RESPONSE,
            ProtocolOp::IntermediateResp(_) => tags::INTERMEDIATE_RESPONSE,
        }
    }
}

impl BerEncode for ProtocolOp {
    fn encode_ber(&self, w: &mut BerWriter) {
        let tag = self.tag();
        match self {
            ProtocolOp::BindRequest(req) => req.encode_ber(w),
            ProtocolOp::BindResponse(resp) => resp.encode_ber(w),
            ProtocolOp::UnbindRequest => w.write_null(Tag::application(tag)),
            ProtocolOp::SearchRequest(req) => req.encode_ber(w),
            ProtocolOp::SearchResEntry(entry) => entry.encode_ber(w),
            ProtocolOp::SearchResRef(urls) => w.write_constructed(Tag::application(tag), |w| {
                for url in urls {
                    w.write_octet_string(Tag::OCTET_STRING, url.as_bytes());
                }
            }),
            ProtocolOp::ModifyRequest(req) => req.encode_ber(w),
            ProtocolOp::AddRequest(req) => req.encode_ber(w),
            ProtocolOp::DelRequest(req) => req.encode_ber(w),
            ProtocolOp::ModifyDnRequest(req) => req.encode_ber(w),
            ProtocolOp::CompareRequest(req) => req.encode_ber(w),
            ProtocolOp::AbandonRequest(id) => w.write_integer(Tag::application(tag), *id as i64),
            ProtocolOp::ExtendedReq(req) => req.encode_ber(w),
            ProtocolOp::ExtendedResp(resp) => resp.encode_ber(w),
            ProtocolOp::IntermediateResp(resp) => resp.encode_ber(w),
            ProtocolOp::SearchResDone(result)
            | ProtocolOp::ModifyResponse(result)
            | ProtocolOp::AddResponse(result)
            | ProtocolOp::DelResponse(result)
            | ProtocolOp::ModifyDnResponse(result)
            | ProtocolOp::CompareResponse(result) => result.encode_as(tag, w),
        }
    }
}

impl BerDecode for ProtocolOp {
    fn decode_ber(r: &mut BerReader<'_>) -> Result<Self, DecodeError> {
        let tag = r.peek_tag()?.ok_or(DecodeError::UnexpectedEnd)?;
        if tag.class != crate::ber::TagClass::Application {
            return Err(DecodeError::InvalidValue("protocolOp"));
        }
        let op = match tag.number {
            tags::BIND_REQUEST => ProtocolOp::BindRequest(r.read()?),
            tags::BIND_RESPONSE => ProtocolOp::BindResponse(r.read()?),
            tags::UNBIND_REQUEST => {
                r.read_null(Tag::application(tags::UNBIND_REQUEST))?;
                ProtocolOp::UnbindRequest
            }
            tags::SEARCH_REQUEST => ProtocolOp::SearchRequest(r.read()?),
            tags::SEARCH_RESULT_ENTRY => ProtocolOp::SearchResEntry(r.read()?),
            tags::SEARCH_RESULT_DONE => ProtocolOp::SearchResDone(LdapResult::decode_as(tag.number, r)?),
            tags::SEARCH_RESULT_REFERENCE => {
                let mut seq = r.read_constructed(Tag::application(tags::SEARCH_RESULT_REFERENCE))?;
                let mut urls = Vec::new();
                while !seq.is_empty() {
                    urls.push(seq.read_string(Tag::OCTET_STRING)?);
                }
                ProtocolOp::SearchResRef(urls)
            }
            tags::MODIFY_REQUEST => ProtocolOp::ModifyRequest(r.read()?),
            tags::MODIFY_RESPONSE => ProtocolOp::ModifyResponse(LdapResult::decode_as(tag.number, r)?),
            tags::ADD_REQUEST => ProtocolOp::AddRequest(r.read()?),
            tags::ADD_RESPONSE => ProtocolOp::AddResponse(LdapResult::decode_as(tag.number, r)?),
            tags::DEL_REQUEST => ProtocolOp::DelRequest(r.read()?),
            tags::DEL_RESPONSE => ProtocolOp::DelResponse(LdapResult::decode_as(tag.number, r)?),
            tags::MODIFY_DN_REQUEST => ProtocolOp::ModifyDnRequest(r.read()?),
            tags::MODIFY_DN_RESPONSE => ProtocolOp::ModifyDnResponse(LdapResult::decode_as(tag.number, r)?),
            tags::COMPARE_REQUEST => ProtocolOp::CompareRequest(r.read()?),
            tags::COMPARE_RESPONSE => ProtocolOp::CompareResponse(LdapResult::decode_as(tag.number, r)?),
            tags::ABANDON_REQUEST => ProtocolOp::AbandonRequest(r.read_u32(Tag::application(tags::ABANDON_REQUEST))?),
            tags::EXTENDED_REQUEST => ProtocolOp::ExtendedReq(r.read()?),
            tags::EXTENDED_RESPONSE => ProtocolOp::ExtendedResp(r.read()?),
            tags::INTERMEDIATE_RESPONSE => ProtocolOp::IntermediateResp(r.read()?),
            _ => return Err(DecodeError::InvalidValue("protocolOp")),
        };
        Ok(op)
    }
}

/// One framed LDAP PDU
#[derive(Debug, Clone, PartialEq)]
pub struct LdapMessage {
    pub message_id: u32,
    pub protocol_op: ProtocolOp,
    pub controls: Option<Vec<Control>>,
}

impl LdapMessage {
    pub fn new(message_id: u32, protocol_op: ProtocolOp) -> Self {
        Self {
            message_id,
            protocol_op,
            controls: None,
        }
    }

    pub fn with_controls(mut self, controls: Vec<Control>) -> Self {
        self.controls = if controls.is_empty() { None } else { Some(controls) };
        self
    }

    /// Find a control by OID
    pub fn control(&self, oid: &str) -> Option<&Control> {
        self.controls.as_ref()?.iter().find(|c| c.control_type == oid)
    }
}

impl BerEncode for LdapMessage {
    fn encode_ber(&self, w: &mut BerWriter) {
        w.write_sequence(|w| {
            w.write_integer(Tag::INTEGER, self.message_id as i64);
            self.protocol_op.encode_ber(w);
            if let Some(ref controls) = self.controls {
                w.write_constructed(CONTROLS_TAG, |w| {
                    for control in controls {
                        control.encode_ber(w);
                    }
                });
            }
        });
    }
}

impl BerDecode for LdapMessage {
    fn decode_ber(r: &mut BerReader<'_>) -> Result<Self, DecodeError> {
        let mut seq = r.read_sequence()?;
        let message_id = seq.read_u32(Tag::INTEGER)?;
        let protocol_op = seq.read()?;
        let controls = seq.read_optional(CONTROLS_TAG, |r| {
            let mut inner = r.read_constructed(CONTROLS_TAG)?;
            let mut controls = Vec::new();
            while !inner.is_empty() {
                controls.push(inner.read()?);
            }
            Ok(controls)
        })?;
        seq.finish()?;
        Ok(LdapMessage {
            message_id,
            protocol_op,
            controls,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ber;

    #[test]
    fn test_unbind_bytes() {
        let msg = LdapMessage::new(1, ProtocolOp::UnbindRequest);
        assert_eq!(&ber::encode(&msg)[..], &[0x30, 0x05, 0x02, 0x01, 0x01, 0x42, 0x00]);
    }

    #[test]
    fn test_result_code_mapping() {
        assert_eq!(ResultCode::from(0), ResultCode::Success);
        assert_eq!(ResultCode::from(10), ResultCode::Referral);
        assert_eq!(ResultCode::from(4711), ResultCode::Unknown(4711));
        assert_eq!(ResultCode::NoSuchObject.code(), 32);
        assert_eq!(ResultCode::Unknown(4711).code(), 4711);
    }

    #[test]
    fn test_message_with_controls() {
        let msg = LdapMessage::new(7, ProtocolOp::DelRequest(DelRequest::new("cn=x,o=apache"))).with_controls(vec![
            Control::new("1.2.3", true, None),
            Control::new("1.2.4", false, Some(Bytes::from_static(b"\x30\x00"))),
        ]);
        let bytes = ber::encode(&msg);
        let decoded: LdapMessage = ber::decode(&bytes).unwrap();
        assert_eq!(decoded, msg);
        assert!(decoded.control("1.2.3").unwrap().criticality);
        assert!(decoded.control("9.9").is_none());
    }

    #[test]
    fn test_result_with_referrals() {
        let result = LdapResult::new(ResultCode::Referral, "o=apache", "go elsewhere")
            .with_referrals(["ldap://a.example.com/o=apache", "ldap://b.example.com/o=apache"]);
        assert!(result.is_referral());
        let msg = LdapMessage::new(3, ProtocolOp::ModifyResponse(result));
        let decoded: LdapMessage = ber::decode(&ber::encode(&msg)).unwrap();
        assert_eq!(decoded, msg);

        assert!(!LdapResult::new(ResultCode::Referral, "", "").with_referrals(Vec::<String>::new()).is_referral());
    }

    #[test]
    fn test_trailing_garbage_rejected() {
        let mut bytes = ber::encode(&LdapMessage::new(1, ProtocolOp::UnbindRequest)).to_vec();
        // grow the outer SEQUENCE to hold an unexpected INTEGER after the operation
        bytes[1] += 3;
        bytes.extend_from_slice(&[0x02, 0x01, 0x00]);
        assert!(ber::decode::<LdapMessage>(&bytes).is_err());
    }

    #[test]
    fn test_cross_check_with_rasn() {
        let msg = LdapMessage::new(
            5,
            ProtocolOp::BindRequest(BindRequest::simple("cn=admin,o=apache", "secret")),
        );
        let ours = ber::encode(&msg);

        let theirs = rasn::ber::encode(&rasn_ldap::LdapMessage::new(
            5,
            rasn_ldap::ProtocolOp::BindRequest(rasn_ldap::BindRequest::new(
                3,
                "cn=admin,o=apache".into(),
                rasn_ldap::AuthenticationChoice::Simple(rasn::types::OctetString::from_static(b"secret")),
            )),
        ))
        .unwrap();
        assert_eq!(&ours[..], &theirs[..]);

        let decoded = rasn::ber::decode::<rasn_ldap::LdapMessage>(&ours).unwrap();
        assert_eq!(decoded.message_id, 5);
    }
}
