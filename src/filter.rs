//! Search filters: tree, RFC 4515 string syntax and BER form

use std::fmt;

use bytes::Bytes;
use once_cell::sync::Lazy;
use pest::{
    iterators::{Pair, Pairs},
    Parser,
};
use pest_derive::Parser;
use regex::bytes::{Captures, Regex};

use crate::{
    ber::{BerDecode, BerEncode, BerReader, BerWriter, DecodeError, Tag, TagClass},
    error::Error,
};

type RulePair<'a> = Pair<'a, Rule>;
type RulePairs<'a> = Pairs<'a, Rule>;

/// Attribute description and asserted value
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AttributeValueAssertion {
    pub attribute_desc: String,
    pub assertion_value: Bytes,
}

impl AttributeValueAssertion {
    pub fn new<A: Into<String>, V: Into<Bytes>>(attribute_desc: A, assertion_value: V) -> Self {
        Self {
            attribute_desc: attribute_desc.into(),
            assertion_value: assertion_value.into(),
        }
    }

    pub(crate) fn encode_as(&self, tag: Tag, w: &mut BerWriter) {
        w.write_constructed(tag, |w| {
            w.write_octet_string(Tag::OCTET_STRING, self.attribute_desc.as_bytes());
            w.write_octet_string(Tag::OCTET_STRING, &self.assertion_value);
        });
    }

    pub(crate) fn decode_as(tag: Tag, r: &mut BerReader<'_>) -> Result<Self, DecodeError> {
        let mut seq = r.read_constructed(tag)?;
        let attribute_desc = seq.read_string(Tag::OCTET_STRING)?;
        let assertion_value = seq.read_bytes(Tag::OCTET_STRING)?;
        seq.finish()?;
        Ok(Self {
            attribute_desc,
            assertion_value,
        })
    }
}

/// Substring assertion. Empty wildcard segments produce no component.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubstringFilter {
    pub attr_type: String,
    pub initial: Option<Bytes>,
    pub any: Vec<Bytes>,
    pub final_: Option<Bytes>,
}

/// Extensible match assertion
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MatchingRuleAssertion {
    pub matching_rule: Option<String>,
    pub attr_type: Option<String>,
    pub match_value: Bytes,
    pub dn_attributes: bool,
}

/// Search filter tree. Children of `And`/`Or` keep their construction order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    EqualityMatch(AttributeValueAssertion),
    Substrings(SubstringFilter),
    GreaterOrEqual(AttributeValueAssertion),
    LessOrEqual(AttributeValueAssertion),
    Present(String),
    ApproxMatch(AttributeValueAssertion),
    ExtensibleMatch(MatchingRuleAssertion),
}

fn unescape(s: &str) -> Bytes {
    static HEX_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"\\([\da-fA-F]{2})"#).unwrap());

    HEX_RE
        .replace_all(s.as_bytes(), |caps: &Captures| {
            // unwrap is justified here by the regex expression
            let hex = std::str::from_utf8(&caps[1]).unwrap();
            vec![u8::from_str_radix(hex, 16).unwrap()]
        })
        .into_owned()
        .into()
}

/// Escape a value for the string representation of a filter
pub fn escape_value(value: &[u8]) -> String {
    let text = std::str::from_utf8(value).ok();
    let mut out = String::with_capacity(value.len());
    match text {
        Some(text) => {
            for c in text.chars() {
                match c {
                    '*' | '(' | ')' | '\\' | '\0' => out.push_str(&format!("\\{:02x}", c as u8)),
                    c => out.push(c),
                }
            }
        }
        None => {
            for b in value {
                match b {
                    b'*' | b'(' | b')' | b'\\' | 0 | 0x80..=0xff => out.push_str(&format!("\\{:02x}", b)),
                    b => out.push(*b as char),
                }
            }
        }
    }
    out
}

#[derive(Parser)]
#[grammar = "filter.pest"]
pub(crate) struct FilterParser;

impl From<pest::error::Error<Rule>> for Error {
    fn from(e: pest::error::Error<Rule>) -> Self {
        Error::InvalidFilter(e.to_string())
    }
}

/// Parse a filter in RFC 4515 string form
pub fn parse_filter<S: AsRef<str>>(filter: S) -> Result<Filter, Error> {
    let mut parsed = FilterParser::parse(Rule::rfc4515, filter.as_ref())?;
    let top = parsed
        .next()
        .ok_or_else(|| Error::InvalidFilter("empty filter".to_owned()))?;
    Ok(parse_rule(top))
}

/// Parse a filter after substituting `{N}` placeholders with escaped arguments
pub fn parse_filter_with_args<S, A>(filter: S, args: &[A]) -> Result<Filter, Error>
where
    S: AsRef<str>,
    A: AsRef<str>,
{
    parse_filter(substitute_args(filter.as_ref(), args)?)
}

fn substitute_args<A: AsRef<str>>(filter: &str, args: &[A]) -> Result<String, Error> {
    let mut out = String::with_capacity(filter.len());
    let mut rest = filter;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after
            .find('}')
            .ok_or_else(|| Error::InvalidFilter(format!("unterminated placeholder in {}", filter)))?;
        let digits = &after[..end];
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidFilter(format!("invalid placeholder {{{}}}", digits)));
        }
        let arg = digits
            .parse::<usize>()
            .ok()
            .and_then(|index| args.get(index))
            .ok_or_else(|| Error::InvalidFilter(format!("no argument for placeholder {{{}}}", digits)))?;
        out.push_str(&escape_value(arg.as_ref().as_bytes()));
        rest = &after[end + 1..];
    }
    out.push_str(rest);

    Ok(out)
}

fn as_string(pair: &RulePair) -> String {
    pair.as_str().to_owned()
}

fn as_inner(pair: RulePair) -> RulePair {
    pair.into_inner().next().expect("No inner rule")
}

fn parse_rule(pair: RulePair) -> Filter {
    match pair.as_rule() {
        Rule::and => Filter::And(parse_set(pair.into_inner())),
        Rule::or => Filter::Or(parse_set(pair.into_inner())),
        Rule::not => Filter::Not(Box::new(parse_rule(as_inner(pair)))),
        Rule::simple => parse_simple(pair.into_inner()),
        Rule::present => Filter::Present(as_string(&as_inner(pair))),
        Rule::substring => parse_substring(pair.into_inner()),
        Rule::extensible => parse_extensible(pair.into_inner()),
        _ => unreachable!("Unexpected rule"),
    }
}

fn parse_set(pairs: RulePairs) -> Vec<Filter> {
    pairs.map(parse_rule).collect()
}

fn parse_simple(pairs: RulePairs) -> Filter {
    let pairs = pairs.collect::<Vec<_>>();
    let assertion = AttributeValueAssertion::new(as_string(&pairs[0]), unescape(pairs[2].as_str()));
    match pairs[1].as_rule() {
        Rule::equal => Filter::EqualityMatch(assertion),
        Rule::approx => Filter::ApproxMatch(assertion),
        Rule::greater => Filter::GreaterOrEqual(assertion),
        Rule::less => Filter::LessOrEqual(assertion),
        _ => unreachable!("Unexpected rule"),
    }
}

fn parse_substring(mut pairs: RulePairs) -> Filter {
    let mut filter = SubstringFilter {
        attr_type: pairs.next().map(|p| as_string(&p)).unwrap_or_default(),
        initial: None,
        any: Vec::new(),
        final_: None,
    };
    for pair in pairs {
        match pair.as_rule() {
            Rule::initial => filter.initial = Some(unescape(pair.as_str())),
            Rule::any => filter.any.push(unescape(pair.as_str())),
            Rule::final_ => filter.final_ = Some(unescape(pair.as_str())),
            _ => unreachable!("Unexpected rule"),
        }
    }
    Filter::Substrings(filter)
}

fn parse_extensible(pairs: RulePairs) -> Filter {
    let mut assertion = MatchingRuleAssertion {
        matching_rule: None,
        attr_type: None,
        match_value: Bytes::new(),
        dn_attributes: false,
    };
    for pair in pairs {
        match pair.as_rule() {
            Rule::ruleid => assertion.matching_rule = Some(as_string(&pair)),
            Rule::attr => assertion.attr_type = Some(as_string(&pair)),
            Rule::value => assertion.match_value = unescape(pair.as_str()),
            Rule::dnattr => assertion.dn_attributes = true,
            _ => unreachable!("Unexpected rule"),
        }
    }
    Filter::ExtensibleMatch(assertion)
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let simple = |f: &mut fmt::Formatter<'_>, ava: &AttributeValueAssertion, op: &str| {
            write!(f, "({}{}{})", ava.attribute_desc, op, escape_value(&ava.assertion_value))
        };
        match self {
            Filter::And(children) | Filter::Or(children) => {
                f.write_str(if matches!(self, Filter::And(_)) { "(&" } else { "(|" })?;
                for child in children {
                    write!(f, "{}", child)?;
                }
                f.write_str(")")
            }
            Filter::Not(inner) => write!(f, "(!{})", inner),
            Filter::EqualityMatch(ava) => simple(f, ava, "="),
            Filter::GreaterOrEqual(ava) => simple(f, ava, ">="),
            Filter::LessOrEqual(ava) => simple(f, ava, "<="),
            Filter::ApproxMatch(ava) => simple(f, ava, "~="),
            Filter::Present(attr) => write!(f, "({}=*)", attr),
            Filter::Substrings(sub) => {
                write!(f, "({}=", sub.attr_type)?;
                if let Some(ref initial) = sub.initial {
                    f.write_str(&escape_value(initial))?;
                }
                f.write_str("*")?;
                for any in &sub.any {
                    write!(f, "{}*", escape_value(any))?;
                }
                if let Some(ref final_) = sub.final_ {
                    f.write_str(&escape_value(final_))?;
                }
                f.write_str(")")
            }
            Filter::ExtensibleMatch(m) => {
                f.write_str("(")?;
                if let Some(ref attr) = m.attr_type {
                    f.write_str(attr)?;
                }
                if m.dn_attributes {
                    f.write_str(":dn")?;
                }
                if let Some(ref rule) = m.matching_rule {
                    write!(f, ":{}", rule)?;
                }
                write!(f, ":={})", escape_value(&m.match_value))
            }
        }
    }
}

impl BerEncode for Filter {
    fn encode_ber(&self, w: &mut BerWriter) {
        match self {
            Filter::And(children) | Filter::Or(children) => {
                let number = if matches!(self, Filter::And(_)) { 0 } else { 1 };
                w.write_constructed(Tag::context(number), |w| {
                    for child in children {
                        child.encode_ber(w);
                    }
                });
            }
            Filter::Not(inner) => w.write_constructed(Tag::context(2), |w| inner.encode_ber(w)),
            Filter::EqualityMatch(ava) => ava.encode_as(Tag::context(3), w),
            Filter::Substrings(sub) => w.write_constructed(Tag::context(4), |w| {
                w.write_octet_string(Tag::OCTET_STRING, sub.attr_type.as_bytes());
                w.write_sequence(|w| {
                    if let Some(ref initial) = sub.initial {
                        w.write_octet_string(Tag::context(0), initial);
                    }
                    for any in &sub.any {
                        w.write_octet_string(Tag::context(1), any);
                    }
                    if let Some(ref final_) = sub.final_ {
                        w.write_octet_string(Tag::context(2), final_);
                    }
                });
            }),
            Filter::GreaterOrEqual(ava) => ava.encode_as(Tag::context(5), w),
            Filter::LessOrEqual(ava) => ava.encode_as(Tag::context(6), w),
            Filter::Present(attr) => w.write_octet_string(Tag::context(7), attr.as_bytes()),
            Filter::ApproxMatch(ava) => ava.encode_as(Tag::context(8), w),
            Filter::ExtensibleMatch(m) => w.write_constructed(Tag::context(9), |w| {
                if let Some(ref rule) = m.matching_rule {
                    w.write_octet_string(Tag::context(1), rule.as_bytes());
                }
                if let Some(ref attr) = m.attr_type {
                    w.write_octet_string(Tag::context(2), attr.as_bytes());
                }
                w.write_octet_string(Tag::context(3), &m.match_value);
                if m.dn_attributes {
                    w.write_boolean(Tag::context(4), true);
                }
            }),
        }
    }
}

fn decode_children(mut set: BerReader<'_>) -> Result<Vec<Filter>, DecodeError> {
    let mut children = Vec::new();
    while !set.is_empty() {
        children.push(set.read()?);
    }
    Ok(children)
}

fn decode_substrings(r: &mut BerReader<'_>) -> Result<SubstringFilter, DecodeError> {
    let mut seq = r.read_constructed(Tag::context(4))?;
    let attr_type = seq.read_string(Tag::OCTET_STRING)?;
    let mut parts = seq.read_sequence()?;
    seq.finish()?;

    let mut filter = SubstringFilter {
        attr_type,
        initial: None,
        any: Vec::new(),
        final_: None,
    };
    while let Some(tag) = parts.peek_tag()? {
        if filter.final_.is_some() {
            return Err(DecodeError::InvalidValue("substrings"));
        }
        match tag.number {
            0 if filter.initial.is_none() && filter.any.is_empty() => {
                filter.initial = Some(parts.read_bytes(Tag::context(0))?)
            }
            1 => filter.any.push(parts.read_bytes(Tag::context(1))?),
            2 => filter.final_ = Some(parts.read_bytes(Tag::context(2))?),
            _ => return Err(DecodeError::InvalidValue("substrings")),
        }
    }
    Ok(filter)
}

fn decode_extensible(r: &mut BerReader<'_>) -> Result<MatchingRuleAssertion, DecodeError> {
    let mut seq = r.read_constructed(Tag::context(9))?;
    let matching_rule = seq.read_optional(Tag::context(1), |r| r.read_string(Tag::context(1)))?;
    let attr_type = seq.read_optional(Tag::context(2), |r| r.read_string(Tag::context(2)))?;
    let match_value = seq.read_bytes(Tag::context(3))?;
    let dn_attributes = seq
        .read_optional(Tag::context(4), |r| r.read_boolean(Tag::context(4)))?
        .unwrap_or(false);
    seq.finish()?;
    Ok(MatchingRuleAssertion {
        matching_rule,
        attr_type,
        match_value,
        dn_attributes,
    })
}

impl BerDecode for Filter {
    fn decode_ber(r: &mut BerReader<'_>) -> Result<Self, DecodeError> {
        let tag = r.peek_tag()?.ok_or(DecodeError::UnexpectedEnd)?;
        if tag.class != TagClass::Context {
            return Err(DecodeError::InvalidValue("Filter"));
        }
        let filter = match tag.number {
            0 => Filter::And(decode_children(r.read_constructed(Tag::context(0))?)?),
            1 => Filter::Or(decode_children(r.read_constructed(Tag::context(1))?)?),
            2 => {
                let mut inner = r.read_constructed(Tag::context(2))?;
                let child = inner.read()?;
                inner.finish()?;
                Filter::Not(Box::new(child))
            }
            3 => Filter::EqualityMatch(AttributeValueAssertion::decode_as(Tag::context(3), r)?),
            4 => Filter::Substrings(decode_substrings(r)?),
            5 => Filter::GreaterOrEqual(AttributeValueAssertion::decode_as(Tag::context(5), r)?),
            6 => Filter::LessOrEqual(AttributeValueAssertion::decode_as(Tag::context(6), r)?),
            7 => Filter::Present(r.read_string(Tag::context(7))?),
            8 => Filter::ApproxMatch(AttributeValueAssertion::decode_as(Tag::context(8), r)?),
            9 => Filter::ExtensibleMatch(decode_extensible(r)?),
            _ => return Err(DecodeError::InvalidValue("Filter")),
        };
        Ok(filter)
    }
}
