//! BER encoding primitives
//!
//! Only the definite-length form is produced and accepted. Every LDAP type implements
//! [`BerEncode`] and [`BerDecode`]; together those impls are the schema of the protocol.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

/// Longest accepted length field, in octets
const MAX_LENGTH_OCTETS: usize = 4;

/// BER decoding errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("need {0} more bytes")]
    Incomplete(usize),
    #[error("indefinite length encoding is not supported")]
    IndefiniteLength,
    #[error("length field of {0} octets is too large")]
    LengthTooLarge(usize),
    #[error("declared length {declared} exceeds {available} remaining bytes")]
    LengthOverrun { declared: usize, available: usize },
    #[error("unexpected tag {found}, expected {expected}")]
    UnexpectedTag { expected: Tag, found: Tag },
    #[error("unexpected end of data")]
    UnexpectedEnd,
    #[error("invalid {0} value")]
    InvalidValue(&'static str),
    #[error("{0} trailing bytes after value")]
    TrailingData(usize),
}

/// Tag class, the two high bits of the identifier octet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagClass {
    Universal,
    Application,
    Context,
    Private,
}

impl TagClass {
    fn bits(self) -> u8 {
        match self {
            TagClass::Universal => 0x00,
            TagClass::Application => 0x40,
            TagClass::Context => 0x80,
            TagClass::Private => 0xc0,
        }
    }

    fn from_bits(b: u8) -> Self {
        match b & 0xc0 {
            0x00 => TagClass::Universal,
            0x40 => TagClass::Application,
            0x80 => TagClass::Context,
            _ => TagClass::Private,
        }
    }
}

/// BER identifier: class, primitive/constructed bit and tag number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag {
    pub class: TagClass,
    pub constructed: bool,
    pub number: u32,
}

impl Tag {
    pub const BOOLEAN: Tag = Tag::universal(1);
    pub const INTEGER: Tag = Tag::universal(2);
    pub const OCTET_STRING: Tag = Tag::universal(4);
    pub const NULL: Tag = Tag::universal(5);
    pub const ENUMERATED: Tag = Tag::universal(10);
    pub const SEQUENCE: Tag = Tag::universal(16).constructed();
    pub const SET: Tag = Tag::universal(17).constructed();

    pub const fn universal(number: u32) -> Self {
        Tag {
            class: TagClass::Universal,
            constructed: false,
            number,
        }
    }

    pub const fn application(number: u32) -> Self {
        Tag {
            class: TagClass::Application,
            constructed: false,
            number,
        }
    }

    pub const fn context(number: u32) -> Self {
        Tag {
            class: TagClass::Context,
            constructed: false,
            number,
        }
    }

    /// Same tag with the constructed bit set
    pub const fn constructed(self) -> Self {
        Tag {
            constructed: true,
            ..self
        }
    }

    fn encode(&self, dst: &mut BytesMut) {
        let first = self.class.bits() | if self.constructed { 0x20 } else { 0 };
        if self.number < 0x1f {
            dst.put_u8(first | self.number as u8);
        } else {
            dst.put_u8(first | 0x1f);
            let mut groups = Vec::with_capacity(5);
            let mut n = self.number;
            loop {
                groups.push((n & 0x7f) as u8);
                n >>= 7;
                if n == 0 {
                    break;
                }
            }
            while let Some(g) = groups.pop() {
                dst.put_u8(if groups.is_empty() { g } else { g | 0x80 });
            }
        }
    }

    /// Parse an identifier, returning the tag and the number of octets it occupies
    pub fn parse(data: &[u8]) -> Result<(Tag, usize), DecodeError> {
        let first = *data.first().ok_or(DecodeError::Incomplete(1))?;
        let class = TagClass::from_bits(first);
        let constructed = first & 0x20 != 0;

        if first & 0x1f != 0x1f {
            return Ok((
                Tag {
                    class,
                    constructed,
                    number: (first & 0x1f) as u32,
                },
                1,
            ));
        }

        let mut number: u32 = 0;
        for (i, b) in data[1..].iter().enumerate() {
            if i == 4 {
                return Err(DecodeError::InvalidValue("tag number"));
            }
            number = (number << 7) | (b & 0x7f) as u32;
            if b & 0x80 == 0 {
                return Ok((
                    Tag {
                        class,
                        constructed,
                        number,
                    },
                    i + 2,
                ));
            }
        }
        Err(DecodeError::Incomplete(1))
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let class = match self.class {
            TagClass::Universal => "UNIVERSAL",
            TagClass::Application => "APPLICATION",
            TagClass::Context => "CONTEXT",
            TagClass::Private => "PRIVATE",
        };
        let form = if self.constructed { "constructed" } else { "primitive" };
        write!(f, "[{} {}] {}", class, self.number, form)
    }
}

/// Append a definite length, short form below 128 and minimal long form otherwise
pub fn encode_length(len: usize, dst: &mut BytesMut) {
    if len < 0x80 {
        dst.put_u8(len as u8);
        return;
    }
    let bytes = (len as u64).to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    dst.put_u8(0x80 | (bytes.len() - skip) as u8);
    dst.put_slice(&bytes[skip..]);
}

/// Parse a definite length, returning the value and the number of octets it occupies
pub fn parse_length(data: &[u8]) -> Result<(usize, usize), DecodeError> {
    let first = *data.first().ok_or(DecodeError::Incomplete(1))?;

    if first & 0x80 == 0 {
        return Ok((first as usize, 1));
    }

    let octets = (first & 0x7f) as usize;
    if octets == 0 {
        return Err(DecodeError::IndefiniteLength);
    }
    if octets > MAX_LENGTH_OCTETS {
        return Err(DecodeError::LengthTooLarge(octets));
    }
    if data.len() < 1 + octets {
        return Err(DecodeError::Incomplete(1 + octets - data.len()));
    }

    let value = data[1..=octets].iter().fold(0usize, |acc, b| (acc << 8) | *b as usize);
    Ok((value, 1 + octets))
}

fn integer_content(value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < bytes.len() - 1 {
        let redundant = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
            || (bytes[start] == 0xff && bytes[start + 1] & 0x80 != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    bytes[start..].to_vec()
}

/// One tag-length-value unit borrowed from an input buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tlv<'a> {
    pub tag: Tag,
    pub content: &'a [u8],
    /// Size of the whole unit including identifier and length octets
    pub encoded_len: usize,
}

impl<'a> Tlv<'a> {
    /// Parse the first TLV in `data`. Returns `Incomplete` if the buffer ends before the value does.
    pub fn parse(data: &'a [u8]) -> Result<Self, DecodeError> {
        let (tag, tag_len) = Tag::parse(data)?;
        let (len, len_len) = parse_length(&data[tag_len..])?;
        let header = tag_len + len_len;
        let total = header.checked_add(len).ok_or(DecodeError::LengthTooLarge(len_len))?;
        if data.len() < total {
            return Err(DecodeError::Incomplete(total - data.len()));
        }
        Ok(Tlv {
            tag,
            content: &data[header..total],
            encoded_len: total,
        })
    }

    /// Size of the unit at the start of `data` once its header is readable, `None` before that.
    /// The buffer may still be shorter than the returned size.
    pub fn frame_len(data: &[u8]) -> Result<Option<usize>, DecodeError> {
        let (_, tag_len) = match Tag::parse(data) {
            Ok(v) => v,
            Err(DecodeError::Incomplete(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        match parse_length(&data[tag_len..]) {
            Ok((len, len_len)) => Ok(Some(tag_len + len_len + len)),
            Err(DecodeError::Incomplete(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// BER output buffer
#[derive(Debug, Default)]
pub struct BerWriter {
    buf: BytesMut,
}

impl BerWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_tlv(&mut self, tag: Tag, content: &[u8]) {
        tag.encode(&mut self.buf);
        encode_length(content.len(), &mut self.buf);
        self.buf.put_slice(content);
    }

    pub fn write_integer(&mut self, tag: Tag, value: i64) {
        self.write_tlv(tag, &integer_content(value));
    }

    pub fn write_enumerated(&mut self, value: u32) {
        self.write_integer(Tag::ENUMERATED, value as i64);
    }

    pub fn write_boolean(&mut self, tag: Tag, value: bool) {
        self.write_tlv(tag, &[if value { 0xff } else { 0x00 }]);
    }

    pub fn write_octet_string(&mut self, tag: Tag, value: &[u8]) {
        self.write_tlv(tag, value);
    }

    pub fn write_null(&mut self, tag: Tag) {
        self.write_tlv(tag, &[]);
    }

    /// Write a constructed value whose content is produced by `f`
    pub fn write_constructed<F>(&mut self, tag: Tag, f: F)
    where
        F: FnOnce(&mut BerWriter),
    {
        let mut inner = BerWriter::new();
        f(&mut inner);
        self.write_tlv(tag.constructed(), &inner.buf);
    }

    pub fn write_sequence<F>(&mut self, f: F)
    where
        F: FnOnce(&mut BerWriter),
    {
        self.write_constructed(Tag::SEQUENCE, f)
    }

    pub fn write<T: BerEncode + ?Sized>(&mut self, value: &T) {
        value.encode_ber(self);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Cursor over the content of a constructed value
#[derive(Debug, Clone)]
pub struct BerReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BerReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Tag of the next value, `None` at the end of the content
    pub fn peek_tag(&self) -> Result<Option<Tag>, DecodeError> {
        if self.is_empty() {
            return Ok(None);
        }
        match Tag::parse(&self.data[self.pos..]) {
            Ok((tag, _)) => Ok(Some(tag)),
            Err(DecodeError::Incomplete(_)) => Err(DecodeError::UnexpectedEnd),
            Err(e) => Err(e),
        }
    }

    /// True if the next value carries `tag`
    pub fn next_is(&self, tag: Tag) -> Result<bool, DecodeError> {
        Ok(self.peek_tag()? == Some(tag))
    }

    /// Read the next value of any tag. A child that claims more than the parent holds is malformed.
    pub fn read_tlv(&mut self) -> Result<Tlv<'a>, DecodeError> {
        let rest = &self.data[self.pos..];
        if rest.is_empty() {
            return Err(DecodeError::UnexpectedEnd);
        }
        let tlv = match Tlv::parse(rest) {
            Ok(tlv) => tlv,
            Err(DecodeError::Incomplete(_)) => {
                let (_, tag_len) = Tag::parse(rest).map_err(|_| DecodeError::UnexpectedEnd)?;
                let (declared, _) = parse_length(&rest[tag_len..]).map_err(|e| match e {
                    DecodeError::Incomplete(_) => DecodeError::UnexpectedEnd,
                    e => e,
                })?;
                return Err(DecodeError::LengthOverrun {
                    declared,
                    available: rest.len() - tag_len,
                });
            }
            Err(e) => return Err(e),
        };
        self.pos += tlv.encoded_len;
        Ok(tlv)
    }

    /// Read the next value and check its tag
    pub fn read_expected(&mut self, tag: Tag) -> Result<&'a [u8], DecodeError> {
        let found = self.peek_tag()?.ok_or(DecodeError::UnexpectedEnd)?;
        if found != tag {
            return Err(DecodeError::UnexpectedTag { expected: tag, found });
        }
        Ok(self.read_tlv()?.content)
    }

    pub fn read_integer(&mut self, tag: Tag) -> Result<i64, DecodeError> {
        let content = self.read_expected(tag)?;
        if content.is_empty() || content.len() > 8 {
            return Err(DecodeError::InvalidValue("INTEGER"));
        }
        let init: i64 = if content[0] & 0x80 != 0 { -1 } else { 0 };
        Ok(content.iter().fold(init, |acc, b| (acc << 8) | *b as i64))
    }

    /// Non-negative INTEGER that fits into 32 bits
    pub fn read_u32(&mut self, tag: Tag) -> Result<u32, DecodeError> {
        u32::try_from(self.read_integer(tag)?).map_err(|_| DecodeError::InvalidValue("INTEGER"))
    }

    pub fn read_enumerated(&mut self) -> Result<u32, DecodeError> {
        self.read_u32(Tag::ENUMERATED)
    }

    pub fn read_boolean(&mut self, tag: Tag) -> Result<bool, DecodeError> {
        match self.read_expected(tag)? {
            [b] => Ok(*b != 0),
            _ => Err(DecodeError::InvalidValue("BOOLEAN")),
        }
    }

    pub fn read_octet_string(&mut self, tag: Tag) -> Result<&'a [u8], DecodeError> {
        self.read_expected(tag)
    }

    pub fn read_bytes(&mut self, tag: Tag) -> Result<Bytes, DecodeError> {
        Ok(Bytes::copy_from_slice(self.read_expected(tag)?))
    }

    /// OCTET STRING holding LDAP string data
    pub fn read_string(&mut self, tag: Tag) -> Result<String, DecodeError> {
        let content = self.read_expected(tag)?;
        String::from_utf8(content.to_vec()).map_err(|_| DecodeError::InvalidValue("UTF-8 string"))
    }

    pub fn read_null(&mut self, tag: Tag) -> Result<(), DecodeError> {
        if self.read_expected(tag)?.is_empty() {
            Ok(())
        } else {
            Err(DecodeError::InvalidValue("NULL"))
        }
    }

    /// Enter a constructed value
    pub fn read_constructed(&mut self, tag: Tag) -> Result<BerReader<'a>, DecodeError> {
        Ok(BerReader::new(self.read_expected(tag.constructed())?))
    }

    pub fn read_sequence(&mut self) -> Result<BerReader<'a>, DecodeError> {
        self.read_constructed(Tag::SEQUENCE)
    }

    /// Read an OPTIONAL component: absent yields `None`, not an error
    pub fn read_optional<T, F>(&mut self, tag: Tag, f: F) -> Result<Option<T>, DecodeError>
    where
        F: FnOnce(&mut Self) -> Result<T, DecodeError>,
    {
        if self.next_is(tag)? {
            f(self).map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn read<T: BerDecode>(&mut self) -> Result<T, DecodeError> {
        T::decode_ber(self)
    }

    /// Skip unknown trailing components
    pub fn skip_rest(&mut self) {
        self.pos = self.data.len();
    }

    /// Require that all content has been consumed
    pub fn finish(self) -> Result<(), DecodeError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(DecodeError::TrailingData(n)),
        }
    }
}

/// Types with a BER encoding
pub trait BerEncode {
    fn encode_ber(&self, w: &mut BerWriter);
}

/// Types decodable from BER
pub trait BerDecode: Sized {
    fn decode_ber(r: &mut BerReader<'_>) -> Result<Self, DecodeError>;
}

/// Encode a single value
pub fn encode<T: BerEncode + ?Sized>(value: &T) -> Bytes {
    let mut w = BerWriter::new();
    value.encode_ber(&mut w);
    w.into_bytes()
}

/// Decode a single value which must span the whole buffer
pub fn decode<T: BerDecode>(data: &[u8]) -> Result<T, DecodeError> {
    let mut r = BerReader::new(data);
    let value = T::decode_ber(&mut r)?;
    r.finish()?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn length_bytes(len: usize) -> Vec<u8> {
        let mut buf = BytesMut::new();
        encode_length(len, &mut buf);
        buf.to_vec()
    }

    fn integer_bytes(value: i64) -> Vec<u8> {
        let mut w = BerWriter::new();
        w.write_integer(Tag::INTEGER, value);
        w.into_bytes().to_vec()
    }

    #[test]
    fn test_length_encoding() {
        assert_eq!(length_bytes(0), [0x00]);
        assert_eq!(length_bytes(0x7f), [0x7f]);
        assert_eq!(length_bytes(0x80), [0x81, 0x80]);
        assert_eq!(length_bytes(0x0100), [0x82, 0x01, 0x00]);
        assert_eq!(length_bytes(0x010000), [0x83, 0x01, 0x00, 0x00]);
    }

    #[test]
    fn test_length_parsing() {
        assert_eq!(parse_length(&[0x05]), Ok((5, 1)));
        assert_eq!(parse_length(&[0x82, 0x01, 0x00]), Ok((0x100, 3)));
        assert_eq!(parse_length(&[0x80]), Err(DecodeError::IndefiniteLength));
        assert_eq!(parse_length(&[0x82, 0x01]), Err(DecodeError::Incomplete(1)));
        assert_eq!(
            parse_length(&[0x85, 0, 0, 0, 0, 1]),
            Err(DecodeError::LengthTooLarge(5))
        );
    }

    #[test]
    fn test_integer_minimal_encoding() {
        assert_eq!(integer_bytes(0), [0x02, 0x01, 0x00]);
        assert_eq!(integer_bytes(127), [0x02, 0x01, 0x7f]);
        assert_eq!(integer_bytes(128), [0x02, 0x02, 0x00, 0x80]);
        assert_eq!(integer_bytes(256), [0x02, 0x02, 0x01, 0x00]);
        assert_eq!(integer_bytes(-1), [0x02, 0x01, 0xff]);
        assert_eq!(integer_bytes(-129), [0x02, 0x02, 0xff, 0x7f]);

        for v in [0, 1, -1, 127, 128, -128, -129, 65535, i32::MAX as i64, i64::MIN] {
            let bytes = integer_bytes(v);
            assert_eq!(BerReader::new(&bytes).read_integer(Tag::INTEGER), Ok(v));
        }
    }

    #[test]
    fn test_high_tag_number() {
        let mut w = BerWriter::new();
        w.write_octet_string(Tag::context(200), b"x");
        let bytes = w.into_bytes();
        assert_eq!(&bytes[..], &[0x9f, 0x81, 0x48, 0x01, b'x']);

        let tlv = Tlv::parse(&bytes).unwrap();
        assert_eq!(tlv.tag, Tag::context(200));
        assert_eq!(tlv.content, b"x");
        assert_eq!(tlv.encoded_len, 5);
    }

    #[test]
    fn test_declared_length_matches_content() {
        let mut w = BerWriter::new();
        w.write_sequence(|w| {
            w.write_octet_string(Tag::OCTET_STRING, &[0x55; 300]);
            w.write_boolean(Tag::BOOLEAN, true);
        });
        let bytes = w.into_bytes();

        let outer = Tlv::parse(&bytes).unwrap();
        assert_eq!(outer.encoded_len, bytes.len());

        let mut r = BerReader::new(outer.content);
        let first = r.read_tlv().unwrap();
        assert_eq!(first.content.len(), 300);
        assert_eq!(first.encoded_len, 1 + 3 + 300);
        assert!(r.read_boolean(Tag::BOOLEAN).unwrap());
        assert!(r.finish().is_ok());
    }

    #[test]
    fn test_child_overrun_is_malformed() {
        // SEQUENCE of 4 bytes holding an OCTET STRING that claims 10
        let data = [0x30, 0x04, 0x04, 0x0a, 0x41, 0x42];
        let mut outer = BerReader::new(&data);
        let mut seq = outer.read_sequence().unwrap();
        assert_eq!(
            seq.read_octet_string(Tag::OCTET_STRING),
            Err(DecodeError::LengthOverrun {
                declared: 10,
                available: 3
            })
        );
    }

    #[test]
    fn test_top_level_incomplete() {
        let data = [0x30, 0x05, 0x02, 0x01];
        assert_eq!(Tlv::parse(&data), Err(DecodeError::Incomplete(3)));
        assert_eq!(Tlv::frame_len(&data), Ok(Some(7)));
        assert_eq!(Tlv::frame_len(&[0x30]), Ok(None));
        assert_eq!(Tlv::frame_len(&[0x30, 0x80]), Err(DecodeError::IndefiniteLength));
    }

    #[test]
    fn test_tag_mismatch_and_optional() {
        let mut w = BerWriter::new();
        w.write_octet_string(Tag::context(1), b"v");
        let bytes = w.into_bytes();

        let mut r = BerReader::new(&bytes);
        assert_eq!(
            r.read_optional(Tag::context(0), |r| r.read_bytes(Tag::context(0))),
            Ok(None)
        );
        assert!(matches!(
            r.clone().read_octet_string(Tag::OCTET_STRING),
            Err(DecodeError::UnexpectedTag { .. })
        ));
        assert_eq!(r.read_string(Tag::context(1)).unwrap(), "v");
        assert!(r.is_empty());
    }

    #[test]
    fn test_boolean_and_null() {
        let mut w = BerWriter::new();
        w.write_boolean(Tag::BOOLEAN, false);
        w.write_null(Tag::application(2));
        let bytes = w.into_bytes();
        assert_eq!(&bytes[..], &[0x01, 0x01, 0x00, 0x42, 0x00]);

        let mut r = BerReader::new(&bytes);
        assert_eq!(r.read_boolean(Tag::BOOLEAN), Ok(false));
        assert_eq!(r.read_null(Tag::application(2)), Ok(()));
    }

    #[test]
    fn test_string_must_be_utf8() {
        let mut r = BerReader::new(&[0x04, 0x02, b'o', b'k']);
        assert_eq!(r.read_string(Tag::OCTET_STRING), Ok("ok".to_owned()));

        let mut r = BerReader::new(&[0x04, 0x02, 0xc3, 0x28]);
        assert_eq!(
            r.read_string(Tag::OCTET_STRING),
            Err(DecodeError::InvalidValue("UTF-8 string"))
        );
    }
}
