use bytes::{Buf, BufMut, BytesMut};
use log::{error, trace};
use tokio_util::codec::{Decoder, Encoder};

use crate::{
    ber::{self, BerReader, DecodeError, Tag, Tlv},
    error::Error,
    message::LdapMessage,
};

/// A complete frame whose content could not be decoded. The stream stays usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MalformedMessage {
    /// Message ID, if the envelope was readable far enough to find it
    pub message_id: Option<u32>,
    pub error: DecodeError,
}

pub(crate) type Incoming = Result<LdapMessage, MalformedMessage>;

fn peek_message_id(frame: &[u8]) -> Option<u32> {
    let mut r = BerReader::new(frame);
    r.read_sequence().ok()?.read_u32(Tag::INTEGER).ok()
}

pub(crate) struct LdapCodec;

impl Decoder for LdapCodec {
    type Item = Incoming;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let len = match Tlv::frame_len(src) {
            Ok(Some(len)) => len,
            Ok(None) => {
                trace!("Incomplete message, buffered: {} bytes", src.len());
                return Ok(None);
            }
            Err(e) => {
                // no way to find the next frame boundary
                error!("Framing error: {}", e);
                return Err(e.into());
            }
        };

        if src.len() < len {
            trace!("Incomplete message, buffered: {} of {} bytes", src.len(), len);
            src.reserve(len - src.len());
            return Ok(None);
        }

        let frame = src.split_to(len);
        trace!("Decoded message: {} bytes", len);

        match ber::decode::<LdapMessage>(&frame) {
            Ok(msg) => Ok(Some(Ok(msg))),
            Err(e) => {
                let message_id = peek_message_id(&frame);
                error!("Decoder error in message {:?}: {}", message_id, e);
                Ok(Some(Err(MalformedMessage { message_id, error: e })))
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(item) => Ok(Some(item)),
            None => {
                if !buf.is_empty() {
                    trace!("Discarding {} bytes of a truncated message", buf.len());
                    buf.advance(buf.len());
                }
                Ok(None)
            }
        }
    }
}

impl Encoder<LdapMessage> for LdapCodec {
    type Error = Error;

    fn encode(&mut self, item: LdapMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let encoded = ber::encode(&item);
        dst.reserve(encoded.len());
        dst.put_slice(&encoded);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::ProtocolOp;

    #[test]
    fn test_partial_frames() {
        let msg = LdapMessage::new(7, ProtocolOp::UnbindRequest);
        let mut encoded = BytesMut::new();
        LdapCodec.encode(msg.clone(), &mut encoded).unwrap();
        LdapCodec.encode(msg.clone(), &mut encoded).unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encoded[..3]);
        assert_eq!(LdapCodec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(&encoded[3..]);
        assert_eq!(LdapCodec.decode(&mut buf).unwrap(), Some(Ok(msg.clone())));
        assert_eq!(LdapCodec.decode(&mut buf).unwrap(), Some(Ok(msg)));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_frame_fed_byte_by_byte() {
        let msg = LdapMessage::new(
            3,
            ProtocolOp::SearchResDone(crate::message::LdapResult::new(
                crate::message::ResultCode::Success,
                "o=apache",
                "done",
            )),
        );
        let encoded = ber::encode(&msg);

        let mut buf = BytesMut::new();
        for (i, b) in encoded.iter().enumerate() {
            buf.extend_from_slice(&[*b]);
            let decoded = LdapCodec.decode(&mut buf).unwrap();
            if i + 1 < encoded.len() {
                assert_eq!(decoded, None, "decoded early at byte {}", i);
            } else {
                assert_eq!(decoded, Some(Ok(msg.clone())));
            }
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_malformed_content_is_isolated() {
        // message 5 with an unknown application tag, followed by a valid unbind
        let mut buf = BytesMut::from(&[0x30, 0x05, 0x02, 0x01, 0x05, 0x5e, 0x00][..]);
        buf.extend_from_slice(&ber::encode(&LdapMessage::new(6, ProtocolOp::UnbindRequest)));

        match LdapCodec.decode(&mut buf).unwrap() {
            Some(Err(malformed)) => assert_eq!(malformed.message_id, Some(5)),
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(LdapCodec.decode(&mut buf).unwrap(), Some(Ok(m)) if m.message_id == 6));
    }

    #[test]
    fn test_invalid_utf8_dn_is_isolated() {
        // delResponse for message 4 whose matchedDN holds 0xff
        let mut buf = BytesMut::from(
            &[0x30, 0x0d, 0x02, 0x01, 0x04, 0x6b, 0x08, 0x0a, 0x01, 0x00, 0x04, 0x01, 0xff, 0x04, 0x00][..],
        );
        match LdapCodec.decode(&mut buf).unwrap() {
            Some(Err(malformed)) => {
                assert_eq!(malformed.message_id, Some(4));
                assert_eq!(malformed.error, DecodeError::InvalidValue("UTF-8 string"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_indefinite_length_is_fatal() {
        let mut buf = BytesMut::from(&[0x30, 0x80, 0x02, 0x01, 0x01, 0x42, 0x00, 0x00, 0x00][..]);
        assert!(matches!(
            LdapCodec.decode(&mut buf),
            Err(Error::Decode(DecodeError::IndefiniteLength))
        ));
    }
}
