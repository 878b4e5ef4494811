//! LDAP controls

use std::convert::TryFrom;

use bytes::Bytes;

use crate::{
    ber::{self, BerReader, BerWriter, Tag},
    error::Error,
    message::Control,
    oid,
};

/// Simple paged result control, OID 1.2.840.113556.1.4.319
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SimplePagedResultsControl {
    size: u32,
    cookie: Bytes,
    has_entries: bool,
}

impl SimplePagedResultsControl {
    /// Control OID
    pub const OID: &'static str = oid::SIMPLE_PAGED_RESULTS_CONTROL_OID;

    /// Create paged result control with a given page size
    pub fn new(size: u32) -> Self {
        Self {
            size,
            cookie: Bytes::new(),
            has_entries: true,
        }
    }

    /// Replace the page size for a given control
    pub fn with_size(self, size: u32) -> Self {
        Self { size, ..self }
    }

    /// Resume from a cookie returned by the server
    pub fn with_cookie(self, cookie: Bytes) -> Self {
        Self {
            has_entries: !cookie.is_empty(),
            cookie,
            ..self
        }
    }

    /// Return a cookie
    pub fn cookie(&self) -> &Bytes {
        &self.cookie
    }

    /// Return a current size
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Returns true if this control indicates more entries are available
    pub fn has_entries(&self) -> bool {
        self.has_entries
    }

    pub(crate) fn clear_entries(&mut self) {
        self.has_entries = false;
    }
}

impl From<SimplePagedResultsControl> for Control {
    fn from(control: SimplePagedResultsControl) -> Self {
        let mut w = BerWriter::new();
        w.write_sequence(|w| {
            w.write_integer(Tag::INTEGER, control.size as i64);
            w.write_octet_string(Tag::OCTET_STRING, &control.cookie);
        });
        Control::new(SimplePagedResultsControl::OID, false, Some(w.into_bytes()))
    }
}

impl TryFrom<Control> for SimplePagedResultsControl {
    type Error = Error;

    fn try_from(value: Control) -> Result<Self, Self::Error> {
        let data = value.control_value.unwrap_or_default();
        let mut r = BerReader::new(&data);
        let mut seq = r.read_sequence()?;
        let size = seq.read_u32(Tag::INTEGER)?;
        let cookie = seq.read_bytes(Tag::OCTET_STRING)?;
        seq.finish()?;
        r.finish()?;

        Ok(SimplePagedResultsControl {
            size,
            has_entries: !cookie.is_empty(),
            cookie,
        })
    }
}

/// Kind of change reported by a persistent search
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeType {
    Add = 1,
    Delete = 2,
    Modify = 4,
    ModDn = 8,
}

impl ChangeType {
    pub const ALL: u32 = 1 | 2 | 4 | 8;
}

impl TryFrom<u32> for ChangeType {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ChangeType::Add),
            2 => Ok(ChangeType::Delete),
            4 => Ok(ChangeType::Modify),
            8 => Ok(ChangeType::ModDn),
            _ => Err(Error::Decode(ber::DecodeError::InvalidValue("changeType"))),
        }
    }
}

/// Persistent search request control
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PersistentSearchControl {
    /// Bit mask of [`ChangeType`] values
    pub change_types: u32,
    /// Skip the initial result set and report only changes
    pub changes_only: bool,
    /// Ask for an entry change notification control on every entry
    pub return_ecs: bool,
}

impl Default for PersistentSearchControl {
    fn default() -> Self {
        Self {
            change_types: ChangeType::ALL,
            changes_only: true,
            return_ecs: true,
        }
    }
}

impl PersistentSearchControl {
    pub const OID: &'static str = oid::PERSISTENT_SEARCH_CONTROL_OID;
}

impl From<PersistentSearchControl> for Control {
    fn from(control: PersistentSearchControl) -> Self {
        let mut w = BerWriter::new();
        w.write_sequence(|w| {
            w.write_integer(Tag::INTEGER, control.change_types as i64);
            w.write_boolean(Tag::BOOLEAN, control.changes_only);
            w.write_boolean(Tag::BOOLEAN, control.return_ecs);
        });
        Control::new(PersistentSearchControl::OID, true, Some(w.into_bytes()))
    }
}

/// Entry change notification, attached by the server to entries of a persistent search
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryChangeNotificationControl {
    pub change_type: ChangeType,
    /// Former DN of a renamed entry
    pub previous_dn: Option<String>,
    pub change_number: Option<i64>,
}

impl EntryChangeNotificationControl {
    pub const OID: &'static str = oid::ENTRY_CHANGE_NOTIFICATION_CONTROL_OID;
}

impl From<EntryChangeNotificationControl> for Control {
    fn from(control: EntryChangeNotificationControl) -> Self {
        let mut w = BerWriter::new();
        w.write_sequence(|w| {
            w.write_enumerated(control.change_type as u32);
            if let Some(ref dn) = control.previous_dn {
                w.write_octet_string(Tag::OCTET_STRING, dn.as_bytes());
            }
            if let Some(number) = control.change_number {
                w.write_integer(Tag::INTEGER, number);
            }
        });
        Control::new(EntryChangeNotificationControl::OID, false, Some(w.into_bytes()))
    }
}

impl TryFrom<&Control> for EntryChangeNotificationControl {
    type Error = Error;

    fn try_from(value: &Control) -> Result<Self, Self::Error> {
        let data = value.control_value.clone().unwrap_or_default();
        let mut r = BerReader::new(&data);
        let mut seq = r.read_sequence()?;
        let change_type = ChangeType::try_from(seq.read_enumerated()?)?;
        let previous_dn = seq.read_optional(Tag::OCTET_STRING, |r| r.read_string(Tag::OCTET_STRING))?;
        let change_number = seq.read_optional(Tag::INTEGER, |r| r.read_integer(Tag::INTEGER))?;
        seq.finish()?;
        r.finish()?;

        Ok(EntryChangeNotificationControl {
            change_type,
            previous_dn,
            change_number,
        })
    }
}

/// ManageDsaIT: referral objects are treated as ordinary entries
pub fn manage_dsa_it() -> Control {
    Control::new(oid::MANAGE_DSA_IT_CONTROL_OID, false, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paged_control() {
        let control: Control = SimplePagedResultsControl::new(100).into();
        assert_eq!(control.control_type, "1.2.840.113556.1.4.319");
        assert_eq!(
            control.control_value.as_deref(),
            Some(&[0x30, 0x05, 0x02, 0x01, 0x64, 0x04, 0x00][..])
        );

        let reply = Control::new(
            SimplePagedResultsControl::OID,
            false,
            Some(Bytes::from_static(&[0x30, 0x07, 0x02, 0x01, 0x00, 0x04, 0x02, 0xab, 0xcd])),
        );
        let paged = SimplePagedResultsControl::try_from(reply).unwrap();
        assert!(paged.has_entries());
        assert_eq!(&paged.cookie()[..], &[0xab, 0xcd]);

        let last = Control::new(
            SimplePagedResultsControl::OID,
            false,
            Some(Bytes::from_static(&[0x30, 0x05, 0x02, 0x01, 0x00, 0x04, 0x00])),
        );
        assert!(!SimplePagedResultsControl::try_from(last).unwrap().has_entries());
    }

    #[test]
    fn test_persistent_search_control() {
        let control: Control = PersistentSearchControl::default().into();
        assert!(control.criticality);
        assert_eq!(
            control.control_value.as_deref(),
            Some(&[0x30, 0x09, 0x02, 0x01, 0x0f, 0x01, 0x01, 0xff, 0x01, 0x01, 0xff][..])
        );
    }

    #[test]
    fn test_entry_change_notification() {
        let ecn = EntryChangeNotificationControl {
            change_type: ChangeType::ModDn,
            previous_dn: Some("cn=old,o=apache".into()),
            change_number: Some(42),
        };
        let control: Control = ecn.clone().into();
        assert_eq!(EntryChangeNotificationControl::try_from(&control).unwrap(), ecn);

        let bare = Control::new(
            EntryChangeNotificationControl::OID,
            false,
            Some(Bytes::from_static(&[0x30, 0x03, 0x0a, 0x01, 0x01])),
        );
        let parsed = EntryChangeNotificationControl::try_from(&bare).unwrap();
        assert_eq!(parsed.change_type, ChangeType::Add);
        assert_eq!(parsed.previous_dn, None);
    }
}
