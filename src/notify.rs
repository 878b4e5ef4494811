//! Persistent search notifications

use std::sync::Arc;

use log::{debug, warn};

use crate::{
    conn::LdapConnection,
    controls::EntryChangeNotificationControl,
    error::Error,
    message::{LdapMessage, ProtocolOp, ResultCode},
    model::{BinaryAttributes, SearchEntry},
};

/// Receiver of directory change notifications.
///
/// Callbacks run on the connection's reader task and must not block.
pub trait NotificationListener: Send + Sync {
    fn entry_changed(&self, notification: ChangeNotification);

    /// The subscription failed and is no longer registered
    fn notification_failed(&self, error: &Error);

    /// The server ended the subscription normally
    fn subscription_closed(&self) {}
}

/// One changed entry delivered to a listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotification {
    pub subscription: u32,
    pub entry: SearchEntry,
    /// Change details, when the server attached an entry change notification control
    pub change: Option<EntryChangeNotificationControl>,
}

/// Listener registration held by the connection for the lifetime of a subscription
pub(crate) struct Subscriber {
    id: u32,
    listener: Arc<dyn NotificationListener>,
    binary: BinaryAttributes,
}

impl Subscriber {
    pub(crate) fn new(id: u32, listener: Arc<dyn NotificationListener>, binary: BinaryAttributes) -> Self {
        Self { id, listener, binary }
    }

    /// Deliver a message of the subscription. Returns false once the subscription is over.
    pub(crate) fn dispatch(&self, incoming: Result<LdapMessage, Error>) -> bool {
        let msg = match incoming {
            Ok(msg) => msg,
            Err(e) => {
                self.listener.notification_failed(&e);
                return false;
            }
        };

        let change = msg
            .control(EntryChangeNotificationControl::OID)
            .and_then(|c| EntryChangeNotificationControl::try_from(c).ok());

        match msg.protocol_op {
            ProtocolOp::SearchResEntry(raw) => {
                let entry = SearchEntry::from_raw(raw, msg.controls, &self.binary);
                self.listener.entry_changed(ChangeNotification {
                    subscription: self.id,
                    entry,
                    change,
                });
                true
            }
            ProtocolOp::SearchResRef(_) | ProtocolOp::IntermediateResp(_) => true,
            ProtocolOp::SearchResDone(result) => {
                if result.result_code == ResultCode::Success {
                    debug!("Persistent search {} ended by server", self.id);
                    self.listener.subscription_closed();
                } else {
                    self.listener.notification_failed(&result.into());
                }
                false
            }
            other => {
                warn!("Unexpected message in persistent search {}: tag {}", self.id, other.tag());
                true
            }
        }
    }

    pub(crate) fn fail(&self, error: &Error) {
        self.listener.notification_failed(error);
    }
}

/// Handle of a registered persistent search
pub struct Subscription {
    id: u32,
    connection: LdapConnection,
}

impl Subscription {
    pub(crate) fn new(id: u32, connection: LdapConnection) -> Self {
        Self { id, connection }
    }

    /// Message ID of the persistent search request
    pub fn id(&self) -> u32 {
        self.id
    }

    /// True while the listener is still registered
    pub fn is_active(&self) -> bool {
        self.connection.has_listener(self.id)
    }

    /// Remove the listener and abandon the search on the server
    pub async fn cancel(mut self) -> Result<(), Error> {
        self.connection.remove_listener(self.id);
        self.connection.abandon(self.id).await
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use parking_lot::Mutex;

    use super::*;
    use crate::{
        controls::ChangeType,
        message::LdapResult,
        ops::{PartialAttribute, SearchResultEntry},
    };

    #[derive(Default)]
    struct Recorder {
        changes: Mutex<Vec<ChangeNotification>>,
        failures: Mutex<Vec<String>>,
    }

    impl NotificationListener for Recorder {
        fn entry_changed(&self, notification: ChangeNotification) {
            self.changes.lock().push(notification);
        }

        fn notification_failed(&self, error: &Error) {
            self.failures.lock().push(error.to_string());
        }
    }

    #[test]
    fn test_dispatch() {
        let recorder = Arc::new(Recorder::default());
        let subscriber = Subscriber::new(9, recorder.clone(), BinaryAttributes::default());

        let ecn = EntryChangeNotificationControl {
            change_type: ChangeType::Modify,
            previous_dn: None,
            change_number: None,
        };
        let entry = LdapMessage::new(
            9,
            ProtocolOp::SearchResEntry(SearchResultEntry {
                object_name: "cn=a,o=apache".into(),
                attributes: vec![PartialAttribute::new("cn", [Bytes::from_static(b"a")])],
            }),
        )
        .with_controls(vec![ecn.clone().into()]);

        assert!(subscriber.dispatch(Ok(entry)));
        let done = LdapMessage::new(
            9,
            ProtocolOp::SearchResDone(LdapResult::new(ResultCode::UnwillingToPerform, "", "no psearch")),
        );
        assert!(!subscriber.dispatch(Ok(done)));

        let changes = recorder.changes.lock();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].subscription, 9);
        assert_eq!(changes[0].entry.dn, "cn=a,o=apache");
        assert_eq!(changes[0].change, Some(ecn));
        assert_eq!(
            recorder.failures.lock().as_slice(),
            &["[LDAP: error code 53 - no psearch]".to_owned()]
        );
    }
}
