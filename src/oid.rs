//! OID definitions

/// StartTLS extended operation
pub const STARTTLS_OID: &str = "1.3.6.1.4.1.1466.20037";

/// WHOAMI extended operation
pub const WHOAMI_OID: &str = "1.3.6.1.4.1.4203.1.11.3";

/// Notice of disconnection response sent by the server
pub const NOTICE_OF_DISCONNECTION_OID: &str = "1.3.6.1.4.1.1466.20036";

/// SimplePagedResultsControl OID
pub const SIMPLE_PAGED_RESULTS_CONTROL_OID: &str = "1.2.840.113556.1.4.319";

/// Persistent search control
pub const PERSISTENT_SEARCH_CONTROL_OID: &str = "2.16.840.1.113730.3.4.3";

/// Entry change notification response control
pub const ENTRY_CHANGE_NOTIFICATION_CONTROL_OID: &str = "2.16.840.1.113730.3.4.7";

/// ManageDsaIT control (RFC 3296)
pub const MANAGE_DSA_IT_CONTROL_OID: &str = "2.16.840.1.113730.3.4.2";
