use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Metadata carried by every `Record`, selecting reply routing and
/// synchronous semantics (§3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Control {
    /// The sender expects a `Result` reply.
    pub req_resp: bool,
    /// Correlation id used to route a `Result` back to the caller's mailbox.
    /// Empty when no reply is expected unless `req_resp` is set.
    pub mailbox_slot: String,
    /// Identifies which physical connection a reply must be written back to;
    /// stamped by the Mux on `RecordCommunicate` (§4.11).
    pub connection_id: String,
    /// Forces forwarding to the Sender even for records that would otherwise
    /// be filtered (e.g. during a sync replay).
    pub always_send: bool,
}

impl Control {
    pub fn wants_reply(&self) -> bool {
        self.req_resp || !self.mailbox_slot.is_empty()
    }
}

/// Newtype used wherever the wire protocol needs a stable record identity
/// distinct from any domain id (run id, file id, ...).
pub type RecordId = Uuid;

pub fn new_record_id() -> RecordId {
    Uuid::new_v4()
}
