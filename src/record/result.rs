use serde::{Deserialize, Serialize};

use super::control::RecordId;
use super::run_state::RunState;

/// The canonical identity and resume seed handed back after the initial
/// run upsert (§3, §4.10 sendRun, invariant 3 in §8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub state: RunState,
    pub resumed: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ExitResult {
    pub exit_code: i32,
}

/// Tagged union of reply payloads a `Result` record may carry back to the
/// mailbox slot named by the originating `Control` (§3, §4.11).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResultKind {
    Run(RunResult),
    Exit(ExitResult),
    Response(serde_json::Value),
}

/// A reply to a request, routed back via the originating record's
/// `Control.mailbox_slot` and `connection_id` (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRecord {
    pub in_reply_to: RecordId,
    pub kind: ResultKind,
}
