//! Denial reason strings, shared by both proxies and by the responses they
//! send back to the blocked client.

/// The destination host/port did not match an allow rule, or matched a deny
/// rule, under the active `NetworkConfig`.
pub const REASON_NOT_ALLOWED: &str = "not_allowed";

/// Maps a reason code to the message shown to the blocked client. Kept
/// separate from the constant above so new reasons can't be added without
/// also giving them a human-readable message.
pub fn human_message(reason: &str) -> &'static str {
    match reason {
        REASON_NOT_ALLOWED => "destination is not permitted by the active network policy",
        _ => "request was blocked by the active network policy",
    }
}
