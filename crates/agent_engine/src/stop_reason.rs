use crate::{Message, MessageType, StopReason};

/// Moves a stop reason that arrived on an earlier streaming fragment onto the
/// turn's result message.
///
/// Some backends report the authoritative stop reason on a lifecycle fragment
/// (a `message_delta`, say) while the result event's own field is absent.
/// This hides that from consumers: non-result messages are stripped of their
/// stop reason and the value is carried until the result.
///
/// Takes the carry from the previous line, mutates the message in place, and
/// returns the carry for the next line:
/// - init: new turn boundary, carry cleared, message untouched;
/// - non-result with a stop reason: value captured and stripped;
/// - result: a missing stop reason is filled from the carry, an existing one
///   is never overwritten; carry always cleared.
pub(crate) fn carry_stop_reason(
    message: &mut Message,
    carried: Option<StopReason>,
) -> Option<StopReason> {
    if message.message_type == MessageType::INIT {
        return None;
    }
    if message.message_type == MessageType::RESULT {
        if message.stop_reason.is_none() {
            message.stop_reason = carried;
        }
        return None;
    }
    if let Some(reason) = message.stop_reason.take() {
        return Some(reason);
    }
    carried
}
