// ── Notification2 consumer frame codec ──
//
// The consumer endpoint speaks a line-oriented text protocol:
//
//   line 1: message identifier (opaque, echoed back as the ack)
//   line 2: description (topic path)
//   line 3: action (CREATE/UPDATE/DELETE)
//   line 4: blank
//   line 5: JSON payload (may be empty)
//
// Decoding is tolerant: missing trailing fields are absent, never an
// error -- the payload is the last part and may itself be empty.

use std::sync::Arc;

use crate::bayeux::RealtimeAction;

/// One notification as delivered to the consumer.
#[derive(Debug, Clone)]
pub struct Notification {
    /// Opaque message identifier; pass to
    /// [`send_ack`](crate::Notification2Client::send_ack) to confirm
    /// delivery.
    pub identifier: String,
    /// Topic path, e.g. `/t123456/measurements/12345`.
    pub description: String,
    /// What happened to the object, when the frame says.
    pub action: Option<RealtimeAction>,
    /// Raw payload text (usually JSON).
    pub payload: String,
    /// Delivery sequence number, monotonic per connection. Diagnostics
    /// only.
    pub seq: u64,
}

/// Decode one text frame. Tolerates CRLF line endings and truncated
/// frames.
pub(crate) fn decode(text: &str, seq: u64) -> Notification {
    let mut parts = text.splitn(4, '\n');

    let identifier = line(&mut parts);
    let description = line(&mut parts);
    let action = line(&mut parts).parse().ok();

    // The remainder starts with the blank separator line; everything
    // after it is the payload, newlines included.
    let rest = parts.next().unwrap_or("");
    let rest = rest.strip_prefix('\r').unwrap_or(rest);
    let payload = rest.strip_prefix('\n').unwrap_or(rest).to_string();

    Notification {
        identifier,
        description,
        action,
        payload,
        seq,
    }
}

fn line<'a>(parts: &mut impl Iterator<Item = &'a str>) -> String {
    parts
        .next()
        .unwrap_or("")
        .trim_end_matches('\r')
        .to_string()
}

/// Encode the acknowledgement for a notification: exactly the
/// identifier bytes.
pub(crate) fn encode_ack(identifier: &str) -> String {
    identifier.to_string()
}

/// Shared-ownership alias used by the delivery channel.
pub type SharedNotification = Arc<Notification>;

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn decodes_the_full_five_part_frame() {
        let frame = "CLJuEJgjIAAwAQ==\n/t123456/measurements/12345\nCREATE\n\n{\"id\":\"12345\"}";

        let n = decode(frame, 7);
        assert_eq!(n.identifier, "CLJuEJgjIAAwAQ==");
        assert_eq!(n.description, "/t123456/measurements/12345");
        assert_eq!(n.action, Some(RealtimeAction::Create));
        assert_eq!(n.payload, "{\"id\":\"12345\"}");
        assert_eq!(n.seq, 7);
    }

    #[test]
    fn tolerates_crlf_line_endings() {
        let frame = "id-1\r\n/t1/alarms/9\r\nDELETE\r\n\r\n{}";

        let n = decode(frame, 0);
        assert_eq!(n.identifier, "id-1");
        assert_eq!(n.description, "/t1/alarms/9");
        assert_eq!(n.action, Some(RealtimeAction::Delete));
        assert_eq!(n.payload, "{}");
    }

    #[test]
    fn missing_trailing_fields_are_absent_not_errors() {
        let n = decode("only-an-identifier", 0);
        assert_eq!(n.identifier, "only-an-identifier");
        assert_eq!(n.description, "");
        assert_eq!(n.action, None);
        assert_eq!(n.payload, "");

        let n = decode("id\n/t1/events/2", 0);
        assert_eq!(n.description, "/t1/events/2");
        assert_eq!(n.action, None);
    }

    #[test]
    fn empty_payload_is_fine() {
        let n = decode("id\n/t1/events/2\nUPDATE\n\n", 0);
        assert_eq!(n.action, Some(RealtimeAction::Update));
        assert_eq!(n.payload, "");
    }

    #[test]
    fn payload_may_contain_newlines() {
        let n = decode("id\n/d\nCREATE\n\n{\n  \"a\": 1\n}", 0);
        assert_eq!(n.payload, "{\n  \"a\": 1\n}");
    }

    #[test]
    fn unknown_action_decodes_as_absent() {
        let n = decode("id\n/d\nMUTATE\n\n{}", 0);
        assert_eq!(n.action, None);
    }

    #[test]
    fn ack_is_exactly_the_identifier() {
        assert_eq!(encode_ack("CLJuEJgjIAAwAQ=="), "CLJuEJgjIAAwAQ==");
    }
}
