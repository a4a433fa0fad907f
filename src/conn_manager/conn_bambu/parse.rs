use tracing::{debug, error, info, trace, warn};

use super::message::{Message, Report};

pub(crate) fn parse_message(message: &rumqttc::Publish) -> Message {
    parse_payload(&message.payload)
}

pub fn parse_payload(payload: &[u8]) -> Message {
    if payload.is_empty() {
        return Message::Unknown(None);
    }

    match serde_json::from_slice::<Report>(payload) {
        Ok(report) if !report.is_empty() => Message::Report(Box::new(report)),
        Ok(_) => {
            let message_str = String::from_utf8_lossy(payload).to_string();
            if message_str.trim() == "{}" {
                Message::Unknown(None)
            } else {
                Message::Unknown(Some(message_str))
            }
        }
        Err(e) => {
            debug!("could not decode report: {}", e);
            match String::from_utf8(payload.to_vec()) {
                Ok(message_str) => Message::Unknown(Some(message_str)),
                Err(_) => Message::Unknown(None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_categories() {
        let msg = parse_payload(br#"{"print": {"bed_temper": 60}}"#);
        assert!(matches!(msg, Message::Report(r) if r.print.is_some()));

        let msg = parse_payload(br#"{"info": {"command": "get_version", "module": []}}"#);
        assert!(matches!(msg, Message::Report(r) if r.info.is_some()));
    }

    #[test]
    fn test_parse_unknown() {
        assert!(matches!(parse_payload(b""), Message::Unknown(None)));
        assert!(matches!(parse_payload(b"{}"), Message::Unknown(None)));
        assert!(matches!(
            parse_payload(br#"{"upgrade": {}}"#),
            Message::Unknown(Some(_))
        ));
        assert!(matches!(parse_payload(b"not json"), Message::Unknown(Some(_))));
    }
}
