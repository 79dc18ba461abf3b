//! Rendering of decoded header packets for the `-H` flag.

use chrono::Utc;
use tapetext_core::packet::{Packet, Payload};

use crate::logging::HeaderLineEvent;

/// Build a printable event from a header packet; `None` for anything else
/// (including time-filling headers, which carry no page).
pub fn describe_header(packet: &Packet) -> Option<HeaderLineEvent> {
    let header = match &packet.payload {
        Payload::Header(header) => header,
        _ => return None,
    };
    let page = packet.page_number()?;

    Some(HeaderLineEvent {
        timestamp: Utc::now(),
        frame_index: packet.frame_index,
        page: page.to_string(),
        subcode: format!("{:04X}", header.subcode),
        errors: packet.errors,
        caption: printable(&header.caption),
    })
}

/// Replace control characters with dots; teletext text is 7-bit with
/// attribute codes below 0x20.
fn printable(text: &[u8]) -> String {
    text.iter()
        .map(|&b| if (0x20..0x7F).contains(&b) { b as char } else { '.' })
        .collect()
}

/// Rate gate for header printing: `-S N` skips N frames between prints.
#[derive(Debug, Clone, Copy)]
pub struct HeaderGate {
    skip: u64,
    last_printed: Option<u64>,
}

impl HeaderGate {
    pub fn new(skip: u64) -> Self {
        Self {
            skip,
            last_printed: None,
        }
    }

    pub fn should_print(&mut self, frame_index: u64) -> bool {
        let due = match self.last_printed {
            None => true,
            Some(last) => frame_index >= last + self.skip + 1,
        };
        if due {
            self.last_printed = Some(frame_index);
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tapetext_core::config::LINE_BYTES;
    use tapetext_core::deconvolver::RawLine;
    use tapetext_core::packet::{encode_header, padded_caption, PageControl};

    fn header_packet(page: u8, frame_index: u64) -> Packet {
        let bytes = encode_header(
            1,
            page,
            0x3F7F,
            &PageControl::default(),
            &padded_caption(b"CAPTION \x07TEXT"),
        );
        Packet::decode(&RawLine {
            frame_index,
            bytes,
            confidence: [1.0; LINE_BYTES],
        })
    }

    #[test]
    fn test_header_event_fields() {
        let event = describe_header(&header_packet(0x23, 5)).unwrap();
        assert_eq!(event.page, "123");
        assert_eq!(event.subcode, "3F7F");
        assert_eq!(event.frame_index, 5);
        // the 0x07 attribute code renders as a dot
        assert!(event.caption.starts_with("CAPTION .TEXT"));
    }

    #[test]
    fn test_time_filling_headers_are_not_printed() {
        assert!(describe_header(&header_packet(0xFF, 0)).is_none());
    }

    #[test]
    fn test_gate_skips_frames_between_prints() {
        let mut gate = HeaderGate::new(2);
        assert!(gate.should_print(0));
        assert!(!gate.should_print(1));
        assert!(!gate.should_print(2));
        assert!(gate.should_print(3));

        let mut every = HeaderGate::new(0);
        assert!(every.should_print(0));
        assert!(every.should_print(1));
    }
}
