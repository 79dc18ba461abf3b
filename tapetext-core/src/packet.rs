//! Typed teletext packets and the 42-byte line decoder.
//!
//! Bytes 0-1 of every line are the Hamming-protected packet address:
//! three magazine bits and five row bits. Row 0 is a page header, rows
//! 1-24 carry display text, and rows 25-31 are designation-coded control
//! packets. Designations this decoder does not understand pass through as
//! `Unknown` rather than being guessed at.

use crate::coding::{hamming84_decode, hamming84_encode, odd_parity_encode, odd_parity_ok};
use crate::config::LINE_BYTES;
use crate::deconvolver::RawLine;
use crate::utils::PageNumber;

/// Value written for nibbles lost to uncorrectable Hamming errors
pub const ERASED_NIBBLE: u8 = 0x0F;

/// Page byte of time-filling headers that carry no real page
pub const TIME_FILLING_PAGE: u8 = 0xFF;

/// Header control bits C4-C14.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageControl {
    pub erase: bool,
    pub newsflash: bool,
    pub subtitle: bool,
    pub suppress_header: bool,
    pub update: bool,
    pub interrupted: bool,
    pub inhibit_display: bool,
    pub magazine_serial: bool,
    /// National option character subset, C12-C14
    pub charset: u8,
}

/// Row 0: page header.
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    /// Page byte within the magazine; 0xFF is time filling
    pub page: u8,
    /// 13-bit subpage code
    pub subcode: u16,
    pub control: PageControl,
    /// Status-row text, parity stripped to 7-bit values
    pub caption: [u8; 32],
}

/// Rows 1-24: one display row of parity-stripped text.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayRow {
    pub text: [u8; 40],
}

/// Rows 26/28/29, designation 0: page enhancement data, passed through
/// undecoded.
#[derive(Debug, Clone, PartialEq)]
pub struct Enhancement {
    pub designation: u8,
    pub data: [u8; 39],
}

/// One editorial page link from a fastext packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageLink {
    pub magazine: u8,
    pub page: u8,
    pub subcode: u16,
}

/// Row 27, designation 0: the six editorial links.
#[derive(Debug, Clone, PartialEq)]
pub struct Fastext {
    pub links: [PageLink; 6],
    pub link_control: u8,
}

/// Row 30 on magazine 8: broadcast service data.
#[derive(Debug, Clone, PartialEq)]
pub struct Broadcast {
    pub designation: u8,
    pub initial_page: PageLink,
    /// Status display text, parity stripped
    pub status: [u8; 20],
}

/// Kind-specific decoded payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Header(Header),
    DisplayRow(DisplayRow),
    Enhancement(Enhancement),
    Fastext(Fastext),
    Broadcast(Broadcast),
    Unknown,
}

impl Payload {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Payload::Header(_) => "header",
            Payload::DisplayRow(_) => "display_row",
            Payload::Enhancement(_) => "enhancement",
            Payload::Fastext(_) => "fastext",
            Payload::Broadcast(_) => "broadcast",
            Payload::Unknown => "unknown",
        }
    }
}

/// One decoded teletext packet.
///
/// Keeps the raw 42 bytes and their per-byte confidence alongside the
/// typed payload; the stream filter votes over the raw bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// Magazine 1-8 (transmitted magazine bits 0 mean 8)
    pub magazine: u8,
    /// Packet row 0-31
    pub row: u8,
    pub frame_index: u64,
    /// Corrected plus uncorrectable Hamming errors
    pub errors: usize,
    pub bytes: [u8; LINE_BYTES],
    /// Per-byte confidence; parity failures zero the affected byte
    pub confidence: [f32; LINE_BYTES],
    /// Deconvolver per-byte confidence before parity accounting. The
    /// stream filter weights votes with this so parity-failed bytes stay
    /// in the tally at a discount instead of vanishing.
    pub signal_confidence: [f32; LINE_BYTES],
    /// False when the packet address itself was unrecoverable; magazine
    /// and row are then best-effort guesses and the packet must not be
    /// attributed to a page.
    pub address_ok: bool,
    pub payload: Payload,
}

impl Packet {
    /// Decode one framed line into a typed packet.
    pub fn decode(line: &RawLine) -> Packet {
        let mut errors = 0usize;
        let mut confidence = line.confidence;

        let addr_lo = hamming84_decode(line.bytes[0]);
        let addr_hi = hamming84_decode(line.bytes[1]);
        errors += addr_lo.residual() + addr_hi.residual();

        let (magazine, row, address_ok) = match (addr_lo.value(), addr_hi.value()) {
            (Some(lo), Some(hi)) => {
                let address = lo | (hi << 4);
                (address & 0x07, address >> 3, true)
            }
            // Address unrecoverable: fall back to the raw data-bit
            // positions so magazine and row stay in range, but the packet
            // can no longer be trusted to be what it claims.
            _ => {
                let address = raw_data_bits(line.bytes[0]) | (raw_data_bits(line.bytes[1]) << 4);
                (address & 0x07, address >> 3, false)
            }
        };
        let magazine = if magazine == 0 { 8 } else { magazine };

        let payload = if !address_ok {
            Payload::Unknown
        } else {
            match row {
                0 => decode_header(&line.bytes, &mut confidence, &mut errors),
                1..=24 => decode_display_row(&line.bytes, &mut confidence),
                26 | 28 | 29 => decode_enhancement(&line.bytes, &mut errors),
                27 => decode_fastext(&line.bytes, magazine, &mut errors),
                30 if magazine == 8 => decode_broadcast(&line.bytes, &mut confidence, &mut errors),
                _ => Payload::Unknown,
            }
        };

        Packet {
            magazine,
            row,
            frame_index: line.frame_index,
            errors,
            bytes: line.bytes,
            confidence,
            signal_confidence: line.confidence,
            address_ok,
            payload,
        }
    }

    /// Full page number for header packets on a real page.
    pub fn page_number(&self) -> Option<PageNumber> {
        match &self.payload {
            Payload::Header(header) if header.page != TIME_FILLING_PAGE => Some(PageNumber {
                magazine: self.magazine,
                page: header.page,
            }),
            _ => None,
        }
    }
}

/// Pull D1-D4 out of a codeword without correction, for packets whose
/// address failed Hamming decode.
fn raw_data_bits(byte: u8) -> u8 {
    ((byte >> 1) & 1) | (((byte >> 3) & 1) << 1) | (((byte >> 5) & 1) << 2) | (((byte >> 7) & 1) << 3)
}

fn decode_nibble(byte: u8, errors: &mut usize) -> u8 {
    let decoded = hamming84_decode(byte);
    *errors += decoded.residual();
    decoded.value().unwrap_or(ERASED_NIBBLE)
}

fn decode_parity_text(raw: &[u8], confidence: &mut [f32], out: &mut [u8]) {
    for ((&byte, conf), text) in raw.iter().zip(confidence.iter_mut()).zip(out.iter_mut()) {
        *text = byte & 0x7F;
        if !odd_parity_ok(byte) {
            *conf = 0.0;
        }
    }
}

fn decode_header(bytes: &[u8; LINE_BYTES], confidence: &mut [f32; LINE_BYTES], errors: &mut usize) -> Payload {
    let units = decode_nibble(bytes[2], errors);
    let tens = decode_nibble(bytes[3], errors);
    let s1 = decode_nibble(bytes[4], errors);
    let s2_c4 = decode_nibble(bytes[5], errors);
    let s3 = decode_nibble(bytes[6], errors);
    let s4_c56 = decode_nibble(bytes[7], errors);
    let c7_10 = decode_nibble(bytes[8], errors);
    let c11_14 = decode_nibble(bytes[9], errors);

    let subcode = (s1 as u16)
        | (((s2_c4 & 0x7) as u16) << 4)
        | ((s3 as u16) << 7)
        | (((s4_c56 & 0x3) as u16) << 11);

    let control = PageControl {
        erase: s2_c4 & 0x8 != 0,
        newsflash: s4_c56 & 0x4 != 0,
        subtitle: s4_c56 & 0x8 != 0,
        suppress_header: c7_10 & 0x1 != 0,
        update: c7_10 & 0x2 != 0,
        interrupted: c7_10 & 0x4 != 0,
        inhibit_display: c7_10 & 0x8 != 0,
        magazine_serial: c11_14 & 0x1 != 0,
        charset: (c11_14 >> 1) & 0x7,
    };

    let mut caption = [0u8; 32];
    decode_parity_text(&bytes[10..], &mut confidence[10..], &mut caption);

    Payload::Header(Header {
        page: units | (tens << 4),
        subcode,
        control,
        caption,
    })
}

fn decode_display_row(bytes: &[u8; LINE_BYTES], confidence: &mut [f32; LINE_BYTES]) -> Payload {
    let mut text = [0u8; 40];
    decode_parity_text(&bytes[2..], &mut confidence[2..], &mut text);
    Payload::DisplayRow(DisplayRow { text })
}

fn decode_enhancement(bytes: &[u8; LINE_BYTES], errors: &mut usize) -> Payload {
    let designation = hamming84_decode(bytes[2]);
    if designation.value() != Some(0) {
        return Payload::Unknown;
    }
    *errors += designation.residual();
    let mut data = [0u8; 39];
    data.copy_from_slice(&bytes[3..]);
    Payload::Enhancement(Enhancement {
        designation: 0,
        data,
    })
}

fn decode_link(
    group: &[u8],
    current_magazine: u8,
    errors: &mut usize,
) -> PageLink {
    let units = decode_nibble(group[0], errors);
    let tens = decode_nibble(group[1], errors);
    let s1 = decode_nibble(group[2], errors);
    let s2_m1 = decode_nibble(group[3], errors);
    let s3 = decode_nibble(group[4], errors);
    let s4_m23 = decode_nibble(group[5], errors);

    let relative =
        ((s2_m1 >> 3) & 1) | (((s4_m23 >> 2) & 1) << 1) | (((s4_m23 >> 3) & 1) << 2);
    let magazine = (current_magazine & 0x7) ^ relative;
    PageLink {
        magazine: if magazine == 0 { 8 } else { magazine },
        page: units | (tens << 4),
        subcode: (s1 as u16)
            | (((s2_m1 & 0x7) as u16) << 4)
            | ((s3 as u16) << 7)
            | (((s4_m23 & 0x3) as u16) << 11),
    }
}

fn decode_fastext(bytes: &[u8; LINE_BYTES], magazine: u8, errors: &mut usize) -> Payload {
    let designation = hamming84_decode(bytes[2]);
    if designation.value() != Some(0) {
        return Payload::Unknown;
    }
    *errors += designation.residual();

    let mut links = [PageLink {
        magazine: 0,
        page: 0,
        subcode: 0,
    }; 6];
    for (i, link) in links.iter_mut().enumerate() {
        let start = 3 + i * 6;
        *link = decode_link(&bytes[start..start + 6], magazine, errors);
    }
    let link_control = decode_nibble(bytes[39], errors);

    Payload::Fastext(Fastext {
        links,
        link_control,
    })
}

fn decode_broadcast(bytes: &[u8; LINE_BYTES], confidence: &mut [f32; LINE_BYTES], errors: &mut usize) -> Payload {
    let designation = hamming84_decode(bytes[2]);
    let dc = match designation.value() {
        Some(dc @ (0 | 1)) => dc,
        _ => return Payload::Unknown,
    };
    *errors += designation.residual();

    let initial_page = decode_link(&bytes[3..9], 8, errors);
    let mut status = [0u8; 20];
    decode_parity_text(&bytes[22..], &mut confidence[22..], &mut status);

    Payload::Broadcast(Broadcast {
        designation: dc,
        initial_page,
        status,
    })
}

// --- encode side -----------------------------------------------------------
//
// Used by the line generator and by the squash filter when it synthesizes
// the flushed page back into wire format.

/// Hamming-coded packet address for (magazine, row).
pub fn encode_address(magazine: u8, row: u8) -> [u8; 2] {
    debug_assert!((1..=8).contains(&magazine));
    debug_assert!(row <= 31);
    let address = (magazine & 0x7) | (row << 3);
    [
        hamming84_encode(address & 0x0F),
        hamming84_encode(address >> 4),
    ]
}

/// Build a complete header packet.
pub fn encode_header(
    magazine: u8,
    page: u8,
    subcode: u16,
    control: &PageControl,
    caption: &[u8; 32],
) -> [u8; LINE_BYTES] {
    let mut bytes = [0u8; LINE_BYTES];
    bytes[..2].copy_from_slice(&encode_address(magazine, 0));
    bytes[2] = hamming84_encode(page & 0x0F);
    bytes[3] = hamming84_encode(page >> 4);
    bytes[4] = hamming84_encode((subcode & 0xF) as u8);
    bytes[5] = hamming84_encode(((subcode >> 4) & 0x7) as u8 | ((control.erase as u8) << 3));
    bytes[6] = hamming84_encode(((subcode >> 7) & 0xF) as u8);
    bytes[7] = hamming84_encode(
        ((subcode >> 11) & 0x3) as u8
            | ((control.newsflash as u8) << 2)
            | ((control.subtitle as u8) << 3),
    );
    bytes[8] = hamming84_encode(
        control.suppress_header as u8
            | ((control.update as u8) << 1)
            | ((control.interrupted as u8) << 2)
            | ((control.inhibit_display as u8) << 3),
    );
    bytes[9] =
        hamming84_encode(control.magazine_serial as u8 | ((control.charset & 0x7) << 1));
    for (byte, &ch) in bytes[10..].iter_mut().zip(caption) {
        *byte = odd_parity_encode(ch);
    }
    bytes
}

/// Build a display-row packet from 40 characters of 7-bit text.
pub fn encode_display_row(magazine: u8, row: u8, text: &[u8; 40]) -> [u8; LINE_BYTES] {
    debug_assert!((1..=24).contains(&row));
    let mut bytes = [0u8; LINE_BYTES];
    bytes[..2].copy_from_slice(&encode_address(magazine, row));
    for (byte, &ch) in bytes[2..].iter_mut().zip(text) {
        *byte = odd_parity_encode(ch);
    }
    bytes
}

/// Pad a short string to a 40-character display row.
pub fn padded_row_text(text: &[u8]) -> [u8; 40] {
    let mut row = [b' '; 40];
    for (slot, &ch) in row.iter_mut().zip(text) {
        *slot = ch;
    }
    row
}

/// Pad a short string to a 32-character header caption.
pub fn padded_caption(text: &[u8]) -> [u8; 32] {
    let mut caption = [b' '; 32];
    for (slot, &ch) in caption.iter_mut().zip(text) {
        *slot = ch;
    }
    caption
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_from(bytes: [u8; LINE_BYTES]) -> RawLine {
        RawLine {
            frame_index: 7,
            bytes,
            confidence: [1.0; LINE_BYTES],
        }
    }

    #[test]
    fn test_header_roundtrip() {
        let control = PageControl {
            subtitle: true,
            magazine_serial: true,
            charset: 0b101,
            ..PageControl::default()
        };
        let caption = padded_caption(b"CEEFAX 100 Mon 01 Jan");
        let bytes = encode_header(1, 0x00, 0x3F7F, &control, &caption);
        let packet = Packet::decode(&line_from(bytes));

        assert_eq!(packet.magazine, 1);
        assert_eq!(packet.row, 0);
        assert_eq!(packet.errors, 0);
        match packet.payload {
            Payload::Header(header) => {
                assert_eq!(header.page, 0x00);
                assert_eq!(header.subcode, 0x3F7F);
                assert_eq!(header.control, control);
                assert_eq!(header.caption, caption);
            }
            other => panic!("expected header, got {:?}", other),
        }
    }

    #[test]
    fn test_display_row_roundtrip() {
        let text = padded_row_text(b"HELLO");
        let bytes = encode_display_row(3, 12, &text);
        let packet = Packet::decode(&line_from(bytes));

        assert_eq!(packet.magazine, 3);
        assert_eq!(packet.row, 12);
        match packet.payload {
            Payload::DisplayRow(row) => assert_eq!(row.text, text),
            other => panic!("expected display row, got {:?}", other),
        }
    }

    #[test]
    fn test_magazine_zero_bits_mean_eight() {
        let bytes = encode_display_row(8, 5, &padded_row_text(b"MAG8"));
        let packet = Packet::decode(&line_from(bytes));
        assert_eq!(packet.magazine, 8);
    }

    #[test]
    fn test_corrected_address_counts_residual_error() {
        let mut bytes = encode_display_row(2, 4, &padded_row_text(b"X"));
        bytes[0] ^= 0x10; // single-bit hit on the address
        let packet = Packet::decode(&line_from(bytes));
        assert_eq!(packet.magazine, 2);
        assert_eq!(packet.row, 4);
        assert_eq!(packet.errors, 1);
        assert!(matches!(packet.payload, Payload::DisplayRow(_)));
    }

    #[test]
    fn test_destroyed_address_reclassifies_unknown() {
        let mut bytes = encode_header(1, 0x23, 0, &PageControl::default(), &padded_caption(b""));
        bytes[0] ^= 0x21; // two bits gone: uncorrectable
        let packet = Packet::decode(&line_from(bytes));
        assert!(matches!(packet.payload, Payload::Unknown));
        assert!(!packet.address_ok);
        assert!(packet.errors >= 1);
        assert!(packet.row <= 31);
        assert!((1..=8).contains(&packet.magazine));
    }

    #[test]
    fn test_parity_failure_keeps_byte_zeroes_confidence() {
        let text = padded_row_text(b"PARITY");
        let mut bytes = encode_display_row(1, 1, &text);
        bytes[2] ^= 0x80; // flip the parity bit of the first character
        let packet = Packet::decode(&line_from(bytes));

        match packet.payload {
            Payload::DisplayRow(row) => assert_eq!(row.text[0], b'P'),
            other => panic!("expected display row, got {:?}", other),
        }
        assert_eq!(packet.confidence[2], 0.0);
        assert!(packet.confidence[3] > 0.0);
        // the pre-parity confidence survives for the vote stage
        assert!(packet.signal_confidence[2] > 0.0);
        // parity failures are not Hamming errors
        assert_eq!(packet.errors, 0);
    }

    #[test]
    fn test_erased_header_nibble_uses_sentinel() {
        let mut bytes = encode_header(1, 0x42, 0, &PageControl::default(), &padded_caption(b""));
        bytes[2] ^= 0x21; // page units nibble destroyed
        let packet = Packet::decode(&line_from(bytes));
        match packet.payload {
            Payload::Header(header) => {
                assert_eq!(header.page & 0x0F, ERASED_NIBBLE);
                assert_eq!(header.page >> 4, 0x4);
            }
            other => panic!("expected header, got {:?}", other),
        }
        assert_eq!(packet.errors, 1);
    }

    #[test]
    fn test_fastext_links_decode() {
        // hand-build an X/27/0 packet with one distinctive link
        let mut bytes = [0u8; LINE_BYTES];
        bytes[..2].copy_from_slice(&encode_address(1, 27));
        bytes[2] = hamming84_encode(0);
        for group in 0..6 {
            let start = 3 + group * 6;
            bytes[start] = hamming84_encode(0x1); // units
            bytes[start + 1] = hamming84_encode(0x0); // tens
            bytes[start + 2] = hamming84_encode(0x0); // s1
            bytes[start + 3] = hamming84_encode(0x8); // m1 set
            bytes[start + 4] = hamming84_encode(0x0); // s3
            bytes[start + 5] = hamming84_encode(0x0); // s4, m2/m3 clear
        }
        bytes[39] = hamming84_encode(0xF);
        for byte in bytes[40..].iter_mut() {
            *byte = odd_parity_encode(0);
        }

        let packet = Packet::decode(&line_from(bytes));
        match packet.payload {
            Payload::Fastext(fastext) => {
                // magazine 1 ^ relative 1 = 0 -> displayed magazine 8
                assert_eq!(fastext.links[0].magazine, 8);
                assert_eq!(fastext.links[0].page, 0x01);
                assert_eq!(fastext.link_control, 0xF);
            }
            other => panic!("expected fastext, got {:?}", other),
        }
    }

    #[test]
    fn test_unhandled_designations_pass_through_unknown() {
        // row 27 with designation 4 (navigation variants we do not decode)
        let mut bytes = [0u8; LINE_BYTES];
        bytes[..2].copy_from_slice(&encode_address(1, 27));
        bytes[2] = hamming84_encode(4);
        let packet = Packet::decode(&line_from(bytes));
        assert!(matches!(packet.payload, Payload::Unknown));

        // row 31 is always passed through
        let mut bytes = [0u8; LINE_BYTES];
        bytes[..2].copy_from_slice(&encode_address(1, 31));
        let packet = Packet::decode(&line_from(bytes));
        assert!(matches!(packet.payload, Payload::Unknown));
    }

    #[test]
    fn test_time_filling_header_has_no_page_number() {
        let bytes = encode_header(2, 0xFF, 0, &PageControl::default(), &padded_caption(b""));
        let packet = Packet::decode(&line_from(bytes));
        assert_eq!(packet.page_number(), None);

        let bytes = encode_header(2, 0x34, 0, &PageControl::default(), &padded_caption(b""));
        let packet = Packet::decode(&line_from(bytes));
        let page = packet.page_number().unwrap();
        assert_eq!(page.to_string(), "234");
    }
}
