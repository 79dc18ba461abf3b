//! Page accumulation and confidence-weighted byte voting.
//!
//! Each observed (magazine, page, subpage) gets a [`PageVotes`] record; a
//! cell holds 256 accumulated weights, one per candidate byte value. The
//! reported byte is the argmax and the margin between winner and runner-up
//! becomes the cell's confidence. Voting is the one place in the pipeline
//! where confidence may rise.

use std::collections::BTreeMap;

use crate::coding::odd_parity_ok;
use crate::config::LINE_BYTES;
use crate::packet::{encode_address, encode_header, Packet, PageControl, Payload};

/// Weight multiplier for bytes whose parity check failed
pub const PARITY_DISCOUNT: f32 = 0.25;

/// The voted outcome of one cell.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VotedCell {
    pub value: u8,
    /// Winner margin over the runner-up, normalized by total weight
    pub confidence: f32,
}

/// Accumulated weights for a single byte position.
#[derive(Debug, Clone)]
pub struct CellVotes {
    weights: Box<[f32; 256]>,
    /// Per-value observation sequence, for the recency tie-break
    last_seen: Box<[u16; 256]>,
    /// Values that have been seen with valid parity at least once
    parity_seen: [u64; 4],
}

impl CellVotes {
    fn new() -> Self {
        Self {
            weights: Box::new([0.0; 256]),
            last_seen: Box::new([0; 256]),
            parity_seen: [0; 4],
        }
    }

    fn add(&mut self, value: u8, weight: f32, parity_valid: bool, seq: u16) {
        let idx = value as usize;
        self.weights[idx] += weight;
        self.last_seen[idx] = seq;
        if parity_valid {
            self.parity_seen[idx / 64] |= 1 << (idx % 64);
        }
    }

    fn parity_seen(&self, value: u8) -> bool {
        self.parity_seen[value as usize / 64] & (1 << (value as usize % 64)) != 0
    }

    /// Current winner. Equal weights prefer parity-valid candidates, then
    /// the most recently observed value.
    fn tally(&self) -> Option<VotedCell> {
        let total: f32 = self.weights.iter().sum();
        if total <= 0.0 {
            return None;
        }

        let mut best: Option<u8> = None;
        for value in 0..=255u8 {
            let idx = value as usize;
            if self.weights[idx] <= 0.0 {
                continue;
            }
            best = match best {
                None => Some(value),
                Some(current) => {
                    let key = |v: u8| {
                        (
                            self.weights[v as usize],
                            self.parity_seen(v),
                            self.last_seen[v as usize],
                        )
                    };
                    let (cw, cp, cs) = key(current);
                    let (nw, np, ns) = key(value);
                    if (nw, np, ns) > (cw, cp, cs) {
                        Some(value)
                    } else {
                        Some(current)
                    }
                }
            };
        }

        let winner = best?;
        let top = self.weights[winner as usize];
        let runner_up = self
            .weights
            .iter()
            .enumerate()
            .filter(|&(i, _)| i != winner as usize)
            .map(|(_, &w)| w)
            .fold(0.0f32, f32::max);

        Some(VotedCell {
            value: winner,
            confidence: ((top - runner_up) / total).clamp(0.0, 1.0),
        })
    }
}

/// Vote state for one subpage of one page.
#[derive(Debug, Clone)]
pub struct PageVotes {
    pub magazine: u8,
    pub page: u8,
    pub subcode: u16,
    /// Control bits from the most recent merged header
    pub control: PageControl,
    /// Header copies merged so far
    pub observations: u32,
    pub first_seen_frame: u64,
    pub last_seen_frame: u64,
    /// Status-row cells, bytes 10-41 of the header
    caption: Vec<CellVotes>,
    /// Rows 1-31; absent rows stay `None`, distinguishing them from rows
    /// voted all-blank
    rows: Vec<Option<Vec<CellVotes>>>,
    seq: u16,
}

impl PageVotes {
    pub fn new(magazine: u8, page: u8, subcode: u16, frame_index: u64) -> Self {
        Self {
            magazine,
            page,
            subcode,
            control: PageControl::default(),
            observations: 0,
            first_seen_frame: frame_index,
            last_seen_frame: frame_index,
            caption: (0..32).map(|_| CellVotes::new()).collect(),
            rows: vec![None; 32],
            seq: 0,
        }
    }

    fn next_seq(&mut self) -> u16 {
        self.seq = self.seq.saturating_add(1);
        self.seq
    }

    fn vote_weight(packet: &Packet, byte_index: usize) -> (f32, bool) {
        let parity_valid = odd_parity_ok(packet.bytes[byte_index]);
        let confidence = packet.signal_confidence[byte_index];
        let weight = if parity_valid {
            confidence
        } else {
            confidence * PARITY_DISCOUNT
        };
        (weight, parity_valid)
    }

    /// Merge a header packet for this subpage.
    pub fn merge_header(&mut self, packet: &Packet) {
        debug_assert_eq!(packet.row, 0);
        if let Payload::Header(header) = &packet.payload {
            self.control = header.control;
        }
        self.observations += 1;
        self.last_seen_frame = packet.frame_index;
        let seq = self.next_seq();
        for (cell_idx, cell) in self.caption.iter_mut().enumerate() {
            let byte_index = 10 + cell_idx;
            let (weight, parity_valid) = Self::vote_weight(packet, byte_index);
            cell.add(packet.bytes[byte_index], weight, parity_valid, seq);
        }
    }

    /// Merge a row packet (rows 1-31) for this subpage.
    pub fn merge_row(&mut self, packet: &Packet) {
        assert!(
            (1..32).contains(&(packet.row as usize)),
            "row {} out of range at frame {}",
            packet.row,
            packet.frame_index
        );
        self.last_seen_frame = packet.frame_index;
        let seq = self.next_seq();
        let cells = self.rows[packet.row as usize]
            .get_or_insert_with(|| (0..40).map(|_| CellVotes::new()).collect());
        for (cell_idx, cell) in cells.iter_mut().enumerate() {
            let byte_index = 2 + cell_idx;
            let (weight, parity_valid) = Self::vote_weight(packet, byte_index);
            cell.add(packet.bytes[byte_index], weight, parity_valid, seq);
        }
    }

    /// Rows currently present, ascending.
    pub fn present_rows(&self) -> impl Iterator<Item = u8> + '_ {
        self.rows
            .iter()
            .enumerate()
            .filter(|(_, cells)| cells.is_some())
            .map(|(row, _)| row as u8)
    }

    /// Voted bytes and confidences for one present row.
    pub fn voted_row(&self, row: u8) -> Option<([u8; 40], [f32; 40])> {
        let cells = self.rows.get(row as usize)?.as_ref()?;
        let mut bytes = [0x20u8; 40];
        let mut confidence = [0.0f32; 40];
        for (idx, cell) in cells.iter().enumerate() {
            if let Some(voted) = cell.tally() {
                bytes[idx] = voted.value;
                confidence[idx] = voted.confidence;
            }
        }
        Some((bytes, confidence))
    }

    /// Emit the voted subpage as wire-format packets: header first, then
    /// present rows ascending. Address and page-address bytes are
    /// regenerated clean from the slot key.
    pub fn synthesize(&self) -> Vec<[u8; LINE_BYTES]> {
        let mut packets = Vec::with_capacity(1 + self.rows.len());

        let mut header = encode_header(
            self.magazine,
            self.page,
            self.subcode,
            &self.control,
            &[b' '; 32],
        );
        for (cell_idx, cell) in self.caption.iter().enumerate() {
            if let Some(voted) = cell.tally() {
                header[10 + cell_idx] = voted.value;
            }
        }
        packets.push(header);

        for row in self.present_rows().collect::<Vec<_>>() {
            let mut bytes = [0u8; LINE_BYTES];
            bytes[..2].copy_from_slice(&encode_address(self.magazine, row));
            let (voted, _) = self.voted_row(row).expect("present row");
            bytes[2..].copy_from_slice(&voted);
            packets.push(bytes);
        }
        packets
    }
}

/// All observed subpages of one page, keyed by subcode.
#[derive(Debug, Clone, Default)]
pub struct SubpageSet {
    subpages: BTreeMap<u16, PageVotes>,
}

impl SubpageSet {
    pub fn get_or_insert(
        &mut self,
        magazine: u8,
        page: u8,
        subcode: u16,
        frame_index: u64,
    ) -> &mut PageVotes {
        self.subpages
            .entry(subcode)
            .or_insert_with(|| PageVotes::new(magazine, page, subcode, frame_index))
    }

    pub fn get_mut(&mut self, subcode: u16) -> Option<&mut PageVotes> {
        self.subpages.get_mut(&subcode)
    }

    pub fn remove(&mut self, subcode: u16) -> Option<PageVotes> {
        self.subpages.remove(&subcode)
    }

    pub fn is_empty(&self) -> bool {
        self.subpages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u16, &PageVotes)> {
        self.subpages.iter()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (u16, PageVotes)> + '_ {
        std::mem::take(&mut self.subpages).into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deconvolver::RawLine;
    use crate::packet::{encode_display_row, padded_row_text};

    fn row_packet(text: &[u8; 40], confidence: f32) -> Packet {
        let bytes = encode_display_row(1, 1, text);
        Packet::decode(&RawLine {
            frame_index: 0,
            bytes,
            confidence: [confidence; LINE_BYTES],
        })
    }

    #[test]
    fn test_majority_vote_beats_corruption() {
        let mut votes = PageVotes::new(1, 0x00, 0, 0);
        let clean = padded_row_text(b"ABCDEF");
        let mut corrupt = clean;
        corrupt[3] = b'#' | 0x80; // wrong value, parity broken too

        for _ in 0..20 {
            votes.merge_row(&row_packet(&clean, 0.9));
        }
        for _ in 0..5 {
            votes.merge_row(&row_packet(&corrupt, 0.9));
        }

        let (bytes, confidence) = votes.voted_row(1).unwrap();
        assert_eq!(bytes[3], crate::coding::odd_parity_encode(b'D'));
        // 20 of 25 votes: a strong but not total margin
        assert!(confidence[3] > 0.6 && confidence[3] < 1.0);
    }

    #[test]
    fn test_confidence_grows_with_consistent_merges() {
        let mut votes = PageVotes::new(1, 0x00, 0, 0);
        let text = padded_row_text(b"STEADY");

        votes.merge_row(&row_packet(&text, 0.8));
        let (_, first) = votes.voted_row(1).unwrap();

        for _ in 0..7 {
            votes.merge_row(&row_packet(&text, 0.8));
        }
        let (_, merged) = votes.voted_row(1).unwrap();

        for (f, m) in first.iter().zip(&merged) {
            assert!(m >= f, "confidence dropped from {} to {}", f, m);
        }
    }

    #[test]
    fn test_parity_failed_votes_are_discounted() {
        let mut votes = PageVotes::new(1, 0x00, 0, 0);
        let valid = padded_row_text(b"GOOD");
        let mut broken = valid;
        broken[0] ^= 0x80; // same character, parity bit ruined

        // three discounted broken copies against one clean copy
        for _ in 0..3 {
            votes.merge_row(&row_packet(&broken, 0.8));
        }
        votes.merge_row(&row_packet(&valid, 0.8));

        let (bytes, _) = votes.voted_row(1).unwrap();
        // 3 * 0.25 < 1.0: the clean byte wins
        assert_eq!(bytes[0], crate::coding::odd_parity_encode(b'G'));
    }

    #[test]
    fn test_equal_weight_tie_prefers_parity_valid() {
        let mut cell = CellVotes::new();
        cell.add(0x41, 0.5, true, 1);
        cell.add(0x42, 0.5, false, 2);
        let voted = cell.tally().unwrap();
        assert_eq!(voted.value, 0x41);
        assert_eq!(voted.confidence, 0.0);
    }

    #[test]
    fn test_equal_weight_tie_prefers_recent_among_valid() {
        let mut cell = CellVotes::new();
        cell.add(0x41, 0.5, true, 1);
        cell.add(0x42, 0.5, true, 2);
        assert_eq!(cell.tally().unwrap().value, 0x42);
    }

    #[test]
    fn test_absent_rows_are_distinguishable_from_blank() {
        let mut votes = PageVotes::new(1, 0x00, 0, 0);
        let blank = padded_row_text(b"");
        votes.merge_row(&row_packet(&blank, 0.9));

        assert!(votes.voted_row(1).is_some());
        assert!(votes.voted_row(2).is_none());
        assert_eq!(votes.present_rows().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_synthesize_emits_header_then_rows() {
        let mut votes = PageVotes::new(2, 0x34, 0x0001, 10);
        votes.merge_row(&{
            let bytes = encode_display_row(2, 3, &padded_row_text(b"ROW THREE"));
            Packet::decode(&RawLine {
                frame_index: 10,
                bytes,
                confidence: [0.9; LINE_BYTES],
            })
        });

        let packets = votes.synthesize();
        assert_eq!(packets.len(), 2);

        let header = Packet::decode(&RawLine {
            frame_index: 0,
            bytes: packets[0],
            confidence: [1.0; LINE_BYTES],
        });
        assert_eq!(header.magazine, 2);
        assert_eq!(header.row, 0);
        match header.payload {
            Payload::Header(h) => {
                assert_eq!(h.page, 0x34);
                assert_eq!(h.subcode, 0x0001);
            }
            other => panic!("expected header, got {:?}", other),
        }

        let row = Packet::decode(&RawLine {
            frame_index: 0,
            bytes: packets[1],
            confidence: [1.0; LINE_BYTES],
        });
        assert_eq!(row.row, 3);
    }

    #[test]
    fn test_row_out_of_range_aborts_with_frame_index() {
        let mut votes = PageVotes::new(1, 0, 0, 0);
        let mut packet = row_packet(&padded_row_text(b"X"), 0.5);
        packet.row = 32;
        packet.frame_index = 1234;
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            votes.merge_row(&packet);
        }));
        let err = result.unwrap_err();
        let message = err.downcast_ref::<String>().cloned().unwrap_or_default();
        assert!(message.contains("1234"), "diagnostic was {:?}", message);
    }
}
