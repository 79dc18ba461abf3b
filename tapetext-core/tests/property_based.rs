//! Property tests for the protection codes and the stream invariants the
//! pipeline guarantees.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use proptest::prelude::*;

use tapetext_core::coding::{hamming84_decode, hamming84_encode, Hamming84};
use tapetext_core::config::{ProfileRegistry, LINE_BYTES};
use tapetext_core::deconvolver::RawLine;
use tapetext_core::filter::{filter_packets, SquashConfig};
use tapetext_core::generate::LineGenerator;
use tapetext_core::logging::SignalLogger;
use tapetext_core::packet::{
    encode_display_row, encode_header, padded_caption, padded_row_text, Packet, PageControl,
    Payload,
};
use tapetext_core::pipeline::{run_deconvolve, PipelineOptions};

proptest! {
    /// Any single-bit hit on any codeword is corrected and counted as
    /// exactly one residual error.
    #[test]
    fn prop_hamming_corrects_every_single_bit_error(nibble in 0u8..16, bit in 0u32..8) {
        let code = hamming84_encode(nibble);
        let damaged = code ^ (1 << bit);
        let decoded = hamming84_decode(damaged);
        prop_assert_eq!(decoded, Hamming84::Corrected(nibble));
        prop_assert_eq!(decoded.residual(), 1);
    }

    /// Any double-bit hit is detected as uncorrectable, never silently
    /// miscorrected.
    #[test]
    fn prop_hamming_detects_every_double_bit_error(
        nibble in 0u8..16,
        a in 0u32..8,
        b in 0u32..8,
    ) {
        prop_assume!(a != b);
        let damaged = hamming84_encode(nibble) ^ (1 << a) ^ (1 << b);
        prop_assert_eq!(hamming84_decode(damaged), Hamming84::Invalid);
    }

    /// Inverting the parity bit of any display cell keeps the 7-bit value
    /// and zeroes that cell's confidence.
    #[test]
    fn prop_parity_flip_keeps_value_zeroes_confidence(
        cell in 0usize..40,
        text in proptest::collection::vec(0x20u8..0x7F, 40),
    ) {
        let mut row_text = [0u8; 40];
        row_text.copy_from_slice(&text);
        let mut bytes = encode_display_row(1, 1, &row_text);
        bytes[2 + cell] ^= 0x80;

        let packet = Packet::decode(&RawLine {
            frame_index: 0,
            bytes,
            confidence: [1.0; LINE_BYTES],
        });
        match packet.payload {
            Payload::DisplayRow(display) => {
                prop_assert_eq!(display.text[cell], text[cell] & 0x7F);
            }
            other => prop_assert!(false, "expected display row, got {:?}", other),
        }
        prop_assert_eq!(packet.confidence[2 + cell], 0.0);
        prop_assert_eq!(packet.errors, 0);
    }

    /// Filter output is a whole number of records for arbitrary inputs
    /// and modes.
    #[test]
    fn prop_filter_output_is_record_aligned(
        records in proptest::collection::vec(
            proptest::array::uniform32(any::<u8>()), 0..20
        ),
        squash in any::<bool>(),
    ) {
        // widen the random 32-byte seeds into records
        let records: Vec<[u8; LINE_BYTES]> = records
            .into_iter()
            .map(|seed| {
                let mut record = [0u8; LINE_BYTES];
                record[..32].copy_from_slice(&seed);
                record
            })
            .collect();
        let squash = squash.then(SquashConfig::default);
        let out = filter_packets(&records, None, squash, None);
        let total: usize = out.iter().map(|r| r.len()).sum();
        prop_assert_eq!(total % LINE_BYTES, 0);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    /// Whatever mix of present and absent lines the tape carries, emitted
    /// packets are strictly increasing in source frame index.
    #[test]
    fn prop_pipeline_preserves_frame_order(present in proptest::collection::vec(any::<bool>(), 1..24)) {
        let config = ProfileRegistry::builtin().get("ideal").unwrap();
        let generator = LineGenerator::new(config.clone());
        let payload = encode_display_row(1, 1, &padded_row_text(b"ORDERING"));

        let mut input = Vec::new();
        for &has_line in &present {
            if has_line {
                input.extend_from_slice(&generator.render_line(&payload));
            } else {
                input.extend_from_slice(&generator.blank_line());
            }
        }

        let mut output = Vec::new();
        let mut indices = Vec::new();
        run_deconvolve(
            &input[..],
            &mut output,
            config,
            &PipelineOptions { workers: 4, ..PipelineOptions::default() },
            Arc::new(AtomicBool::new(false)),
            &SignalLogger::default(),
            |packet| indices.push(packet.frame_index),
        )
        .unwrap();

        prop_assert_eq!(output.len() % LINE_BYTES, 0);
        prop_assert!(indices.windows(2).all(|w| w[0] < w[1]));
        let expected: Vec<u64> = present
            .iter()
            .enumerate()
            .filter(|(_, &p)| p)
            .map(|(i, _)| i as u64)
            .collect();
        prop_assert_eq!(indices, expected);
    }

    /// Squash is idempotent over streams where every subpage is fully
    /// observed before stream end.
    #[test]
    fn prop_squash_idempotent(
        pages in proptest::collection::vec((1u8..=8, 0u8..=0xFE, 1u8..=6), 1..4),
        repeats in 2usize..5,
    ) {
        let mut records = Vec::new();
        for _ in 0..repeats {
            for &(magazine, page, rows) in &pages {
                records.push(encode_header(
                    magazine,
                    page,
                    0,
                    &PageControl::default(),
                    &padded_caption(b"PROP"),
                ));
                for row in 1..=rows {
                    records.push(encode_display_row(
                        magazine,
                        row,
                        &padded_row_text(format!("ROW {}", row).as_bytes()),
                    ));
                }
            }
        }

        let once = filter_packets(&records, None, Some(SquashConfig::default()), None);
        let twice = filter_packets(&once, None, Some(SquashConfig::default()), None);
        prop_assert_eq!(once, twice);
    }
}
