//! Stream filter: page-predicate pass-through and squash deduplication.
//!
//! Both modes ride on the magazine serial rule: within one magazine
//! exactly one page is open at a time, and a new header on that magazine
//! closes the previous page. Eight small state machines, one per
//! magazine, carry that state.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::LINE_BYTES;
use crate::logging::{SignalLogger, Subsystem};
use crate::packet::{Packet, Payload, TIME_FILLING_PAGE};
use crate::page::{PageVotes, SubpageSet};
use crate::utils::PageNumber;

/// Tunables for squash mode.
#[derive(Debug, Clone, Copy)]
pub struct SquashConfig {
    /// Flush a subpage after this many merged header copies
    pub max_observations: u32,
    /// Flush a subpage after this many frames without traffic
    pub quiet_frames: u64,
}

impl Default for SquashConfig {
    fn default() -> Self {
        Self {
            max_observations: 32,
            quiet_frames: 500,
        }
    }
}

/// Per-magazine serial state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MagazineState {
    /// Awaiting a header
    Idle,
    /// Header seen; rows accumulate into this subpage
    Accumulating { page: PageNumber, subcode: u16 },
}

/// Pass-through filter: emit packets whose magazine's currently-open page
/// matches the target. Headers update the open page before the predicate
/// runs, so the opening header itself is emitted.
#[derive(Debug, Clone)]
pub struct PassThroughFilter {
    target: PageNumber,
    open: [Option<u8>; 8],
}

impl PassThroughFilter {
    pub fn new(target: PageNumber) -> Self {
        Self {
            target,
            open: [None; 8],
        }
    }

    /// Decide whether this packet belongs to the target page.
    pub fn push(&mut self, packet: &Packet) -> bool {
        if !packet.address_ok {
            return false;
        }
        let slot = (packet.magazine - 1) as usize;
        if let Payload::Header(header) = &packet.payload {
            self.open[slot] = if header.page == TIME_FILLING_PAGE {
                None
            } else {
                Some(header.page)
            };
        }
        packet.magazine == self.target.magazine && self.open[slot] == Some(self.target.page)
    }
}

/// Squash filter: one vote-merged copy of every observed subpage.
#[derive(Debug, Clone)]
pub struct SquashFilter {
    config: SquashConfig,
    magazines: [MagazineState; 8],
    pages: BTreeMap<PageNumber, SubpageSet>,
    last_sweep_frame: u64,
    logger: Option<Arc<SignalLogger>>,
}

/// How often the quiet-subpage sweep runs, in frames.
const SWEEP_INTERVAL: u64 = 64;

impl SquashFilter {
    pub fn new(config: SquashConfig) -> Self {
        Self {
            config,
            magazines: [MagazineState::Idle; 8],
            pages: BTreeMap::new(),
            last_sweep_frame: 0,
            logger: None,
        }
    }

    /// Squash filter that reports its flushes under the `FILTER`
    /// subsystem.
    pub fn with_logger(config: SquashConfig, logger: Arc<SignalLogger>) -> Self {
        Self {
            logger: Some(logger),
            ..Self::new(config)
        }
    }

    fn log_flush(&self, votes: &PageVotes, reason: &str) {
        if let Some(logger) = &self.logger {
            let page = PageNumber {
                magazine: votes.magazine,
                page: votes.page,
            };
            logger.info(
                Subsystem::Filter,
                votes.last_seen_frame,
                format!(
                    "flushed page {} subpage {:04X}: {} rows from {} observations ({})",
                    page,
                    votes.subcode,
                    votes.present_rows().count(),
                    votes.observations,
                    reason
                ),
            );
        }
    }

    /// Feed one packet; returns any wire-format packets flushed by this
    /// step (usually none).
    pub fn push(&mut self, packet: &Packet) -> Vec<[u8; LINE_BYTES]> {
        let mut flushed = Vec::new();
        self.sweep_quiet(packet.frame_index, &mut flushed);

        if !packet.address_ok {
            return flushed;
        }
        let slot = (packet.magazine - 1) as usize;

        match &packet.payload {
            Payload::Header(header) => {
                if header.page == TIME_FILLING_PAGE {
                    // time filling carries no page; it only closes the
                    // magazine's open page
                    self.magazines[slot] = MagazineState::Idle;
                    return flushed;
                }
                let page = PageNumber {
                    magazine: packet.magazine,
                    page: header.page,
                };
                let subcode = header.subcode;
                let votes = self
                    .pages
                    .entry(page)
                    .or_default()
                    .get_or_insert(packet.magazine, header.page, subcode, packet.frame_index);
                votes.merge_header(packet);
                let saturated = votes.observations >= self.config.max_observations;
                self.magazines[slot] = MagazineState::Accumulating { page, subcode };

                if saturated {
                    self.flush_subpage(page, subcode, &mut flushed, "saturated");
                }
            }
            Payload::DisplayRow(_)
            | Payload::Enhancement(_)
            | Payload::Fastext(_)
            | Payload::Unknown
                if (1..=31).contains(&packet.row) =>
            {
                // rows belong to whatever page their magazine has open;
                // with no open page they are unattributable noise
                if let MagazineState::Accumulating { page, subcode } = self.magazines[slot] {
                    if let Some(votes) = self
                        .pages
                        .get_mut(&page)
                        .and_then(|subpages| subpages.get_mut(subcode))
                    {
                        votes.merge_row(packet);
                    }
                }
            }
            // broadcast service data is stream-wide rather than page
            // content; squash drops it
            Payload::Broadcast(_) => {}
            _ => {}
        }
        flushed
    }

    /// Stream end or cancellation: flush every live subpage, ordered by
    /// page then subcode for deterministic output.
    pub fn finish(&mut self) -> Vec<[u8; LINE_BYTES]> {
        let mut flushed = Vec::new();
        let mut pages = std::mem::take(&mut self.pages);
        for (_, subpages) in pages.iter_mut() {
            for (_, votes) in subpages.drain() {
                self.log_flush(&votes, "stream end");
                flushed.extend(votes.synthesize());
            }
        }
        self.magazines = [MagazineState::Idle; 8];
        flushed
    }

    fn flush_subpage(
        &mut self,
        page: PageNumber,
        subcode: u16,
        flushed: &mut Vec<[u8; LINE_BYTES]>,
        reason: &'static str,
    ) {
        let votes = match self
            .pages
            .get_mut(&page)
            .and_then(|subpages| subpages.remove(subcode))
        {
            Some(votes) => votes,
            None => return,
        };
        if self.pages.get(&page).map_or(false, |s| s.is_empty()) {
            self.pages.remove(&page);
        }
        self.log_flush(&votes, reason);
        flushed.extend(votes.synthesize());
        for state in self.magazines.iter_mut() {
            if *state == (MagazineState::Accumulating { page, subcode }) {
                *state = MagazineState::Idle;
            }
        }
    }

    fn sweep_quiet(&mut self, frame_index: u64, flushed: &mut Vec<[u8; LINE_BYTES]>) {
        if frame_index < self.last_sweep_frame + SWEEP_INTERVAL {
            return;
        }
        self.last_sweep_frame = frame_index;

        let mut stale = Vec::new();
        for (page, subpages) in self.pages.iter() {
            for (&subcode, votes) in subpages.iter() {
                if frame_index.saturating_sub(votes.last_seen_frame) >= self.config.quiet_frames {
                    stale.push((*page, subcode));
                }
            }
        }
        for (page, subcode) in stale {
            self.flush_subpage(page, subcode, flushed, "quiet");
        }
    }

    /// Live subpage under accumulation, for tests and diagnostics.
    pub fn live_subpage(&self, page: PageNumber, subcode: u16) -> Option<&PageVotes> {
        self.pages
            .get(&page)
            .and_then(|subpages| subpages.iter().find(|(&s, _)| s == subcode).map(|(_, v)| v))
    }
}

/// Run a whole packet stream through the filter in one call: an optional
/// page predicate, then optional squashing. Records read from a `.t42`
/// carry no confidence information, so they vote at full weight.
pub fn filter_packets(
    records: &[[u8; LINE_BYTES]],
    page: Option<PageNumber>,
    squash: Option<SquashConfig>,
    logger: Option<Arc<SignalLogger>>,
) -> Vec<[u8; LINE_BYTES]> {
    let mut pass = page.map(PassThroughFilter::new);
    let mut squasher = squash.map(|config| match &logger {
        Some(logger) => SquashFilter::with_logger(config, logger.clone()),
        None => SquashFilter::new(config),
    });
    let mut out = Vec::new();

    for (index, record) in records.iter().enumerate() {
        let packet = Packet::decode(&crate::deconvolver::RawLine {
            frame_index: index as u64,
            bytes: *record,
            confidence: [1.0; LINE_BYTES],
        });
        if let Some(pass) = pass.as_mut() {
            if !pass.push(&packet) {
                continue;
            }
        }
        match squasher.as_mut() {
            Some(squasher) => out.extend(squasher.push(&packet)),
            None => out.push(*record),
        }
    }
    if let Some(squasher) = squasher.as_mut() {
        out.extend(squasher.finish());
    }
    out
}
