//! Recovery protocol: missing-chunk reporting for a transfer.
//!
//! After the first pass the receiver computes which chunk indices never
//! arrived intact and reports them to the sender. A long list is split into
//! pages of at most [`MAX_INDICES_PER_PAGE`] indices; each page carries its
//! position and the total page count of the round. The sender must hold
//! every page of a round before it resends anything.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Default capacity of one missing-list page.
/// 135 indices of up to ten digits plus JSON overhead stays under one MTU.
pub const MAX_INDICES_PER_PAGE: usize = 135;

/// One page of a missing-chunk report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingPacketData {
    pub missing_chunks: Vec<u32>,
    /// Zero-based page number within the round.
    pub packet_index: u32,
    pub total_packets: u32,
}

/// Split an ordered missing list into pages of at most `per_page` indices.
///
/// An empty list produces no pages. A `per_page` of zero is treated as one.
pub fn paginate(missing: &[u32], per_page: usize) -> Vec<MissingPacketData> {
    let per_page = per_page.max(1);
    let total = missing.len().div_ceil(per_page) as u32;

    missing
        .chunks(per_page)
        .enumerate()
        .map(|(i, page)| MissingPacketData {
            missing_chunks: page.to_vec(),
            packet_index: i as u32,
            total_packets: total,
        })
        .collect()
}

/// Indices in `[0, chunk_count)` not present in `have`, ascending.
pub fn missing_indices<F>(chunk_count: u32, have: F) -> Vec<u32>
where
    F: Fn(u32) -> bool,
{
    (0..chunk_count).filter(|i| !have(*i)).collect()
}

/// Sender-side buffer that collects the pages of one round.
#[derive(Debug, Default)]
pub struct PageAssembler {
    total: u32,
    pages: BTreeMap<u32, Vec<u32>>,
}

impl PageAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a page. Returns the full missing list, ordered by page, once
    /// every page of the round has arrived; the assembler is then empty
    /// and ready for the next round.
    ///
    /// A page announcing a different page total than the one being
    /// collected starts a new round. Duplicate pages overwrite.
    pub fn add(&mut self, page: MissingPacketData) -> Option<Vec<u32>> {
        if page.total_packets == 0 || page.packet_index >= page.total_packets {
            return None;
        }
        if page.total_packets != self.total {
            self.pages.clear();
            self.total = page.total_packets;
        }

        self.pages.insert(page.packet_index, page.missing_chunks);

        if self.pages.len() as u32 == self.total {
            let complete = std::mem::take(&mut self.pages)
                .into_values()
                .flatten()
                .collect();
            self.total = 0;
            Some(complete)
        } else {
            None
        }
    }

    /// Pages held for the round in progress.
    pub fn pending(&self) -> usize {
        self.pages.len()
    }
}
