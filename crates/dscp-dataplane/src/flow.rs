//! Bounded per-flow statistics for the bulk/priority heuristic.
//!
//! Flows are tracked by a 5-tuple hash in a capacity-limited table.
//! Time is quantized into ~1 s check intervals on a coarse monotonic
//! clock (nanoseconds shifted right by 24, so values fit in a u32).
//! Entries idle longer than the flow timeout are treated as absent and
//! reclaimed when the table needs room.

use dashmap::DashMap;
use std::time::Instant;

use crate::maps::{DataplaneConfig, DSCP_UNSET};

/// Capacity of the flow table.
pub const FLOW_TABLE_SIZE: usize = 8192;

/// Coarse clock shift: 1 unit is 2^24 ns, about 16.8 ms.
const COARSE_SHIFT: u32 = 24;

/// One counting window, about 1 s in coarse units.
const CHECK_INTERVAL: u32 = (1_000_000_000u64 >> COARSE_SHIFT) as u32;

/// Idle time after which a flow record is stale, about 30 s.
const FLOW_TIMEOUT: u32 = ((30 * 1_000_000_000u64) >> COARSE_SHIFT) as u32;

/// EWMA fixed-point shift for the packet length average.
const EWMA_SHIFT: u32 = 12;

#[derive(Debug, Clone, Copy)]
struct FlowRecord {
    last_update: u32,
    pkt_len_avg: u32,
    pkt_count: u16,
    /// Current override, [`DSCP_UNSET`] when none.
    dscp: u8,
    /// Remaining check intervals to hold the bulk classification.
    bulk_timeout: u8,
}

impl FlowRecord {
    fn new(now: u32) -> Self {
        FlowRecord {
            last_update: now,
            pkt_len_avg: 0,
            pkt_count: 0,
            dscp: DSCP_UNSET,
            bulk_timeout: 0,
        }
    }
}

/// Bounded, concurrently updatable table of recent-flow statistics.
pub struct FlowTracker {
    flows: DashMap<u32, FlowRecord, ahash::RandomState>,
    epoch: Instant,
    capacity: usize,
}

impl FlowTracker {
    pub fn new() -> Self {
        Self::with_capacity(FLOW_TABLE_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        FlowTracker {
            flows: DashMap::with_hasher(ahash::RandomState::with_seeds(
                0x243f, 0x6a88, 0x85a3, 0x08d3,
            )),
            epoch: Instant::now(),
            capacity,
        }
    }

    fn now_coarse(&self) -> u32 {
        (self.epoch.elapsed().as_nanos() as u64 >> COARSE_SHIFT) as u32
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Runs the bulk/priority heuristic for one packet of the flow and
    /// returns the DSCP override to use, or [`DSCP_UNSET`] when the
    /// flow stays on its default treatment.
    ///
    /// Only called for packets whose resolved DSCP still carries the
    /// default flag; the caller also checks that at least one of the
    /// heuristic knobs is configured.
    pub fn update(&self, hash: u32, pkt_len: u32, config: &DataplaneConfig) -> u8 {
        self.update_at(hash, pkt_len, config, self.now_coarse())
    }

    /// Clock-injected variant backing [`FlowTracker::update`].
    pub(crate) fn update_at(
        &self,
        hash: u32,
        pkt_len: u32,
        config: &DataplaneConfig,
        now: u32,
    ) -> u8 {
        if !self.flows.contains_key(&hash) && self.flows.len() >= self.capacity {
            self.evict(now);
        }

        let mut entry = self.flows.entry(hash).or_insert_with(|| FlowRecord::new(now));
        let flow = entry.value_mut();

        let age = now.wrapping_sub(flow.last_update);
        if age > FLOW_TIMEOUT {
            *flow = FlowRecord::new(now);
        } else if age >= CHECK_INTERVAL {
            // Interval rollover: run down the bulk hold, open a new
            // counting window.
            if flow.bulk_timeout > 0 {
                flow.bulk_timeout -= 1;
                if flow.bulk_timeout == 0 {
                    flow.dscp = DSCP_UNSET;
                }
            }
            flow.pkt_count = 0;
            flow.last_update = now;
        }

        flow.pkt_count = flow.pkt_count.saturating_add(1);
        if config.bulk_trigger_pps != 0 && u32::from(flow.pkt_count) > config.bulk_trigger_pps {
            flow.dscp = config.dscp_bulk;
            flow.bulk_timeout = config.bulk_trigger_timeout.min(u8::MAX as u32) as u8;
            flow.pkt_count = 0;
            flow.pkt_len_avg = 0;
        }

        let bulk_active = flow.dscp != DSCP_UNSET && flow.dscp == config.dscp_bulk;
        if config.prio_max_avg_pkt_len != 0 && !bulk_active {
            flow.pkt_len_avg = ewma(flow.pkt_len_avg, pkt_len);
            if flow.pkt_len_avg >> EWMA_SHIFT <= config.prio_max_avg_pkt_len {
                flow.dscp = config.dscp_prio;
            } else {
                flow.dscp = DSCP_UNSET;
            }
        }

        flow.dscp
    }

    /// Makes room in the table: drop stale records first, then the
    /// least recently updated one. Bounded by the table capacity.
    fn evict(&self, now: u32) {
        let before = self.flows.len();
        self.flows
            .retain(|_, f| now.wrapping_sub(f.last_update) <= FLOW_TIMEOUT);
        if self.flows.len() < before {
            return;
        }

        let oldest = self
            .flows
            .iter()
            .max_by_key(|r| now.wrapping_sub(r.value().last_update))
            .map(|r| *r.key());
        if let Some(key) = oldest {
            self.flows.remove(&key);
        }
    }
}

impl Default for FlowTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Fixed-point EWMA with weight 1/4 for the new sample.
fn ewma(avg: u32, len: u32) -> u32 {
    if avg == 0 {
        return len << EWMA_SHIFT;
    }
    avg - (avg >> 2) + ((len << EWMA_SHIFT) >> 2)
}
