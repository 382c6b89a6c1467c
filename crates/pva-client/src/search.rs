//! Channel search back-off management.
//!
//! Unresolved channels live in exponential back-off buckets: bucket `k`
//! fires every `(1 << k) × rtt_estimate` milliseconds. A channel that
//! gets no response slides to the next bucket (slowdown); a response
//! updates the round-trip estimate and removes it. Beacon anomalies
//! demote long-period channels back to the anomaly bucket so newly
//! started servers are found quickly.
//!
//! Pure state machine: time is passed in, frames come out as
//! [`SearchBatch`] values for the UDP driver to address and send.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use pva_proto::payloads::discovery::SearchChannel;

/// Floor of the round-trip estimate, milliseconds.
pub const MIN_RTT_MS: f64 = 32.0;

/// Ceiling of the round-trip estimate, milliseconds.
pub const MAX_RTT_MS: f64 = 2.0 * MIN_RTT_MS;

/// Response/attempt ratio treated as congestion-free.
pub const SUCCESS_RATE: f64 = 0.9;

/// Ceiling on UDP frames emitted per bucket round.
pub const MAX_FRAMES_PER_TRY: f64 = 64.0;

/// Channels in buckets at or beyond this period are eligible for the
/// beacon-anomaly boost.
const BEACON_ANOMALY_PERIOD_MS: f64 = 5_000.0;

/// Slowest allowed bucket period.
const MAX_SEARCH_PERIOD_MS: f64 = 60_000.0;

/// Hard cap on the number of buckets.
const MAX_BUCKETS: usize = 18;

/// Delay before a freshly installed channel is first searched, so a
/// burst of registrations batches into one frame.
const INSTALL_DELAY: Duration = Duration::from_millis(10);

/// Payload budget per search frame (fits an un-fragmented UDP datagram).
const FRAME_PAYLOAD_BUDGET: usize = 1400;

/// Fixed search-payload bytes before the channel list.
const FRAME_OVERHEAD: usize = 50;

/// One UDP search frame's worth of channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchBatch {
    /// Sequence id stamped into the frame.
    pub sequence_id: u32,
    /// Channels searched by this frame.
    pub channels: Vec<SearchChannel>,
}

#[derive(Debug)]
struct Searched {
    name: String,
    bucket: usize,
}

#[derive(Debug)]
struct Bucket {
    index: usize,
    allow_boost: bool,
    allow_slowdown: bool,
    request_pending: VecDeque<u32>,
    response_pending: VecDeque<u32>,
    frames_per_try: f64,
    congest_thresh: f64,
    attempts: u32,
    responses: u32,
    start_seq: u32,
    end_seq: u32,
    deadline: Option<Instant>,
    last_period_check: Option<Instant>,
}

impl Bucket {
    fn new(index: usize, allow_boost: bool, allow_slowdown: bool) -> Self {
        Self {
            index,
            allow_boost,
            allow_slowdown,
            request_pending: VecDeque::new(),
            response_pending: VecDeque::new(),
            frames_per_try: 1.0,
            congest_thresh: f64::MAX,
            attempts: 0,
            responses: 0,
            start_seq: 0,
            end_seq: 0,
            deadline: None,
            last_period_check: None,
        }
    }

    fn period(&self, rtt_ms: f64) -> Duration {
        Duration::from_millis(((1u64 << self.index) as f64 * rtt_ms) as u64)
    }

    fn is_idle(&self) -> bool {
        self.request_pending.is_empty() && self.response_pending.is_empty()
    }
}

/// The client-wide search scheduler.
#[derive(Debug)]
pub struct SearchManager {
    buckets: Vec<Bucket>,
    channels: HashMap<u32, Searched>,
    beacon_anomaly_bucket: usize,
    rtt_ms: f64,
    sequence: u32,
    time_at_last_send: Option<Instant>,
}

impl SearchManager {
    /// Build the bucket ladder from the protocol constants.
    pub fn new() -> Self {
        let count = (((MAX_SEARCH_PERIOD_MS / MIN_RTT_MS).log2()) as usize + 1).min(MAX_BUCKETS);
        let anomaly =
            (((BEACON_ANOMALY_PERIOD_MS / MIN_RTT_MS).log2()) as usize + 1).min(count - 1);

        let buckets = (0..count)
            .map(|i| Bucket::new(i, i > anomaly, i != count - 1))
            .collect();

        Self {
            buckets,
            channels: HashMap::new(),
            beacon_anomaly_bucket: anomaly,
            rtt_ms: MIN_RTT_MS,
            sequence: 0,
            time_at_last_send: None,
        }
    }

    /// Number of channels still searching.
    pub fn registered_count(&self) -> usize {
        self.channels.len()
    }

    /// Bucket index a channel currently occupies (tests/diagnostics).
    pub fn bucket_of(&self, cid: u32) -> Option<usize> {
        self.channels.get(&cid).map(|c| c.bucket)
    }

    /// Current round-trip estimate in milliseconds.
    pub fn rtt_estimate_ms(&self) -> f64 {
        self.rtt_ms.clamp(MIN_RTT_MS, MAX_RTT_MS)
    }

    /// Earliest instant any bucket wants a tick; `None` when idle.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.buckets.iter().filter_map(|b| b.deadline).min()
    }

    /// Register a channel for searching. `penalize` starts it at the
    /// beacon-anomaly bucket instead of the fastest one (re-registration
    /// after a disconnect).
    pub fn register(&mut self, cid: u32, name: impl Into<String>, penalize: bool, now: Instant) {
        self.unregister(cid);
        let bucket = if penalize { self.beacon_anomaly_bucket } else { 0 };
        self.channels.insert(cid, Searched { name: name.into(), bucket });
        self.install(cid, bucket, now);
    }

    /// Forget a channel (resolved elsewhere or destroyed).
    pub fn unregister(&mut self, cid: u32) {
        if let Some(entry) = self.channels.remove(&cid) {
            let bucket = &mut self.buckets[entry.bucket];
            bucket.request_pending.retain(|c| *c != cid);
            bucket.response_pending.retain(|c| *c != cid);
        }
    }

    fn install(&mut self, cid: u32, bucket: usize, now: Instant) {
        let b = &mut self.buckets[bucket];
        let start_now = b.is_idle();
        b.request_pending.push_back(cid);
        if let Some(entry) = self.channels.get_mut(&cid) {
            entry.bucket = bucket;
        }
        if start_now || b.deadline.is_none() {
            b.deadline = Some(now + INSTALL_DELAY);
            b.last_period_check.get_or_insert(now);
        }
    }

    /// A search response arrived for `cid`. Returns the channel's name
    /// when it was still being searched (the caller resolves it).
    pub fn on_response(&mut self, cid: u32, sequence_id: u32, now: Instant) -> Option<String> {
        let entry = self.channels.remove(&cid)?;
        let bucket = &mut self.buckets[entry.bucket];
        bucket.request_pending.retain(|c| *c != cid);
        bucket.response_pending.retain(|c| *c != cid);

        let seq_valid = sequence_id == 0
            || (bucket.start_seq <= sequence_id && sequence_id <= bucket.end_seq);
        if seq_valid {
            if let Some(sent) = self.time_at_last_send {
                let measured = (now.saturating_duration_since(sent)).as_secs_f64() * 1e3;
                self.rtt_ms += (measured - self.rtt_ms) / 4.0;
            }
            bucket.responses = bucket.responses.saturating_add(1);
            // everyone answered: rerun the bucket immediately
            if bucket.responses >= bucket.attempts && !bucket.request_pending.is_empty() {
                bucket.deadline = Some(now);
            }
        }
        Some(entry.name)
    }

    /// A new server appeared: demote every channel searching slower than
    /// the anomaly bucket back to it.
    pub fn new_server_detected(&mut self, now: Instant) {
        let anomaly = self.beacon_anomaly_bucket;
        let mut moved = Vec::new();
        for bucket in &mut self.buckets[anomaly + 1..] {
            if bucket.attempts > 0 {
                let n = bucket.response_pending.len().min(bucket.attempts as usize);
                bucket.attempts -= n as u32;
            }
            moved.extend(bucket.request_pending.drain(..));
            moved.extend(bucket.response_pending.drain(..));
        }
        for cid in moved {
            self.install(cid, anomaly, now);
        }
    }

    /// Run every due bucket. Returns the frames to send; the driver
    /// stamps the response address and transmits each batch.
    pub fn tick(&mut self, now: Instant) -> Vec<SearchBatch> {
        let mut out = Vec::new();
        for index in 0..self.buckets.len() {
            if self.buckets[index].deadline.is_some_and(|d| d <= now) {
                self.run_bucket(index, now, &mut out);
            }
        }
        if !out.is_empty() {
            self.time_at_last_send = Some(now);
        }
        out
    }

    fn run_bucket(&mut self, index: usize, now: Instant, out: &mut Vec<SearchBatch>) {
        // Boost: after any success, request-pending channels of a
        // slow bucket re-home to the anomaly bucket.
        let anomaly = self.beacon_anomaly_bucket;
        if self.buckets[index].allow_boost
            && self.buckets[index].responses > 0
            && index > anomaly
        {
            let moved: Vec<u32> = self.buckets[index].request_pending.drain(..).collect();
            for cid in moved {
                self.install(cid, anomaly, now);
            }
        }

        let period = self.buckets[index].period(self.rtt_estimate_ms());
        let period_expired = self.buckets[index]
            .last_period_check
            .is_none_or(|t| now.saturating_duration_since(t) >= period);

        if period_expired {
            self.buckets[index].last_period_check = Some(now);

            // Response timeouts: unanswered channels slow down.
            let timed_out: Vec<u32> =
                self.buckets[index].response_pending.drain(..).collect();
            let slowdown = self.buckets[index].allow_slowdown;
            let next = (index + 1).min(self.buckets.len() - 1);
            for cid in timed_out {
                let target = if slowdown { next } else { index };
                self.install(cid, target, now);
            }

            // TCP-style congestion avoidance on the frame budget.
            let bucket = &mut self.buckets[index];
            if bucket.attempts > 0 {
                if f64::from(bucket.responses) >= f64::from(bucket.attempts) * SUCCESS_RATE {
                    if bucket.frames_per_try < MAX_FRAMES_PER_TRY {
                        if bucket.frames_per_try < bucket.congest_thresh {
                            bucket.frames_per_try =
                                (2.0 * bucket.frames_per_try).min(bucket.congest_thresh);
                        } else {
                            bucket.frames_per_try += 1.0 / bucket.frames_per_try;
                        }
                    }
                } else {
                    bucket.congest_thresh = bucket.frames_per_try / 2.0;
                    bucket.frames_per_try = 1.0;
                }
            }
            bucket.attempts = 0;
            bucket.responses = 0;
        }

        // Emit batched frames for this round.
        let start_seq = self.sequence + 1;
        self.buckets[index].start_seq = start_seq;

        let mut frames_sent = 0usize;
        let mut batch = Vec::new();
        let mut batch_bytes = FRAME_OVERHEAD;
        let max_frames = self.buckets[index].frames_per_try as usize;

        let mut searched: Vec<u32> = Vec::new();
        while let Some(cid) = self.buckets[index].request_pending.pop_front() {
            let Some(entry) = self.channels.get(&cid) else { continue };
            let cost = 4 + 1 + 4 + entry.name.len();
            if batch_bytes + cost > FRAME_PAYLOAD_BUDGET && !batch.is_empty() {
                self.sequence = self.sequence.wrapping_add(1);
                out.push(SearchBatch {
                    sequence_id: self.sequence,
                    channels: std::mem::take(&mut batch),
                });
                batch_bytes = FRAME_OVERHEAD;
                frames_sent += 1;
                if frames_sent >= max_frames {
                    self.buckets[index].request_pending.push_front(cid);
                    break;
                }
            }
            batch.push(SearchChannel { id: cid, name: entry.name.clone() });
            batch_bytes += cost;
            searched.push(cid);
        }
        if !batch.is_empty() {
            self.sequence = self.sequence.wrapping_add(1);
            out.push(SearchBatch { sequence_id: self.sequence, channels: batch });
        }

        let bucket = &mut self.buckets[index];
        bucket.end_seq = self.sequence;
        for cid in searched {
            bucket.response_pending.push_back(cid);
            bucket.attempts = bucket.attempts.saturating_add(1);
        }

        // Reschedule while any work remains.
        bucket.deadline = if bucket.is_idle() {
            None
        } else {
            Some(now + bucket.period(self.rtt_ms.clamp(MIN_RTT_MS, MAX_RTT_MS)))
        };
    }
}

impl Default for SearchManager {
    fn default() -> Self {
        Self::new()
    }
}
