//! Bounded subscription queue with overrun coalescing and optional
//! flow-controlled (pipeline) operation.
//!
//! The FIFO owns a pool of `actual_count + 1` elements; the extra element
//! guarantees that `|empty| ≥ 1 ∨ |in_use| ≥ 1` always holds, so a
//! producer can always either enqueue or squash. When no free element is
//! available, [`MonitorFifo::post`] coalesces into the newest queued
//! element: offsets changed in both updates are recorded in the overrun
//! mask, never dropped silently.
//!
//! This type performs no I/O and holds no lock; the owner serializes
//! access and dispatches the pending notifications returned by
//! [`MonitorFifo::take_notifications`] with no lock held.

use std::collections::VecDeque;
use std::sync::Arc;

use pva_proto::{BitSet, Mapper, PvRequest, PvStructure, Status, StructDesc};
use thiserror::Error;

/// Misuse of the FIFO lifecycle.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FifoError {
    /// An operation was invoked in a state that forbids it.
    #[error("invalid monitor state: {0}")]
    InvalidState(&'static str),
}

/// Pool sizing and filtering knobs.
#[derive(Debug, Clone)]
pub struct FifoConfig {
    /// Hard upper bound on the queue depth.
    pub max_count: usize,
    /// Depth used when the request does not ask for one.
    pub default_count: usize,
    /// Drop posts whose change mask misses the requested mask.
    pub drop_empty_updates: bool,
}

impl Default for FifoConfig {
    fn default() -> Self {
        Self { max_count: 4, default_count: 4, drop_empty_updates: true }
    }
}

/// One queued update.
#[derive(Debug, Clone)]
pub struct MonitorElement {
    /// The projected structure.
    pub value: PvStructure,
    /// Offsets present in `value`.
    pub changed: BitSet,
    /// Offsets whose intermediate values were coalesced away.
    pub overrun: BitSet,
}

impl MonitorElement {
    fn fresh(value: PvStructure) -> Self {
        Self { value, changed: BitSet::new(), overrun: BitSet::new() }
    }
}

/// Lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FifoState {
    /// Not open; posts are ignored.
    Closed,
    /// Open and accepting posts.
    Opened,
    /// The type/request projection failed; behaves as permanently full.
    Error,
}

/// Pending notifications collected by [`MonitorFifo::take_notifications`].
///
/// Dispatch order is fixed: connect, then event, then unlisten, then
/// closed.
#[derive(Debug, Default, Clone)]
pub struct FifoNotifications {
    /// Deliver `monitorConnect(status, type)`.
    pub connected: Option<(Status, Option<Arc<StructDesc>>)>,
    /// The queue went empty → non-empty (coalesced).
    pub event: bool,
    /// Graceful end-of-stream reached.
    pub unlisten: bool,
    /// The monitor was closed; deliver `channelDisconnect`.
    pub closed: bool,
}

impl FifoNotifications {
    /// True when nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.connected.is_none() && !self.event && !self.unlisten && !self.closed
    }
}

/// Queue statistics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FifoStats {
    /// Elements ready for the producer.
    pub nempty: usize,
    /// Elements queued for the consumer.
    pub nfilled: usize,
    /// Elements held by the consumer.
    pub noutstanding: usize,
}

/// The monitor FIFO.
#[derive(Debug)]
pub struct MonitorFifo {
    request: PvRequest,
    actual_count: usize,
    pipeline: bool,
    drop_empty_updates: bool,

    state: FifoState,
    error: Status,
    mapper: Option<Mapper>,
    running: bool,
    finished: bool,

    need_connected: bool,
    need_event: bool,
    need_unlisten: bool,
    need_closed: bool,

    free_high_level: usize,
    flow_count: i32,

    empty: VecDeque<MonitorElement>,
    in_use: VecDeque<MonitorElement>,
    returned: VecDeque<MonitorElement>,

    scratch: BitSet,
    oscratch: BitSet,
}

impl MonitorFifo {
    /// Build a FIFO for a parsed pvRequest.
    ///
    /// `actual_count = clamp(request queueSize or default, 1, max)`;
    /// pipeline mode comes from the request's `pipeline` option.
    pub fn new(request: PvRequest, config: &FifoConfig) -> Self {
        let max_count = config.max_count.max(1);
        let default_count = config.default_count.max(1);
        let mut actual_count = match request.record.queue_size {
            Some(0) | None => default_count,
            Some(n) => n as usize,
        };
        actual_count = actual_count.min(max_count).max(1);
        let pipeline = request.record.pipeline.unwrap_or(false);

        let mut fifo = Self {
            request,
            actual_count,
            pipeline,
            drop_empty_updates: config.drop_empty_updates,
            state: FifoState::Closed,
            error: Status::ok(),
            mapper: None,
            running: false,
            finished: false,
            need_connected: false,
            need_event: false,
            need_unlisten: false,
            need_closed: false,
            free_high_level: 0,
            flow_count: 0,
            empty: VecDeque::new(),
            in_use: VecDeque::new(),
            returned: VecDeque::new(),
            scratch: BitSet::new(),
            oscratch: BitSet::new(),
        };
        fifo.set_free_high_mark(0.0);
        fifo
    }

    /// Negotiated queue depth.
    pub fn actual_count(&self) -> usize {
        self.actual_count
    }

    /// Whether this FIFO runs with flow credit.
    pub fn pipeline(&self) -> bool {
        self.pipeline
    }

    /// Current lifecycle state.
    pub fn state(&self) -> &FifoState {
        &self.state
    }

    /// The projected descriptor once open.
    pub fn requested(&self) -> Option<&Arc<StructDesc>> {
        self.mapper.as_ref().map(Mapper::requested)
    }

    /// Set the free-watermark level in `[0, 1]`; crossing it from below
    /// on a release/ack produces an upcall signal.
    pub fn set_free_high_mark(&mut self, level: f64) {
        let level = level.clamp(0.0, 1.0);
        let elems = ((self.actual_count as f64) * level) as usize;
        self.free_high_level = elems.min(self.actual_count - 1);
    }

    /// Open against the source type: computes the projection and fills
    /// the pool. A projection failure parks the FIFO in
    /// [`FifoState::Error`]; the failure status is delivered through the
    /// pending connect notification.
    ///
    /// Returns mapper warnings (missing fields etc.) for the owner to
    /// forward.
    pub fn open(&mut self, source: &Arc<StructDesc>) -> Result<Vec<String>, FifoError> {
        if self.state != FifoState::Closed {
            return Err(FifoError::InvalidState("open() requires a closed monitor"));
        }
        if self.need_closed {
            return Err(FifoError::InvalidState("notify() required between close() and open()"));
        }
        if self.finished {
            return Err(FifoError::InvalidState("finished monitors cannot re-open"));
        }

        // Never reuse elements across a re-open, even without a type
        // change.
        self.empty.clear();
        self.in_use.clear();
        self.returned.clear();

        let mut warnings = Vec::new();
        match Mapper::compute(source, &self.request) {
            Ok(mapper) => {
                warnings.extend_from_slice(mapper.warnings());
                for _ in 0..self.actual_count + 1 {
                    self.empty.push_back(MonitorElement::fresh(mapper.build_requested()));
                }
                self.mapper = Some(mapper);
                self.state = FifoState::Opened;
                self.error = Status::ok();
                debug_assert!(self.in_use.is_empty());
                debug_assert!(self.empty.len() >= 2);
            }
            Err(e) => {
                self.error = Status::error(e.to_string());
                self.state = FifoState::Error;
            }
        }
        self.need_connected = true;
        Ok(warnings)
    }

    /// Close; a pending `closed` notification is queued if the FIFO was
    /// open.
    pub fn close(&mut self) {
        self.need_closed = self.state == FifoState::Opened;
        self.state = FifoState::Closed;
    }

    /// Mark end-of-stream. Once the queue drains, the unlisten
    /// notification fires exactly once.
    pub fn finish(&mut self) -> Result<(), FifoError> {
        if self.state == FifoState::Closed {
            return Err(FifoError::InvalidState("cannot finish() a closed monitor"));
        }
        if self.finished {
            return Ok(());
        }
        self.finished = true;
        if self.in_use.is_empty() && self.running && self.state == FifoState::Opened {
            self.need_unlisten = true;
        }
        Ok(())
    }

    /// Begin delivery; queues an event if updates are already waiting.
    pub fn start(&mut self) -> Result<(), FifoError> {
        if self.state == FifoState::Closed {
            return Err(FifoError::InvalidState("cannot start() before open()"));
        }
        if self.running || self.state != FifoState::Opened {
            return Ok(());
        }
        if !self.in_use.is_empty() {
            self.need_event = true;
        }
        self.running = true;
        Ok(())
    }

    /// Pause delivery.
    pub fn stop(&mut self) {
        self.running = false;
    }

    /// Elements the producer may post right now. In pipeline mode this is
    /// additionally limited by the peer's flow credit; it never exceeds
    /// the negotiated depth.
    pub fn free_count(&self) -> usize {
        let raw = if self.pipeline {
            let flow = self.flow_count.max(0) as usize;
            flow.min(self.empty.len())
        } else if self.empty.is_empty() {
            0
        } else {
            self.empty.len() - 1
        };
        raw.min(self.actual_count)
    }

    fn drops_update(&self, changed: &BitSet) -> bool {
        match &self.mapper {
            Some(mapper) => {
                self.drop_empty_updates && !changed.intersects(mapper.requested_mask())
            }
            None => true,
        }
    }

    fn fill_element(&mut self, mut elem: MonitorElement, value: &PvStructure, changed: &BitSet,
                    overrun: &BitSet) {
        let Some(mapper) = &self.mapper else { return };
        elem.changed.clear_all();
        mapper.copy_to_requested(value, changed, &mut elem.value, &mut elem.changed);
        elem.overrun.clear_all();
        mapper.mask_to_requested(overrun, &mut elem.overrun);

        if self.in_use.is_empty() && self.running {
            self.need_event = true;
        }
        self.in_use.push_back(elem);
        if self.pipeline {
            self.flow_count -= 1;
        }
    }

    /// Post an update. With a free element available the update is
    /// queued; otherwise it coalesces into the newest queued element.
    pub fn post(&mut self, value: &PvStructure, changed: &BitSet, overrun: &BitSet) {
        if self.state != FifoState::Opened || self.finished {
            return;
        }
        debug_assert!(!self.empty.is_empty() || !self.in_use.is_empty());

        if self.drops_update(changed) {
            return;
        }

        let use_empty = self.free_count() > 0
            || (self.in_use.is_empty() && !self.empty.is_empty());

        if use_empty {
            if let Some(elem) = self.empty.pop_front() {
                self.fill_element(elem, value, changed, overrun);
            }
            return;
        }

        // Overflow: squash into the newest element. Offsets changed by
        // both updates are data loss, recorded in the overrun mask.
        let Some(mapper) = self.mapper.take() else { return };
        if let Some(elem) = self.in_use.back_mut() {
            self.scratch.clear_all();
            mapper.copy_to_requested(value, changed, &mut elem.value, &mut self.scratch);

            elem.overrun.or_and(&elem.changed, &self.scratch);
            elem.changed.union_with(&self.scratch);

            self.oscratch.clear_all();
            mapper.mask_to_requested(overrun, &mut self.oscratch);
            elem.overrun.or_and(&self.oscratch, &self.scratch);
        }
        self.mapper = Some(mapper);
    }

    /// Post without squashing: refuses when no free element exists
    /// (unless `force` allocates past the pool). Returns whether free
    /// capacity remains afterwards.
    pub fn try_post(&mut self, value: &PvStructure, changed: &BitSet, overrun: &BitSet,
                    force: bool) -> bool {
        if self.state != FifoState::Opened || self.finished {
            return false; // an errored monitor acts permanently full
        }
        debug_assert!(!self.empty.is_empty() || !self.in_use.is_empty());

        if self.drops_update(changed) {
            return self.free_count() > 0;
        }

        if self.free_count() > 0 {
            if let Some(elem) = self.empty.pop_front() {
                self.fill_element(elem, value, changed, overrun);
            }
        } else if force {
            if let Some(mapper) = &self.mapper {
                let elem = MonitorElement::fresh(mapper.build_requested());
                self.fill_element(elem, value, changed, overrun);
            }
        }

        self.free_count() > 0
    }

    /// [`Self::poll`] for a network sender: in pipeline mode the newest
    /// element stays queued as a coalescing target while the peer's
    /// credit is exhausted, so later posts squash instead of vanishing.
    pub fn poll_for_send(&mut self) -> Option<MonitorElement> {
        if self.pipeline && self.in_use.len() == 1 && self.free_count() == 0 {
            return None;
        }
        self.poll()
    }

    /// Take the oldest queued element, or `None` while the spare
    /// invariant forbids it. Draining the queue after [`Self::finish`]
    /// arms the unlisten notification.
    pub fn poll(&mut self) -> Option<MonitorElement> {
        if self.in_use.is_empty() || self.in_use.len() + self.empty.len() <= 1 {
            return None;
        }
        let elem = self.in_use.pop_front();
        if self.in_use.is_empty() && self.finished {
            self.need_unlisten = true;
        }
        debug_assert!(!self.in_use.is_empty() || !self.empty.is_empty());
        elem
    }

    /// Return a polled element to the pool.
    ///
    /// Elements of a stale type (from before a re-open) and force'd
    /// extras beyond the pool size are dropped. In pipeline mode the
    /// element parks in the `returned` queue until the peer acknowledges.
    /// Returns `Some(free_count)` when the free count crossed the
    /// watermark from below, which the owner forwards to its producer.
    pub fn release(&mut self, elem: MonitorElement) -> Option<usize> {
        let current_type = match (&self.in_use.front(), &self.empty.back(), &self.mapper) {
            (Some(e), _, _) => Some(e.value.desc().clone()),
            (None, Some(e), _) => Some(e.value.desc().clone()),
            (None, None, Some(m)) => Some(m.requested().clone()),
            _ => None,
        };
        let stale = current_type.is_none_or(|t| t.as_ref() != elem.value.desc().as_ref());
        if stale || self.empty.len() + self.returned.len() >= self.actual_count + 1 {
            return None;
        }

        if self.pipeline {
            // credited back during report_remote_queue_status()
            self.returned.push_back(elem);
            return None;
        }

        let below = self.free_count() <= self.free_high_level;
        self.empty.push_front(elem);
        let above = self.free_count() > self.free_high_level;

        (below && above).then(|| self.free_count())
    }

    /// Apply a pipeline acknowledgment: the peer freed `nfree` elements.
    /// Returns `Some(free_count)` on a below→above watermark crossing.
    pub fn report_remote_queue_status(&mut self, nfree: i32) -> Option<usize> {
        if nfree <= 0 || !self.pipeline {
            return None;
        }

        let below = self.free_count() <= self.free_high_level;

        let nack = (nfree as usize).min(self.returned.len());
        self.flow_count = self.flow_count.saturating_add(nfree);
        for _ in 0..nack {
            if let Some(elem) = self.returned.pop_front() {
                self.empty.push_back(elem);
            }
        }

        let above = self.free_count() > self.free_high_level;
        (below && above && self.empty.len() > 1).then(|| self.free_count())
    }

    /// Collect and clear pending notifications. The owner dispatches them
    /// in struct order with no lock held.
    pub fn take_notifications(&mut self) -> FifoNotifications {
        let mut out = FifoNotifications::default();
        if std::mem::take(&mut self.need_connected) {
            let error = std::mem::take(&mut self.error);
            let desc = if error.is_success() { self.requested().cloned() } else { None };
            out.connected = Some((error, desc));
        }
        out.event = std::mem::take(&mut self.need_event);
        out.unlisten = std::mem::take(&mut self.need_unlisten);
        out.closed = std::mem::take(&mut self.need_closed);
        out
    }

    /// Queue statistics.
    pub fn stats(&self) -> FifoStats {
        let nempty = self.empty.len() + self.returned.len();
        let nfilled = self.in_use.len();
        FifoStats {
            nempty,
            nfilled,
            noutstanding: (self.actual_count + 1).saturating_sub(nempty + nfilled),
        }
    }
}

#[cfg(test)]
mod tests {
    use pva_proto::{FieldDesc, PvValue, ScalarKind, StructDesc};

    use super::*;

    fn source() -> Arc<StructDesc> {
        StructDesc::builder("counter_t")
            .field("value", FieldDesc::scalar(ScalarKind::I32))
            .build()
        // offsets: 0 self, 1 value
    }

    fn post_value(fifo: &mut MonitorFifo, src: &Arc<StructDesc>, v: i32) {
        let mut s = PvStructure::new(src.clone());
        s.set("value", v.into()).unwrap();
        fifo.post(&s, &BitSet::from_bits([1]), &BitSet::new());
    }

    fn open_fifo(request: &str, config: &FifoConfig) -> (MonitorFifo, Arc<StructDesc>) {
        let src = source();
        let mut fifo = MonitorFifo::new(PvRequest::parse(request).unwrap(), config);
        fifo.open(&src).unwrap();
        fifo.start().unwrap();
        let _ = fifo.take_notifications();
        (fifo, src)
    }

    #[test]
    fn queue_size_clamps_to_bounds() {
        let config = FifoConfig { max_count: 8, default_count: 3, ..Default::default() };
        let fifo = MonitorFifo::new(PvRequest::parse("field(value)").unwrap(), &config);
        assert_eq!(fifo.actual_count(), 3);

        let fifo = MonitorFifo::new(
            PvRequest::parse("record[queueSize=100]field(value)").unwrap(),
            &config,
        );
        assert_eq!(fifo.actual_count(), 8);

        let fifo = MonitorFifo::new(
            PvRequest::parse("record[queueSize=5]field(value)").unwrap(),
            &config,
        );
        assert_eq!(fifo.actual_count(), 5);
    }

    #[test]
    fn connect_notification_carries_type() {
        let (mut fifo, _src) = {
            let src = source();
            let mut fifo = MonitorFifo::new(PvRequest::all(), &FifoConfig::default());
            fifo.open(&src).unwrap();
            (fifo, src)
        };
        let notes = fifo.take_notifications();
        let (status, desc) = notes.connected.unwrap();
        assert!(status.is_success());
        assert!(desc.is_some());
        assert!(!notes.event && !notes.unlisten && !notes.closed);
    }

    /// Spec scenario: actual_count = 2, posts 1..4, expect exactly
    /// `{1}` then the coalesced `{4, overrun {1}}`.
    #[test]
    fn overflow_coalesces_into_tail() {
        let config = FifoConfig { max_count: 2, default_count: 2, drop_empty_updates: false };
        let (mut fifo, src) = open_fifo("field(value)", &config);

        for v in 1..=4 {
            post_value(&mut fifo, &src, v);
        }

        let first = fifo.poll().unwrap();
        assert_eq!(first.value.get("value").and_then(PvValue::as_i32), Some(1));
        assert_eq!(first.changed, BitSet::from_bits([1]));
        assert!(first.overrun.is_empty());

        let second = fifo.poll().unwrap();
        assert_eq!(second.value.get("value").and_then(PvValue::as_i32), Some(4));
        assert_eq!(second.changed, BitSet::from_bits([1]));
        assert_eq!(second.overrun, BitSet::from_bits([1]));

        assert!(fifo.poll().is_none());
    }

    #[test]
    fn event_fires_once_per_empty_to_nonempty() {
        let (mut fifo, src) = open_fifo("field(value)", &FifoConfig::default());

        post_value(&mut fifo, &src, 1);
        post_value(&mut fifo, &src, 2);
        let notes = fifo.take_notifications();
        assert!(notes.event); // coalesced: one event for two posts

        assert!(!fifo.take_notifications().event);

        // drain, then a new post raises a new event
        while fifo.poll().is_some() {}
        post_value(&mut fifo, &src, 3);
        assert!(fifo.take_notifications().event);
    }

    #[test]
    fn drop_empty_updates_filters_unrequested_changes() {
        let src = StructDesc::builder("pair_t")
            .field("value", FieldDesc::scalar(ScalarKind::I32))
            .field("other", FieldDesc::scalar(ScalarKind::I32))
            .build();
        // request selects only `value` (source offset 1); `other` is 2
        let mut fifo = MonitorFifo::new(
            PvRequest::parse("field(value)").unwrap(),
            &FifoConfig::default(),
        );
        fifo.open(&src).unwrap();
        fifo.start().unwrap();
        let _ = fifo.take_notifications();

        let s = PvStructure::new(src);
        fifo.post(&s, &BitSet::from_bits([2]), &BitSet::new());
        assert!(fifo.poll().is_none());

        fifo.post(&s, &BitSet::from_bits([1]), &BitSet::new());
        assert!(fifo.poll().is_some());
    }

    #[test]
    fn finish_then_drain_unlistens_exactly_once() {
        let (mut fifo, src) = open_fifo("field(value)", &FifoConfig::default());

        post_value(&mut fifo, &src, 1);
        fifo.finish().unwrap();
        assert!(!fifo.take_notifications().unlisten); // not drained yet

        let elem = fifo.poll().unwrap();
        let notes = fifo.take_notifications();
        assert!(notes.unlisten);

        // releasing and polling again never re-arms it
        let _ = fifo.release(elem);
        assert!(fifo.poll().is_none());
        assert!(!fifo.take_notifications().unlisten);
    }

    #[test]
    fn post_after_finish_is_ignored() {
        let (mut fifo, src) = open_fifo("field(value)", &FifoConfig::default());
        fifo.finish().unwrap();
        post_value(&mut fifo, &src, 1);
        assert!(fifo.poll().is_none());
    }

    #[test]
    fn release_returns_capacity_and_signals_watermark() {
        let config = FifoConfig { max_count: 2, default_count: 2, drop_empty_updates: false };
        let (mut fifo, src) = open_fifo("field(value)", &config);

        post_value(&mut fifo, &src, 1);
        post_value(&mut fifo, &src, 2);
        assert_eq!(fifo.free_count(), 0);

        let elem = fifo.poll().unwrap();
        // free was 0 (≤ level 0), rises to 1 → watermark crossing
        assert_eq!(fifo.release(elem), Some(1));
        assert_eq!(fifo.free_count(), 1);
    }

    #[test]
    fn stale_elements_are_dropped_on_release() {
        let (mut fifo, src) = open_fifo("field(value)", &FifoConfig::default());
        post_value(&mut fifo, &src, 1);
        let elem = fifo.poll().unwrap();
        let before = fifo.stats().nempty;

        // re-open changes the element generation
        fifo.close();
        let _ = fifo.take_notifications();
        fifo.open(&src).unwrap();
        let _ = fifo.take_notifications();

        let _ = fifo.release(elem);
        assert_eq!(fifo.stats().nempty, fifo.actual_count() + 1);
        let _ = before;
    }

    /// Spec scenario: pipeline credit gates posts; acks splice returned
    /// elements back and restore credit.
    #[test]
    fn pipeline_credit_flow() {
        let config = FifoConfig { max_count: 4, default_count: 4, drop_empty_updates: false };
        let src = source();
        let mut fifo = MonitorFifo::new(
            PvRequest::parse("record[queueSize=4,pipeline=true]field(value)").unwrap(),
            &config,
        );
        assert!(fifo.pipeline());
        fifo.open(&src).unwrap();
        fifo.start().unwrap();
        let _ = fifo.take_notifications();

        let try_post = |fifo: &mut MonitorFifo, v: i32| {
            let mut s = PvStructure::new(source());
            s.set("value", v.into()).unwrap();
            let accepted_before = fifo.stats().nfilled;
            fifo.try_post(&s, &BitSet::from_bits([1]), &BitSet::new(), false);
            fifo.stats().nfilled > accepted_before
        };

        // no credit: every post rejected
        for v in 1..=3 {
            assert!(!try_post(&mut fifo, v), "post {v} should be rejected");
        }
        assert_eq!(fifo.stats().nfilled, 0);

        // peer grants 2 credits
        fifo.report_remote_queue_status(2);
        assert_eq!(fifo.free_count(), 2);

        assert!(try_post(&mut fifo, 10));
        assert!(try_post(&mut fifo, 11));
        assert!(!try_post(&mut fifo, 12)); // credit exhausted
        assert_eq!(fifo.stats().nfilled, 2);

        // consume one element; release parks it in `returned`
        let elem = fifo.poll().unwrap();
        assert_eq!(elem.value.get("value").and_then(PvValue::as_i32), Some(10));
        assert!(fifo.release(elem).is_none());
        assert_eq!(fifo.free_count(), 0);

        // ack restores credit, splices the element back, and crosses the
        // watermark from zero
        let crossing = fifo.report_remote_queue_status(1);
        assert_eq!(crossing, Some(1));
        assert_eq!(fifo.free_count(), 1);
    }

    /// With credit exhausted the sender leaves one element queued so the
    /// producer always has a squash target; nothing is dropped silently.
    #[test]
    fn pipeline_sender_keeps_a_coalescing_tail() {
        let config = FifoConfig { max_count: 2, default_count: 2, drop_empty_updates: false };
        let src = source();
        let mut fifo = MonitorFifo::new(
            PvRequest::parse("record[queueSize=2,pipeline=true]field(value)").unwrap(),
            &config,
        );
        fifo.open(&src).unwrap();
        fifo.start().unwrap();
        let _ = fifo.take_notifications();
        fifo.report_remote_queue_status(2);

        let mut post = |fifo: &mut MonitorFifo, v: i32| {
            let mut s = PvStructure::new(src.clone());
            s.set("value", v.into()).unwrap();
            fifo.post(&s, &BitSet::from_bits([1]), &BitSet::new());
        };

        // first element rides out on the credit
        post(&mut fifo, 1);
        let elem = fifo.poll_for_send().unwrap();
        assert_eq!(elem.value.get("value").and_then(PvValue::as_i32), Some(1));
        let _ = fifo.release(elem);

        // the second consumes the last credit: it must stay queued
        post(&mut fifo, 2);
        assert!(fifo.poll_for_send().is_none());

        // further posts coalesce into it instead of disappearing
        post(&mut fifo, 3);
        post(&mut fifo, 4);
        assert_eq!(fifo.stats().nfilled, 1);

        // credit returns: the coalesced element is sendable and carries
        // the overrun evidence
        fifo.report_remote_queue_status(1);
        let elem = fifo.poll_for_send().unwrap();
        assert_eq!(elem.value.get("value").and_then(PvValue::as_i32), Some(4));
        assert_eq!(elem.overrun, BitSet::from_bits([1]));
    }

    #[test]
    fn free_count_never_exceeds_actual_count() {
        let config = FifoConfig { max_count: 4, default_count: 4, drop_empty_updates: false };
        let src = source();
        let mut fifo = MonitorFifo::new(
            PvRequest::parse("record[pipeline=true]field(value)").unwrap(),
            &config,
        );
        fifo.open(&src).unwrap();

        // grossly excessive credit still clamps
        fifo.report_remote_queue_status(1000);
        assert!(fifo.free_count() <= fifo.actual_count());
    }

    mod properties {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            /// `0 ≤ freeCount ≤ actual_count` under arbitrary
            /// post/poll/release/ack interleavings.
            #[test]
            fn free_count_stays_bounded(
                ops in prop::collection::vec(0u8..4, 1..200),
                queue in 1u32..6,
                pipeline in any::<bool>(),
            ) {
                let src = source();
                let text = if pipeline {
                    format!("record[queueSize={queue},pipeline=true]field(value)")
                } else {
                    format!("record[queueSize={queue}]field(value)")
                };
                let config =
                    FifoConfig { max_count: 8, default_count: 4, drop_empty_updates: false };
                let mut fifo =
                    MonitorFifo::new(PvRequest::parse(&text).unwrap(), &config);
                fifo.open(&src).unwrap();
                fifo.start().unwrap();
                let _ = fifo.take_notifications();

                let mut held = Vec::new();
                let mut counter = 0i32;
                for op in ops {
                    match op {
                        0 => {
                            counter += 1;
                            let mut s = PvStructure::new(src.clone());
                            s.set("value", counter.into()).unwrap();
                            fifo.post(&s, &BitSet::from_bits([1]), &BitSet::new());
                        }
                        1 => {
                            if let Some(elem) = fifo.poll() {
                                held.push(elem);
                            }
                        }
                        2 => {
                            if !held.is_empty() {
                                let _ = fifo.release(held.remove(0));
                            }
                        }
                        _ => {
                            fifo.report_remote_queue_status(1);
                        }
                    }
                    prop_assert!(fifo.free_count() <= fifo.actual_count());
                    let stats = fifo.stats();
                    prop_assert!(stats.nempty + stats.nfilled <= fifo.actual_count() + 1);
                }
            }
        }
    }

    #[test]
    fn lifecycle_misuse_is_rejected() {
        let src = source();
        let mut fifo = MonitorFifo::new(PvRequest::all(), &FifoConfig::default());

        assert!(fifo.start().is_err());
        assert!(fifo.finish().is_err());

        fifo.open(&src).unwrap();
        assert!(fifo.open(&src).is_err());

        fifo.close();
        // close() queued a notification; open() before notify is misuse
        assert!(fifo.open(&src).is_err());
        let _ = fifo.take_notifications();
        fifo.open(&src).unwrap();
    }

    #[test]
    fn projection_failure_surfaces_through_connect() {
        let src = source();
        let mut fifo = MonitorFifo::new(
            PvRequest::parse("field(bogus)").unwrap(),
            &FifoConfig::default(),
        );
        fifo.open(&src).unwrap();
        assert_eq!(fifo.state(), &FifoState::Error);

        let (status, desc) = fifo.take_notifications().connected.unwrap();
        assert!(!status.is_success());
        assert!(desc.is_none());

        // acts permanently full
        let s = PvStructure::new(src);
        assert!(!fifo.try_post(&s, &BitSet::from_bits([1]), &BitSet::new(), false));
    }
}
