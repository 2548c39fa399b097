//! ACK/retry bookkeeping for link-reliable media (serial, audio).
//!
//! The sender side assigns each outbound payload a `frame_seq`, keeps it in a
//! pending table, and re-queues it every `ack_timeout` until the peer's ACK
//! arrives or the retry budget is exhausted. The receiver side ACKs every
//! valid DATA frame (duplicates included, so lost ACKs heal) and releases
//! payloads strictly in `frame_seq` order, holding back frames that arrive
//! ahead of a gap.

use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use crate::frame::LinkFrame;
use crate::LinkError;

#[derive(Debug, Clone, Copy)]
pub struct ReliabilityConfig {
    pub ack_timeout: Duration,
    pub max_retries: u32,
    /// Bound on frames held back waiting for an inbound gap to fill.
    /// Beyond it a frame is dropped unacknowledged (the peer retransmits).
    pub reorder_window: usize,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        ReliabilityConfig {
            ack_timeout: Duration::from_millis(200),
            max_retries: 20,
            reorder_window: 4096,
        }
    }
}

#[derive(Debug)]
struct PendingFrame {
    payload: Vec<u8>,
    attempts: u32,
    next_retry_at: Option<Instant>,
}

#[derive(Debug)]
pub struct LinkReliability {
    cfg: ReliabilityConfig,
    next_frame_seq: u32,
    pending: BTreeMap<u32, PendingFrame>,
    ack_queue: VecDeque<LinkFrame>,
    next_inbound_seq: u32,
    inbound_held: BTreeMap<u32, Vec<u8>>,
    retry_exhaustions: u64,
}

impl LinkReliability {
    pub fn new(cfg: ReliabilityConfig) -> LinkReliability {
        LinkReliability {
            cfg,
            next_frame_seq: 1,
            pending: BTreeMap::new(),
            ack_queue: VecDeque::new(),
            next_inbound_seq: 1,
            inbound_held: BTreeMap::new(),
            retry_exhaustions: 0,
        }
    }

    /// Register an outbound payload; it will be offered by [`due_frames`]
    /// until acknowledged.
    pub fn stage_data(&mut self, payload: Vec<u8>) -> u32 {
        let frame_seq = self.take_frame_seq();
        self.pending.insert(
            frame_seq,
            PendingFrame {
                payload,
                attempts: 0,
                next_retry_at: None,
            },
        );
        frame_seq
    }

    /// Build a one-shot DATA frame that is never retried. Used for
    /// diagnostics pings.
    pub fn stage_fire_and_forget(&mut self, payload: Vec<u8>) -> LinkFrame {
        let frame_seq = self.take_frame_seq();
        LinkFrame::Data { frame_seq, payload }
    }

    fn take_frame_seq(&mut self) -> u32 {
        let frame_seq = self.next_frame_seq;
        self.next_frame_seq = self.next_frame_seq.wrapping_add(1).max(1);
        frame_seq
    }

    /// Frames that should go on the medium now: queued ACKs first, then
    /// every pending DATA frame whose retry timer has elapsed.
    ///
    /// A frame past its retry budget is dropped from the table and reported
    /// as [`LinkError::RetryExhausted`] (with its payload, so the caller can
    /// restage it after a modulation change); the exhaustion counter keeps
    /// incrementing so the audio layer can drive downgrades.
    pub fn due_frames(&mut self, now: Instant) -> Result<Vec<LinkFrame>, LinkError> {
        let mut out: Vec<LinkFrame> = self.ack_queue.drain(..).collect();

        let mut exhausted: Option<(u32, u32)> = None;
        for (frame_seq, pending) in self.pending.iter_mut() {
            match pending.next_retry_at {
                Some(at) if now < at => continue,
                Some(_) => {
                    pending.attempts += 1;
                    if pending.attempts > self.cfg.max_retries.max(1) {
                        exhausted = Some((*frame_seq, pending.attempts));
                        break;
                    }
                }
                None => {}
            }
            pending.next_retry_at = Some(now + self.cfg.ack_timeout);
            out.push(LinkFrame::Data {
                frame_seq: *frame_seq,
                payload: pending.payload.clone(),
            });
        }

        if let Some((frame_seq, attempts)) = exhausted {
            let dropped = self.pending.remove(&frame_seq);
            self.retry_exhaustions += 1;
            return Err(LinkError::RetryExhausted {
                frame_seq,
                attempts,
                payload: dropped.map(|p| p.payload).unwrap_or_default(),
            });
        }
        Ok(out)
    }

    /// Process a deframed inbound frame. Returns the in-order run of
    /// payloads this frame unlocked (usually one, empty for ACKs,
    /// duplicates and out-of-order arrivals).
    pub fn handle_inbound(&mut self, frame: LinkFrame) -> Vec<Vec<u8>> {
        match frame {
            LinkFrame::Ack { frame_seq } => {
                self.pending.remove(&frame_seq);
                Vec::new()
            }
            LinkFrame::Data { frame_seq, payload } => {
                if frame_seq < self.next_inbound_seq
                    || self.inbound_held.contains_key(&frame_seq)
                {
                    // Duplicate (its ACK was likely lost): re-acknowledge,
                    // do not re-deliver.
                    self.ack_queue.push_back(LinkFrame::Ack { frame_seq });
                    return Vec::new();
                }
                if self.inbound_held.len() >= self.cfg.reorder_window.max(1) {
                    // Hold-back buffer full: stay silent so the peer
                    // retransmits once the gap has filled.
                    return Vec::new();
                }
                self.ack_queue.push_back(LinkFrame::Ack { frame_seq });
                self.inbound_held.insert(frame_seq, payload);

                let mut run = Vec::new();
                while let Some(next) = self.inbound_held.remove(&self.next_inbound_seq) {
                    run.push(next);
                    self.next_inbound_seq = self.next_inbound_seq.wrapping_add(1).max(1);
                }
                run
            }
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Count of frames dropped after their retry budget ran out.
    pub fn retry_exhaustions(&self) -> u64 {
        self.retry_exhaustions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_cfg() -> ReliabilityConfig {
        ReliabilityConfig {
            ack_timeout: Duration::from_millis(10),
            max_retries: 2,
            reorder_window: 8,
        }
    }

    fn data(frame_seq: u32, payload: &[u8]) -> LinkFrame {
        LinkFrame::Data {
            frame_seq,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn data_is_sent_once_until_the_timeout_passes() {
        let mut link = LinkReliability::new(fast_cfg());
        let seq = link.stage_data(b"hello".to_vec());
        let now = Instant::now();

        let first = link.due_frames(now).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].frame_seq(), seq);

        // Not due again before the ACK timeout.
        assert!(link.due_frames(now).unwrap().is_empty());

        let later = now + Duration::from_millis(11);
        assert_eq!(link.due_frames(later).unwrap().len(), 1);
    }

    #[test]
    fn ack_clears_the_pending_entry() {
        let mut link = LinkReliability::new(fast_cfg());
        let seq = link.stage_data(b"x".to_vec());
        let now = Instant::now();
        link.due_frames(now).unwrap();

        link.handle_inbound(LinkFrame::Ack { frame_seq: seq });
        assert_eq!(link.pending_len(), 0);
        assert!(link
            .due_frames(now + Duration::from_secs(1))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn lost_ack_triggers_retransmit_without_double_delivery() {
        // Sender A -> receiver B, B's first ACK is lost.
        let mut sender = LinkReliability::new(fast_cfg());
        let mut receiver = LinkReliability::new(fast_cfg());
        let now = Instant::now();

        sender.stage_data(b"payload".to_vec());
        let tx1 = sender.due_frames(now).unwrap();
        assert_eq!(tx1.len(), 1);
        assert_eq!(receiver.handle_inbound(tx1[0].clone()), vec![b"payload".to_vec()]);
        // Drop the ACK the receiver queued.
        let _ = receiver.due_frames(now).unwrap();

        // Sender times out and retransmits.
        let later = now + Duration::from_millis(11);
        let tx2 = sender.due_frames(later).unwrap();
        assert_eq!(tx2.len(), 1);

        // Receiver re-acks but does not deliver twice.
        assert!(receiver.handle_inbound(tx2[0].clone()).is_empty());
        let acks = receiver.due_frames(later).unwrap();
        assert!(matches!(acks[0], LinkFrame::Ack { .. }));

        // The surviving ACK settles the sender.
        sender.handle_inbound(acks[0].clone());
        assert_eq!(sender.pending_len(), 0);
    }

    #[test]
    fn out_of_order_arrivals_are_released_in_order() {
        let mut receiver = LinkReliability::new(fast_cfg());

        // Frame 2 lands before frame 1.
        assert!(receiver.handle_inbound(data(2, b"two")).is_empty());
        let run = receiver.handle_inbound(data(1, b"one"));
        assert_eq!(run, vec![b"one".to_vec(), b"two".to_vec()]);

        // Both were acknowledged while held.
        let acks = receiver.due_frames(Instant::now()).unwrap();
        assert_eq!(
            acks.iter().filter(|f| matches!(f, LinkFrame::Ack { .. })).count(),
            2
        );
    }

    #[test]
    fn hold_back_buffer_is_bounded() {
        let mut receiver = LinkReliability::new(ReliabilityConfig {
            reorder_window: 2,
            ..fast_cfg()
        });

        // Fill the buffer with frames ahead of the missing frame 1.
        assert!(receiver.handle_inbound(data(2, b"b")).is_empty());
        assert!(receiver.handle_inbound(data(3, b"c")).is_empty());
        // Buffer full: frame 4 is neither held nor acked.
        assert!(receiver.handle_inbound(data(4, b"d")).is_empty());
        let acks = receiver.due_frames(Instant::now()).unwrap();
        assert_eq!(acks.len(), 2);

        // The gap fills; everything held is released in order.
        let run = receiver.handle_inbound(data(1, b"a"));
        assert_eq!(run, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn retry_budget_exhaustion_surfaces_payload_and_is_counted() {
        let mut link = LinkReliability::new(fast_cfg());
        link.stage_data(b"doomed".to_vec());

        let mut now = Instant::now();
        let mut exhausted = false;
        for _ in 0..10 {
            match link.due_frames(now) {
                Ok(_) => now += Duration::from_millis(11),
                Err(LinkError::RetryExhausted { attempts, payload, .. }) => {
                    assert!(attempts > 2);
                    assert_eq!(payload, b"doomed".to_vec());
                    exhausted = true;
                    break;
                }
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert!(exhausted);
        assert_eq!(link.retry_exhaustions(), 1);
        assert_eq!(link.pending_len(), 0);
    }

    #[test]
    fn acks_queue_ahead_of_data() {
        let mut link = LinkReliability::new(fast_cfg());
        link.stage_data(b"out".to_vec());
        link.handle_inbound(data(1, b"in"));

        let frames = link.due_frames(Instant::now()).unwrap();
        assert!(matches!(frames[0], LinkFrame::Ack { frame_seq: 1 }));
        assert!(matches!(frames[1], LinkFrame::Data { .. }));
    }

    #[test]
    fn fire_and_forget_frames_use_the_shared_seq_space() {
        let mut link = LinkReliability::new(fast_cfg());
        let ping = link.stage_fire_and_forget(b"diag".to_vec());
        let staged = link.stage_data(b"real".to_vec());
        assert_ne!(ping.frame_seq(), staged);
        assert_eq!(link.pending_len(), 1);
    }
}
