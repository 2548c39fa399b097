//! Seq-ordered delivery for polled transports, which may surface the
//! peer's envelopes out of order (clipboard overwrites, drive poll races).
//!
//! Frames ahead of a gap are held up to a fixed window; when the window
//! overflows the gap is declared lost and delivery skips forward. Late
//! arrivals behind the delivery point are dropped.

use std::collections::BTreeMap;

use clipssh_protocol::Envelope;

pub const REORDER_WINDOW: usize = 32;

#[derive(Debug)]
pub struct ReorderBuffer {
    next_seq: Option<u64>,
    held: BTreeMap<u64, Envelope>,
    window: usize,
    dropped: u64,
}

impl ReorderBuffer {
    pub fn new(window: usize) -> ReorderBuffer {
        ReorderBuffer {
            next_seq: None,
            held: BTreeMap::new(),
            window: window.max(1),
            dropped: 0,
        }
    }

    /// Fix the first expected seq (e.g. just past the handshake ack)
    /// instead of inferring it from the first arrival.
    pub fn prime(&mut self, next_seq: u64) {
        self.next_seq = Some(next_seq);
    }

    /// Accept one peer envelope; returns the envelopes now deliverable in
    /// seq order.
    pub fn push(&mut self, envelope: Envelope) -> Vec<Envelope> {
        let seq = envelope.seq;
        let next = *self.next_seq.get_or_insert(seq);

        if seq < next {
            self.dropped += 1;
            tracing::debug!(seq, next, "dropping stale out-of-window envelope");
            return Vec::new();
        }
        self.held.insert(seq, envelope);

        // Window overflow: the gap is considered lost, jump to the oldest
        // held frame.
        if self.held.len() > self.window {
            if let Some(oldest) = self.held.keys().next().copied() {
                if oldest > next {
                    tracing::debug!(from = next, to = oldest, "reorder window overflow, skipping gap");
                    self.next_seq = Some(oldest);
                }
            }
        }

        let mut out = Vec::new();
        loop {
            let expect = self.next_seq.unwrap_or(0);
            match self.held.remove(&expect) {
                Some(envelope) => {
                    out.push(envelope);
                    self.next_seq = Some(expect + 1);
                }
                None => break,
            }
        }
        out
    }

    pub fn held_len(&self) -> usize {
        self.held.len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Default for ReorderBuffer {
    fn default() -> Self {
        ReorderBuffer::new(REORDER_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clipssh_protocol::{Body, Protocol, Role};

    fn envelope(seq: u64) -> Envelope {
        Envelope::new(
            Protocol::GitsshV2,
            "44444444-4444-4444-4444-444444444444",
            Role::Server,
            seq,
            Body::PtyOutput {
                data: format!("chunk-{seq}").into_bytes(),
            },
        )
    }

    fn seqs(run: &[Envelope]) -> Vec<u64> {
        run.iter().map(|e| e.seq).collect()
    }

    #[test]
    fn in_order_input_flows_straight_through() {
        let mut buffer = ReorderBuffer::default();
        for seq in 0..4 {
            let run = buffer.push(envelope(seq));
            assert_eq!(seqs(&run), vec![seq]);
        }
        assert_eq!(buffer.held_len(), 0);
    }

    #[test]
    fn out_of_order_arrivals_come_out_sorted() {
        let mut buffer = ReorderBuffer::default();
        assert_eq!(seqs(&buffer.push(envelope(0))), vec![0]);
        assert!(buffer.push(envelope(2)).is_empty());
        assert!(buffer.push(envelope(3)).is_empty());
        let run = buffer.push(envelope(1));
        assert_eq!(seqs(&run), vec![1, 2, 3]);
    }

    #[test]
    fn late_arrival_behind_the_cursor_is_dropped() {
        let mut buffer = ReorderBuffer::default();
        buffer.push(envelope(0));
        buffer.push(envelope(1));
        assert!(buffer.push(envelope(0)).is_empty());
        assert_eq!(buffer.dropped(), 1);
    }

    #[test]
    fn window_overflow_skips_the_lost_gap() {
        let mut buffer = ReorderBuffer::new(4);
        buffer.push(envelope(0));
        // seq 1 never arrives; 2..=6 pile up past the window.
        assert!(buffer.push(envelope(2)).is_empty());
        assert!(buffer.push(envelope(3)).is_empty());
        assert!(buffer.push(envelope(4)).is_empty());
        assert!(buffer.push(envelope(5)).is_empty());
        let run = buffer.push(envelope(6));
        assert_eq!(seqs(&run), vec![2, 3, 4, 5, 6]);

        // The skipped seq 1 arriving later is stale.
        assert!(buffer.push(envelope(1)).is_empty());
    }
}
