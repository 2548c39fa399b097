//! Session-level retransmission for transports without link ACKs
//! (clipboard, git, drive).
//!
//! Every outbound envelope keeps its msg_id across retransmissions; the
//! receiver's dedup window makes retries idempotent. An entry is settled by
//! a correlated reply, by peer progress (the peer's seq moving past where
//! it stood when the entry was queued), or expires once the schedule is
//! exhausted.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use clipssh_protocol::{Body, Envelope};

/// Backoff schedule; the last step repeats until the attempt cap.
const SCHEDULE: [Duration; 4] = [
    Duration::from_millis(500),
    Duration::from_millis(1000),
    Duration::from_millis(2000),
    Duration::from_millis(4000),
];

const MAX_ATTEMPTS: u32 = 8;

#[derive(Debug)]
struct Entry {
    envelope: Envelope,
    first_sent_at: Instant,
    next_deadline: Instant,
    attempts: u32,
    /// Highest peer seq observed when the entry was queued; any peer
    /// envelope beyond it counts as progress.
    peer_watermark: Option<u64>,
}

#[derive(Debug, Default)]
pub struct RetryQueue {
    entries: HashMap<String, Entry>,
    last_peer_seq: Option<u64>,
}

impl RetryQueue {
    pub fn new() -> RetryQueue {
        RetryQueue::default()
    }

    /// Track an envelope that was just sent for the first time.
    pub fn enqueue(&mut self, envelope: Envelope, now: Instant) {
        let entry = Entry {
            next_deadline: now + SCHEDULE[0],
            first_sent_at: now,
            attempts: 1,
            peer_watermark: self.last_peer_seq,
            envelope,
        };
        self.entries.insert(entry.envelope.msg_id.clone(), entry);
    }

    /// Fold in an inbound peer envelope; settles entries it answers or
    /// makes obsolete.
    pub fn observe_peer(&mut self, envelope: &Envelope) {
        let peer_seq = envelope.seq;
        self.last_peer_seq = Some(match self.last_peer_seq {
            Some(prev) => prev.max(peer_seq),
            None => peer_seq,
        });

        let reply_to: Option<&str> = match &envelope.body {
            Body::Stdout { cmd_id, .. }
            | Body::Stderr { cmd_id, .. }
            | Body::Exit { cmd_id, .. } => Some(cmd_id.as_str()),
            _ => None,
        };
        let answers_connect = matches!(
            envelope.body,
            Body::ConnectAck { .. } | Body::Busy { .. }
        );

        self.entries.retain(|msg_id, entry| {
            if let Some(reply_to) = reply_to {
                if reply_to == msg_id {
                    return false;
                }
            }
            if answers_connect && matches!(entry.envelope.body, Body::ConnectReq { .. }) {
                return false;
            }
            match entry.peer_watermark {
                Some(watermark) if peer_seq > watermark => false,
                None => false, // any peer traffic is progress past "nothing"
                _ => true,
            }
        });
    }

    /// Entries due for retransmission, plus entries whose budget expired
    /// (already removed from the queue).
    pub fn due(&mut self, now: Instant) -> (Vec<Envelope>, Vec<Envelope>) {
        let mut retransmit = Vec::new();
        let mut expired_ids = Vec::new();

        for (msg_id, entry) in self.entries.iter_mut() {
            if now < entry.next_deadline {
                continue;
            }
            entry.attempts += 1;
            if entry.attempts > MAX_ATTEMPTS {
                expired_ids.push(msg_id.clone());
                continue;
            }
            let step = SCHEDULE[(entry.attempts as usize - 1).min(SCHEDULE.len() - 1)];
            entry.next_deadline = now + step;
            retransmit.push(entry.envelope.clone());
        }

        let mut expired = Vec::new();
        for msg_id in expired_ids {
            if let Some(entry) = self.entries.remove(&msg_id) {
                tracing::debug!(
                    msg_id,
                    kind = entry.envelope.kind(),
                    age_ms = entry.first_sent_at.elapsed().as_millis() as u64,
                    "retry budget exhausted"
                );
                expired.push(entry.envelope);
            }
        }
        (retransmit, expired)
    }

    pub fn settle(&mut self, msg_id: &str) {
        self.entries.remove(msg_id);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clipssh_protocol::{Protocol, Role};

    fn outbound(seq: u64, body: Body) -> Envelope {
        Envelope::new(
            Protocol::ClipsshV1,
            "33333333-3333-3333-3333-333333333333",
            Role::Client,
            seq,
            body,
        )
    }

    fn peer(seq: u64, body: Body) -> Envelope {
        Envelope::new(
            Protocol::ClipsshV1,
            "33333333-3333-3333-3333-333333333333",
            Role::Server,
            seq,
            body,
        )
    }

    #[test]
    fn retransmits_follow_the_backoff_schedule() {
        let mut queue = RetryQueue::new();
        let now = Instant::now();
        queue.enqueue(outbound(0, Body::Cmd { text: "ls".into() }), now);

        // Nothing due before the first deadline.
        assert!(queue.due(now + Duration::from_millis(100)).0.is_empty());

        let (retransmit, expired) = queue.due(now + Duration::from_millis(600));
        assert_eq!(retransmit.len(), 1);
        assert!(expired.is_empty());

        // Second deadline moved out to ~1s after the retransmit.
        assert!(queue.due(now + Duration::from_millis(700)).0.is_empty());
        assert_eq!(queue.due(now + Duration::from_millis(1700)).0.len(), 1);
    }

    #[test]
    fn retransmitted_envelopes_keep_their_msg_id() {
        let mut queue = RetryQueue::new();
        let now = Instant::now();
        let envelope = outbound(0, Body::Cmd { text: "pwd".into() });
        let msg_id = envelope.msg_id.clone();
        queue.enqueue(envelope, now);

        let (retransmit, _) = queue.due(now + Duration::from_secs(1));
        assert_eq!(retransmit[0].msg_id, msg_id);
    }

    #[test]
    fn a_correlated_reply_settles_the_cmd() {
        let mut queue = RetryQueue::new();
        let now = Instant::now();
        let cmd = outbound(1, Body::Cmd { text: "ls".into() });
        let cmd_id = cmd.msg_id.clone();
        // Seed a watermark so seq-progress alone won't settle it.
        queue.observe_peer(&peer(5, Body::Disconnect {}));
        queue.enqueue(cmd, now);

        queue.observe_peer(&peer(5, Body::Stdout {
            cmd_id,
            data: b"file\n".to_vec(),
        }));
        assert!(queue.is_empty());
    }

    #[test]
    fn connect_req_settles_on_ack_or_busy() {
        let mut queue = RetryQueue::new();
        let now = Instant::now();
        queue.observe_peer(&peer(3, Body::Disconnect {}));
        queue.enqueue(outbound(0, Body::ConnectReq { host: "h".into() }), now);

        queue.observe_peer(&peer(3, Body::Busy {
            session_id: "s".into(),
        }));
        assert!(queue.is_empty());
    }

    #[test]
    fn peer_seq_progress_settles_older_entries() {
        let mut queue = RetryQueue::new();
        let now = Instant::now();
        queue.observe_peer(&peer(7, Body::Disconnect {}));
        queue.enqueue(
            outbound(
                2,
                Body::PtyResize { cols: 80, rows: 24 },
            ),
            now,
        );

        // Same peer seq: no progress, entry stays.
        queue.observe_peer(&peer(7, Body::Disconnect {}));
        assert_eq!(queue.len(), 1);

        // Peer moved past the watermark: settled.
        queue.observe_peer(&peer(8, Body::Disconnect {}));
        assert!(queue.is_empty());
    }

    #[test]
    fn the_budget_expires_after_the_cap() {
        let mut queue = RetryQueue::new();
        let mut now = Instant::now();
        queue.observe_peer(&peer(1, Body::Disconnect {}));
        let doomed = outbound(0, Body::Cmd { text: "x".into() });
        let msg_id = doomed.msg_id.clone();
        queue.enqueue(doomed, now);

        let mut expired = Vec::new();
        for _ in 0..20 {
            now += Duration::from_secs(5);
            let (_, mut dead) = queue.due(now);
            expired.append(&mut dead);
            if !expired.is_empty() {
                break;
            }
        }
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].msg_id, msg_id);
        assert!(queue.is_empty());
    }
}
