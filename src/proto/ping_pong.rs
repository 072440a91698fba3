use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::frame::Ping;

/// Liveness pings and round-trip time estimation.
///
/// Outgoing pings carry a monotonically increasing 4 byte sequence number in
/// the low half of the 8 byte payload. Acks drain the in-flight queue; each
/// matched ack contributes one sample to a rolling window of the most recent
/// three round trips.
#[derive(Debug)]
pub struct PingPong {
    next_seq: u32,
    last_sent: Option<Instant>,
    inflight: VecDeque<Sent>,
    samples: VecDeque<u64>,
}

#[derive(Debug, Clone, Copy)]
struct Sent {
    seq: u32,
    at: Instant,
}

/// Unforced pings are spaced at least this far apart.
const PING_INTERVAL: Duration = Duration::from_secs(10);

/// Rolling RTT window size.
const RTT_SAMPLES: usize = 3;

impl PingPong {
    pub fn new() -> PingPong {
        PingPong {
            next_seq: 1,
            last_sent: None,
            inflight: VecDeque::new(),
            samples: VecDeque::new(),
        }
    }

    /// Produce the next PING to send, if one is due.
    ///
    /// `force` skips the interval check; used to seed the RTT estimate right
    /// after the preface.
    pub fn send_ping(&mut self, force: bool, now: Instant) -> Option<Ping> {
        if !force {
            match self.last_sent {
                Some(at) if now.duration_since(at) < PING_INTERVAL => return None,
                _ => {}
            }
        }

        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        self.last_sent = Some(now);
        self.inflight.push_back(Sent { seq, at: now });

        let mut payload = [0; 8];
        payload[4..].copy_from_slice(&seq.to_be_bytes());

        tracing::trace!("sending PING; seq={}", seq);
        Some(Ping::new(payload))
    }

    /// Process a PING ack from the peer.
    ///
    /// The in-flight queue is drained up to and including the first entry
    /// whose sequence is at least the acked one; entries skipped over are
    /// stale. An ack matching nothing is ignored.
    pub fn recv_pong(&mut self, payload: &[u8; 8], now: Instant) {
        let mut seq_bytes = [0; 4];
        seq_bytes.copy_from_slice(&payload[4..]);
        let seq = u32::from_be_bytes(seq_bytes);

        while let Some(&sent) = self.inflight.front() {
            self.inflight.pop_front();

            if sent.seq >= seq {
                let rtt = now.duration_since(sent.at).as_nanos() as u64;
                tracing::trace!("PING ack; seq={} rtt={}ns", seq, rtt);

                self.samples.push_back(rtt);
                while self.samples.len() > RTT_SAMPLES {
                    self.samples.pop_front();
                }
                return;
            }
        }

        tracing::trace!("unmatched PING ack; seq={}", seq);
    }

    /// The mean of the most recent round-trip samples; zero before the
    /// first ack arrives.
    pub fn round_trip_time(&self) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }

        let sum: u64 = self.samples.iter().sum();
        Duration::from_nanos(sum / self.samples.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq_of(ping: &Ping) -> u32 {
        let mut bytes = [0; 4];
        bytes.copy_from_slice(&ping.payload()[4..]);
        u32::from_be_bytes(bytes)
    }

    fn pong_payload(seq: u32) -> [u8; 8] {
        let mut payload = [0; 8];
        payload[4..].copy_from_slice(&seq.to_be_bytes());
        payload
    }

    #[test]
    fn rtt_is_mean_of_samples() {
        let mut pings = PingPong::new();
        let start = Instant::now();

        let ping = pings.send_ping(true, start).unwrap();
        assert_eq!(seq_of(&ping), 1);

        pings.recv_pong(&pong_payload(1), start + Duration::from_millis(20));
        assert_eq!(pings.round_trip_time(), Duration::from_millis(20));

        let ping = pings.send_ping(true, start).unwrap();
        pings.recv_pong(&pong_payload(seq_of(&ping)), start + Duration::from_millis(40));
        assert_eq!(pings.round_trip_time(), Duration::from_millis(30));
    }

    #[test]
    fn window_keeps_last_three() {
        let mut pings = PingPong::new();
        let start = Instant::now();

        for ms in [10u64, 20, 30, 40] {
            let ping = pings.send_ping(true, start).unwrap();
            pings.recv_pong(
                &pong_payload(seq_of(&ping)),
                start + Duration::from_millis(ms),
            );
        }

        // Only 20, 30 and 40 remain.
        assert_eq!(pings.round_trip_time(), Duration::from_millis(30));
    }

    #[test]
    fn interval_gates_unforced_pings() {
        let mut pings = PingPong::new();
        let start = Instant::now();

        assert!(pings.send_ping(false, start).is_some());
        assert!(pings.send_ping(false, start + Duration::from_secs(5)).is_none());
        assert!(pings.send_ping(true, start + Duration::from_secs(5)).is_some());
        assert!(pings.send_ping(false, start + Duration::from_secs(16)).is_some());
    }

    #[test]
    fn unmatched_ack_is_ignored() {
        let mut pings = PingPong::new();
        let start = Instant::now();

        let ping = pings.send_ping(true, start).unwrap();
        pings.recv_pong(&pong_payload(seq_of(&ping)), start + Duration::from_millis(20));

        // Sequence 99 was never sent; RTT stays put.
        pings.recv_pong(&pong_payload(99), start + Duration::from_millis(500));
        assert_eq!(pings.round_trip_time(), Duration::from_millis(20));
    }

    #[test]
    fn stale_entries_are_skipped() {
        let mut pings = PingPong::new();
        let start = Instant::now();

        pings.send_ping(true, start).unwrap();
        pings.send_ping(true, start).unwrap();
        let third = pings.send_ping(true, start).unwrap();

        // Only the third ping gets acked; the two before it are stale.
        pings.recv_pong(
            &pong_payload(seq_of(&third)),
            start + Duration::from_millis(15),
        );
        assert_eq!(pings.round_trip_time(), Duration::from_millis(15));

        // Their (never arriving) acks match nothing now.
        pings.recv_pong(&pong_payload(1), start + Duration::from_millis(800));
        assert_eq!(pings.round_trip_time(), Duration::from_millis(15));
    }
}
