/// Wall-clock time in Unix milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Local send/receive instants of one request/acknowledgment exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundTrip {
    pub sent_at: i64,
    pub received_at: i64,
}

impl RoundTrip {
    pub fn rtt_ms(&self) -> i64 {
        (self.received_at - self.sent_at).max(0)
    }
}

/// Estimate of how far the server clock is ahead of ours.
///
/// Assumes the reply was stamped halfway through the round trip.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerClock {
    offset_ms: Option<f64>,
}

impl ServerClock {
    pub fn observe(&mut self, round_trip: RoundTrip, server_time: i64) {
        let midpoint = round_trip.sent_at as f64 + round_trip.rtt_ms() as f64 / 2.0;
        let sample = server_time as f64 - midpoint;
        self.offset_ms = Some(match self.offset_ms {
            Some(previous) => previous * 0.75 + sample * 0.25,
            None => sample,
        });
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.unwrap_or(0.0).round() as i64
    }

    pub fn to_server(&self, local: i64) -> i64 {
        local + self.offset_ms()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_sets_offset_from_midpoint() {
        let mut clock = ServerClock::default();
        assert_eq!(clock.to_server(1_000), 1_000);

        clock.observe(
            RoundTrip {
                sent_at: 1_000,
                received_at: 1_200,
            },
            5_100,
        );
        assert_eq!(clock.offset_ms(), 4_000);
        assert_eq!(clock.to_server(2_000), 6_000);
    }

    #[test]
    fn later_samples_are_smoothed() {
        let mut clock = ServerClock::default();
        let rt = RoundTrip {
            sent_at: 0,
            received_at: 0,
        };
        clock.observe(rt, 1_000);
        clock.observe(rt, 2_000);
        assert_eq!(clock.offset_ms(), 1_250);
    }
}
