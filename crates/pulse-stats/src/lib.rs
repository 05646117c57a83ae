// Thread-safe running aggregate of delivery metrics.
//
// One `DeliveryStats` instance is shared by every concurrent handler in the
// consumption loop; a single mutex serializes all mutation. The lock is held
// only for the O(1) append/increment in each record call; statistics are
// computed lazily when a summary is requested.
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Mutex;

#[derive(Debug, Default)]
struct StatsState {
    // Set once, on the first successful record; construction may precede the
    // first real message by an arbitrary interval.
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    received: u64,
    failed: u64,
    // Parallel sequences in receive order: index i across all three refers to
    // the same observation.
    latencies_ms: Vec<f64>,
    receive_times: Vec<DateTime<Utc>>,
    sequences: Vec<u64>,
}

/// Shared accumulator of per-message observations.
///
/// ```
/// use chrono::Utc;
/// use pulse_stats::DeliveryStats;
///
/// let stats = DeliveryStats::new();
/// stats.record_message(1.5, Utc::now(), 1);
/// stats.record_message(2.5, Utc::now(), 2);
/// stats.finalize();
/// let summary = stats.summary();
/// assert_eq!(summary.received, 2);
/// assert_eq!(summary.out_of_order, 0);
/// ```
#[derive(Debug, Default)]
pub struct DeliveryStats {
    state: Mutex<StatsState>,
}

impl DeliveryStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one successfully processed message. Negative latency is valid
    /// data under clock skew and is stored as-is, never clamped.
    pub fn record_message(&self, latency_ms: f64, receive_time: DateTime<Utc>, sequence: u64) {
        let mut state = self.state.lock().expect("stats lock");
        if state.start_time.is_none() {
            state.start_time = Some(receive_time);
        }
        state.received += 1;
        state.latencies_ms.push(latency_ms);
        state.receive_times.push(receive_time);
        state.sequences.push(sequence);
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().expect("stats lock");
        state.failed += 1;
    }

    /// Close the measurement window. Single-call discipline is owned by the
    /// consumption loop; calling this twice is a caller bug.
    pub fn finalize(&self) {
        let mut state = self.state.lock().expect("stats lock");
        state.end_time = Some(Utc::now());
    }

    /// Atomically replace all counters and observation sequences.
    pub fn reset(&self) {
        let mut state = self.state.lock().expect("stats lock");
        *state = StatsState::default();
    }

    /// Point-in-time statistical snapshot. All derived values are computed
    /// outside the lock over a cloned observation set.
    pub fn summary(&self) -> Summary {
        let snapshot = {
            let state = self.state.lock().expect("stats lock");
            StatsState {
                start_time: state.start_time,
                end_time: state.end_time,
                received: state.received,
                failed: state.failed,
                latencies_ms: state.latencies_ms.clone(),
                receive_times: state.receive_times.clone(),
                sequences: state.sequences.clone(),
            }
        };
        Summary::compute(snapshot)
    }
}

/// Latency distribution over the recorded observations, in milliseconds.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct LatencySummary {
    pub min_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
    pub mean_ms: f64,
}

/// Gaps between consecutive receive timestamps, sorted ascending.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct InterArrivalSummary {
    pub min_ms: f64,
    pub max_ms: f64,
    pub mean_ms: f64,
    pub stdev_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Summary {
    pub received: u64,
    pub failed: u64,
    pub latency: Option<LatencySummary>,
    /// `received / (end_time - start_time)`, msg/s over the wall-clock window.
    pub throughput: Option<f64>,
    /// `(received - 1) / (last_receive - first_receive)`, msg/s over the span
    /// actually spent receiving.
    pub effective_throughput: Option<f64>,
    pub inter_arrival: Option<InterArrivalSummary>,
    /// Positions where a sequence number is smaller than its predecessor in
    /// receive order.
    pub out_of_order: u64,
    pub in_order_rate: Option<f64>,
}

impl Summary {
    fn compute(state: StatsState) -> Self {
        let out_of_order = out_of_order_count(&state.sequences);
        let in_order_rate = if state.received > 0 {
            Some((state.received - out_of_order) as f64 / state.received as f64)
        } else {
            None
        };

        let latency = if state.latencies_ms.is_empty() {
            None
        } else {
            let mut sorted = state.latencies_ms.clone();
            sorted.sort_unstable_by(f64::total_cmp);
            let mean_ms = sorted.iter().sum::<f64>() / sorted.len() as f64;
            Some(LatencySummary {
                min_ms: sorted[0],
                p50_ms: percentile(&sorted, 50.0).unwrap_or(0.0),
                p90_ms: percentile(&sorted, 90.0).unwrap_or(0.0),
                p95_ms: percentile(&sorted, 95.0).unwrap_or(0.0),
                p99_ms: percentile(&sorted, 99.0).unwrap_or(0.0),
                max_ms: sorted[sorted.len() - 1],
                mean_ms,
            })
        };

        let throughput = match (state.start_time, state.end_time) {
            (Some(start), Some(end)) if state.received > 0 => {
                let secs = span_ms(start, end) / 1000.0;
                (secs > 0.0).then(|| state.received as f64 / secs)
            }
            _ => None,
        };

        let mut sorted_times = state.receive_times.clone();
        sorted_times.sort_unstable();
        let effective_throughput = if sorted_times.len() >= 2 {
            let span_secs =
                span_ms(sorted_times[0], sorted_times[sorted_times.len() - 1]) / 1000.0;
            (span_secs > 0.0).then(|| (state.received - 1) as f64 / span_secs)
        } else {
            None
        };

        let inter_arrival = inter_arrival_summary(&sorted_times);

        Self {
            received: state.received,
            failed: state.failed,
            latency,
            throughput,
            effective_throughput,
            inter_arrival,
            out_of_order,
            in_order_rate,
        }
    }
}

/// Linear-interpolation rank statistic over a sorted slice. `p` is in
/// percent; p=0 is the minimum and p=100 the maximum.
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = (sorted.len() - 1) as f64 * (p / 100.0);
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        return Some(sorted[lo]);
    }
    let frac = rank - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

// Count positions where a sequence number regresses, in receive order.
fn out_of_order_count(sequences: &[u64]) -> u64 {
    sequences
        .windows(2)
        .filter(|pair| pair[1] < pair[0])
        .count() as u64
}

fn inter_arrival_summary(sorted_times: &[DateTime<Utc>]) -> Option<InterArrivalSummary> {
    if sorted_times.len() < 2 {
        return None;
    }
    let gaps_ms: Vec<f64> = sorted_times
        .windows(2)
        .map(|pair| span_ms(pair[0], pair[1]))
        .collect();
    let mean_ms = gaps_ms.iter().sum::<f64>() / gaps_ms.len() as f64;
    let variance = gaps_ms
        .iter()
        .map(|gap| (gap - mean_ms).powi(2))
        .sum::<f64>()
        / gaps_ms.len() as f64;
    let mut min_ms = gaps_ms[0];
    let mut max_ms = gaps_ms[0];
    for gap in &gaps_ms[1..] {
        min_ms = min_ms.min(*gap);
        max_ms = max_ms.max(*gap);
    }
    Some(InterArrivalSummary {
        min_ms,
        max_ms,
        mean_ms,
        stdev_ms: variance.sqrt(),
    })
}

fn span_ms(earlier: DateTime<Utc>, later: DateTime<Utc>) -> f64 {
    // Saturate on spans too large for microsecond math; real runs never get
    // anywhere near the limit.
    let micros = (later - earlier).num_microseconds().unwrap_or(i64::MAX);
    micros as f64 / 1000.0
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "delivery summary:")?;
        writeln!(f, "  received = {}, failed = {}", self.received, self.failed)?;
        match &self.latency {
            Some(latency) => {
                writeln!(
                    f,
                    "  latency ms: min={:.3} p50={:.3} p90={:.3} p95={:.3} p99={:.3} max={:.3} mean={:.3}",
                    latency.min_ms,
                    latency.p50_ms,
                    latency.p90_ms,
                    latency.p95_ms,
                    latency.p99_ms,
                    latency.max_ms,
                    latency.mean_ms,
                )?;
            }
            None => writeln!(f, "  latency: n/a (no received samples)")?,
        }
        match self.throughput {
            Some(rate) => writeln!(f, "  throughput = {rate:.2} msg/s")?,
            None => writeln!(f, "  throughput = n/a")?,
        }
        match self.effective_throughput {
            Some(rate) => writeln!(f, "  effective throughput = {rate:.2} msg/s")?,
            None => writeln!(f, "  effective throughput = n/a")?,
        }
        match &self.inter_arrival {
            Some(gaps) => writeln!(
                f,
                "  inter-arrival ms: min={:.3} max={:.3} mean={:.3} stdev={:.3}",
                gaps.min_ms, gaps.max_ms, gaps.mean_ms, gaps.stdev_ms,
            )?,
            None => writeln!(f, "  inter-arrival: n/a")?,
        }
        match self.in_order_rate {
            Some(rate) => write!(
                f,
                "  out-of-order = {} (in-order rate {:.1}%)",
                self.out_of_order,
                rate * 100.0,
            ),
            None => write!(f, "  out-of-order = n/a"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap()
    }

    fn ms(base: DateTime<Utc>, offset_ms: i64) -> DateTime<Utc> {
        base + chrono::Duration::milliseconds(offset_ms)
    }

    #[test]
    fn percentile_bounds_match_min_max() {
        let sorted = vec![-3.0, 1.0, 4.0, 9.5, 20.0];
        assert_eq!(percentile(&sorted, 0.0), Some(-3.0));
        assert_eq!(percentile(&sorted, 100.0), Some(20.0));
    }

    #[test]
    fn percentile_median_matches_reference() {
        // Odd count: exact middle element.
        let odd = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(percentile(&odd, 50.0), Some(3.0));
        // Even count: interpolated between the two middle elements.
        let even = vec![1.0, 2.0, 3.0, 10.0];
        assert_eq!(percentile(&even, 50.0), Some(2.5));
    }

    #[test]
    fn percentile_interpolates_between_order_statistics() {
        let sorted = vec![10.0, 20.0, 30.0, 40.0];
        // rank = 3 * 0.9 = 2.7 -> 30 + 0.7 * (40 - 30).
        let p90 = percentile(&sorted, 90.0).expect("p90");
        assert!((p90 - 37.0).abs() < 1e-9);
    }

    #[test]
    fn percentile_of_empty_input_is_none() {
        assert_eq!(percentile(&[], 50.0), None);
    }

    #[test]
    fn in_order_recording_has_no_out_of_order() {
        let stats = DeliveryStats::new();
        let base = base_time();
        for seq in 1..=5u64 {
            stats.record_message(1.0, ms(base, seq as i64), seq);
        }
        let summary = stats.summary();
        assert_eq!(summary.out_of_order, 0);
        assert_eq!(summary.in_order_rate, Some(1.0));
    }

    #[test]
    fn sequence_regression_is_counted_once() {
        let stats = DeliveryStats::new();
        let base = base_time();
        for (i, seq) in [1u64, 2, 4, 3, 5].into_iter().enumerate() {
            stats.record_message(1.0, ms(base, i as i64), seq);
        }
        assert_eq!(stats.summary().out_of_order, 1);
    }

    #[test]
    fn empty_summary_reports_no_data() {
        let stats = DeliveryStats::new();
        stats.finalize();
        let summary = stats.summary();
        assert_eq!(summary.received, 0);
        assert_eq!(summary.failed, 0);
        assert!(summary.latency.is_none());
        assert!(summary.throughput.is_none());
        assert!(summary.effective_throughput.is_none());
        assert!(summary.inter_arrival.is_none());
        assert!(summary.in_order_rate.is_none());
        // The report renders without panicking on the empty state.
        assert!(summary.to_string().contains("n/a"));
    }

    #[test]
    fn negative_latency_is_preserved() {
        let stats = DeliveryStats::new();
        stats.record_message(-4.25, base_time(), 1);
        let latency = stats.summary().latency.expect("latency");
        assert_eq!(latency.min_ms, -4.25);
        assert_eq!(latency.max_ms, -4.25);
    }

    #[test]
    fn reset_clears_all_state() {
        let stats = DeliveryStats::new();
        stats.record_message(1.0, base_time(), 1);
        stats.record_failure();
        stats.finalize();
        stats.reset();
        let summary = stats.summary();
        assert_eq!(summary.received, 0);
        assert_eq!(summary.failed, 0);
        assert!(summary.latency.is_none());
        assert!(summary.throughput.is_none());
    }

    #[test]
    fn skewed_reordered_delivery_scenario() {
        // Five messages published at T, T+10, ..., T+40; received in order
        // 1,2,3,5,4 at T+15, T+25, T+35, T+50, T+55.
        let stats = DeliveryStats::new();
        let t = base_time();
        let publish = [0i64, 10, 20, 30, 40];
        let arrivals = [(1u64, 15i64), (2, 25), (3, 35), (5, 50), (4, 55)];
        for (seq, received_at) in arrivals {
            let latency = (received_at - publish[(seq - 1) as usize]) as f64;
            stats.record_message(latency, ms(t, received_at), seq);
        }
        stats.finalize();
        let summary = stats.summary();
        assert_eq!(summary.received, 5);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.out_of_order, 1);
        assert_eq!(summary.in_order_rate, Some(0.8));
        // Span-based throughput over the 40ms receive window: 4 / 0.040s.
        let effective = summary.effective_throughput.expect("effective");
        assert!((effective - 100.0).abs() < 1e-6);
    }

    #[test]
    fn inter_arrival_requires_two_observations() {
        let stats = DeliveryStats::new();
        stats.record_message(1.0, base_time(), 1);
        assert!(stats.summary().inter_arrival.is_none());
    }

    #[test]
    fn inter_arrival_over_sorted_receive_times() {
        let stats = DeliveryStats::new();
        let base = base_time();
        // Recorded out of receive-time order; gaps come from the sorted times.
        stats.record_message(1.0, ms(base, 30), 3);
        stats.record_message(1.0, ms(base, 0), 1);
        stats.record_message(1.0, ms(base, 10), 2);
        let gaps = stats.summary().inter_arrival.expect("gaps");
        assert_eq!(gaps.min_ms, 10.0);
        assert_eq!(gaps.max_ms, 20.0);
        assert_eq!(gaps.mean_ms, 15.0);
        assert_eq!(gaps.stdev_ms, 5.0);
    }

    #[test]
    fn wall_clock_throughput_defined_only_with_data() {
        let stats = DeliveryStats::new();
        stats.record_message(1.0, base_time(), 1);
        // Not finalized yet: no end time, no wall-clock throughput.
        assert!(stats.summary().throughput.is_none());
        stats.finalize();
        let rate = stats.summary().throughput.expect("throughput");
        assert!(rate > 0.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_records_lose_nothing() {
        let stats = Arc::new(DeliveryStats::new());
        let base = base_time();
        let mut handles = Vec::new();
        for seq in 1..=100u64 {
            let stats = Arc::clone(&stats);
            handles.push(tokio::spawn(async move {
                stats.record_message(seq as f64, ms(base, seq as i64), seq);
            }));
        }
        for handle in handles {
            handle.await.expect("record task");
        }
        stats.finalize();
        let summary = stats.summary();
        assert_eq!(summary.received, 100);
        // Every sequence number shows up exactly once.
        let mut recorded: Vec<u64> = {
            let state = stats.state.lock().expect("stats lock");
            state.sequences.clone()
        };
        recorded.sort_unstable();
        assert_eq!(recorded, (1..=100).collect::<Vec<_>>());
    }
}
