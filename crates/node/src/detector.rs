//! Presence detection: folds each scan cycle's observations into a
//! confirmed present/absent decision for one tracked device.
//!
//! Two variants share the [`Detector`] trait:
//!
//! - [`PresenceDetector`] debounces. It needs `debounce` consecutive
//!   matching cycles to declare presence and as many consecutive misses to
//!   declare absence. A present subject whose last confirmation is older
//!   than `absence_timeout` is forced absent even if the miss counter has
//!   not tripped (a scanner that silently stalls must not hold status open).
//! - [`ImmediateDetector`] has no debounce: present on the first match,
//!   absent once no match has been seen for `absence_timeout`.
//!
//! Either way, exactly one [`PresenceEvent`] comes out per transition.

use std::time::Duration;

use presence_link::{now_epoch_ms, Identity, PresenceEvent};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// One sighting from a radio scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    /// Hardware address as reported by the radio stack, any accepted form.
    pub identity: String,
    /// Signal strength in dBm.
    pub rssi: i32,
    pub observed_at: Instant,
}

impl Observation {
    pub fn new(identity: impl Into<String>, rssi: i32) -> Self {
        Self {
            identity: identity.into(),
            rssi,
            observed_at: Instant::now(),
        }
    }
}

/// When a scan cycle is evaluated. Timeouts use the monotonic instant;
/// emitted events carry the wall-clock time.
#[derive(Debug, Clone, Copy)]
pub struct CycleTime {
    pub at: Instant,
    pub epoch_ms: i64,
}

impl CycleTime {
    pub fn now() -> Self {
        Self {
            at: Instant::now(),
            epoch_ms: now_epoch_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceState {
    pub is_present: bool,
    pub consecutive_detections: u32,
    pub consecutive_absences: u32,
    pub last_confirmed_at: Option<Instant>,
    pub last_matched_identity: Option<Identity>,
}

impl PresenceState {
    fn record_match(&mut self, identity: Identity, at: Instant) {
        self.consecutive_detections = self.consecutive_detections.saturating_add(1);
        self.consecutive_absences = 0;
        self.last_confirmed_at = Some(at);
        self.last_matched_identity = Some(identity);
    }

    fn record_miss(&mut self) {
        self.consecutive_absences = self.consecutive_absences.saturating_add(1);
        self.consecutive_detections = 0;
    }

    fn transition(&mut self, present: bool) {
        self.is_present = present;
        self.consecutive_detections = 0;
        self.consecutive_absences = 0;
    }

    fn confirmation_older_than(&self, now: Instant, timeout: Duration) -> bool {
        self.last_confirmed_at
            .map_or(true, |at| now.saturating_duration_since(at) > timeout)
    }
}

pub trait Detector: Send {
    /// Evaluate one scan cycle. Returns an event only on a confirmed
    /// transition. An empty cycle counts as a cycle without a match.
    fn on_scan_cycle(&mut self, observations: &[Observation], now: CycleTime) -> Option<PresenceEvent>;

    fn state(&self) -> &PresenceState;

    /// The current status restated as a fresh event.
    fn current_event(&self, now: CycleTime) -> PresenceEvent;
}

// ---------------------------------------------------------------------------
// Matching
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Matcher {
    subject_id: String,
    target: Identity,
    rssi_threshold: i32,
}

impl Matcher {
    /// First observation of the target whose strength strictly exceeds the
    /// threshold. Unparseable addresses are skipped.
    fn first_match(&self, observations: &[Observation]) -> Option<Identity> {
        observations.iter().find_map(|o| {
            let id: Identity = o.identity.parse().ok()?;
            (id == self.target && o.rssi > self.rssi_threshold).then_some(id)
        })
    }

    fn event(&self, present: bool, epoch_ms: i64) -> PresenceEvent {
        PresenceEvent::new(&self.subject_id, present, self.target.as_str(), epoch_ms)
    }
}

// ---------------------------------------------------------------------------
// Debounced
// ---------------------------------------------------------------------------

pub struct PresenceDetector {
    matcher: Matcher,
    debounce: u32,
    absence_timeout: Duration,
    state: PresenceState,
}

impl PresenceDetector {
    pub fn new(
        subject_id: impl Into<String>,
        target: Identity,
        rssi_threshold: i32,
        debounce: u32,
        absence_timeout: Duration,
    ) -> Self {
        Self {
            matcher: Matcher {
                subject_id: subject_id.into(),
                target,
                rssi_threshold,
            },
            debounce: debounce.max(1),
            absence_timeout,
            state: PresenceState::default(),
        }
    }
}

impl Detector for PresenceDetector {
    fn on_scan_cycle(&mut self, observations: &[Observation], now: CycleTime) -> Option<PresenceEvent> {
        match self.matcher.first_match(observations) {
            Some(id) => self.state.record_match(id, now.at),
            None => self.state.record_miss(),
        }

        let s = &self.state;
        let present = if !s.is_present && s.consecutive_detections >= self.debounce {
            info!(subject = %self.matcher.subject_id, cycles = s.consecutive_detections, "presence confirmed");
            true
        } else if s.is_present && s.consecutive_absences >= self.debounce {
            info!(subject = %self.matcher.subject_id, cycles = s.consecutive_absences, "absence confirmed");
            false
        } else if s.is_present && s.confirmation_older_than(now.at, self.absence_timeout) {
            warn!(
                subject = %self.matcher.subject_id,
                misses = s.consecutive_absences,
                timeout_ms = self.absence_timeout.as_millis() as u64,
                "last confirmation is stale; forcing absent"
            );
            false
        } else {
            debug!(
                subject = %self.matcher.subject_id,
                detections = s.consecutive_detections,
                absences = s.consecutive_absences,
                "scan cycle"
            );
            return None;
        };

        self.state.transition(present);
        Some(self.matcher.event(present, now.epoch_ms))
    }

    fn state(&self) -> &PresenceState {
        &self.state
    }

    fn current_event(&self, now: CycleTime) -> PresenceEvent {
        self.matcher.event(self.state.is_present, now.epoch_ms)
    }
}

// ---------------------------------------------------------------------------
// Immediate
// ---------------------------------------------------------------------------

pub struct ImmediateDetector {
    matcher: Matcher,
    absence_timeout: Duration,
    state: PresenceState,
}

impl ImmediateDetector {
    pub fn new(subject_id: impl Into<String>, target: Identity, rssi_threshold: i32, absence_timeout: Duration) -> Self {
        Self {
            matcher: Matcher {
                subject_id: subject_id.into(),
                target,
                rssi_threshold,
            },
            absence_timeout,
            state: PresenceState::default(),
        }
    }
}

impl Detector for ImmediateDetector {
    fn on_scan_cycle(&mut self, observations: &[Observation], now: CycleTime) -> Option<PresenceEvent> {
        let present = match self.matcher.first_match(observations) {
            Some(id) => {
                self.state.record_match(id, now.at);
                if self.state.is_present {
                    return None;
                }
                info!(subject = %self.matcher.subject_id, "device seen; present");
                true
            }
            None => {
                self.state.record_miss();
                if !self.state.is_present || !self.state.confirmation_older_than(now.at, self.absence_timeout) {
                    return None;
                }
                info!(subject = %self.matcher.subject_id, "device not seen within timeout; absent");
                false
            }
        };

        self.state.transition(present);
        Some(self.matcher.event(present, now.epoch_ms))
    }

    fn state(&self) -> &PresenceState {
        &self.state
    }

    fn current_event(&self, now: CycleTime) -> PresenceEvent {
        self.matcher.event(self.state.is_present, now.epoch_ms)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const TARGET: &str = "AA:BB:CC:DD:EE:FF";
    const EPOCH: i64 = 1_700_000_000_000;

    fn target() -> Identity {
        TARGET.parse().unwrap()
    }

    fn debounced(debounce: u32, timeout_ms: u64) -> PresenceDetector {
        PresenceDetector::new("3", target(), -80, debounce, Duration::from_millis(timeout_ms))
    }

    fn at(t0: Instant, ms: u64) -> CycleTime {
        CycleTime {
            at: t0 + Duration::from_millis(ms),
            epoch_ms: EPOCH + ms as i64,
        }
    }

    fn seen(rssi: i32) -> Vec<Observation> {
        vec![Observation::new(TARGET, rssi)]
    }

    fn hit() -> Vec<Observation> {
        seen(-60)
    }

    /// Drive `d` to present with `n` matching cycles starting at `t0`.
    fn make_present(d: &mut dyn Detector, t0: Instant, n: u32) {
        for i in 0..n {
            d.on_scan_cycle(&hit(), at(t0, i as u64 * 1000));
        }
        assert!(d.state().is_present);
    }

    // -- Debounced: presence ------------------------------------------------

    #[test]
    fn three_matching_cycles_emit_one_present_event() {
        let t0 = Instant::now();
        let mut d = debounced(3, 30_000);

        assert_eq!(d.on_scan_cycle(&hit(), at(t0, 0)), None);
        assert_eq!(d.on_scan_cycle(&hit(), at(t0, 5_000)), None);
        let ev = d.on_scan_cycle(&hit(), at(t0, 10_000)).unwrap();

        assert_eq!(ev, PresenceEvent::new("3", true, TARGET, EPOCH + 10_000));
        assert_eq!(d.on_scan_cycle(&hit(), at(t0, 15_000)), None);
        assert_eq!(d.state().consecutive_detections, 1);
    }

    #[test]
    fn interspersed_misses_never_flip_to_present() {
        let t0 = Instant::now();
        let mut d = debounced(3, 30_000);

        for i in 0..60u64 {
            let obs = if i % 3 == 2 { Vec::new() } else { hit() };
            assert_eq!(d.on_scan_cycle(&obs, at(t0, i * 1000)), None, "cycle {i}");
        }
        assert!(!d.state().is_present);
    }

    #[test]
    fn weak_signal_at_threshold_is_not_a_match() {
        let t0 = Instant::now();
        let mut d = debounced(1, 30_000);

        assert_eq!(d.on_scan_cycle(&seen(-80), at(t0, 0)), None);
        assert!(d.on_scan_cycle(&seen(-79), at(t0, 1000)).is_some());
    }

    #[test]
    fn other_devices_ignored() {
        let t0 = Instant::now();
        let mut d = debounced(1, 30_000);
        let obs = vec![
            Observation::new("11:22:33:44:55:66", -30),
            Observation::new("not-a-mac", -30),
        ];
        assert_eq!(d.on_scan_cycle(&obs, at(t0, 0)), None);
        assert_eq!(d.state().consecutive_absences, 1);
    }

    #[test]
    fn target_matched_in_any_address_form() {
        let t0 = Instant::now();
        let mut d = debounced(1, 30_000);
        let obs = vec![Observation::new("aa-bb-cc-dd-ee-ff", -50)];

        let ev = d.on_scan_cycle(&obs, at(t0, 0)).unwrap();
        assert_eq!(ev.identity, TARGET);
        assert_eq!(d.state().last_matched_identity, Some(target()));
    }

    #[test]
    fn several_matches_in_one_cycle_count_once() {
        let t0 = Instant::now();
        let mut d = debounced(3, 30_000);
        let obs = vec![
            Observation::new(TARGET, -50),
            Observation::new(TARGET, -40),
            Observation::new(TARGET, -45),
        ];
        assert_eq!(d.on_scan_cycle(&obs, at(t0, 0)), None);
        assert_eq!(d.state().consecutive_detections, 1);
    }

    // -- Debounced: absence -------------------------------------------------

    #[test]
    fn consecutive_misses_emit_one_absent_event() {
        let t0 = Instant::now();
        let mut d = debounced(3, 300_000);
        make_present(&mut d, t0, 3);

        assert_eq!(d.on_scan_cycle(&[], at(t0, 3_000)), None);
        assert_eq!(d.on_scan_cycle(&[], at(t0, 4_000)), None);
        let ev = d.on_scan_cycle(&[], at(t0, 5_000)).unwrap();
        assert!(!ev.present);
        assert_eq!(d.on_scan_cycle(&[], at(t0, 6_000)), None);

        let s = d.state();
        assert!(!s.is_present);
        assert_eq!(s.consecutive_absences, 1);
        assert_eq!(s.consecutive_detections, 0);
    }

    #[test]
    fn two_misses_do_not_declare_absence() {
        let t0 = Instant::now();
        let mut d = debounced(3, 300_000);
        make_present(&mut d, t0, 3);

        d.on_scan_cycle(&[], at(t0, 3_000));
        d.on_scan_cycle(&[], at(t0, 4_000));
        assert_eq!(d.on_scan_cycle(&hit(), at(t0, 5_000)), None);
        assert!(d.state().is_present);
        assert_eq!(d.state().consecutive_absences, 0);
    }

    #[test]
    fn empty_cycle_same_as_cycle_without_match() {
        let t0 = Instant::now();
        let mut a = debounced(3, 300_000);
        let mut b = debounced(3, 300_000);
        make_present(&mut a, t0, 3);
        make_present(&mut b, t0, 3);

        let stranger = vec![Observation::new("11:22:33:44:55:66", -20)];
        for i in 3..6u64 {
            let ea = a.on_scan_cycle(&[], at(t0, i * 1000));
            let eb = b.on_scan_cycle(&stranger, at(t0, i * 1000));
            assert_eq!(ea, eb);
        }
        assert_eq!(a.state(), b.state());
    }

    #[test]
    fn stale_confirmation_forces_absent_before_debounce() {
        let t0 = Instant::now();
        let mut d = debounced(5, 30_000);
        make_present(&mut d, t0, 5);
        let last = 4_000;

        // One miss right at the boundary: not yet stale.
        assert_eq!(d.on_scan_cycle(&[], at(t0, last + 30_000)), None);
        // One past the boundary: forced absent with a single miss counted.
        let ev = d.on_scan_cycle(&[], at(t0, last + 30_001)).unwrap();
        assert!(!ev.present);
        assert_eq!(ev.emitted_at, EPOCH + (last + 30_001) as i64);

        let s = d.state();
        assert!(!s.is_present);
        assert_eq!((s.consecutive_detections, s.consecutive_absences), (0, 0));
        assert_eq!(d.on_scan_cycle(&[], at(t0, last + 60_000)), None);
    }

    #[test]
    fn weak_sightings_do_not_refresh_confirmation() {
        let t0 = Instant::now();
        let mut d = debounced(50, 10_000);
        make_present(&mut d, t0, 50);
        let last = 49_000;

        assert_eq!(d.on_scan_cycle(&seen(-95), at(t0, last + 5_000)), None);
        assert!(d.on_scan_cycle(&seen(-95), at(t0, last + 10_001)).is_some());
    }

    #[test]
    fn one_event_per_transition_over_long_run() {
        let t0 = Instant::now();
        let mut d = debounced(3, 20_000);

        // Runs of hits and misses of varying length, some shorter than the
        // debounce threshold.
        let runs: [(bool, u64); 10] = [
            (true, 2),
            (false, 1),
            (true, 5),
            (false, 2),
            (true, 1),
            (false, 4),
            (true, 3),
            (false, 3),
            (true, 7),
            (false, 1),
        ];

        let mut t = 0u64;
        let mut events = Vec::new();
        let mut previous = d.state().is_present;
        for (present, len) in runs {
            for _ in 0..len {
                let obs = if present { hit() } else { Vec::new() };
                let ev = d.on_scan_cycle(&obs, at(t0, t));
                let now_present = d.state().is_present;
                assert_eq!(ev.is_some(), now_present != previous, "at t={t}");
                if let Some(ev) = ev {
                    assert_eq!(ev.present, now_present);
                    events.push(ev.present);
                }
                previous = now_present;
                t += 1000;
            }
        }

        assert_eq!(events, vec![true, false, true, false, true]);
    }

    #[test]
    fn zero_debounce_treated_as_one() {
        let t0 = Instant::now();
        let mut d = debounced(0, 30_000);
        assert!(d.on_scan_cycle(&hit(), at(t0, 0)).is_some());
    }

    #[test]
    fn current_event_restates_status() {
        let t0 = Instant::now();
        let mut d = debounced(1, 30_000);
        assert!(!d.current_event(at(t0, 0)).present);

        d.on_scan_cycle(&hit(), at(t0, 0));
        let ev = d.current_event(at(t0, 90_000));
        assert!(ev.present);
        assert_eq!(ev.emitted_at, EPOCH + 90_000);
        assert_eq!(ev.subject_id, "3");
    }

    #[test]
    fn independent_instances_do_not_share_state() {
        let t0 = Instant::now();
        let mut a = debounced(1, 30_000);
        let b = debounced(1, 30_000);
        a.on_scan_cycle(&hit(), at(t0, 0));
        assert!(a.state().is_present);
        assert!(!b.state().is_present);
    }

    // -- Immediate ----------------------------------------------------------

    fn immediate(timeout_ms: u64) -> ImmediateDetector {
        ImmediateDetector::new("3", target(), -80, Duration::from_millis(timeout_ms))
    }

    #[test]
    fn immediate_present_on_first_match() {
        let t0 = Instant::now();
        let mut d = immediate(10_000);
        let ev = d.on_scan_cycle(&hit(), at(t0, 0)).unwrap();
        assert!(ev.present);
        assert_eq!(d.on_scan_cycle(&hit(), at(t0, 1_000)), None);
    }

    #[test]
    fn immediate_ignores_misses_within_timeout() {
        let t0 = Instant::now();
        let mut d = immediate(10_000);
        d.on_scan_cycle(&hit(), at(t0, 0));

        for i in 1..=10u64 {
            assert_eq!(d.on_scan_cycle(&[], at(t0, i * 1000)), None);
        }
        assert!(d.state().is_present);
        let ev = d.on_scan_cycle(&[], at(t0, 10_001)).unwrap();
        assert!(!ev.present);
        assert_eq!(d.on_scan_cycle(&[], at(t0, 20_000)), None);
    }

    #[test]
    fn immediate_match_resets_timeout() {
        let t0 = Instant::now();
        let mut d = immediate(10_000);
        d.on_scan_cycle(&hit(), at(t0, 0));
        d.on_scan_cycle(&hit(), at(t0, 8_000));
        assert_eq!(d.on_scan_cycle(&[], at(t0, 15_000)), None);
        assert!(d.on_scan_cycle(&[], at(t0, 18_001)).is_some());
    }

    #[test]
    fn immediate_respects_threshold() {
        let t0 = Instant::now();
        let mut d = immediate(10_000);
        assert_eq!(d.on_scan_cycle(&seen(-80), at(t0, 0)), None);
        assert!(!d.state().is_present);
    }
}
