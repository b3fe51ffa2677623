//! Simulated BLE scanner for local development.
//!
//! Models what a real scan of a desk looks like:
//! - Target signal strength follows a random walk with mean reversion
//! - Per-sighting radio noise
//! - Lossy scanning (the target is sometimes missed even when nearby)
//! - Background devices with their own addresses
//! - Optional arrive/leave cycle for exercising transitions end to end

use std::fmt;

use presence_link::Identity;

use crate::detector::Observation;
use crate::source::SignalSource;

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Approximate a sample from N(0,1) using the Irwin-Hall method:
/// sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Simulation profiles selectable via `source.scenario` or `SIM_SCENARIO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Target sits at the desk. Strong signal, rare misses.
    Seated,
    /// Target is never in range. Only background devices.
    Away,
    /// Target at the edge of range. Weak, noisy, frequently missed.
    Flaky,
    /// Alternates between seated and away every `commute_cycles` scans.
    Commute,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "away" => Self::Away,
            "flaky" => Self::Flaky,
            "commute" => Self::Commute,
            _ => Self::Seated,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Seated => write!(f, "seated"),
            Self::Away => write!(f, "away"),
            Self::Flaky => write!(f, "flaky"),
            Self::Commute => write!(f, "commute"),
        }
    }
}

/// Signal profile for the target while it is in range.
struct Profile {
    center_dbm: f64,
    walk_sigma: f64,
    noise_sigma: f64,
    miss_prob: f32,
}

impl Profile {
    fn for_scenario(scenario: Scenario) -> Self {
        match scenario {
            Scenario::Flaky => Self {
                center_dbm: -78.0,
                walk_sigma: 2.5,
                noise_sigma: 6.0,
                miss_prob: 0.35,
            },
            _ => Self {
                center_dbm: -58.0,
                walk_sigma: 1.5,
                noise_sigma: 3.0,
                miss_prob: 0.05,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Simulator
// ---------------------------------------------------------------------------

pub struct ScanSim {
    scenario: Scenario,
    target: Identity,
    profile: Profile,
    /// Current "true" target strength. Evolves each scan.
    base_dbm: f64,
    mean_reversion: f64,
    background: Vec<String>,
    commute_cycles: u32,
    cycle: u64,
}

impl ScanSim {
    pub fn new(scenario: Scenario, target: Identity, background_devices: usize, commute_cycles: u32) -> Self {
        let profile = Profile::for_scenario(scenario);
        let background = (0..background_devices).map(|_| random_address()).collect();
        Self {
            scenario,
            target,
            base_dbm: profile.center_dbm,
            profile,
            mean_reversion: 0.1,
            background,
            commute_cycles: commute_cycles.max(1),
            cycle: 0,
        }
    }

    pub fn scenario(&self) -> Scenario {
        self.scenario
    }

    fn target_in_range(&self) -> bool {
        match self.scenario {
            Scenario::Away => false,
            Scenario::Commute => (self.cycle / self.commute_cycles as u64) % 2 == 0,
            Scenario::Seated | Scenario::Flaky => true,
        }
    }

    /// One scan's worth of sightings.
    pub fn scan(&mut self) -> Vec<Observation> {
        let mut out = Vec::new();

        if self.target_in_range() {
            let pull = self.mean_reversion * (self.profile.center_dbm - self.base_dbm);
            self.base_dbm = (self.base_dbm + pull + gaussian(0.0, self.profile.walk_sigma)).clamp(-100.0, -30.0);

            if fastrand::f32() >= self.profile.miss_prob {
                let rssi = gaussian(self.base_dbm, self.profile.noise_sigma).round().clamp(-110.0, -20.0);
                out.push(Observation::new(self.target.as_str(), rssi as i32));
            }
        }

        for addr in &self.background {
            if fastrand::f32() < 0.6 {
                let rssi = gaussian(-82.0, 8.0).round().clamp(-110.0, -20.0);
                out.push(Observation::new(addr.clone(), rssi as i32));
            }
        }

        fastrand::shuffle(&mut out);
        self.cycle += 1;
        out
    }
}

impl SignalSource for ScanSim {
    fn poll_observations(&mut self) -> Vec<Observation> {
        self.scan()
    }
}

fn random_address() -> String {
    (0..6)
        .map(|_| format!("{:02X}", fastrand::u8(..)))
        .collect::<Vec<_>>()
        .join(":")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const TARGET: &str = "AA:BB:CC:DD:EE:FF";

    fn sim(scenario: Scenario, background: usize) -> ScanSim {
        ScanSim::new(scenario, TARGET.parse().unwrap(), background, 10)
    }

    /// Target sightings per scan over `n` scans.
    fn target_hits(sim: &mut ScanSim, n: usize) -> Vec<Option<i32>> {
        (0..n)
            .map(|_| sim.scan().into_iter().find(|o| o.identity == TARGET).map(|o| o.rssi))
            .collect()
    }

    #[test]
    fn seated_target_mostly_seen_with_strong_signal() {
        let mut s = sim(Scenario::Seated, 0);
        let hits = target_hits(&mut s, 200);
        let seen: Vec<i32> = hits.iter().flatten().copied().collect();

        assert!(seen.len() > 150, "seated target seen only {} of 200 scans", seen.len());
        let avg = seen.iter().map(|&v| v as f64).sum::<f64>() / seen.len() as f64;
        assert!(avg > -70.0, "seated average too weak: {avg:.1}");
    }

    #[test]
    fn away_target_never_seen() {
        let mut s = sim(Scenario::Away, 3);
        assert!(target_hits(&mut s, 100).iter().all(Option::is_none));
    }

    #[test]
    fn flaky_target_weaker_and_missed_more() {
        let mut seated = sim(Scenario::Seated, 0);
        let mut flaky = sim(Scenario::Flaky, 0);
        let seated_seen = target_hits(&mut seated, 300).iter().flatten().count();
        let flaky_seen = target_hits(&mut flaky, 300).iter().flatten().count();
        assert!(flaky_seen < seated_seen, "flaky {flaky_seen} vs seated {seated_seen}");
    }

    #[test]
    fn commute_alternates_in_blocks() {
        let mut s = ScanSim::new(Scenario::Commute, TARGET.parse().unwrap(), 0, 5);
        let hits = target_hits(&mut s, 20);
        // Cycles 5..10 and 15..20 are away.
        assert!(hits[5..10].iter().all(Option::is_none));
        assert!(hits[15..20].iter().all(Option::is_none));
        assert!(hits[0..5].iter().any(Option::is_some));
    }

    #[test]
    fn rssi_within_radio_range() {
        let mut s = sim(Scenario::Flaky, 4);
        for _ in 0..200 {
            for o in s.scan() {
                assert!((-110..=-20).contains(&o.rssi), "rssi out of range: {}", o.rssi);
            }
        }
    }

    #[test]
    fn background_addresses_are_valid_identities() {
        let mut s = sim(Scenario::Away, 5);
        for o in (0..20).flat_map(|_| s.scan()) {
            assert!(o.identity.parse::<Identity>().is_ok(), "bad address {}", o.identity);
        }
    }

    #[test]
    fn scenario_from_str_lossy() {
        assert_eq!(Scenario::from_str_lossy("seated"), Scenario::Seated);
        assert_eq!(Scenario::from_str_lossy("AWAY"), Scenario::Away);
        assert_eq!(Scenario::from_str_lossy("Flaky"), Scenario::Flaky);
        assert_eq!(Scenario::from_str_lossy("commute"), Scenario::Commute);
        assert_eq!(Scenario::from_str_lossy("unknown"), Scenario::Seated);
        assert_eq!(Scenario::from_str_lossy(""), Scenario::Seated);
    }

    #[test]
    fn scenario_display() {
        assert_eq!(Scenario::Seated.to_string(), "seated");
        assert_eq!(Scenario::Commute.to_string(), "commute");
    }

    #[test]
    fn approx_std_normal_has_zero_mean() {
        let n = 5000;
        let sum: f64 = (0..n).map(|_| approx_std_normal()).sum();
        let mean = sum / n as f64;
        assert!(mean.abs() < 0.15, "approx_std_normal mean should be near zero: {mean}");
    }
}
