//! Stateful enclosure simulator for local development.
//!
//! Each channel is an independent random walk with mean reversion, per-read
//! electronic noise and occasional spikes.  Values are produced in the same
//! raw units the real probes use: 10-bit ADC counts for light, EC and pH,
//! °C and % RH for the digital transducers.

use std::fmt;

use crate::{Channel, Sample, SampleSource};

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

/// Pre-configured simulation profiles selectable via `SIM_SCENARIO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Every channel hovers near the middle of its default band.
    Stable,
    /// Air warms, water cools, nutrients deplete and pH sinks, slowly
    /// enough that the hub has to correct every few minutes.
    Drifting,
    /// High noise, frequent spikes, and sensors that sometimes fail to
    /// report.  Exercises the hub's plausibility checks and fail-open path.
    Flaky,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "drifting" => Self::Drifting,
            "flaky" => Self::Flaky,
            _ => Self::Stable,
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stable => write!(f, "stable"),
            Self::Drifting => write!(f, "drifting"),
            Self::Flaky => write!(f, "flaky"),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-channel state
// ---------------------------------------------------------------------------

struct ChannelSim {
    channel: Channel,
    /// Current "true" value.  Evolves each sample.
    base: f64,
    center: f64,
    drift: f64,
    walk_sigma: f64,
    noise_sigma: f64,
    /// Physically possible output range.
    min: f64,
    max: f64,
}

impl ChannelSim {
    fn new(channel: Channel, scenario: Scenario) -> Self {
        // (center, drift per sample, walk sigma, noise sigma, min, max)
        let (center, drift, walk_sigma, noise_sigma, min, max) = match channel {
            Channel::EnvLight => (650.0, 0.0, 8.0, 4.0, 0.0, 1023.0),
            Channel::EnvTemp => (23.5, 0.05, 0.08, 0.05, -40.0, 125.0),
            Channel::EnvHumidity => (50.0, -0.08, 0.3, 0.2, 0.0, 100.0),
            Channel::WaterTemp => (21.0, -0.03, 0.03, 0.02, -10.0, 85.0),
            // ~1.5 V, comfortably above a 400 ppm floor.
            Channel::WaterEc => (307.0, -0.4, 1.5, 1.0, 0.0, 1023.0),
            // ~pH 6.0 with the default offset.
            Channel::WaterPh => (307.0, -0.3, 1.0, 0.8, 0.0, 1023.0),
        };

        let (drift, noise_scale) = match scenario {
            Scenario::Stable => (0.0, 1.0),
            Scenario::Drifting => (drift, 1.0),
            Scenario::Flaky => (drift * 0.5, 4.0),
        };

        Self {
            channel,
            base: gaussian(center, walk_sigma * 3.0).clamp(min, max),
            center,
            drift,
            walk_sigma,
            noise_sigma: noise_sigma * noise_scale,
            min,
            max,
        }
    }

    fn step(&mut self, mean_reversion: f64, spike_prob: f32) -> f64 {
        let pull = mean_reversion * (self.center - self.base);
        let walk = gaussian(0.0, self.walk_sigma);
        self.base = (self.base + self.drift + pull + walk).clamp(self.min, self.max);

        let noise = gaussian(0.0, self.noise_sigma);
        let spike = if fastrand::f32() < spike_prob {
            gaussian(0.0, (self.max - self.min) * 0.05)
        } else {
            0.0
        };

        let v = (self.base + noise + spike).clamp(self.min, self.max);
        match self.channel {
            // ADC channels are integer counts.
            Channel::EnvLight | Channel::WaterEc | Channel::WaterPh => v.round(),
            _ => (v * 100.0).round() / 100.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Main simulator
// ---------------------------------------------------------------------------

pub struct GrowboxSim {
    channels: Vec<ChannelSim>,
    mean_reversion: f64,
    spike_prob: f32,
    /// Chance that a channel is left out of a round.
    dropout_prob: f32,
}

impl GrowboxSim {
    pub fn new(scenario: Scenario) -> Self {
        let (mean_reversion, spike_prob, dropout_prob) = match scenario {
            Scenario::Stable => (0.05, 0.0, 0.0),
            // Weak pull so drift wins and values leave their bands.
            Scenario::Drifting => (0.002, 0.01, 0.0),
            Scenario::Flaky => (0.02, 0.10, 0.15),
        };

        Self {
            channels: Channel::ALL
                .into_iter()
                .map(|c| ChannelSim::new(c, scenario))
                .collect(),
            mean_reversion,
            spike_prob,
            dropout_prob,
        }
    }
}

impl SampleSource for GrowboxSim {
    fn sample_all(&mut self) -> Vec<Sample> {
        let mut out = Vec::with_capacity(self.channels.len());
        for ch in &mut self.channels {
            let raw = ch.step(self.mean_reversion, self.spike_prob);
            if fastrand::f32() < self.dropout_prob {
                tracing::debug!(channel = %ch.channel, "[sim] sensor dropout");
                continue;
            }
            out.push(Sample::new(ch.channel, raw));
        }
        out
    }
}

// ===========================================================================
// Tests
// ===========================================================================
