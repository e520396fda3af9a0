//! The real sensor set: ADS1115 analog probes, SHT31 air sensor and a
//! DS18B20 in the reservoir.  A sensor that is missing at startup or fails
//! a read is simply absent from that round's samples.

use anyhow::Result;
use std::path::Path;

use crate::adc::{self, Ads1115, ChannelMap};
use crate::ds18b20::{self, Ds18b20};
use crate::sht31::{self, Sht31};
use crate::{Channel, Sample, SampleSource};

pub struct Probes {
    adc: Ads1115,
    air: Option<Sht31>,
    water: Option<Ds18b20>,
}

impl Probes {
    pub fn open(channels: Vec<ChannelMap>) -> Result<Self> {
        let adc = Ads1115::new(adc::DEFAULT_ADDR, channels)?;

        let air = Sht31::new(sht31::DEFAULT_ADDR)
            .map_err(|e| tracing::warn!("sht31 unavailable: {e:#}"))
            .ok();
        let water = Ds18b20::discover(Path::new(ds18b20::W1_DEVICES))
            .map_err(|e| tracing::warn!("ds18b20 unavailable: {e:#}"))
            .ok();

        Ok(Self { adc, air, water })
    }
}

impl SampleSource for Probes {
    fn sample_all(&mut self) -> Vec<Sample> {
        let mut samples = self.adc.read_all();

        if let Some(air) = self.air.as_mut() {
            match air.read() {
                Ok((celsius, humidity)) => {
                    samples.push(Sample::new(Channel::EnvTemp, celsius));
                    samples.push(Sample::new(Channel::EnvHumidity, humidity));
                }
                Err(e) => tracing::error!("sht31 read failed: {e:#}"),
            }
        }

        if let Some(water) = &self.water {
            match water.read() {
                Ok(celsius) => samples.push(Sample::new(Channel::WaterTemp, celsius)),
                Err(e) => tracing::error!("ds18b20 read failed: {e:#}"),
            }
        }

        samples
    }
}
