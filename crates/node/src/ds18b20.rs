//! DS18B20 water temperature probe via the kernel 1-wire sysfs interface.
//!
//! With `dtoverlay=w1-gpio` the kernel exposes each probe as
//! `/sys/bus/w1/devices/28-xxxxxxxxxxxx/w1_slave`:
//!
//! ```text
//! 72 01 4b 46 7f ff 0e 10 57 : crc=57 YES
//! 72 01 4b 46 7f ff 0e 10 57 t=23125
//! ```

use anyhow::{anyhow, bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub const W1_DEVICES: &str = "/sys/bus/w1/devices";

/// DS18B20 family code prefix.
const FAMILY_PREFIX: &str = "28-";

/// Power-on reset value; the probe has not completed a conversion.
const POWER_ON_MILLI_C: i64 = 85_000;

/// Parse the contents of a `w1_slave` file into °C.
pub fn parse_w1_slave(contents: &str) -> Result<f64> {
    let mut lines = contents.lines();
    let status = lines.next().ok_or_else(|| anyhow!("empty w1_slave"))?;
    if !status.trim_end().ends_with("YES") {
        bail!("ds18b20 crc check failed");
    }

    let data = lines.next().ok_or_else(|| anyhow!("w1_slave missing data line"))?;
    let (_, milli) = data
        .rsplit_once("t=")
        .ok_or_else(|| anyhow!("w1_slave missing t= field"))?;
    let milli: i64 = milli
        .trim()
        .parse()
        .with_context(|| format!("bad temperature field {milli:?}"))?;

    if milli == POWER_ON_MILLI_C {
        bail!("ds18b20 reported power-on value");
    }
    Ok(milli as f64 / 1000.0)
}

/// First DS18B20 under `devices_dir`, sorted by id for stable selection.
pub fn find_device(devices_dir: &Path) -> Result<PathBuf> {
    let mut ids: Vec<PathBuf> = fs::read_dir(devices_dir)
        .with_context(|| format!("cannot list {}", devices_dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(FAMILY_PREFIX))
        })
        .collect();
    ids.sort();
    ids.into_iter()
        .next()
        .map(|p| p.join("w1_slave"))
        .ok_or_else(|| anyhow!("no ds18b20 found in {}", devices_dir.display()))
}

pub struct Ds18b20 {
    path: PathBuf,
}

impl Ds18b20 {
    pub fn discover(devices_dir: &Path) -> Result<Self> {
        let path = find_device(devices_dir)?;
        tracing::info!(path = %path.display(), "ds18b20 found");
        Ok(Self { path })
    }

    pub fn read(&self) -> Result<f64> {
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("cannot read {}", self.path.display()))?;
        parse_w1_slave(&contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str = "72 01 4b 46 7f ff 0e 10 57 : crc=57 YES\n\
                        72 01 4b 46 7f ff 0e 10 57 t=23125\n";

    #[test]
    fn parse_good_reading() {
        assert_eq!(parse_w1_slave(GOOD).unwrap(), 23.125);
    }

    #[test]
    fn parse_negative_reading() {
        let s = "ff ff : crc=aa YES\nff ff t=-1250\n";
        assert_eq!(parse_w1_slave(s).unwrap(), -1.25);
    }

    #[test]
    fn parse_rejects_crc_failure() {
        let s = "72 01 : crc=57 NO\n72 01 t=23125\n";
        assert!(parse_w1_slave(s).is_err());
    }

    #[test]
    fn parse_rejects_power_on_value() {
        let s = "50 05 : crc=aa YES\n50 05 t=85000\n";
        assert!(parse_w1_slave(s).is_err());
    }

    #[test]
    fn parse_rejects_truncated() {
        assert!(parse_w1_slave("").is_err());
        assert!(parse_w1_slave("aa : crc=aa YES\n").is_err());
        assert!(parse_w1_slave("aa : crc=aa YES\naa t=\n").is_err());
    }

    #[test]
    fn discover_and_read_from_sysfs_layout() {
        let root = std::env::temp_dir().join(format!("w1-test-{}", std::process::id()));
        let dev = root.join("28-0000075a3c21");
        fs::create_dir_all(&dev).unwrap();
        fs::create_dir_all(root.join("w1_bus_master1")).unwrap();
        fs::write(dev.join("w1_slave"), GOOD).unwrap();

        let probe = Ds18b20::discover(&root).unwrap();
        assert_eq!(probe.read().unwrap(), 23.125);

        fs::remove_dir_all(&root).unwrap();
    }

    #[test]
    fn discover_without_probe_fails() {
        let root = std::env::temp_dir().join(format!("w1-empty-{}", std::process::id()));
        fs::create_dir_all(&root).unwrap();
        assert!(Ds18b20::discover(&root).is_err());
        fs::remove_dir_all(&root).unwrap();
    }
}
