//! Runtime settings.
//!
//! Defaults are compiled in from [`crate::consts`]; a TOML file may overlay
//! any subset of fields. Every load path runs the same validation, so a
//! bad overlay is rejected before any subsystem sees it.

use std::net::Ipv4Addr;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::axis::N_AXIS;
use crate::consts;

/// CLI transport selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommMode {
    /// Line-oriented stdin/stdout.
    Console,
    /// TCP socket, single client.
    Socket,
}

/// CLI behaviour settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CliSettings {
    /// Transport for commands and reports.
    pub comm_mode: CommMode,
    /// Address to listen on in socket mode.
    pub listen_ip: Ipv4Addr,
    /// Port to listen on in socket mode.
    pub listen_port: u16,
    /// Request a cycle start automatically when the planner ring fills.
    pub auto_cycle: bool,
    /// Execute each accepted line immediately (manual data input mode).
    pub mdi_mode: bool,
    /// Report positions in inches instead of millimeters.
    pub report_inches: bool,
}

impl Default for CliSettings {
    fn default() -> Self {
        Self {
            comm_mode: CommMode::Console,
            listen_ip: Ipv4Addr::LOCALHOST,
            listen_port: 51401,
            auto_cycle: true,
            mdi_mode: true,
            report_inches: false,
        }
    }
}

/// Machine settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub cli: CliSettings,

    /// Scale laser power with actual speed during rate-adjusted motion.
    pub laser_power_correction: bool,
    /// Reject targets outside the machine envelope.
    pub soft_limits: bool,

    /// Steps per millimeter per axis.
    pub steps_per_mm: [f32; N_AXIS],
    /// Acceleration per axis [mm/min^2].
    pub acceleration: [f32; N_AXIS],
    /// Maximum rate per axis [mm/min].
    pub max_rate: [f32; N_AXIS],
    /// Maximum travel per axis [mm], signed toward machine space.
    pub max_travel: [f32; N_AXIS],

    /// Corner-speed deviation radius [mm].
    pub junction_deviation: f32,
    /// Arc chordal tolerance [mm].
    pub arc_tolerance: f32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cli: CliSettings::default(),
            laser_power_correction: true,
            soft_limits: true,
            steps_per_mm: [
                consts::steps_per_mm(0),
                consts::steps_per_mm(1),
                consts::steps_per_mm(2),
            ],
            acceleration: consts::ACCELERATION,
            max_rate: consts::MAX_RATE,
            // Stored signed toward machine space; X and Z run negative, Y positive.
            max_travel: [
                -consts::MAX_TRAVEL[0],
                -consts::MAX_TRAVEL[1],
                -consts::MAX_TRAVEL[2],
            ],
            junction_deviation: consts::JUNCTION_DEVIATION,
            arc_tolerance: consts::ARC_TOLERANCE,
        }
    }
}

/// Settings loading/validation error.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("settings parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("settings validation: {0}")]
    Validation(String),
}

impl Settings {
    /// Load settings, overlaying an optional TOML file on the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        let settings = match path {
            None => Self::default(),
            Some(p) => {
                let text = std::fs::read_to_string(p).map_err(|source| SettingsError::Io {
                    path: p.display().to_string(),
                    source,
                })?;
                toml::from_str(&text)?
            }
        };
        settings.validate()?;
        Ok(settings)
    }

    /// Bounds-check every kinematic parameter.
    pub fn validate(&self) -> Result<(), SettingsError> {
        for idx in 0..N_AXIS {
            if !(self.steps_per_mm[idx] > 0.0) {
                return Err(SettingsError::Validation(format!(
                    "steps_per_mm[{idx}] must be positive"
                )));
            }
            if !(self.acceleration[idx] > 0.0) {
                return Err(SettingsError::Validation(format!(
                    "acceleration[{idx}] must be positive"
                )));
            }
            if !(self.max_rate[idx] > 0.0) {
                return Err(SettingsError::Validation(format!(
                    "max_rate[{idx}] must be positive"
                )));
            }
        }
        if !(self.junction_deviation > 0.0) {
            return Err(SettingsError::Validation(
                "junction_deviation must be positive".into(),
            ));
        }
        if !(self.arc_tolerance > 0.0) {
            return Err(SettingsError::Validation(
                "arc_tolerance must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_validate() {
        Settings::default().validate().unwrap();
    }

    #[test]
    fn overlay_keeps_unmentioned_fields() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "junction_deviation = 0.02\n[cli]\nmdi_mode = false\nlisten_port = 9000"
        )
        .unwrap();

        let s = Settings::load(Some(file.path())).unwrap();
        assert_eq!(s.junction_deviation, 0.02);
        assert!(!s.cli.mdi_mode);
        assert_eq!(s.cli.listen_port, 9000);
        // Untouched fields keep their compiled defaults.
        assert_eq!(s.max_rate, consts::MAX_RATE);
        assert!(s.cli.auto_cycle);
    }

    #[test]
    fn bad_overlay_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "arc_tolerance = -1.0").unwrap();
        assert!(matches!(
            Settings::load(Some(file.path())),
            Err(SettingsError::Validation(_))
        ));
    }
}
