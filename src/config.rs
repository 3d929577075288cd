//! TOML configuration for chambercycle.
//!
//! Every section has compiled-in defaults matching the reference bench
//! (Watlow F4T chamber, two CRAM reliability replicas, Denkovi relays), so a
//! partial file only needs to name what differs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "CHAMBERCYCLE_CONFIG";

/// Standard system location for the config file.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/chambercycle/chambercycle.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration for a harness session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarnessConfig {
    #[serde(default)]
    pub chamber: ChamberConfig,
    #[serde(default)]
    pub plan: PlanConfig,
    #[serde(default)]
    pub stabilization: StabilizationConfig,
    #[serde(default)]
    pub workload: WorkloadConfig,
    #[serde(default)]
    pub power: PowerConfig,
    #[serde(default)]
    pub results: ResultsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl HarnessConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded harness configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path in `CHAMBERCYCLE_CONFIG`.
    /// 2. `/etc/chambercycle/chambercycle.toml`.
    /// 3. Compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "CHAMBERCYCLE_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let plan = &self.plan;
        if !(plan.low_setpoint < plan.high_setpoint) {
            return Err(invalid(
                "plan.low_setpoint",
                format!(
                    "low bound {} must be below high bound {}",
                    plan.low_setpoint, plan.high_setpoint
                ),
            ));
        }
        let in_bounds = |v: f64| v >= plan.low_setpoint && v <= plan.high_setpoint;
        if !in_bounds(plan.rest_setpoint) {
            return Err(invalid(
                "plan.rest_setpoint",
                format!(
                    "{} is outside [{}, {}]",
                    plan.rest_setpoint, plan.low_setpoint, plan.high_setpoint
                ),
            ));
        }
        if let Some(setpoint) = plan.precondition_setpoint {
            if !in_bounds(setpoint) {
                return Err(invalid(
                    "plan.precondition_setpoint",
                    format!(
                        "{} is outside [{}, {}]",
                        setpoint, plan.low_setpoint, plan.high_setpoint
                    ),
                ));
            }
        }
        if let Some(ramp) = &plan.ramp {
            if !(ramp.step > 0.0) {
                return Err(invalid("plan.ramp.step", "must be greater than zero"));
            }
        }

        let sim = &self.chamber.simulated;
        if !sim.ambient.is_finite() {
            return Err(invalid("chamber.simulated.ambient", "must be a finite temperature"));
        }
        if !sim.ramp_per_sample.is_finite() {
            return Err(invalid("chamber.simulated.ramp_per_sample", "must be finite"));
        }
        if !sim.noise.is_finite() || sim.noise < 0.0 {
            return Err(invalid(
                "chamber.simulated.noise",
                format!("{} is not a non-negative amplitude", sim.noise),
            ));
        }

        let stab = &self.stabilization;
        if !(stab.compare_band > 0.0) || !stab.compare_band.is_finite() {
            return Err(invalid(
                "stabilization.compare_band",
                format!("{} is not a positive tolerance", stab.compare_band),
            ));
        }
        if stab.max_polls == 0 {
            return Err(invalid("stabilization.max_polls", "must allow at least one poll"));
        }

        let wl = &self.workload;
        if wl.replicas == 0 {
            return Err(invalid("workload.replicas", "at least one replica is required"));
        }
        if wl.executable.as_os_str().is_empty() {
            return Err(invalid("workload.executable", "must not be empty"));
        }
        if wl.tc_tolerance < 0.0 {
            return Err(invalid("workload.tc_tolerance", "must not be negative"));
        }

        let power = &self.power;
        if power.cycles_per_setpoint > 0
            && (power.off_commands.is_empty() || power.on_commands.is_empty())
        {
            return Err(invalid(
                "power.cycles_per_setpoint",
                "power cycling needs both off_commands and on_commands",
            ));
        }

        if self.results.extensions.is_empty() {
            return Err(invalid("results.extensions", "at least one extension is required"));
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Chamber
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChamberBackend {
    /// Watlow F4T controller over Modbus/TCP.
    WatlowF4t,
    /// In-process first-order model, for dry runs.
    Simulated,
}

/// Order of the two 16-bit registers holding a 32-bit float.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WordOrder {
    LowFirst,
    HighFirst,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChamberConfig {
    pub backend: ChamberBackend,
    /// `host:port` of the controller's Modbus/TCP server.
    pub address: String,
    pub unit_id: u8,
    /// Per-request connect/read/write timeout.
    pub io_timeout_sec: u64,
    pub word_order: WordOrder,
    pub registers: RegisterMap,
    pub simulated: SimulatedConfig,
}

impl Default for ChamberConfig {
    fn default() -> Self {
        Self {
            backend: ChamberBackend::WatlowF4t,
            address: "192.168.9.10:502".to_string(),
            unit_id: 1,
            io_timeout_sec: 5,
            word_order: WordOrder::LowFirst,
            registers: RegisterMap::default(),
            simulated: SimulatedConfig::default(),
        }
    }
}

impl ChamberConfig {
    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_sec)
    }
}

/// Holding-register addresses on the controller. The defaults target loop 1
/// of an F4T; check them against the controller's own Modbus map.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegisterMap {
    /// Loop 1 closed-loop set point (float, two registers).
    pub setpoint: u16,
    /// Loop 1 air process value (float, two registers).
    pub process_value: u16,
    /// Event output enabling conditioning (single enumerated register).
    pub conditioning: u16,
    pub conditioning_on: u16,
    pub conditioning_off: u16,
}

impl Default for RegisterMap {
    fn default() -> Self {
        Self {
            setpoint: 2782,
            process_value: 2820,
            conditioning: 2064,
            conditioning_on: 63,
            conditioning_off: 62,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatedConfig {
    /// Starting air temperature.
    pub ambient: f64,
    /// Maximum movement toward the target per sample while conditioning.
    pub ramp_per_sample: f64,
    /// Peak amplitude of uniform measurement noise.
    pub noise: f64,
    pub seed: u64,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        Self {
            ambient: 22.0,
            ramp_per_sample: 2.0,
            noise: 0.05,
            seed: 7,
        }
    }
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlanConfig {
    /// Literal setpoint sequence, terminated by `sentinel`. Ignored when
    /// `ramp` is present.
    pub setpoints: Vec<f64>,
    pub sentinel: f64,
    pub ramp: Option<RampConfig>,
    pub low_setpoint: f64,
    pub high_setpoint: f64,
    /// Where the chamber is parked once the plan ends.
    pub rest_setpoint: f64,
    /// Optional setpoint reached and stabilized before the plan starts.
    pub precondition_setpoint: Option<f64>,
    /// Thermal soak time at each plateau.
    pub dwell_sec: u64,
}

impl Default for PlanConfig {
    fn default() -> Self {
        Self {
            setpoints: vec![50.0, 20.0, 45.0, 40.0, 35.0, 30.0, 25.0, 0.0],
            sentinel: 0.0,
            ramp: None,
            low_setpoint: 20.0,
            high_setpoint: 60.0,
            rest_setpoint: 25.0,
            precondition_setpoint: None,
            dwell_sec: 20 * 60,
        }
    }
}

impl PlanConfig {
    pub fn dwell(&self) -> Duration {
        Duration::from_secs(self.dwell_sec)
    }
}

/// Evenly spaced setpoints from `start` to `end` inclusive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RampConfig {
    pub start: f64,
    pub end: f64,
    pub step: f64,
}

// ---------------------------------------------------------------------------
// Stabilization
// ---------------------------------------------------------------------------

/// What to do when the chamber never enters the compare band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Log, record the timeout, and soak anyway.
    Continue,
    /// Stop the session.
    Abort,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StabilizationConfig {
    /// Half-width of the band the air reading must fall into.
    pub compare_band: f64,
    pub poll_interval_sec: u64,
    /// Upper bound on samples per setpoint; `max_polls * poll_interval_sec`
    /// is the longest a single wait can take.
    pub max_polls: u32,
    pub on_timeout: TimeoutPolicy,
}

impl Default for StabilizationConfig {
    fn default() -> Self {
        Self {
            compare_band: 0.3,
            poll_interval_sec: 10,
            max_polls: 30,
            on_timeout: TimeoutPolicy::Continue,
        }
    }
}

impl StabilizationConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_sec)
    }
}

// ---------------------------------------------------------------------------
// Workload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadConfig {
    pub executable: PathBuf,
    /// Argument template. Recognized placeholders: `{duration_sec}`,
    /// `{setpoint}`, `{upper_bound}`, `{lower_bound}`, `{replica}`.
    pub args: Vec<String>,
    pub replicas: usize,
    /// Length of the primary I/O burst at each plateau.
    pub duration_sec: u64,
    /// Extra time granted past the burst length before replicas are
    /// considered unresponsive.
    pub safety_margin_sec: u64,
    pub launch_stagger_sec: u64,
    /// Thermocouple tolerance passed to the workload as `setpoint ± tol`.
    pub tc_tolerance: f64,
    pub working_dir: PathBuf,
    /// Write each replica's stdout/stderr to `replica<N>.log`.
    pub capture_output: bool,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        let args = [
            "--exec-period-seconds",
            "{duration_sec}",
            "-i",
            "i8254:{replica}",
            "-e",
            "../eni/CRAM_rim_event_status_11-11.xml",
            "-s",
            "1000",
            "--tc-upper-bound",
            "{upper_bound}",
            "--tc-lower-bound",
            "{lower_bound}",
        ];
        Self {
            executable: PathBuf::from("../bin/CRAM_reliability"),
            args: args.iter().map(|a| a.to_string()).collect(),
            replicas: 2,
            duration_sec: 15 * 60,
            safety_margin_sec: 15,
            launch_stagger_sec: 3,
            tc_tolerance: 20.0,
            working_dir: PathBuf::from("."),
            capture_output: true,
        }
    }
}

impl WorkloadConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_sec)
    }

    pub fn safety_margin(&self) -> Duration {
        Duration::from_secs(self.safety_margin_sec)
    }

    pub fn launch_stagger(&self) -> Duration {
        Duration::from_secs(self.launch_stagger_sec)
    }
}

// ---------------------------------------------------------------------------
// Power
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerConfig {
    /// Power cycles after the primary burst at each plateau. 0 disables the
    /// power phase.
    pub cycles_per_setpoint: u32,
    /// I/O burst length after each power cycle.
    pub post_cycle_duration_sec: u64,
    /// Shell used to run relay commands (`<shell> -c <command>`).
    pub shell: String,
    pub off_commands: Vec<String>,
    pub on_commands: Vec<String>,
    pub off_settle_sec: u64,
    /// DUT boot time after power returns.
    pub on_settle_sec: u64,
}

impl Default for PowerConfig {
    fn default() -> Self {
        Self {
            cycles_per_setpoint: 0,
            post_cycle_duration_sec: 15,
            shell: "sh".to_string(),
            off_commands: Vec::new(),
            on_commands: Vec::new(),
            off_settle_sec: 10,
            on_settle_sec: 25,
        }
    }
}

impl PowerConfig {
    pub fn post_cycle_duration(&self) -> Duration {
        Duration::from_secs(self.post_cycle_duration_sec)
    }

    pub fn off_settle(&self) -> Duration {
        Duration::from_secs(self.off_settle_sec)
    }

    pub fn on_settle(&self) -> Duration {
        Duration::from_secs(self.on_settle_sec)
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResultsConfig {
    /// Directory the workload writes its result files into.
    pub source_dir: PathBuf,
    /// Parent of the per-run artifact directories.
    pub destination_root: PathBuf,
    /// File extensions (without the dot) relocated into each run directory.
    pub extensions: Vec<String>,
    /// Append-only JSON-lines journal. `None` disables it.
    pub journal_path: Option<PathBuf>,
}

impl Default for ResultsConfig {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::from("."),
            destination_root: PathBuf::from("results"),
            extensions: vec!["csv".to_string()],
            journal_path: Some(PathBuf::from("results/journal.jsonl")),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON log lines instead of human-readable text.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let cfg = HarnessConfig::default();

        assert_eq!(cfg.chamber.backend, ChamberBackend::WatlowF4t);
        assert_eq!(cfg.chamber.address, "192.168.9.10:502");
        assert_eq!(cfg.chamber.word_order, WordOrder::LowFirst);

        assert_eq!(cfg.plan.setpoints.last(), Some(&0.0));
        assert_eq!(cfg.plan.sentinel, 0.0);
        assert_eq!(cfg.plan.rest_setpoint, 25.0);
        assert_eq!(cfg.plan.dwell(), Duration::from_secs(1200));

        assert!((cfg.stabilization.compare_band - 0.3).abs() < f64::EPSILON);
        assert_eq!(cfg.stabilization.max_polls, 30);
        assert_eq!(cfg.stabilization.on_timeout, TimeoutPolicy::Continue);

        assert_eq!(cfg.workload.replicas, 2);
        assert_eq!(cfg.workload.duration(), Duration::from_secs(900));
        assert_eq!(cfg.workload.safety_margin(), Duration::from_secs(15));
        assert!(cfg.workload.args.iter().any(|a| a.contains("{replica}")));

        assert_eq!(cfg.power.cycles_per_setpoint, 0);
        assert_eq!(cfg.power.off_settle(), Duration::from_secs(10));
        assert_eq!(cfg.power.on_settle(), Duration::from_secs(25));

        assert_eq!(cfg.results.extensions, vec!["csv".to_string()]);
        assert_eq!(cfg.logging.level, "info");

        cfg.validate().unwrap();
    }

    #[test]
    fn test_parse_example_toml() {
        let toml_str = r#"
[chamber]
backend = "simulated"
address = "10.0.0.5:502"
word_order = "high_first"

[chamber.simulated]
ambient = 18.0
ramp_per_sample = 1.5

[plan]
sentinel = -999.0
low_setpoint = 0.0
high_setpoint = 85.0
precondition_setpoint = 37.5
dwell_sec = 600

[plan.ramp]
start = 0.0
end = 55.0
step = 5.0

[stabilization]
compare_band = 0.5
poll_interval_sec = 5
max_polls = 60
on_timeout = "abort"

[workload]
executable = "/opt/dut/bin/io_check"
args = ["-t", "{duration_sec}"]
replicas = 4

[power]
cycles_per_setpoint = 2
off_commands = ["relay 1 off"]
on_commands = ["relay 1 on"]
on_settle_sec = 30

[results]
destination_root = "/data/runs"
extensions = ["csv", "log"]

[logging]
level = "debug"
json = true
"#;

        let cfg: HarnessConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(cfg.chamber.backend, ChamberBackend::Simulated);
        assert_eq!(cfg.chamber.address, "10.0.0.5:502");
        assert_eq!(cfg.chamber.word_order, WordOrder::HighFirst);
        assert_eq!(cfg.chamber.simulated.ambient, 18.0);
        assert_eq!(cfg.plan.sentinel, -999.0);
        assert_eq!(cfg.plan.precondition_setpoint, Some(37.5));
        let ramp = cfg.plan.ramp.as_ref().unwrap();
        assert_eq!(ramp.step, 5.0);
        assert_eq!(cfg.stabilization.on_timeout, TimeoutPolicy::Abort);
        assert_eq!(cfg.stabilization.max_polls, 60);
        assert_eq!(cfg.workload.executable, PathBuf::from("/opt/dut/bin/io_check"));
        assert_eq!(cfg.workload.replicas, 4);
        // Unset fields keep their defaults.
        assert_eq!(cfg.workload.safety_margin_sec, 15);
        assert_eq!(cfg.power.cycles_per_setpoint, 2);
        assert_eq!(cfg.power.off_settle_sec, 10);
        assert_eq!(cfg.power.on_settle_sec, 30);
        assert_eq!(cfg.results.destination_root, PathBuf::from("/data/runs"));
        assert!(cfg.logging.json);

        cfg.validate().unwrap();
    }

    #[test]
    fn test_empty_toml_uses_all_defaults() {
        let cfg: HarnessConfig = toml::from_str("").unwrap();
        let defaults = HarnessConfig::default();

        assert_eq!(cfg.chamber.address, defaults.chamber.address);
        assert_eq!(cfg.plan.setpoints, defaults.plan.setpoints);
        assert_eq!(cfg.workload.args, defaults.workload.args);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("chambercycle.toml");
        std::fs::write(
            &path,
            r#"
[plan]
setpoints = [30.0, 0.0]
dwell_sec = 1
"#,
        )
        .unwrap();

        let cfg = HarnessConfig::load(&path).unwrap();
        assert_eq!(cfg.plan.setpoints, vec![30.0, 0.0]);
        assert_eq!(cfg.plan.dwell_sec, 1);
    }

    #[test]
    fn test_load_missing_file_errors() {
        let result = HarnessConfig::load(Path::new("/nonexistent/path/chambercycle.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_non_positive_band() {
        let mut cfg = HarnessConfig::default();
        cfg.stabilization.compare_band = 0.0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("stabilization.compare_band"));
    }

    #[test]
    fn test_validate_rejects_zero_polls_and_replicas() {
        let mut cfg = HarnessConfig::default();
        cfg.stabilization.max_polls = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = HarnessConfig::default();
        cfg.workload.replicas = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_power_cycles_need_commands() {
        let mut cfg = HarnessConfig::default();
        cfg.power.cycles_per_setpoint = 1;
        cfg.power.off_commands = vec!["relay off".into()];
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("on_commands"));

        cfg.power.on_commands = vec!["relay on".into()];
        cfg.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_inverted_bounds() {
        let mut cfg = HarnessConfig::default();
        cfg.plan.low_setpoint = 60.0;
        cfg.plan.high_setpoint = 20.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_validate_rest_and_precondition_within_bounds() {
        let mut cfg = HarnessConfig::default();
        cfg.plan.precondition_setpoint = Some(150.0);
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("precondition_setpoint"));

        let mut cfg = HarnessConfig::default();
        cfg.plan.rest_setpoint = -80.0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("rest_setpoint"));

        let mut cfg = HarnessConfig::default();
        cfg.plan.rest_setpoint = f64::NAN;
        assert!(cfg.validate().is_err());

        let mut cfg = HarnessConfig::default();
        cfg.plan.precondition_setpoint = Some(60.0);
        cfg.plan.rest_setpoint = 20.0;
        cfg.validate().unwrap();
    }

    #[test]
    fn test_validate_simulated_noise() {
        let mut cfg = HarnessConfig::default();
        cfg.chamber.simulated.noise = f64::NAN;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("noise"));

        let mut cfg = HarnessConfig::default();
        cfg.chamber.simulated.noise = -0.1;
        assert!(cfg.validate().is_err());

        let mut cfg = HarnessConfig::default();
        cfg.chamber.simulated.ramp_per_sample = f64::INFINITY;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let cfg = HarnessConfig::default();
        let toml_str = toml::to_string_pretty(&cfg).unwrap();
        let roundtripped: HarnessConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(cfg.chamber.address, roundtripped.chamber.address);
        assert_eq!(cfg.plan.setpoints, roundtripped.plan.setpoints);
        assert_eq!(cfg.power.on_settle_sec, roundtripped.power.on_settle_sec);
    }
}
