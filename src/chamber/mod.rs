//! Environmental chamber facade.
//!
//! The harness only ever needs three things from a chamber: move the target,
//! switch conditioning, and read the air temperature. Everything behind that
//! (the controller's own PID loop, ramp rates, alarms) is the vendor's.

pub mod modbus;
pub mod simulated;

use serde::Serialize;
use thiserror::Error;

use crate::config::{ChamberBackend, ChamberConfig};

pub use modbus::WatlowF4t;
pub use simulated::SimulatedChamber;

#[derive(Debug, Error)]
pub enum ChamberError {
    #[error("failed to connect to chamber at {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("chamber I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("chamber did not answer {operation} within {timeout_sec}s")]
    Timeout {
        operation: &'static str,
        timeout_sec: u64,
    },

    #[error("controller rejected function 0x{function:02x} with exception code {code}")]
    Exception { function: u8, code: u8 },

    #[error("malformed controller response: {0}")]
    Protocol(String),
}

/// One sample of the chamber's process values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProcessReading {
    /// Air temperature in degrees Celsius.
    pub air: f64,
}

/// Synchronous-in-spirit chamber control. Each call completes before the
/// harness moves on; implementations may be slow.
#[async_trait::async_trait]
pub trait ChamberController: Send {
    /// Change the loop setpoint.
    async fn set_target(&mut self, value: f64) -> Result<(), ChamberError>;

    /// Enable conditioning so the chamber drives toward the setpoint.
    async fn start_conditioning(&mut self) -> Result<(), ChamberError>;

    /// Disable conditioning; the chamber drifts toward ambient.
    async fn stop_conditioning(&mut self) -> Result<(), ChamberError>;

    /// Read the current process value.
    async fn sample(&mut self) -> Result<ProcessReading, ChamberError>;
}

/// Build the chamber backend named in the configuration. `force_simulated`
/// overrides the configured backend (used by `run --simulate`).
pub async fn connect(
    config: &ChamberConfig,
    force_simulated: bool,
) -> Result<Box<dyn ChamberController>, ChamberError> {
    let backend = if force_simulated {
        ChamberBackend::Simulated
    } else {
        config.backend
    };

    match backend {
        ChamberBackend::WatlowF4t => {
            let chamber = WatlowF4t::connect(config).await?;
            Ok(Box::new(chamber))
        }
        ChamberBackend::Simulated => {
            tracing::info!(ambient = config.simulated.ambient, "using simulated chamber");
            Ok(Box::new(SimulatedChamber::from_config(&config.simulated)))
        }
    }
}
