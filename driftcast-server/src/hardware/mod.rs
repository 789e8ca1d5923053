//! Hardware probing, load sampling, and admission control.

pub mod admission;
pub mod monitor;
pub mod profile;

pub use admission::AdmissionController;
pub use monitor::LoadMonitor;
pub use profile::{HardwareProfiler, ProbeError};
