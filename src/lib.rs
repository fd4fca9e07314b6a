//! Core library for the bluefly fly scanning system.
//!
//! Devices here are built from asynchronous [`signal`]s and expose the
//! synchronous, [`Status`]-returning interface a scan orchestrator drives:
//! step scannable motors and detectors, and a [`FlyDevice`] that runs a whole
//! trajectory scan on a PMAC while area detectors collect frames.
//!
//! Every signal can be backed by the in-memory [`signal::sim::SimProvider`],
//! and [`sim`] attaches simulated hardware behaviour to it, so the full stack
//! runs without a control system.

pub mod areadetector;
pub mod config;
pub mod detector;
pub mod device;
pub mod error;
pub mod fly;
pub mod motor;
pub mod pmac;
pub mod points;
pub mod signal;
pub mod sim;
pub mod status;
pub mod tracing_setup;

pub use config::FlyConfig;
pub use detector::DetectorDevice;
pub use device::{Device, Flyable, Movable, Readable};
pub use error::{FlyError, FlyResult};
pub use fly::FlyDevice;
pub use motor::MotorDevice;
pub use points::{CompoundGenerator, LineGenerator};
pub use status::Status;
