//! Simulated hardware
//!
//! Each submodule attaches behaviour to the signals of one kind of device
//! made by a [`SimProvider`]. [`SimBeamline`] wires them into a sample table
//! on a PMAC with an Andor camera watching it, enough to run a real fly scan
//! with no hardware.

pub mod areadetector;
pub mod motor;
pub mod pmac;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::areadetector::{AndorLogic, DetectorDriver, HdfWriter};
use crate::config::FlyConfig;
use crate::detector::{CollectTimings, DetectorDevice};
use crate::device::FilenameScheme;
use crate::error::FlyResult;
use crate::fly::{FlyDevice, PmacMasterFlyLogic};
use crate::motor::{MotorDevice, MotorRecord};
use crate::pmac::{PmacCoord, PmacMotor, PmacRawMotor, PmacTrajectory};
use crate::signal::sim::SimProvider;

/// A simulated beamline ready to fly scan `t1x` and `t1y`.
#[derive(Debug)]
pub struct SimBeamline {
    /// Provider holding every simulated signal
    pub provider: SimProvider,
    /// Sample table motors, keyed by name
    pub motors: BTreeMap<String, PmacRawMotor>,
    /// Trajectory scan interface of the PMAC
    pub trajectory: PmacTrajectory,
    /// The only co-ordinate system
    pub cs: PmacCoord,
    /// Sample rotation on a motor record, for step scans
    pub phi: MotorDevice,
    /// Camera, usable in step scans too
    pub andor: DetectorDevice,
    /// Fly scan device over the table and camera
    pub fly: FlyDevice,
}

impl SimBeamline {
    /// Build the beamline with timings and frame size from `config`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: &FlyConfig) -> FlyResult<Self> {
        let p = SimProvider::new();

        let table = [("t1x", "X"), ("t1y", "Y"), ("t1z", "Z")];
        let mut motors = BTreeMap::new();
        let mut by_letter = BTreeMap::new();
        for (name, letter) in table {
            let motor = PmacRawMotor::new(&p, &format!("BLxxI-MO-TABLE-01:{letter}"));
            motors.insert(name.to_string(), motor.clone());
            by_letter.insert(letter.to_string(), motor);
        }

        let cs = PmacCoord::new(&p, "BLxxI-MO-PMAC-01:CS1");
        pmac::sim_coord_logic(&p, &cs, "CS1", &by_letter)?;
        let trajectory = PmacTrajectory::new(&p, "BLxxI-MO-PMAC-01:TRAJ");
        pmac::sim_trajectory_logic(&p, &trajectory, &by_letter)?;

        let phi = MotorRecord::new(&p, "BLxxI-MO-STAGE-01:PHI");
        motor::sim_motor_logic(&p, &phi, &motor::SimMotorSettings::from(&config.sim))?;

        let driver = DetectorDriver::new(&p, "BLxxI-EA-DET-01:DRV");
        let hdf = HdfWriter::new(&p, "BLxxI-EA-DET-01:HDF5");
        areadetector::sim_detector_logic(
            &p,
            &driver,
            &hdf,
            motors["t1x"].axis.readback.clone(),
            motors["t1y"].axis.readback.clone(),
            config.detector.width,
            config.detector.height,
        )?;

        let scheme = Arc::new(FilenameScheme::tmp(config.storage.data_dir.clone()));
        let andor = DetectorDevice::new(
            "andor",
            Arc::new(AndorLogic::new(driver, hdf, &config.detector)),
            scheme.clone(),
            CollectTimings::from(&config.scan),
        );

        let collect_timeout = Duration::from_secs_f64(config.scan.collect_timeout_secs);
        let logic = PmacMasterFlyLogic::new(
            trajectory.clone(),
            motors
                .iter()
                .map(|(name, motor)| (name.clone(), PmacMotor::from(motor.clone())))
                .collect(),
            vec![cs.clone()],
            config.scan.trajectory_batch_size,
            collect_timeout,
        );
        let fly = FlyDevice::new(
            "fly",
            vec![andor.clone()],
            Arc::new(logic),
            scheme,
            collect_timeout,
        )?;
        tracing::info!(signals = p.sources().len(), "Simulated beamline ready");

        Ok(Self {
            provider: p,
            motors,
            trajectory,
            cs,
            phi: MotorDevice::new("phi", phi),
            andor,
            fly,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_beamline_wiring() {
        let beamline = SimBeamline::new(&FlyConfig::default()).unwrap();
        assert_eq!(beamline.motors.len(), 3);
        assert_eq!(
            beamline.motors["t1y"].cs_axis.get().await.unwrap(),
            "Y"
        );
        assert_eq!(beamline.cs.port.get().await.unwrap(), "CS1");
        assert_eq!(
            beamline.trajectory.program_version.get().await.unwrap(),
            2.0
        );
        let sources = beamline.provider.sources();
        assert!(sources.contains(&"BLxxI-EA-DET-01:HDF5.summary".to_string()));
        assert!(sources.contains(&"BLxxI-MO-TABLE-01:Z.readback".to_string()));
    }
}
