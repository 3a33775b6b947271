//! Adaptive cruise-control application module.
//!
//! This crate builds the replaceable artifact the ECU loads each
//! application cycle (`libacc_app.so` / `libacc_app.dylib`). The only
//! ABI between the ECU and the module is a single exported symbol:
//!
//! ```c
//! void run_acc_application(void);
//! ```
//!
//! Each invocation reads its calibration and the current speeds from the
//! NVRAM store, runs one PI-controller step, and writes the new own
//! speed back. The host process treats the module as opaque; a panic in
//! here must never unwind across the FFI boundary.

use parking_lot::Mutex;
use tracing::{error, info};
use vecu_core::nvram::NvramStore;

pub mod controller;

use controller::{control_step, CycleInputs};

/// The store lives next to the simulator binary, same as the module
/// itself.
const NVRAM_PATH: &str = "nvram.dat";

/// Integral state carried between cycles. A fresh module load (e.g.
/// after a hot-swap) starts from zero, exactly like a rebooted ECU.
static INTEGRAL_ERROR: Mutex<f64> = Mutex::new(0.0);

/// Entry point resolved by the ECU's dynamic loader.
#[no_mangle]
pub extern "C" fn run_acc_application() {
    // The module has its own tracing registry; install a subscriber on
    // first use so cycle logs show up alongside the host's.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("acc_app=info")),
        )
        .try_init();

    if std::panic::catch_unwind(run_cycle).is_err() {
        error!("application cycle panicked");
    }
}

fn run_cycle() {
    let nvram = NvramStore::new(NVRAM_PATH);
    if let Err(e) = nvram.load() {
        error!(error = %e, "could not load NVRAM, skipping cycle");
        return;
    }

    let inputs = CycleInputs {
        lead_speed: nvram.get_f64_or("LEAD_VEHICLE_SPEED", 0.0),
        own_speed: nvram.get_f64_or("OWN_VEHICLE_SPEED", 0.0),
        kp: nvram.get_f64_or("ACC_KP", 0.4),
        ki: nvram.get_f64_or("ACC_KI", 0.1),
        max_accel: nvram.get_f64_or("ACC_MAX_ACCEL", 2.0),
        max_decel: nvram.get_f64_or("ACC_MAX_DECEL", 3.0),
    };
    let gap_setting = nvram.get_f64_or("ACC_GAP_SETTING", 2.0);

    let mut integral = INTEGRAL_ERROR.lock();
    let outcome = control_step(&inputs, *integral);
    *integral = outcome.integral_error;
    drop(integral);

    info!(
        lead = inputs.lead_speed,
        own = format!("{:.2}", outcome.own_speed),
        change = format!("{:+.2}", outcome.speed_change),
        gap = gap_setting,
        "cruise control cycle"
    );

    nvram.set("OWN_VEHICLE_SPEED", &outcome.own_speed.to_string());
    if let Err(e) = nvram.save() {
        error!(error = %e, "could not persist NVRAM");
    }
}
