//! PI speed controller.
//!
//! One step per application cycle: drive own speed toward the lead
//! vehicle's speed with a proportional-integral law. The integral term
//! is clamped for anti-windup, and the commanded speed change is
//! clamped to the calibrated acceleration and deceleration limits.

/// Anti-windup bound on the accumulated integral error.
pub const INTEGRAL_LIMIT: f64 = 20.0;

/// Inputs to one controller step, as read from NVRAM.
#[derive(Debug, Clone, Copy)]
pub struct CycleInputs {
    pub lead_speed: f64,
    pub own_speed: f64,
    pub kp: f64,
    pub ki: f64,
    /// Maximum speed increase per cycle (positive).
    pub max_accel: f64,
    /// Maximum speed decrease per cycle (positive).
    pub max_decel: f64,
}

/// Result of one controller step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CycleOutcome {
    /// New own speed, floored at zero.
    pub own_speed: f64,
    /// Integral error to carry into the next cycle.
    pub integral_error: f64,
    /// The applied (already clamped) speed change.
    pub speed_change: f64,
}

/// Run one PI step.
pub fn control_step(inputs: &CycleInputs, integral_error: f64) -> CycleOutcome {
    let error = inputs.lead_speed - inputs.own_speed;

    let integral_error = (integral_error + error).clamp(-INTEGRAL_LIMIT, INTEGRAL_LIMIT);

    let control_output = inputs.kp * error + inputs.ki * integral_error;
    let speed_change = control_output.clamp(-inputs.max_decel, inputs.max_accel);

    let own_speed = (inputs.own_speed + speed_change).max(0.0);

    CycleOutcome {
        own_speed,
        integral_error,
        speed_change,
    }
}
