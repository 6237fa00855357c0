//! Beta schedules for the full-length training process.

use crate::config::NoiseSchedule;

/// Betas for `num_timesteps` training steps under the named schedule.
pub fn named_beta_schedule(schedule: NoiseSchedule, num_timesteps: usize) -> Vec<f64> {
    match schedule {
        NoiseSchedule::Linear => linear_beta_schedule(num_timesteps),
        NoiseSchedule::Cosine => cosine_beta_schedule(num_timesteps),
    }
}

/// Linear schedule, scaled so it keeps working for step counts other than 1000.
fn linear_beta_schedule(num_timesteps: usize) -> Vec<f64> {
    let scale = 1000.0 / num_timesteps as f64;
    let beta_start = scale * 0.0001;
    let beta_end = scale * 0.02;
    if num_timesteps == 1 {
        return vec![beta_start];
    }
    (0..num_timesteps)
        .map(|i| beta_start + (beta_end - beta_start) * (i as f64) / (num_timesteps as f64 - 1.0))
        .collect()
}

fn cosine_beta_schedule(num_timesteps: usize) -> Vec<f64> {
    let max_beta = 0.999;
    let alpha_bar =
        |t: f64| f64::cos((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).powi(2);
    (0..num_timesteps)
        .map(|i| {
            let t1 = i as f64 / num_timesteps as f64;
            let t2 = (i + 1) as f64 / num_timesteps as f64;
            (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(max_beta)
        })
        .collect()
}
