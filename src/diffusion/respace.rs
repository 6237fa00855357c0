//! Timestep respacing: picking which of the training timesteps are kept for
//! sampling.

use std::collections::BTreeSet;

use crate::error::{EggError, Result};

/// Timesteps of a `num_timesteps`-step process to keep, in increasing order.
///
/// `spacing` is either
/// - empty: keep every step,
/// - `"ddimN"`: the evenly strided set `0, s, 2s, ...` with exactly `N` entries,
/// - a comma-separated list of section counts, e.g. `"50"` or `"10,15,20"`:
///   the process is split into that many equal sections and each section is
///   sampled with the given number of evenly spaced steps.
pub fn space_timesteps(num_timesteps: usize, spacing: &str) -> Result<Vec<usize>> {
    let spacing = spacing.trim();
    let invalid = |reason: String| EggError::InvalidRespacing {
        spacing: spacing.to_string(),
        reason,
    };

    if spacing.is_empty() {
        return Ok((0..num_timesteps).collect());
    }

    if let Some(count) = spacing.strip_prefix("ddim") {
        let desired: usize = count
            .trim()
            .parse()
            .map_err(|_| invalid(format!("`{}` is not a step count", count)))?;
        for stride in 1..num_timesteps {
            if num_timesteps.div_ceil(stride) == desired {
                return Ok((0..num_timesteps).step_by(stride).collect());
            }
        }
        return Err(invalid(format!(
            "cannot create exactly {} steps with an integer stride",
            desired
        )));
    }

    let section_counts = spacing
        .split(',')
        .map(|s| {
            s.trim()
                .parse::<usize>()
                .map_err(|_| invalid(format!("`{}` is not a step count", s.trim())))
        })
        .collect::<Result<Vec<_>>>()?;

    let size_per = num_timesteps / section_counts.len();
    let extra = num_timesteps % section_counts.len();
    let mut start_idx = 0;
    let mut all_steps = BTreeSet::new();
    for (i, &section_count) in section_counts.iter().enumerate() {
        let size = size_per + usize::from(i < extra);
        if size < section_count {
            return Err(invalid(format!(
                "cannot divide section of {} steps into {}",
                size, section_count
            )));
        }
        let frac_stride = if section_count <= 1 {
            1.0
        } else {
            (size - 1) as f64 / (section_count - 1) as f64
        };
        let mut cur_idx = 0.0f64;
        for _ in 0..section_count {
            // round half to even, matching how the pretrained schedules were built
            all_steps.insert(start_idx + cur_idx.round_ties_even() as usize);
            cur_idx += frac_stride;
        }
        start_idx += size;
    }
    Ok(all_steps.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_section() {
        let steps = space_timesteps(1000, "50").unwrap();
        assert_eq!(steps.len(), 50);
        assert_eq!(steps[0], 0);
        assert_eq!(*steps.last().unwrap(), 999);
        assert!(steps.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn ties_round_to_even() {
        // stride 2.5: 0, 2.5, 5, 7.5, 10 -> 0, 2, 5, 8, 10
        assert_eq!(space_timesteps(11, "5").unwrap(), vec![0, 2, 5, 8, 10]);
    }

    #[test]
    fn multiple_sections() {
        let steps = space_timesteps(300, "10,15,20").unwrap();
        assert_eq!(steps.len(), 45);
        assert_eq!(steps.iter().filter(|&&s| s < 100).count(), 10);
        assert_eq!(steps.iter().filter(|&&s| (100..200).contains(&s)).count(), 15);
        assert_eq!(steps.iter().filter(|&&s| s >= 200).count(), 20);
    }

    #[test]
    fn ddim_stride() {
        let steps = space_timesteps(1000, "ddim50").unwrap();
        assert_eq!(steps.len(), 50);
        assert_eq!(steps[1], 20);
        assert!(space_timesteps(10, "ddim7").is_err());
    }

    #[test]
    fn empty_keeps_everything() {
        assert_eq!(space_timesteps(4, "").unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(space_timesteps(10, "20").is_err());
        assert!(space_timesteps(10, "five").is_err());
    }
}
