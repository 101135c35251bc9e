use std::sync::Arc;

use anyhow::Result;
use candle_core::Tensor;
use candle_transformers::models::stable_diffusion::{
    ddim::DDIMSchedulerConfig,
    euler_ancestral_discrete::EulerAncestralDiscreteSchedulerConfig,
    schedulers::{Scheduler, SchedulerConfig},
    uni_pc::UniPCSchedulerConfig,
};
use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::seeded_noise;

/// Sampling algorithm used to remove noise across the diffusion steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SchedulerKind {
    #[default]
    #[serde(rename = "DDIM")]
    Ddim,
    #[serde(rename = "EulerA")]
    EulerAncestral,
    #[serde(rename = "UniPC")]
    UniPc,
}

serde_plain::derive_display_from_serialize!(SchedulerKind);
serde_plain::derive_fromstr_from_deserialize!(SchedulerKind);

impl SchedulerKind {
    /// Every selectable scheduler, default first.
    pub const ALL: [SchedulerKind; 3] = [
        SchedulerKind::Ddim,
        SchedulerKind::EulerAncestral,
        SchedulerKind::UniPc,
    ];

    /// Stable Diffusion 1.x defaults (scaled-linear betas, epsilon prediction).
    pub fn config(self) -> Arc<dyn SchedulerConfig> {
        match self {
            SchedulerKind::Ddim => Arc::new(DDIMSchedulerConfig::default()),
            SchedulerKind::EulerAncestral => {
                Arc::new(EulerAncestralDiscreteSchedulerConfig::default())
            }
            SchedulerKind::UniPc => Arc::new(UniPCSchedulerConfig::default()),
        }
    }

    /// A schedule of `steps` steps; `seed` drives any per-step noise.
    ///
    /// Euler ancestral draws its step noise from a host RNG instead of the
    /// device RNG, which cannot be seeded on the CPU.
    pub fn build(self, steps: usize, seed: u64) -> Result<Box<dyn Scheduler>> {
        match self {
            SchedulerKind::EulerAncestral => {
                Ok(Box::new(SeededEulerAncestral::new(steps, seed)?))
            }
            kind => Ok(kind.config().build(steps)?),
        }
    }
}

const TRAIN_TIMESTEPS: usize = 1000;
const BETA_START: f64 = 0.00085;
const BETA_END: f64 = 0.012;
const STEPS_OFFSET: usize = 1;

/// Euler ancestral sampling with "leading" timestep spacing and scaled-linear
/// betas, matching candle's `EulerAncestralDiscreteScheduler` defaults.
#[derive(Debug, Clone)]
pub struct SeededEulerAncestral {
    timesteps: Vec<usize>,
    /// One sigma per timestep, followed by a final zero.
    sigmas: Vec<f64>,
    rng: StdRng,
}

impl SeededEulerAncestral {
    pub fn new(steps: usize, seed: u64) -> Result<Self> {
        if steps == 0 || steps > TRAIN_TIMESTEPS {
            anyhow::bail!("steps must be within 1..={TRAIN_TIMESTEPS}, got {steps}");
        }
        let step_ratio = TRAIN_TIMESTEPS / steps;
        let timesteps: Vec<usize> = (0..steps)
            .map(|s| s * step_ratio + STEPS_OFFSET)
            .rev()
            .collect();

        let (start, end) = (BETA_START.sqrt(), BETA_END.sqrt());
        let delta = (end - start) / (TRAIN_TIMESTEPS - 1) as f64;
        let mut alpha_cumprod = 1.0;
        let train_sigmas: Vec<f64> = (0..TRAIN_TIMESTEPS)
            .map(|i| {
                let beta = (start + i as f64 * delta).powi(2);
                alpha_cumprod *= 1.0 - beta;
                ((1.0 - alpha_cumprod) / alpha_cumprod).sqrt()
            })
            .collect();

        let mut sigmas: Vec<f64> = timesteps
            .iter()
            .map(|&t| train_sigmas[t.min(TRAIN_TIMESTEPS - 1)])
            .collect();
        sigmas.push(0.0);

        Ok(Self {
            timesteps,
            sigmas,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    fn step_index(&self, timestep: usize) -> candle_core::Result<usize> {
        self.timesteps
            .iter()
            .position(|&t| t == timestep)
            .ok_or_else(|| candle_core::Error::Msg(format!("timestep {timestep} not in schedule")))
    }
}

impl Scheduler for SeededEulerAncestral {
    fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    fn add_noise(
        &self,
        original: &Tensor,
        noise: Tensor,
        timestep: usize,
    ) -> candle_core::Result<Tensor> {
        let sigma = self.sigmas[self.step_index(timestep)?];
        original + (noise * sigma)?
    }

    fn init_noise_sigma(&self) -> f64 {
        (self.sigmas[0].powi(2) + 1.0).sqrt()
    }

    fn scale_model_input(&self, sample: Tensor, timestep: usize) -> candle_core::Result<Tensor> {
        let sigma = self.sigmas[self.step_index(timestep)?];
        sample / (sigma.powi(2) + 1.0).sqrt()
    }

    fn step(
        &mut self,
        model_output: &Tensor,
        timestep: usize,
        sample: &Tensor,
    ) -> candle_core::Result<Tensor> {
        let index = self.step_index(timestep)?;
        let (sigma_from, sigma_to) = (self.sigmas[index], self.sigmas[index + 1]);

        let sigma_up = (sigma_to.powi(2) * (sigma_from.powi(2) - sigma_to.powi(2))
            / sigma_from.powi(2))
        .sqrt();
        let sigma_down = (sigma_to.powi(2) - sigma_up.powi(2)).sqrt();

        // Epsilon prediction: the derivative is the predicted noise itself.
        let prev_sample = (sample + (model_output * (sigma_down - sigma_from))?)?;

        let noise = seeded_noise(&mut self.rng, prev_sample.shape(), prev_sample.device())
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?
            .to_dtype(prev_sample.dtype())?;
        prev_sample + (noise * sigma_up)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_transformers::models::stable_diffusion::euler_ancestral_discrete::EulerAncestralDiscreteScheduler;

    #[test]
    fn names_round_trip() {
        for kind in SchedulerKind::ALL {
            let parsed: SchedulerKind = kind.to_string().parse().unwrap();
            assert_eq!(parsed, kind);
        }
        assert_eq!(SchedulerKind::EulerAncestral.to_string(), "EulerA");
    }

    #[test]
    fn unknown_name_lists_choices() {
        let err = "Heun".parse::<SchedulerKind>().unwrap_err().to_string();
        assert!(err.contains("DDIM"), "{err}");
        assert!(err.contains("UniPC"), "{err}");
    }

    #[test]
    fn every_scheduler_builds_a_schedule() {
        for kind in SchedulerKind::ALL {
            let scheduler = kind.build(20, 1).unwrap();
            assert_eq!(scheduler.timesteps().len(), 20, "{kind}");
        }
    }

    #[test]
    fn seeded_euler_matches_candle_schedule() -> Result<()> {
        let ours = SeededEulerAncestral::new(25, 0)?;
        let config = EulerAncestralDiscreteSchedulerConfig::default();
        let theirs = EulerAncestralDiscreteScheduler::new(25, config)?;
        assert_eq!(ours.timesteps(), theirs.timesteps());
        assert!((ours.init_noise_sigma() - theirs.init_noise_sigma()).abs() < 1e-6);

        let sample = Tensor::ones((1, 4, 2, 2), DType::F32, &Device::Cpu)?;
        for &t in ours.timesteps() {
            let x = ours
                .scale_model_input(sample.clone(), t)?
                .flatten_all()?
                .to_vec1::<f32>()?;
            let y = theirs
                .scale_model_input(sample.clone(), t)?
                .flatten_all()?
                .to_vec1::<f32>()?;
            for (x, y) in x.iter().zip(y.iter()) {
                assert!((x - y).abs() < 1e-5, "timestep {t}: {x} vs {y}");
            }
        }
        Ok(())
    }

    #[test]
    fn stepping_is_reproducible_for_every_scheduler() -> Result<()> {
        let device = Device::Cpu;
        let sample = Tensor::arange(0f32, 16., &device)?.reshape((1, 1, 4, 4))?;
        let model_output = (sample.clone() * 0.1)?;

        let run = |kind: SchedulerKind, seed: u64| -> Result<Vec<f32>> {
            let mut scheduler = kind.build(10, seed)?;
            let timesteps = scheduler.timesteps().to_vec();
            let mut latents = sample.clone();
            for &t in timesteps.iter().take(2) {
                latents = scheduler.step(&model_output, t, &latents)?;
            }
            Ok(latents.flatten_all()?.to_vec1::<f32>()?)
        };

        for kind in SchedulerKind::ALL {
            assert_eq!(run(kind, 1234)?, run(kind, 1234)?, "{kind}");
        }
        assert_ne!(
            run(SchedulerKind::EulerAncestral, 1234)?,
            run(SchedulerKind::EulerAncestral, 4321)?
        );
        Ok(())
    }

    #[test]
    fn final_euler_step_adds_no_noise() -> Result<()> {
        let mut scheduler = SeededEulerAncestral::new(4, 9)?;
        let last = *scheduler.timesteps().last().unwrap_or(&0);
        let sample = Tensor::ones((1, 1, 2, 2), DType::F32, &Device::Cpu)?;
        let eps = (sample.clone() * 0.5)?;

        // sigma_to is zero on the last step, so the result is x - sigma * eps.
        let sigma = scheduler.sigmas[3];
        let out = scheduler.step(&eps, last, &sample)?.flatten_all()?.to_vec1::<f32>()?;
        let expected = (1.0 - sigma * 0.5) as f32;
        assert!(out.iter().all(|v| (v - expected).abs() < 1e-5), "{out:?}");
        Ok(())
    }
}
