//! Energy guidance: gradients of a caller-supplied energy w.r.t. the current
//! sample and the policies that fold them into the predicted mean.

use std::collections::BTreeMap;

use candle_core::{DType, Tensor, Var};

use crate::diffusion::GaussianDiffusion;
use crate::error::{EggError, Result};

/// Named energy terms returned by an [`EnergyFunction`]. Each term is either
/// a scalar or holds one value per sample.
pub type Energies = BTreeMap<String, Tensor>;

/// Scores an image batch; lower is preferred.
///
/// The returned terms must be differentiable w.r.t. `images`, a
/// `(N, 3, H, W)` F32 batch in `[-1, 1]` (roughly, while noisy).
pub trait EnergyFunction {
    fn energy(&self, images: &Tensor) -> candle_core::Result<Energies>;
}

impl<F> EnergyFunction for F
where
    F: Fn(&Tensor) -> candle_core::Result<Energies>,
{
    fn energy(&self, images: &Tensor) -> candle_core::Result<Energies> {
        self(images)
    }
}

/// Energy with no terms, used for unguided sampling.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEnergy;

impl EnergyFunction for NoEnergy {
    fn energy(&self, _images: &Tensor) -> candle_core::Result<Energies> {
        Ok(Energies::new())
    }
}

/// How the scaled energy gradient is weighted before it is added to the
/// predicted mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GuidancePolicy {
    /// Weight by `1 - alpha_bar_t`: full strength on the noisiest steps,
    /// vanishing on the last ones.
    AlphaBar,
    /// Weight by the variance of the reverse step, i.e. the same quantity
    /// that scales the noise injected at this step.
    #[default]
    Variance,
}

impl GuidancePolicy {
    pub fn from_use_alpha_bar(use_alpha_bar: bool) -> Self {
        if use_alpha_bar {
            GuidancePolicy::AlphaBar
        } else {
            GuidancePolicy::Variance
        }
    }

    /// Nominal weight at sampling index `t`. For the variance policy this is
    /// the posterior variance; networks with learned sigma move the actual
    /// variance within `[posterior variance, beta_t]`.
    pub fn schedule_weight(&self, diffusion: &GaussianDiffusion, t: usize) -> f64 {
        match self {
            GuidancePolicy::AlphaBar => 1.0 - diffusion.alpha_bar(t),
            GuidancePolicy::Variance => diffusion.posterior_variance(t),
        }
    }
}

/// Parameters of the guidance correction for one sampling call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GuidanceSettings {
    pub energy_scale: f64,
    pub policy: GuidancePolicy,
    pub normalize_grad: bool,
}

impl GuidanceSettings {
    /// Correction to add to the predicted mean at sampling index `t`.
    ///
    /// `grad` is the energy gradient w.r.t. the current sample and
    /// `variance` the variance of this reverse step. The correction points
    /// downhill in energy.
    pub fn correction(
        &self,
        grad: &Tensor,
        diffusion: &GaussianDiffusion,
        t: usize,
        variance: &Tensor,
    ) -> Result<Tensor> {
        let grad = if self.normalize_grad {
            normalize_per_sample(grad)?
        } else {
            grad.clone()
        };
        let scaled = grad.affine(self.energy_scale, 0.0)?;
        let weighted = match self.policy {
            GuidancePolicy::AlphaBar => {
                scaled.affine(self.policy.schedule_weight(diffusion, t), 0.0)?
            }
            GuidancePolicy::Variance => (&scaled * variance)?,
        };
        Ok(weighted.neg()?)
    }
}

/// Gradient of the combined energy w.r.t. the sample, with the summed value
/// of every term.
#[derive(Debug, Clone)]
pub struct EnergyGradient {
    pub grad: Tensor,
    pub energies: BTreeMap<String, f32>,
}

/// Evaluates `energy_fn` on `x` and differentiates the sum of all terms
/// w.r.t. `x` only.
///
/// `x` is copied into a fresh variable, so nothing that produced `x`
/// (in particular the denoiser) is part of the differentiated graph. Terms
/// with a shape other than `[]` or `[N]`, non-finite terms and non-finite
/// gradients are reported as errors tagged with `step`.
pub fn energy_gradient<E: EnergyFunction + ?Sized>(
    energy_fn: &E,
    x: &Tensor,
    step: usize,
) -> Result<EnergyGradient> {
    let batch = x.dim(0)?;
    let x_in = Var::from_tensor(&x.detach())?;
    let terms = energy_fn.energy(x_in.as_tensor())?;

    let mut total: Option<Tensor> = None;
    let mut energies = BTreeMap::new();
    for (name, term) in &terms {
        if !(term.rank() == 0 || term.dims() == [batch]) {
            return Err(EggError::EnergyShape {
                term: name.clone(),
                shape: term.dims().to_vec(),
                batch,
            });
        }
        let term_sum = term.to_dtype(DType::F32)?.sum_all()?;
        let value = term_sum.to_scalar::<f32>()?;
        if !value.is_finite() {
            return Err(EggError::NonFiniteEnergy {
                step,
                term: name.clone(),
            });
        }
        energies.insert(name.clone(), value);
        total = Some(match total {
            Some(acc) => (acc + term_sum)?,
            None => term_sum,
        });
    }

    // An energy that ignores its input has no gradient entry.
    let grad = match total {
        Some(total) => total.backward()?.get(x_in.as_tensor()).cloned(),
        None => None,
    };
    let grad = match grad {
        Some(grad) => grad.to_dtype(x.dtype())?,
        None => x.zeros_like()?,
    };

    let sq_norm = grad.to_dtype(DType::F64)?.sqr()?.sum_all()?.to_scalar::<f64>()?;
    if !sq_norm.is_finite() {
        return Err(EggError::NonFiniteGradient(step));
    }

    Ok(EnergyGradient { grad, energies })
}

/// Rescales every sample of `grad` to unit L2 norm. Samples whose gradient
/// is exactly zero stay zero.
pub fn normalize_per_sample(grad: &Tensor) -> Result<Tensor> {
    let batch = grad.dim(0)?;
    let norms = grad.flatten_from(1)?.sqr()?.sum_keepdim(1)?.sqrt()?;
    let zero = norms.eq(&norms.zeros_like()?)?.to_dtype(norms.dtype())?;
    let denom = (norms + zero)?;
    let mut dims = vec![1usize; grad.rank()];
    dims[0] = batch;
    Ok(grad.broadcast_div(&denom.reshape(dims)?)?)
}

/// L2 norm of every sample of `t`.
pub fn per_sample_norms(t: &Tensor) -> Result<Vec<f32>> {
    Ok(t
        .to_dtype(DType::F32)?
        .flatten_from(1)?
        .sqr()?
        .sum(1)?
        .sqrt()?
        .to_vec1::<f32>()?)
}
