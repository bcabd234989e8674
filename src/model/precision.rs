use burn::{
    module::{AutodiffModule, ModuleVisitor, ParamId},
    optim::{GradientsParams, Optimizer},
    prelude::*,
    tensor::{ElementConversion, backend::AutodiffBackend},
};
use tracing::{debug, warn};

use crate::model::constants::SCALE_RECOVERY;

/// Selects how losses are scaled before backpropagation.
///
/// Reduced precision itself is a property of the backend element type and is picked once at
/// startup; this configuration only decides whether the loss-scaling policy is dynamic.
#[derive(Config, Debug)]
pub struct PrecisionConfig {
    #[config(default = false)]
    pub mixed: bool,

    #[config(default = 65536.0)]
    pub init_scale: f64,

    #[config(default = 2.0)]
    pub growth_factor: f64,

    #[config(default = 0.5)]
    pub backoff_factor: f64,

    #[config(default = 2000)]
    pub growth_interval: usize,

    /// Below this value the scale is reset to the recovery value.
    #[config(default = 64.0)]
    pub scaler_min: f64,
}

impl PrecisionConfig {
    pub fn init(&self) -> GradScaler {
        if self.mixed {
            GradScaler::Dynamic(DynamicLossScaler {
                scale: self.init_scale,
                growth_factor: self.growth_factor,
                backoff_factor: self.backoff_factor,
                growth_interval: self.growth_interval,
                scaler_min: self.scaler_min,
                growth_tracker: 0,
            })
        } else {
            GradScaler::Full(FullPrecision)
        }
    }
}

/// Uniform loss-scaling contract shared by both precision modes.
pub trait GradScaling {
    fn get_scale(&self) -> f64;

    fn scale<B: Backend, const D: usize>(&self, loss: Tensor<B, D>) -> Tensor<B, D> {
        loss.mul_scalar(self.get_scale())
    }

    fn unscale<B: Backend, const D: usize>(&self, grad: Tensor<B, D>) -> Tensor<B, D> {
        grad.mul_scalar(1.0 / self.get_scale())
    }

    /// Backpropagates `loss`, steps `optim` on `module` and returns the updated module.
    fn backward_and_step<B, M, O>(
        &mut self,
        loss: Tensor<B, 1>,
        module: M,
        optim: &mut O,
        lr: f64,
    ) -> M
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FullPrecision;

impl GradScaling for FullPrecision {
    fn get_scale(&self) -> f64 {
        1.0
    }

    fn scale<B: Backend, const D: usize>(&self, loss: Tensor<B, D>) -> Tensor<B, D> {
        loss
    }

    fn unscale<B: Backend, const D: usize>(&self, grad: Tensor<B, D>) -> Tensor<B, D> {
        grad
    }

    fn backward_and_step<B, M, O>(
        &mut self,
        loss: Tensor<B, 1>,
        module: M,
        optim: &mut O,
        lr: f64,
    ) -> M
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let grads = loss.backward();
        let grads = GradientsParams::from_grads(grads, &module);
        optim.step(lr, module, grads)
    }
}

/// Dynamic loss scaler. Steps with non-finite gradients are skipped and the scale backs off;
/// after `growth_interval` consecutive finite steps the scale grows.
#[derive(Debug, Clone)]
pub struct DynamicLossScaler {
    scale: f64,
    growth_factor: f64,
    backoff_factor: f64,
    growth_interval: usize,
    scaler_min: f64,
    growth_tracker: usize,
}

impl DynamicLossScaler {
    /// Records the outcome of one step and adjusts the scale.
    pub fn update(&mut self, found_inf: bool) {
        if found_inf {
            self.scale *= self.backoff_factor;
            self.growth_tracker = 0;
        } else {
            self.growth_tracker += 1;
            if self.growth_tracker >= self.growth_interval {
                self.scale *= self.growth_factor;
                self.growth_tracker = 0;
            }
        }

        if self.scale < self.scaler_min {
            warn!(
                scale = self.scale,
                floor = self.scaler_min,
                "loss scale collapsed, resetting to {SCALE_RECOVERY}"
            );
            self.scale = SCALE_RECOVERY;
        }
    }
}

impl GradScaling for DynamicLossScaler {
    fn get_scale(&self) -> f64 {
        self.scale
    }

    fn unscale<B: Backend, const D: usize>(&self, grad: Tensor<B, D>) -> Tensor<B, D> {
        grad.mul_scalar(1.0 / (self.scale + 1e-8))
    }

    fn backward_and_step<B, M, O>(
        &mut self,
        loss: Tensor<B, 1>,
        module: M,
        optim: &mut O,
        lr: f64,
    ) -> M
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        let grads = self.scale(loss).backward();
        let grads = GradientsParams::from_grads(grads, &module);

        let mut unscaler = Unscaler::<B> {
            grads,
            inv_scale: 1.0 / (self.scale + 1e-8),
            found_inf: false,
            _backend: core::marker::PhantomData,
        };
        module.visit(&mut unscaler);

        let found_inf = unscaler.found_inf;
        self.update(found_inf);

        if found_inf {
            debug!(scale = self.scale, "skipping step with non-finite gradients");
            module
        } else {
            optim.step(lr, module, unscaler.grads)
        }
    }
}

struct Unscaler<B: AutodiffBackend> {
    grads: GradientsParams,
    inv_scale: f64,
    found_inf: bool,
    _backend: core::marker::PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleVisitor<B> for Unscaler<B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        let Some(grad) = self.grads.remove::<B::InnerBackend, D>(id) else {
            return;
        };
        let grad = grad.mul_scalar(self.inv_scale);
        let magnitude = grad.clone().abs().sum().into_scalar().elem::<f64>();
        if !magnitude.is_finite() {
            self.found_inf = true;
        }
        self.grads.register::<B::InnerBackend, D>(id, grad);
    }
}

/// The loss-scaling policy selected once from [`PrecisionConfig`].
#[derive(Debug, Clone)]
pub enum GradScaler {
    Full(FullPrecision),
    Dynamic(DynamicLossScaler),
}

impl GradScaler {
    pub fn is_dynamic(&self) -> bool {
        matches!(self, GradScaler::Dynamic(_))
    }
}

impl GradScaling for GradScaler {
    fn get_scale(&self) -> f64 {
        match self {
            GradScaler::Full(s) => s.get_scale(),
            GradScaler::Dynamic(s) => s.get_scale(),
        }
    }

    fn scale<B: Backend, const D: usize>(&self, loss: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            GradScaler::Full(s) => s.scale(loss),
            GradScaler::Dynamic(s) => s.scale(loss),
        }
    }

    fn unscale<B: Backend, const D: usize>(&self, grad: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            GradScaler::Full(s) => s.unscale(grad),
            GradScaler::Dynamic(s) => s.unscale(grad),
        }
    }

    fn backward_and_step<B, M, O>(
        &mut self,
        loss: Tensor<B, 1>,
        module: M,
        optim: &mut O,
        lr: f64,
    ) -> M
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        O: Optimizer<M, B>,
    {
        match self {
            GradScaler::Full(s) => s.backward_and_step(loss, module, optim, lr),
            GradScaler::Dynamic(s) => s.backward_and_step(loss, module, optim, lr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::{
        backend::{Autodiff, NdArray},
        nn::{Linear, LinearConfig},
        optim::SgdConfig,
    };

    type TestBackend = Autodiff<NdArray<f32>>;

    fn dynamic(config: PrecisionConfig) -> DynamicLossScaler {
        match config.with_mixed(true).init() {
            GradScaler::Dynamic(scaler) => scaler,
            GradScaler::Full(_) => panic!("mixed precision should select the dynamic scaler"),
        }
    }

    #[test]
    fn scale_backs_off_on_overflow() {
        let mut scaler = dynamic(PrecisionConfig::new());
        scaler.update(true);
        assert_eq!(scaler.get_scale(), 32768.0);
    }

    #[test]
    fn scale_grows_after_interval() {
        let mut scaler = dynamic(PrecisionConfig::new().with_growth_interval(3));
        for _ in 0..3 {
            scaler.update(false);
        }
        assert_eq!(scaler.get_scale(), 131072.0);
    }

    #[test]
    fn scale_resets_below_floor() {
        let mut scaler = dynamic(PrecisionConfig::new().with_init_scale(100.0));
        scaler.update(true);
        assert_eq!(scaler.get_scale(), SCALE_RECOVERY);
    }

    #[test]
    fn full_precision_is_identity() {
        let device = Default::default();
        let scaler = PrecisionConfig::new().init();
        let loss = Tensor::<NdArray<f32>, 1>::from_floats([3.0], &device);

        assert!(!scaler.is_dynamic());
        assert_eq!(scaler.scale(loss.clone()).into_scalar(), 3.0);
        assert_eq!(scaler.unscale(loss).into_scalar(), 3.0);
    }

    #[test]
    fn scaled_step_matches_unscaled_step() {
        let device = Default::default();
        let linear: Linear<TestBackend> = LinearConfig::new(2, 1).init(&device);
        let input = Tensor::<TestBackend, 2>::from_floats([[1.0, -2.0], [0.5, 3.0]], &device);
        let loss = |m: &Linear<TestBackend>| m.forward(input.clone()).powf_scalar(2.0).mean();

        let mut full = PrecisionConfig::new().init();
        let mut optim = SgdConfig::new().init();
        let a = full.backward_and_step(loss(&linear), linear.clone(), &mut optim, 0.1);

        let mut mixed = PrecisionConfig::new().with_mixed(true).with_init_scale(1024.0).init();
        let mut optim = SgdConfig::new().init();
        let b = mixed.backward_and_step(loss(&linear), linear, &mut optim, 0.1);

        let a = a.weight.val().into_data().to_vec::<f32>().unwrap();
        let b = b.weight.val().into_data().to_vec::<f32>().unwrap();
        for (a, b) in a.iter().zip(&b) {
            approx::assert_relative_eq!(a, b, epsilon = 1e-5);
        }
    }

    #[test]
    fn non_finite_gradients_skip_the_step() {
        let device = Default::default();
        let linear: Linear<TestBackend> = LinearConfig::new(2, 1).init(&device);
        let before = linear.weight.val().into_data();
        let input = Tensor::<TestBackend, 2>::from_floats([[f32::INFINITY, 1.0]], &device);
        let loss = linear.forward(input).sum();

        let mut scaler = PrecisionConfig::new().with_mixed(true).init();
        let mut optim = SgdConfig::new().init();
        let linear = scaler.backward_and_step(loss, linear, &mut optim, 0.1);

        assert_eq!(linear.weight.val().into_data(), before);
        assert_eq!(scaler.get_scale(), 32768.0);
    }
}
