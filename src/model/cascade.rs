//! Predictor orchestration.
//!
//! A single-stage model runs one predictor conditioned on codes and labels.
//! The cascade refines noise predictions in three stages:
//!
//! ```text
//! base  = base_predictor(x, t)
//! label = base.detach()  + scale_label(label_predictor(x, t, labels), t)
//! cond  = label.detach() + scale_cond(cond_predictor(x, t, cond, labels), t)
//! ```
//! Each stage is trained by its own loss; the detaches keep a later stage's
//! loss from reaching earlier predictors.

use candle_core::Tensor;

use super::Predictor;
use super::time_scale::TimeScale;
use crate::{Error, Result};

/// Named output of an orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Base,
    Label,
    Cond,
}

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Self::Base => "base",
            Self::Label => "label",
            Self::Cond => "cond",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Noise predictions keyed by stage, in evaluation order.
///
/// The last entry is the orchestrator's output and is what sampling uses.
#[derive(Debug, Clone)]
pub struct Predictions {
    stages: Vec<(Stage, Tensor)>,
}

impl Predictions {
    fn new(stages: Vec<(Stage, Tensor)>) -> Self {
        Self { stages }
    }

    pub fn get(&self, stage: Stage) -> Option<&Tensor> {
        self.stages
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, t)| t)
    }

    /// Final prediction.
    pub fn output(&self) -> Result<&Tensor> {
        self.stages
            .last()
            .map(|(_, t)| t)
            .ok_or_else(|| Error::Config("orchestrator produced no predictions".into()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (Stage, &Tensor)> {
        self.stages.iter().map(|(s, t)| (*s, t))
    }

    pub fn into_output(mut self) -> Result<Tensor> {
        self.stages
            .pop()
            .map(|(_, t)| t)
            .ok_or_else(|| Error::Config("orchestrator produced no predictions".into()))
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

/// Three-stage cascade with learned time-dependent gates.
pub struct Cascade {
    base: Box<dyn Predictor>,
    label: Box<dyn Predictor>,
    cond: Box<dyn Predictor>,
    scale_label: TimeScale,
    scale_cond: TimeScale,
}

impl Cascade {
    /// - `base`: unconditional predictor
    /// - `label`: label-conditioned predictor
    /// - `cond`: code- and label-conditioned predictor
    pub fn new(
        base: Box<dyn Predictor>,
        label: Box<dyn Predictor>,
        cond: Box<dyn Predictor>,
        scale_label: TimeScale,
        scale_cond: TimeScale,
    ) -> Self {
        Self {
            base,
            label,
            cond,
            scale_label,
            scale_cond,
        }
    }

    pub fn predictions(
        &self,
        xs: &Tensor,
        ts: &Tensor,
        cond: &Tensor,
        labels: &Tensor,
        train: bool,
    ) -> Result<Predictions> {
        let base = self.base.predict(xs, ts, None, None, train)?;

        let label_eps = self.label.predict(xs, ts, None, Some(labels), train)?;
        let label = (base.detach() + self.scale_label.forward(&label_eps, ts)?)?;

        let cond_eps = self.cond.predict(xs, ts, Some(cond), Some(labels), train)?;
        let cond = (label.detach() + self.scale_cond.forward(&cond_eps, ts)?)?;

        Ok(Predictions::new(vec![
            (Stage::Base, base),
            (Stage::Label, label),
            (Stage::Cond, cond),
        ]))
    }

    pub fn downsample_rate(&self) -> usize {
        [&self.base, &self.label, &self.cond]
            .iter()
            .map(|p| p.downsample_rate())
            .fold(1, super::lcm)
    }
}

/// The predictor structure behind a VQ-VAE.
pub enum Stages {
    Single { cond: Box<dyn Predictor> },
    Cascade(Cascade),
}

impl Stages {
    pub fn predictions(
        &self,
        xs: &Tensor,
        ts: &Tensor,
        cond: &Tensor,
        labels: &Tensor,
        train: bool,
    ) -> Result<Predictions> {
        match self {
            Self::Single { cond: predictor } => {
                let eps = predictor.predict(xs, ts, Some(cond), Some(labels), train)?;
                Ok(Predictions::new(vec![(Stage::Cond, eps)]))
            }
            Self::Cascade(cascade) => cascade.predictions(xs, ts, cond, labels, train),
        }
    }

    pub fn downsample_rate(&self) -> usize {
        match self {
            Self::Single { cond } => cond.downsample_rate(),
            Self::Cascade(cascade) => cascade.downsample_rate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::time_scale::TimeScaleConfig;
    use candle_core::{DType, Device, Var};
    use candle_nn::{VarBuilder, VarMap};

    /// Predicts `value * weight` everywhere; `weight` is a trainable scalar.
    struct ConstPredictor {
        weight: Var,
        value: f32,
    }

    impl ConstPredictor {
        fn boxed(value: f32) -> (Box<dyn Predictor>, Var) {
            let weight = Var::new(&[1f32], &Device::Cpu).unwrap();
            let predictor = Self {
                weight: weight.clone(),
                value,
            };
            (Box::new(predictor), weight)
        }
    }

    impl Predictor for ConstPredictor {
        fn predict(
            &self,
            xs: &Tensor,
            _ts: &Tensor,
            _cond: Option<&Tensor>,
            _labels: Option<&Tensor>,
            _train: bool,
        ) -> Result<Tensor> {
            let ones = xs.ones_like()?;
            let w = self.weight.as_tensor().reshape((1, 1, 1))?;
            Ok((ones.broadcast_mul(&w)? * self.value as f64)?)
        }

        fn downsample_rate(&self) -> usize {
            64
        }
    }

    struct Fixture {
        cascade: Cascade,
        weights: [Var; 3],
        _varmap: VarMap,
    }

    fn fixture() -> Fixture {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let cfg = TimeScaleConfig {
            channels: 16,
            ..Default::default()
        };
        let (base, wb) = ConstPredictor::boxed(1.0);
        let (label, wl) = ConstPredictor::boxed(2.0);
        let (cond, wc) = ConstPredictor::boxed(3.0);
        let cascade = Cascade::new(
            base,
            label,
            cond,
            TimeScale::new(cfg, vb.pp("scale_label")).unwrap(),
            TimeScale::new(cfg, vb.pp("scale_cond")).unwrap(),
        );
        Fixture {
            cascade,
            weights: [wb, wl, wc],
            _varmap: varmap,
        }
    }

    fn inputs() -> (Tensor, Tensor, Tensor, Tensor) {
        let dev = Device::Cpu;
        let xs = Tensor::zeros((2, 1, 64), DType::F32, &dev).unwrap();
        let ts = Tensor::new(&[0.25f32, 0.75], &dev).unwrap();
        let cond = Tensor::zeros((2, 8, 1), DType::F32, &dev).unwrap();
        let labels = Tensor::new(&[0u32, 1], &dev).unwrap();
        (xs, ts, cond, labels)
    }

    #[test]
    fn test_cascade_combines_stages_with_initial_gates() {
        let f = fixture();
        let (xs, ts, cond, labels) = inputs();
        let preds = f.cascade.predictions(&xs, &ts, &cond, &labels, false).unwrap();
        assert_eq!(preds.len(), 3);

        let check = |stage: Stage, expected: f32| {
            for v in preds.get(stage).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap() {
                assert!((v - expected).abs() < 1e-5, "{stage}: {v} != {expected}");
            }
        };
        check(Stage::Base, 1.0);
        check(Stage::Label, 1.0 + 0.05 * 2.0);
        check(Stage::Cond, 1.0 + 0.05 * 2.0 + 0.05 * 3.0);

        let out = preds.output().unwrap();
        assert_eq!(out.dims(), preds.get(Stage::Cond).unwrap().dims());
    }

    #[test]
    fn test_later_stage_loss_does_not_reach_earlier_predictors() {
        let f = fixture();
        let (xs, ts, cond, labels) = inputs();
        let preds = f.cascade.predictions(&xs, &ts, &cond, &labels, true).unwrap();
        let loss = preds.get(Stage::Cond).unwrap().sqr().unwrap().mean_all().unwrap();
        let grads = loss.backward().unwrap();

        let [base, label, cond_w] = &f.weights;
        assert!(grads.get(base.as_tensor()).is_none());
        assert!(grads.get(label.as_tensor()).is_none());
        assert!(grads.get(cond_w.as_tensor()).is_some());
    }

    #[test]
    fn test_label_loss_reaches_only_label_predictor() {
        let f = fixture();
        let (xs, ts, cond, labels) = inputs();
        let preds = f.cascade.predictions(&xs, &ts, &cond, &labels, true).unwrap();
        let loss = preds.get(Stage::Label).unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();

        let [base, label, cond_w] = &f.weights;
        assert!(grads.get(base.as_tensor()).is_none());
        assert!(grads.get(label.as_tensor()).is_some());
        assert!(grads.get(cond_w.as_tensor()).is_none());
    }

    #[test]
    fn test_single_stage_outputs_cond_only() {
        let (cond_pred, _w) = ConstPredictor::boxed(3.0);
        let stages = Stages::Single { cond: cond_pred };
        let (xs, ts, cond, labels) = inputs();
        let preds = stages.predictions(&xs, &ts, &cond, &labels, false).unwrap();
        assert_eq!(preds.len(), 1);
        assert!(preds.get(Stage::Base).is_none());
        let out: f32 = preds.output().unwrap().mean_all().unwrap().to_scalar().unwrap();
        assert!((out - 3.0).abs() < 1e-6);
        assert_eq!(stages.downsample_rate(), 64);
    }
}
