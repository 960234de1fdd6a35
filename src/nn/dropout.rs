//! Dropout regularization layer
//!
//! During training, randomly zeroes elements with probability `p` and scales
//! survivors by `1/(1-p)` (inverted dropout). During evaluation, acts as identity.

use crate::error::{Error, Result};
use crate::nn::module::TrainMode;
use numr::autograd::{Var, var_dropout};
use numr::ops::{BinaryOps, RandomOps, ScalarOps, TensorOps};
use numr::runtime::{Runtime, RuntimeClient};

/// Dropout layer with training/eval mode. Starts in training mode.
#[derive(Debug, Clone)]
pub struct Dropout {
    p: f64,
    training: bool,
}

impl Dropout {
    /// Create a dropout layer with drop probability `p` in `[0, 1)`.
    pub fn new(p: f64) -> Result<Self> {
        if !(0.0..1.0).contains(&p) {
            return Err(Error::ConfigError {
                reason: format!("dropout probability must be in [0, 1), got {p}"),
            });
        }
        Ok(Self { p, training: true })
    }

    pub fn p(&self) -> f64 {
        self.p
    }

    /// Forward pass. Identity in eval mode or when `p == 0`.
    pub fn forward<R, C>(&self, client: &C, input: &Var<R>) -> Result<Var<R>>
    where
        R: Runtime<DType = numr::dtype::DType>,
        C: RuntimeClient<R> + TensorOps<R> + RandomOps<R> + ScalarOps<R> + BinaryOps<R>,
        R::Client: TensorOps<R> + ScalarOps<R> + BinaryOps<R>,
    {
        if !self.training || self.p == 0.0 {
            return Ok(input.clone());
        }
        let (output, _mask) = var_dropout(input, self.p, client).map_err(Error::Numr)?;
        Ok(output)
    }
}

impl TrainMode for Dropout {
    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::cpu_setup;
    use numr::runtime::cpu::CpuRuntime;
    use numr::tensor::Tensor;

    #[test]
    fn test_dropout_eval_mode_is_identity() {
        let (client, device) = cpu_setup();
        let input = Var::new(
            Tensor::<CpuRuntime>::from_slice(&[1.0f32, 2.0, 3.0, 4.0], &[4], &device),
            false,
        );

        let mut dropout = Dropout::new(0.5).unwrap();
        dropout.set_training(false);

        let output = dropout.forward(&client, &input).unwrap();
        let data: Vec<f32> = output.tensor().to_vec();
        assert_eq!(data, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_dropout_training_mode_zeroes_elements() {
        let (client, device) = cpu_setup();
        let input = Var::new(
            Tensor::<CpuRuntime>::from_slice(&[1.0f32; 1000], &[1000], &device),
            false,
        );

        let dropout = Dropout::new(0.5).unwrap();
        assert!(dropout.is_training());
        let output = dropout.forward(&client, &input).unwrap();
        let data: Vec<f32> = output.tensor().to_vec();

        let zeros = data.iter().filter(|&&v| v == 0.0).count();
        assert!(zeros > 300 && zeros < 700, "zeros: {zeros}");
    }

    #[test]
    fn test_dropout_rejects_bad_probability() {
        assert!(matches!(Dropout::new(1.0), Err(Error::ConfigError { .. })));
        assert!(Dropout::new(-0.1).is_err());
        assert!(Dropout::new(0.0).is_ok());
    }
}
