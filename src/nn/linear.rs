//! Linear layer

use crate::error::{Error, Result};
use crate::nn::module::Module;
use numr::autograd::{Var, var_add, var_matmul, var_transpose};
use numr::dtype::DType;
use numr::ops::TensorOps;
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::Tensor;
use rand::Rng;

/// Dense linear layer: output = input @ weight^T + bias
///
/// Uses `Var<R>` throughout so autograd works during training.
pub struct Linear<R: Runtime> {
    weight: Var<R>,
    bias: Option<Var<R>>,
}

impl<R: Runtime> Linear<R> {
    /// Create from loaded tensors. `trainable` controls gradient tracking.
    pub fn new(weight: Tensor<R>, bias: Option<Tensor<R>>, trainable: bool) -> Self {
        Self {
            weight: Var::new(weight, trainable),
            bias: bias.map(|b| Var::new(b, trainable)),
        }
    }

    /// Forward: input @ weight^T + bias
    ///
    /// input: `[..., in_features]`, output: `[..., out_features]`
    pub fn forward<C>(&self, client: &C, input: &Var<R>) -> Result<Var<R>>
    where
        C: RuntimeClient<R> + TensorOps<R>,
        R::Client: TensorOps<R>,
    {
        let w_t = var_transpose(&self.weight).map_err(Error::Numr)?;
        let output = var_matmul(input, &w_t, client).map_err(Error::Numr)?;
        match &self.bias {
            Some(bias) => var_add(&output, bias, client).map_err(Error::Numr),
            None => Ok(output),
        }
    }

    pub fn weight(&self) -> &Var<R> {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Var<R>> {
        self.bias.as_ref()
    }

    /// `[out_features, in_features]`
    pub fn shape(&self) -> (usize, usize) {
        let s = self.weight.shape();
        (s[0], s[1])
    }
}

impl<R: Runtime<DType = DType>> Linear<R> {
    /// Trainable F32 layer with Xavier-uniform weight drawn from `rng` and zero bias.
    pub fn xavier_uniform<G: Rng + ?Sized>(
        in_features: usize,
        out_features: usize,
        rng: &mut G,
        device: &R::Device,
    ) -> Self {
        let bound = (6.0 / (in_features + out_features) as f32).sqrt();
        let data: Vec<f32> = (0..out_features * in_features)
            .map(|_| rng.gen_range(-bound..=bound))
            .collect();
        Self::new(
            Tensor::<R>::from_slice(&data, &[out_features, in_features], device),
            Some(Tensor::<R>::zeros(&[out_features], DType::F32, device)),
            true,
        )
    }
}

impl<R: Runtime> Module<R> for Linear<R> {
    fn parameters(&self) -> Vec<&Var<R>> {
        let mut params = vec![&self.weight];
        if let Some(b) = &self.bias {
            params.push(b);
        }
        params
    }

    fn named_parameters(&self) -> Vec<(String, &Var<R>)> {
        let mut params = vec![("weight".to_string(), &self.weight)];
        if let Some(b) = &self.bias {
            params.push(("bias".to_string(), b));
        }
        params
    }
}
