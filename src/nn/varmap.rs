//! VarMap: named collection of module weights.

use crate::error::{Error, Result};
use numr::runtime::Runtime;
use numr::tensor::Tensor;
use std::collections::HashMap;

/// Named collection of weight tensors, keyed by dotted path
/// (`"encoder.layers.0.attn.value_proj.weight"`).
pub struct VarMap<R: Runtime> {
    data: HashMap<String, Tensor<R>>,
}

impl<R: Runtime> VarMap<R> {
    pub fn new() -> Self {
        Self {
            data: HashMap::new(),
        }
    }

    pub fn insert(&mut self, name: String, tensor: Tensor<R>) {
        self.data.insert(name, tensor);
    }

    pub fn get(&self, name: &str) -> Result<&Tensor<R>> {
        self.data.get(name).ok_or_else(|| Error::WeightNotFound {
            name: name.to_string(),
        })
    }

    /// Remove and return a tensor by name (zero-copy extraction).
    pub fn take(&mut self, name: &str) -> Result<Tensor<R>> {
        self.data.remove(name).ok_or_else(|| Error::WeightNotFound {
            name: name.to_string(),
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.data.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.data.keys().map(|s| s.as_str())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl<R: Runtime> Default for VarMap<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Runtime> From<HashMap<String, Tensor<R>>> for VarMap<R> {
    fn from(data: HashMap<String, Tensor<R>>) -> Self {
        Self { data }
    }
}
