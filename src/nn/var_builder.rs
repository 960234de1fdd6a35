//! VarBuilder: scoped access to weights in a VarMap.
//!
//! Provides prefix-based navigation for hierarchical weight names
//! (e.g., "encoder.layers.0.attn.sampling_offsets.weight").

use crate::error::{Error, Result};
use crate::nn::varmap::VarMap;
use numr::runtime::Runtime;
use numr::tensor::Tensor;

/// Scoped access to weights in a `VarMap`.
pub struct VarBuilder<'a, R: Runtime> {
    varmap: &'a mut VarMap<R>,
    prefix: String,
    device: &'a R::Device,
}

impl<'a, R: Runtime> VarBuilder<'a, R> {
    /// Create a root VarBuilder.
    pub fn new(varmap: &'a mut VarMap<R>, device: &'a R::Device) -> Self {
        Self {
            varmap,
            prefix: String::new(),
            device,
        }
    }

    /// Create a sub-builder with an additional prefix component.
    pub fn push_prefix(&mut self, segment: &str) -> VarBuilder<'_, R> {
        let prefix = self.full_name(segment);
        VarBuilder {
            varmap: self.varmap,
            prefix,
            device: self.device,
        }
    }

    /// Alias for `push_prefix`.
    pub fn pp(&mut self, segment: &str) -> VarBuilder<'_, R> {
        self.push_prefix(segment)
    }

    fn full_name(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", self.prefix, name)
        }
    }

    /// Get a tensor by name (relative to prefix).
    pub fn get(&self, name: &str) -> Result<&Tensor<R>> {
        self.varmap.get(&self.full_name(name))
    }

    /// Take a tensor by name, removing it from the map.
    pub fn take_tensor(&mut self, name: &str) -> Result<Tensor<R>> {
        let full = self.full_name(name);
        self.varmap.take(&full)
    }

    /// Take a tensor and validate its shape.
    pub fn take_with_shape(&mut self, name: &str, expected_shape: &[usize]) -> Result<Tensor<R>> {
        let full = self.full_name(name);
        let t = self.varmap.take(&full)?;
        if t.shape() != expected_shape {
            return Err(Error::ShapeMismatch {
                arg: "weight",
                expected: format!("{full}: {expected_shape:?}"),
                got: format!("{:?}", t.shape()),
            });
        }
        Ok(t)
    }

    pub fn device(&self) -> &R::Device {
        self.device
    }

    pub fn contains(&self, name: &str) -> bool {
        self.varmap.contains(&self.full_name(name))
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}
