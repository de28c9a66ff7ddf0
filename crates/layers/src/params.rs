//! Named parameter and buffer registry.
//!
//! Learnable tensors are held as [`Var`]s so gradients can flow through them.
//! Composite modules walk their children with dotted prefixes
//! (`layer1.0.conv2.rate1`) so the flattened list reads like a state dict.
//! Buffers are non-learnable state such as batch-norm running statistics.

use std::fmt;

use candle_core::{Tensor, Var};

/// A learnable tensor together with its dotted path.
#[derive(Debug, Clone)]
pub struct NamedParameter {
    pub name: String,
    pub var: Var,
}

impl NamedParameter {
    pub fn new(name: String, var: Var) -> Self {
        Self { name, var }
    }

    /// Number of scalar elements held by the parameter.
    pub fn elem_count(&self) -> usize {
        self.var.as_tensor().elem_count()
    }
}

/// Joins a parent prefix and a child name with a dot.
pub fn join(prefix: &str, name: &str) -> String {
    match (prefix.is_empty(), name.is_empty()) {
        (true, _) => name.to_string(),
        (false, true) => prefix.to_string(),
        (false, false) => format!("{prefix}.{name}"),
    }
}

/// Implemented by every layer that owns learnable state.
pub trait Parameterized {
    /// Appends the layer's parameters to `out`, named below `prefix`.
    fn collect_parameters(&self, prefix: &str, out: &mut Vec<NamedParameter>);

    /// Appends non-learnable state tensors (running statistics and counters).
    fn collect_buffers(&self, _prefix: &str, _out: &mut Vec<(String, Tensor)>) {}

    /// Flattened parameter list rooted at the layer itself.
    fn parameters(&self) -> Vec<NamedParameter> {
        let mut out = Vec::new();
        self.collect_parameters("", &mut out);
        out
    }

    /// Total number of learnable scalars.
    fn num_parameters(&self) -> usize {
        self.parameters().iter().map(NamedParameter::elem_count).sum()
    }

    /// Summary of parameter and buffer sizes.
    fn parameter_count(&self) -> ParameterCount {
        let params = self.parameters();
        let total = params.iter().map(NamedParameter::elem_count).sum();
        let trainable = params
            .iter()
            .filter(|param| param.var.as_tensor().is_variable())
            .map(NamedParameter::elem_count)
            .sum();
        let mut buffers = Vec::new();
        self.collect_buffers("", &mut buffers);
        ParameterCount {
            total,
            trainable,
            buffers: buffers.iter().map(|(_, tensor)| tensor.elem_count()).sum(),
        }
    }
}

/// Element counts across parameters and buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ParameterCount {
    pub total: usize,
    pub trainable: usize,
    pub buffers: usize,
}

impl fmt::Display for ParameterCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} total parameters, {} trainable, {} buffer elements",
            self.total, self.trainable, self.buffers
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_skips_empty_segments() {
        assert_eq!(join("", "weight"), "weight");
        assert_eq!(join("layer1.0", ""), "layer1.0");
        assert_eq!(join("layer1.0", "conv1"), "layer1.0.conv1");
    }
}
