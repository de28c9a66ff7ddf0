//! Forward-pass tracing used for layer summaries and cost estimates.
//!
//! A [`Trace`] is threaded through composite forwards. When disabled every
//! call is a no-op; when recording, each leaf layer appends a [`LayerRecord`]
//! with its output shape, the parameters it owns directly, and an estimate of
//! multiply-accumulate operations.
//!
//! MAC rules per layer kind:
//!
//! * convolution: `out_elems * (in_channels / groups * kernel_volume + bias)`
//! * linear: `in_features * out_elems`
//! * batch norm: `2 * out_elems`
//! * max pooling: `0`
//! * adaptive average pooling: `(kernel_volume + 1) * out_elems`
//!
//! Composite units may add rows for work done outside their children, for
//! instance the window products of an attention path.

use candle_core::Tensor;

use crate::params::join;

/// Cost model implemented by layers that appear in a summary.
pub trait Profiled {
    /// Short type name shown in the summary table.
    fn kind(&self) -> &'static str;

    /// Parameters owned directly by this layer, excluding children that
    /// record their own rows.
    fn own_parameters(&self) -> usize;

    /// Multiply-accumulate estimate for one forward pass.
    fn macs(&self, input: &[usize], output: &[usize]) -> u64;
}

/// One row of a traced forward pass.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerRecord {
    pub path: String,
    pub kind: &'static str,
    pub output_shape: Vec<usize>,
    pub parameters: usize,
    pub macs: u64,
}

/// Collects [`LayerRecord`]s during a forward pass.
#[derive(Debug, Default)]
pub struct Trace {
    enabled: bool,
    scopes: Vec<String>,
    records: Vec<LayerRecord>,
}

impl Trace {
    /// A trace that ignores every call.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// A trace that records every leaf layer.
    pub fn recording() -> Self {
        Self {
            enabled: true,
            ..Self::default()
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Enters a named child scope.
    pub fn push(&mut self, name: impl Into<String>) {
        if self.enabled {
            self.scopes.push(name.into());
        }
    }

    /// Leaves the innermost scope.
    pub fn pop(&mut self) {
        if self.enabled {
            self.scopes.pop();
        }
    }

    fn path(&self, name: &str) -> String {
        join(&self.scopes.join("."), name)
    }

    /// Records `layer` under `name` within the current scope. An empty name
    /// records the scope itself.
    pub fn record(&mut self, name: &str, layer: &dyn Profiled, input: &Tensor, output: &Tensor) {
        if !self.enabled {
            return;
        }
        let record = LayerRecord {
            path: self.path(name),
            kind: layer.kind(),
            output_shape: output.dims().to_vec(),
            parameters: layer.own_parameters(),
            macs: layer.macs(input.dims(), output.dims()),
        };
        log::trace!(
            "{} {} -> {:?} params={} macs={}",
            record.path,
            record.kind,
            record.output_shape,
            record.parameters,
            record.macs
        );
        self.records.push(record);
    }

    pub fn records(&self) -> &[LayerRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<LayerRecord> {
        self.records
    }
}

/// Product of all dimensions.
pub fn elems(dims: &[usize]) -> u64 {
    dims.iter().map(|&d| d as u64).product()
}
