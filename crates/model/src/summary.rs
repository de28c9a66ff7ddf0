//! Layer-by-layer report of a traced forward pass.
//!
//! Rows come from [`Trace`] records; composite units contribute a row of
//! their own for parameters and work not owned by a child, so the parameter
//! column sums to the network total.

use std::fmt;

use candle_core::{Result, Tensor};
use layers::{LayerRecord, ParameterCount, Parameterized, Trace};

use crate::model::Acmix3d;

/// Result of [`Acmix3d::profile`].
#[derive(Debug, Clone)]
pub struct ProfileReport {
    pub records: Vec<LayerRecord>,
    pub output_shape: Vec<usize>,
    pub total_macs: u64,
    pub parameters: ParameterCount,
}

impl ProfileReport {
    /// Sum of the per-row parameter column.
    pub fn traced_parameters(&self) -> usize {
        self.records.iter().map(|r| r.parameters).sum()
    }

    pub fn giga_macs(&self) -> f64 {
        self.total_macs as f64 / 1e9
    }

    pub fn mega_params(&self) -> f64 {
        self.parameters.total as f64 / 1e6
    }
}

impl Acmix3d {
    /// Runs `x` through the network while recording every layer.
    pub fn profile(&self, x: &Tensor) -> Result<ProfileReport> {
        let mut trace = Trace::recording();
        let logits = self.forward_traced(x, &mut trace)?;
        let records = trace.into_records();
        let total_macs = records.iter().map(|r| r.macs).sum();
        Ok(ProfileReport {
            records,
            output_shape: logits.dims().to_vec(),
            total_macs,
            parameters: self.parameter_count(),
        })
    }
}

/// Formats `1234567` as `1,234,567`.
pub fn format_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

impl fmt::Display for ProfileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let headers = ["Layer", "Type", "Output Shape", "Params", "MACs"];
        let rows: Vec<[String; 5]> = self
            .records
            .iter()
            .map(|r| {
                [
                    r.path.clone(),
                    r.kind.to_string(),
                    format!("{:?}", r.output_shape),
                    format_thousands(r.parameters as u64),
                    format_thousands(r.macs),
                ]
            })
            .collect();

        let mut widths = headers.map(str::len);
        for row in &rows {
            for (width, cell) in widths.iter_mut().zip(row) {
                *width = (*width).max(cell.len());
            }
        }
        let total_width = widths.iter().sum::<usize>() + 2 * (widths.len() - 1);
        let rule = "-".repeat(total_width);

        writeln!(f, "{rule}")?;
        write_row(f, &widths, headers)?;
        writeln!(f, "{}", "=".repeat(total_width))?;
        for row in &rows {
            write_row(f, &widths, row.each_ref().map(String::as_str))?;
        }
        writeln!(f, "{rule}")?;
        writeln!(f, "Total params: {}", format_thousands(self.parameters.total as u64))?;
        writeln!(f, "Trainable params: {}", format_thousands(self.parameters.trainable as u64))?;
        writeln!(f, "Buffer elements: {}", format_thousands(self.parameters.buffers as u64))?;
        writeln!(f, "Output shape: {:?}", self.output_shape)?;
        writeln!(f, "{rule}")?;
        writeln!(f, "MACs: {:.3}G", self.giga_macs())?;
        write!(f, "params: {:.3}M", self.mega_params())
    }
}

fn write_row(f: &mut fmt::Formatter<'_>, widths: &[usize; 5], cells: [&str; 5]) -> fmt::Result {
    writeln!(
        f,
        "{:<w0$}  {:<w1$}  {:<w2$}  {:>w3$}  {:>w4$}",
        cells[0],
        cells[1],
        cells[2],
        cells[3],
        cells[4],
        w0 = widths[0],
        w1 = widths[1],
        w2 = widths[2],
        w3 = widths[3],
        w4 = widths[4]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thousands_separators() {
        assert_eq!(format_thousands(0), "0");
        assert_eq!(format_thousands(999), "999");
        assert_eq!(format_thousands(1000), "1,000");
        assert_eq!(format_thousands(1234567), "1,234,567");
        assert_eq!(format_thousands(100000), "100,000");
    }

    #[test]
    fn display_lists_rows_and_totals() {
        let report = ProfileReport {
            records: vec![LayerRecord {
                path: "layer1.0.conv2".into(),
                kind: "ACmix",
                output_shape: vec![2, 64, 16, 4, 4],
                parameters: 2,
                macs: 1_572_864,
            }],
            output_shape: vec![2, 10],
            total_macs: 1_572_864,
            parameters: ParameterCount {
                total: 2,
                trainable: 2,
                buffers: 0,
            },
        };
        let text = report.to_string();
        assert!(text.contains("layer1.0.conv2"));
        assert!(text.contains("[2, 64, 16, 4, 4]"));
        assert!(text.contains("1,572,864"));
        assert!(text.contains("Total params: 2"));
        assert!(text.contains("MACs: 0.002G"));
        assert!(text.ends_with("params: 0.000M"));
    }
}
