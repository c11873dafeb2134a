use std::fmt;

use nnaot::Tensor;

/// Values of one network output, dequantized, with the arg-max of each row.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputReport {
    pub name: String,
    pub ty: String,
    pub values: Vec<f32>,
    /// Index of the largest element per batch row; a single entry for
    /// tensors of rank below two.
    pub argmax: Vec<usize>,
}

impl OutputReport {
    pub fn new(name: &str, tensor: &Tensor) -> nnaot::Result<Self> {
        let float = tensor.to_f32();
        let values = float.as_f32().map(<[f32]>::to_vec).unwrap_or_default();
        let argmax = if float.ty().rank() >= 2 {
            let rows = float.ty().dims()[0];
            let mut argmax = Vec::with_capacity(rows);
            for row in 0..rows {
                let slice = float.slice_outer(row)?.to_tensor();
                argmax.extend(slice.min_max_arg().map(|(_, max)| max));
            }
            argmax
        } else {
            float.min_max_arg().map(|(_, max)| max).into_iter().collect()
        };
        Ok(Self {
            name: name.to_string(),
            ty: tensor.ty().to_string(),
            values,
            argmax,
        })
    }
}

impl fmt::Display for OutputReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} : {}", self.name, self.ty)?;
        let values: Vec<String> = self.values.iter().map(|v| format!("{v:.6}")).collect();
        writeln!(f, "  values: [{}]", values.join(", "))?;
        for (row, index) in self.argmax.iter().enumerate() {
            writeln!(f, "  row {row}: arg-max {index}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argmax_is_reported_per_batch_row() {
        let tensor = Tensor::from_f32(vec![2, 3], vec![0.1, 0.7, 0.2, 0.9, 0.05, 0.05]).unwrap();
        let report = OutputReport::new("probs", &tensor).unwrap();
        assert_eq!(report.argmax, vec![1, 0]);
        let text = report.to_string();
        assert!(text.contains("row 1: arg-max 0"), "{text}");
    }

    #[test]
    fn vectors_report_a_single_argmax() {
        let tensor = Tensor::from_f32(vec![4], vec![3.0, -1.0, 8.0, 2.0]).unwrap();
        let report = OutputReport::new("v", &tensor).unwrap();
        assert_eq!(report.argmax, vec![2]);
        assert_eq!(report.values.len(), 4);
    }
}
