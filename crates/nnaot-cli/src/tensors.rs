//! Input tensors read from small JSON files: `{"dims": [1, 4], "values": [...]}`.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use nnaot::Tensor;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorFile {
    pub dims: Vec<usize>,
    pub values: Vec<f32>,
}

impl TensorFile {
    pub fn into_tensor(self) -> nnaot::Result<Tensor> {
        Tensor::from_f32(self.dims, self.values)
    }
}

/// `--input name=path` as given on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputArg {
    pub name: String,
    pub path: PathBuf,
}

impl std::str::FromStr for InputArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((name, path)) if !name.is_empty() && !path.is_empty() => Ok(InputArg {
                name: name.to_string(),
                path: PathBuf::from(path),
            }),
            _ => Err(format!("expected NAME=FILE, got `{s}`")),
        }
    }
}

pub fn read_tensor(path: &Path) -> anyhow::Result<Tensor> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading tensor file {}", path.display()))?;
    let file: TensorFile = serde_json::from_str(&text)
        .with_context(|| format!("parsing tensor file {}", path.display()))?;
    file.into_tensor()
        .with_context(|| format!("tensor in {}", path.display()))
}

/// Reads every input file, rejecting names bound twice.
pub fn load_inputs(args: &[InputArg]) -> anyhow::Result<Vec<(String, Tensor)>> {
    let mut loaded: Vec<(String, Tensor)> = Vec::with_capacity(args.len());
    for arg in args {
        if loaded.iter().any(|(name, _)| name == &arg.name) {
            bail!("input `{}` is bound more than once", arg.name);
        }
        let tensor = read_tensor(&arg.path)?;
        log::debug!("input `{}`: {} from {}", arg.name, tensor.ty(), arg.path.display());
        loaded.push((arg.name.clone(), tensor));
    }
    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_args_split_on_the_first_equals_sign() {
        let arg: InputArg = "x=data/a=b.json".parse().unwrap();
        assert_eq!(arg.name, "x");
        assert_eq!(arg.path, PathBuf::from("data/a=b.json"));
        assert!("x".parse::<InputArg>().is_err());
        assert!("=file.json".parse::<InputArg>().is_err());
    }

    #[test]
    fn element_count_must_match_dims() {
        let file = TensorFile {
            dims: vec![2, 2],
            values: vec![1.0, 2.0, 3.0],
        };
        assert!(file.into_tensor().is_err());
    }
}
