//! Checkpoint persistence.
//!
//! A checkpoint is one safetensors file: every `VarMap` entry stored as f32,
//! plus the flat [`VqVaeConfig`] as JSON under the `"config"` metadata key.
//! Loading rebuilds the model from that config and overwrites each variable.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::Path;

use candle_core::safetensors::Load;
use candle_core::{DType, Device, Tensor};
use safetensors::SafeTensors;
use safetensors::tensor::Dtype;
use tempfile::NamedTempFile;

use crate::config::VqVaeConfig;
use crate::vqvae::VqVae;
use crate::{Error, Result};

/// Metadata key holding the JSON model configuration.
pub const CONFIG_KEY: &str = "config";

/// Serialize `model` and atomically replace `path` with it.
pub fn save(model: &VqVae, path: &Path) -> Result<()> {
    let bytes = to_bytes(model)?;

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(&bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| Error::Io(e.error))?;

    tracing::info!(path = %path.display(), bytes = bytes.len(), "saved checkpoint");
    Ok(())
}

/// Build a fresh model from the stored config and restore its variables.
pub fn load(path: &Path, device: &Device) -> Result<VqVae> {
    let bytes = std::fs::read(path)?;
    let model = from_bytes(&bytes, device)?;
    tracing::info!(
        path = %path.display(),
        num_labels = model.num_labels(),
        "loaded checkpoint"
    );
    Ok(model)
}

fn to_bytes(model: &VqVae) -> Result<Vec<u8>> {
    let tensors: BTreeMap<String, Tensor> = {
        let vars = model
            .varmap()
            .data()
            .lock()
            .map_err(|_| Error::Checkpoint("parameter map lock poisoned".into()))?;
        vars.iter()
            .map(|(name, var)| Ok((name.clone(), var.as_tensor().to_dtype(DType::F32)?)))
            .collect::<Result<_>>()?
    };

    let metadata = HashMap::from([(
        CONFIG_KEY.to_string(),
        serde_json::to_string(model.config())?,
    )]);
    Ok(safetensors::tensor::serialize(&tensors, Some(metadata))?)
}

fn from_bytes(bytes: &[u8], device: &Device) -> Result<VqVae> {
    let (_, metadata) = SafeTensors::read_metadata(bytes)?;
    let config_json = metadata
        .metadata()
        .as_ref()
        .and_then(|m| m.get(CONFIG_KEY))
        .ok_or_else(|| Error::Checkpoint(format!("missing \"{CONFIG_KEY}\" metadata")))?;
    let config: VqVaeConfig = serde_json::from_str(config_json)?;

    let model = VqVae::new(config, device)?;
    let tensors = SafeTensors::deserialize(bytes)?;
    {
        let vars = model
            .varmap()
            .data()
            .lock()
            .map_err(|_| Error::Checkpoint("parameter map lock poisoned".into()))?;
        if tensors.len() != vars.len() {
            return Err(Error::Checkpoint(format!(
                "checkpoint has {} tensors, model expects {}",
                tensors.len(),
                vars.len()
            )));
        }
        for (name, var) in vars.iter() {
            let view = tensors
                .tensor(name)
                .map_err(|_| Error::Checkpoint(format!("missing tensor {name}")))?;
            if view.dtype() != Dtype::F32 {
                return Err(Error::Checkpoint(format!(
                    "tensor {name} has dtype {:?}, expected F32",
                    view.dtype()
                )));
            }
            if view.shape() != var.dims() {
                return Err(Error::Checkpoint(format!(
                    "tensor {name} has shape {:?}, model expects {:?}",
                    view.shape(),
                    var.dims()
                )));
            }
            let value = view.load(device)?;
            var.set(&value.to_dtype(var.dtype())?)?;
        }
    }
    Ok(model)
}
