pub mod aft_conv;
pub mod aft_full;

use std::path::Path;

use serde::de::DeserializeOwned;

use crate::error::{AftError, Result};

pub use aft_conv::{AftConv, AftConvConfig};
pub use aft_full::{AftFull, AftFullConfig};

pub(crate) fn read_json_config<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path).map_err(|source| AftError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_str(&raw)?)
}
