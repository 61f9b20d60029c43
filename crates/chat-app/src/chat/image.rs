use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use snafu::ResultExt;

use super::error::{ChatResult, ReadImageSnafu};

/// Raw image picked by the user, ready to be sent as a data URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageAttachment {
    pub bytes: Vec<u8>,
    /// MIME subtype, e.g. `png` for `image/png`.
    pub subtype: String,
}

impl ImageAttachment {
    pub fn new(bytes: Vec<u8>, subtype: impl Into<String>) -> Self {
        Self {
            bytes,
            subtype: subtype.into(),
        }
    }

    pub async fn from_path(path: &Path) -> ChatResult<Self> {
        let bytes = tokio::fs::read(path).await.context(ReadImageSnafu {
            stage: "read-image-file",
            path: path.to_path_buf(),
        })?;
        Ok(Self::new(bytes, subtype_for_path(path)))
    }

    pub fn data_url(&self) -> String {
        format!(
            "data:image/{};base64,{}",
            self.subtype,
            STANDARD.encode(&self.bytes)
        )
    }
}

fn subtype_for_path(path: &Path) -> String {
    let extension = path
        .extension()
        .and_then(|extension| extension.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    match extension.as_str() {
        "jpg" | "jpeg" => "jpeg".to_string(),
        "svg" => "svg+xml".to_string(),
        "" => "png".to_string(),
        other => other.to_string(),
    }
}
