//! Graph descriptions from disk. `.json` files are read as JSON, anything
//! else as TOML.

use std::path::Path;

use async_trait::async_trait;
use pipeline::graph::GraphDescription;
use pipeline::ports::{GraphLoader, LoadError};

#[derive(Debug, Default, Clone, Copy)]
pub struct FileGraphLoader;

#[async_trait]
impl GraphLoader for FileGraphLoader {
    async fn load(&self, source: &str) -> Result<GraphDescription, LoadError> {
        let text = match tokio::fs::read_to_string(source).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(LoadError::NotFound {
                    location: source.to_string(),
                })
            }
            Err(e) => {
                return Err(LoadError::Io {
                    location: source.to_string(),
                    message: e.to_string(),
                })
            }
        };
        let is_json = Path::new(source)
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let parsed = if is_json {
            serde_json::from_str(&text).map_err(|e| e.to_string())
        } else {
            toml::from_str(&text).map_err(|e| e.to_string())
        };
        parsed.map_err(|message| LoadError::Parse {
            location: source.to_string(),
            message,
        })
    }
}
