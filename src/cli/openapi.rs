//! `vmdeck openapi`: print or save the API document.

use clap::Args;
use std::path::{Path, PathBuf};
use utoipa::OpenApi;

use vmdeck::{ApiDoc, Error, Result};

/// Export the OpenAPI document without starting the server.
#[derive(Args, Debug)]
pub struct OpenapiCmd {
    /// Write to FILE instead of stdout.
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Document format.
    #[arg(short, long, value_enum, default_value_t = DocFormat::Json)]
    format: DocFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum DocFormat {
    Json,
    Yaml,
}

impl OpenapiCmd {
    /// Render the document and write it out.
    pub fn run(&self) -> Result<()> {
        let document = render(self.format)?;
        match &self.output {
            Some(path) => {
                write_document(path, &document)?;
                eprintln!("OpenAPI document written to {}", path.display());
            }
            None => println!("{}", document),
        }
        Ok(())
    }
}

fn render(format: DocFormat) -> Result<String> {
    let doc = ApiDoc::openapi();
    let rendered = match format {
        DocFormat::Json => doc.to_pretty_json().map_err(|e| e.to_string()),
        DocFormat::Yaml => serde_yaml::to_string(&doc).map_err(|e| e.to_string()),
    };
    rendered.map_err(|e| Error::Config(format!("render openapi document as {:?}: {}", format, e)))
}

fn write_document(path: &Path, document: &str) -> Result<()> {
    std::fs::write(path, document).map_err(|e| {
        Error::Io(std::io::Error::new(
            e.kind(),
            format!("write {}: {}", path.display(), e),
        ))
    })?;
    tracing::debug!(path = %path.display(), bytes = document.len(), "openapi document written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_both_formats() {
        let json = render(DocFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert!(value["paths"]["/api/v1/vms"].is_object());

        let yaml = render(DocFormat::Yaml).unwrap();
        assert!(yaml.contains("/api/v1/storage-pools"));
    }

    #[test]
    fn test_write_error_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("openapi.json");
        let err = write_document(&path, "{}").unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("openapi.json"), "{}", err);

        let path = dir.path().join("openapi.json");
        write_document(&path, "{}").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{}");
    }
}
