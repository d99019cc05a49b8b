//! hc-config: the per-run engine configuration document.
//!
//! The engine reads one XML document on initialize. It names a controlling
//! component and describes that component (library, working directory, input
//! file). The document is regenerated for every run.

pub mod builder;
pub mod document;

pub use builder::{ComponentSpec, ConfigDocumentBuilder, load_document, to_xml_string};
pub use document::{ComponentRecord, ConfigDocument, Control, Documentation, StartRef};

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error("XML serialization error: {0}")]
    Serialize(#[from] quick_xml::se::SeError),

    #[error("XML parse error: {0}")]
    Deserialize(#[from] quick_xml::de::DeError),

    #[error("Control references '{control}' but the component is named '{component}'")]
    MismatchedControl { control: String, component: String },

    #[error("Invalid value: {field} ({reason})")]
    InvalidValue { field: &'static str, reason: String },
}
