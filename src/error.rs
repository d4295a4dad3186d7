use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("Unparseable period '{value}' in source row {row}")]
    PeriodParse { row: usize, value: String },

    #[error("Invalid fee '{value}' in source row {row}")]
    InvalidFee { row: usize, value: String },

    #[error("Ambiguous match: {count} fee records for ({operation}, {employee}, {month})")]
    AmbiguousMatch {
        operation: String,
        employee: String,
        month: String,
        count: usize,
    },

    #[error("Required column '{column}' not found in {path}")]
    MissingColumn { column: String, path: PathBuf },

    #[error("Sheet '{name}' not found in {path}")]
    SheetNotFound { name: String, path: PathBuf },

    #[error("Workbook error during {stage} ({path}): {message}")]
    Workbook {
        stage: &'static str,
        path: PathBuf,
        message: String,
    },

    #[error("IO error during {stage} ({path}): {source}")]
    Io {
        stage: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ReconcileError {
    pub(crate) fn io(stage: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            stage,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn workbook(
        stage: &'static str,
        path: impl Into<PathBuf>,
        message: impl ToString,
    ) -> Self {
        Self::Workbook {
            stage,
            path: path.into(),
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ReconcileError>;
