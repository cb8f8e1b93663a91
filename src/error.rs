use thiserror::Error;

#[derive(Error, Debug)]
pub enum BatchError {
    #[error("Schema conflict: existing table has columns {found:?}, header supplied {supplied:?}")]
    SchemaConflict {
        found: Vec<String>,
        supplied: Vec<String>,
    },

    #[error("Record has {got} values, schema has {expected} columns")]
    ArityMismatch { expected: usize, got: usize },

    #[error("State store has no schema yet, load data first")]
    SchemaMissing,

    #[error("Failed to open state store {path}: {source}")]
    StoreUnavailable {
        path: String,
        source: rusqlite::Error,
    },

    #[error("Query failed: filter='{filter}', order='{order}', limit={limit}: {source}")]
    QueryFailure {
        filter: String,
        order: String,
        limit: i64,
        source: rusqlite::Error,
    },

    #[error("Row not found: rowid={0}")]
    RowNotFound(i64),

    #[error("Store write failed: {0}")]
    StoreWrite(#[from] rusqlite::Error),

    #[error("Invalid command template: {0}")]
    TemplateParse(String),

    #[error("Unknown field '{0}' in command template")]
    TemplateField(String),

    #[error("Separator must be a single character, got '{0}'")]
    Separator(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BatchError>;
