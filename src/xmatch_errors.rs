use thiserror::Error;

#[derive(Error, Debug)]
pub enum XmatchError {
    #[error("Invalid HEALPix order: {0} (must be <= 28)")]
    InvalidResolution(u32),

    #[error("Insufficient data for density estimation: {0}")]
    InsufficientData(String),

    #[error("Fit quality below threshold: held-out deviance {deviance} exceeds {threshold}")]
    FitQuality { deviance: f64, threshold: f64 },

    #[error("Missing positional error for source {0} and no fill_unknown configured")]
    MissingError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Database query failed: {0}")]
    DatabaseQuery(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Atlas container format error: {0}")]
    ContainerFormat(String),

    #[error("Incommensurate atlas geometries: {0} != {1} pixels")]
    IncommensurateAtlas(u64, u64),

    #[error("Unable to perform file operation: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Binary serialization error: {0}")]
    BincodeError(#[from] bincode::Error),

    #[error("YAML configuration error: {0}")]
    YamlError(#[from] serde_yml::Error),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Store database error: {0}")]
    StoreDatabaseError(#[from] redb::DatabaseError),

    #[error("Store transaction error: {0}")]
    StoreTransactionError(#[from] redb::TransactionError),

    #[error("Store table error: {0}")]
    StoreTableError(#[from] redb::TableError),

    #[error("Store storage error: {0}")]
    StoreStorageError(#[from] redb::StorageError),

    #[error("Store commit error: {0}")]
    StoreCommitError(#[from] redb::CommitError),
}
