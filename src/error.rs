use derive_more::{Display, Error};

#[derive(Debug, Display, Error)]
pub enum ConfigError {
    #[display("failed to read config file")]
    ReadFile,
    #[display("failed to parse config: {reason}")]
    Parse { reason: String },
    #[display("invalid config: {field}")]
    Validation { field: String },
}

#[derive(Debug, Display, Error)]
pub enum ExchangeError {
    #[display("request to {exchange} failed")]
    Request { exchange: String },
    #[display("failed to parse response from {exchange}")]
    ResponseParse { exchange: String },
}

#[derive(Debug, Display, Error)]
pub enum StorageError {
    #[display("database migration failed")]
    Migration,
    #[display("failed to insert data")]
    Insert,
    #[display("failed to query data")]
    Query,
    #[display("failed to delete data")]
    Delete,
    #[display("stored value is malformed: {column}")]
    Decode { column: String },
}

#[derive(Debug, Display, Error)]
pub enum IndicatorError {
    #[display("invalid parameter: {name}")]
    InvalidParameter { name: String },
}

#[derive(Debug, Display, Error)]
pub enum SyncError {
    #[display("candle store unavailable")]
    Storage,
}

#[derive(Debug, Display, Error)]
pub enum EngineError {
    #[display("indicator engine storage failure")]
    Storage,
}

#[derive(Debug, Display, Error)]
pub enum PatternError {
    #[display("pattern stage failed: {reason}")]
    Stage { reason: String },
}

#[derive(Debug, Display, Error)]
pub enum PipelineError {
    #[display("{stage} already in progress")]
    StageBusy { stage: String },
    #[display("{stage} failed")]
    StageFailed { stage: String },
    #[display("{stage} postcondition violated: {reason}")]
    Postcondition { stage: String, reason: String },
}
