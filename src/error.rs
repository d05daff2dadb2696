use std::path::PathBuf;

/// Failure to decode a raw model output into function calls.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("Invalid syntax. Failed to decode AST. {0}")]
    InvalidSyntax(String),
    #[error("Unsupported expression in function call: {0}")]
    UnsupportedNode(String),
    #[error("Malformed XML: {0}")]
    MalformedXml(String),
    #[error("Malformed JSON function calls: {0}")]
    MalformedJson(String),
    #[error("Function element is missing its name attribute")]
    MissingFunctionName,
    #[error("Did not output in the specified format: {0}")]
    WrongFormat(String),
}

/// Failure of a single call against a simulator. Always captured into the
/// call's result slot by the execution engine.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExecutionError {
    #[error("Unknown method: {0}")]
    UnknownMethod(String),
    #[error("Invalid arguments for {method}: {reason}")]
    InvalidArguments { method: String, reason: String },
    #[error("{0}")]
    Simulator(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SimulatorError {
    #[error("Unknown backend class: {0}")]
    UnknownClass(String),
    #[error("Method {method} is exposed by both {first} and {second}")]
    MethodCollision {
        method: String,
        first: String,
        second: String,
    },
    #[error("Invalid initial config for {class}: {reason}")]
    InvalidConfig { class: String, reason: String },
    #[error("Missing memory snapshot file: {}", .0.display())]
    MissingSnapshot(PathBuf),
    #[error("Snapshot I/O error at {}: {source}", path.display())]
    SnapshotIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Snapshot JSON error: {0}")]
    SnapshotJson(#[from] serde_json::Error),
}

/// Failure raised by a model handler. Contained at the entry boundary.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Model request failed: {0}")]
    Request(String),
    #[error("Malformed model response: {0}")]
    MalformedResponse(String),
    #[error("Handler task panicked or was cancelled: {0}")]
    Join(String),
}

/// Unrecoverable errors. These abort the run for a model before any entry is scheduled.
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Invalid model name '{0}'")]
    UnknownModel(String),
    #[error("Unknown test category '{0}'")]
    UnknownCategory(String),
    #[error("Malformed test entry id '{0}'")]
    MalformedId(String),
    #[error("Duplicate test entry id '{0}'")]
    DuplicateEntry(String),
    #[error("Entry {entry} depends on {dependency}, which is neither scheduled nor completed")]
    MissingDependency { entry: String, dependency: String },
    #[error("Dependency cycle involving entry {0}")]
    DependencyCycle(String),
    #[error(transparent)]
    Simulator(#[from] SimulatorError),
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON error in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("No {what} found for entry {id}")]
    MissingRecord { what: &'static str, id: String },
    #[error("Replaying entry {id} failed: {source}")]
    Replay {
        id: String,
        #[source]
        source: Box<EntryError>,
    },
    #[error("Background task failed: {0}")]
    Task(String),
}

/// Anything that stops a single entry. The scheduler turns it into the
/// entry's error result and moves on.
#[derive(Debug, thiserror::Error)]
pub enum EntryError {
    #[error(transparent)]
    Handler(#[from] HandlerError),
    #[error(transparent)]
    Simulator(#[from] SimulatorError),
    #[error(transparent)]
    Harness(#[from] HarnessError),
}
