//! Error taxonomy for the pipeline runtime.

use std::fmt;

use thiserror::Error;

/// A fatal configuration error: validation failure before or during driver start.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read pipeline config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse pipeline config '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid pipeline name '{0}': must be at least 3 characters, start with a letter, and contain only letters, digits, '-' or '_'")]
    InvalidName(String),
    #[error("script path '{0}' does not exist")]
    ScriptNotFound(String),
    #[error("script path '{0}' does not have a .py extension")]
    ScriptNotPython(String),
    #[error("pipeline must declare at least one script")]
    NoScripts,
    #[error("pipeline name must be assigned")]
    NameNotAssigned,
    #[error("input and deserialize steps must both be present or both be absent")]
    InputDeserializePairingMismatch,
    #[error("serialize and output steps must both be present or both be absent")]
    SerializeOutputPairingMismatch,
}

/// Surfaced by `Driver::start`: either the synchronous
/// validation failed, or the worker thread never published *started*
/// within its bound.
#[derive(Error, Debug)]
pub enum StartError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("pipeline worker did not signal 'started' within {0:?}")]
    WorkerStartTimeout(std::time::Duration),
}

/// Discovery cannot complete within its constraints (wrong count, handshake
/// failure, no usable network interface).
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("no viable network interface for discovery")]
    NoViableInterface,
    #[error("discovery cancelled before completion")]
    Cancelled,
    #[error("remote endpoint {0} attempted to complete the handshake more than once")]
    DuplicateEndpoint(String),
    #[error("discovered {found} peer(s), expected {expected}")]
    CountMismatch { found: usize, expected: usize },
    #[error("I/O error during discovery: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed discovery message: {0}")]
    Malformed(String),
}

/// A transient failure surfaced by a background send/receive task.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed by peer")]
    Closed,
    #[error("malformed wire frame: {0}")]
    Framing(String),
}

/// A missing/wrong-arity `step` function, or an exception raised from user code.
#[derive(Error, Debug)]
pub enum ScriptError {
    #[error("script '{0}' raised an error during top-level execution: {1}")]
    TopLevel(String, String),
    #[error("script '{0}' does not define a callable 'step' with arity 0 or 1")]
    MissingStep(String),
    #[error("script '{0}' passed a host value of unexpected shape to 'step'")]
    UnexpectedArgShape(String),
    #[error("call to '{function}' with {arg_count} argument(s) in script '{script}' failed: {message}")]
    CallFailed {
        script: String,
        function: String,
        arg_count: usize,
        message: String,
    },
    #[error("module '{0}' is not loaded in the script host")]
    ModuleNotFound(String),
    #[error("duplicate script module key '{0}'")]
    DuplicateModuleKey(String),
    #[error("runtime error in module '{0}': {1}")]
    Runtime(String, String),
}

/// Top-level error surfaced on the driver's exit signal.
#[derive(Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("script error: {0}")]
    Script(#[from] ScriptError),
    /// Not a failure: a clean exit triggered by cancellation.
    #[error("cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled)
    }
}

impl PipelineError {
    /// Walks the `source()` chain down to the leaf, for fatal-error logging.
    pub fn root_cause(&self) -> String {
        let mut current: &dyn std::error::Error = self;
        let mut last = current.to_string();
        while let Some(source) = current.source() {
            last = source.to_string();
            current = source;
        }
        last
    }
}

impl fmt::Debug for PipelineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}
