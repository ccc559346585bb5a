//! Deserialize step: turns a per-source byte map into a scripting-runtime
//! value.

use indexmap::IndexMap;
use pyo3::prelude::*;

use crate::codec::Codec;
use crate::errors::ScriptError;
use crate::scripthost::bridge::ScriptHost;
use crate::scripthost::convert;

pub struct DeserializeStep {
    codec: Box<dyn Codec>,
}

impl DeserializeStep {
    pub fn new(codec: Box<dyn Codec>) -> DeserializeStep {
        DeserializeStep { codec }
    }

    /// No resources to acquire: the codec is stateless. Present for
    /// uniformity with the other step roles' lifecycle.
    pub fn awaken(&mut self) -> Result<(), ScriptError> {
        Ok(())
    }

    /// No-op; see `awaken`.
    pub fn end(&mut self) {}

    pub fn deserialize(
        &self,
        bytes_by_source: IndexMap<String, Vec<u8>>,
    ) -> Result<Py<PyAny>, ScriptError> {
        let value = self
            .codec
            .deserialize(&bytes_by_source)
            .map_err(|e| ScriptError::Runtime("<deserialize>".into(), e.to_string()))?;
        let host = ScriptHost::global();
        Ok(host.acquire(|acq| convert::to_python(acq.py(), &value)))
    }
}
