//! Serialize step: turns the final script's output into bytes.

use pyo3::prelude::*;

use crate::codec::Codec;
use crate::errors::ScriptError;
use crate::scripthost::bridge::ScriptHost;
use crate::scripthost::convert;

pub struct SerializeStep {
    codec: Box<dyn Codec>,
}

impl SerializeStep {
    pub fn new(codec: Box<dyn Codec>) -> SerializeStep {
        SerializeStep { codec }
    }

    /// No resources to acquire: the codec is stateless. Present for
    /// uniformity with the other step roles' lifecycle.
    pub fn awaken(&mut self) -> Result<(), ScriptError> {
        Ok(())
    }

    /// No-op; see `awaken`.
    pub fn end(&mut self) {}

    pub fn serialize(&self, value: Py<PyAny>) -> Result<Vec<u8>, ScriptError> {
        let host = ScriptHost::global();
        let script_value = host.acquire(|acq| convert::from_python(acq.py(), &value))?;
        self.codec
            .serialize(&script_value)
            .map_err(|e| ScriptError::Runtime("<serialize>".into(), e.to_string()))
    }
}
