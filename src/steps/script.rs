//! Script step: hosts one user script in an isolated namespace,
//! invokes its `step` function per iteration, manages a small set of
//! driver-supplied variables, and optionally calls an `end` function on
//! shutdown.

use log::warn;
use pyo3::prelude::*;

use crate::cancel::CancelToken;
use crate::errors::ScriptError;
use crate::scripthost::bridge::{ModuleSource, ScriptHost};
use crate::scripthost::managed_vars::ManagedVariable;

/// `step`'s detected parameter count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StepArity {
    Zero,
    One,
}

pub struct ScriptStep {
    label: String,
    script_path: String,
    module_key: String,
    arity: Option<StepArity>,
    has_end: bool,
    managed_vars: Vec<Box<dyn ManagedVariable>>,
    #[allow(dead_code)]
    cancel: CancelToken,
}

impl ScriptStep {
    pub fn new(
        label: impl Into<String>,
        script_path: impl Into<String>,
        managed_vars: Vec<Box<dyn ManagedVariable>>,
    ) -> ScriptStep {
        let label = label.into();
        ScriptStep {
            module_key: format!("script::{}", label),
            label,
            script_path: script_path.into(),
            arity: None,
            has_end: false,
            managed_vars,
            cancel: CancelToken::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn set_cancel_token(&mut self, token: CancelToken) {
        self.cancel = token;
    }

    /// Executes the script's top-level code once, requires a callable `step`
    /// of arity 0 or 1, detects an optional `end`, and binds every managed
    /// variable present in the namespace to its initial value.
    pub fn awaken(&mut self) -> Result<(), ScriptError> {
        let source = std::fs::read_to_string(&self.script_path).map_err(|e| {
            ScriptError::TopLevel(self.script_path.clone(), format!("cannot read script file: {}", e))
        })?;
        let host = ScriptHost::global();
        host.add_module(
            &self.module_key,
            ModuleSource::Code {
                source: &source,
                file_name: &self.script_path,
            },
        )?;

        self.arity = if host.is_function(&self.module_key, "step", 0)? {
            Some(StepArity::Zero)
        } else if host.is_function(&self.module_key, "step", 1)? {
            Some(StepArity::One)
        } else {
            return Err(ScriptError::MissingStep(self.script_path.clone()));
        };
        self.has_end = host.is_function(&self.module_key, "end", 0)?;

        host.acquire(|acq| -> Result<(), ScriptError> {
            let py = acq.py();
            for var in &self.managed_vars {
                if host.is_global(&self.module_key, var.name())? {
                    let value = var.initial_value(py);
                    host.set_global(&self.module_key, var.name(), &value)?;
                }
            }
            Ok(())
        })
    }

    /// Invokes `step`: zero-arity ignores `arg` entirely; one-arity forwards
    /// `arg` or the runtime's `None`-equivalent.
    /// Refreshes every managed variable present in the namespace afterward.
    pub fn invoke(&self, arg: Option<Py<PyAny>>) -> Result<Py<PyAny>, ScriptError> {
        let host = ScriptHost::global();
        let result = match self.arity.expect("invoke() called before awaken()") {
            StepArity::Zero => host.call_function(&self.module_key, "step", &[])?,
            StepArity::One => {
                let value = arg.unwrap_or_else(|| host.none());
                host.call_function(&self.module_key, "step", &[value])?
            }
        };

        host.acquire(|acq| -> Result<(), ScriptError> {
            let py = acq.py();
            for var in &self.managed_vars {
                if host.is_global(&self.module_key, var.name())? {
                    let value = var.per_step_value(py);
                    host.set_global(&self.module_key, var.name(), &value)?;
                }
            }
            Ok(())
        })?;

        Ok(result)
    }

    /// Invokes `end` if detected, logging and swallowing any error, then
    /// disposes this script's namespace.
    pub fn end(&mut self) {
        if self.has_end {
            let host = ScriptHost::global();
            if let Err(e) = host.call_function(&self.module_key, "end", &[]) {
                warn!("script step '{}': end() raised: {}", self.label, e);
            }
        }
        ScriptHost::global().remove_module(&self.module_key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    fn ensure_host() {
        if !ScriptHost::is_initialized() {
            ScriptHost::initialize(None).unwrap();
        }
    }

    fn write_script(source: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::Builder::new().suffix(".py").tempfile().unwrap();
        f.write_all(source.as_bytes()).unwrap();
        f
    }

    #[test]
    #[serial]
    fn zero_arity_step_ignores_its_argument() {
        ensure_host();
        let f = write_script("counter = 0\ndef step():\n    global counter\n    counter += 1\n    return counter\n");
        let mut step = ScriptStep::new("counter", f.path().to_str().unwrap(), vec![]);
        step.awaken().unwrap();

        let host = ScriptHost::global();
        for expected in 1..=3i64 {
            let result = step.invoke(None).unwrap();
            let value: i64 = host.acquire(|acq| result.extract(acq.py()).unwrap());
            assert_eq!(value, expected);
        }
        step.end();
    }

    #[test]
    #[serial]
    fn one_arity_step_receives_the_forwarded_value() {
        ensure_host();
        let f = write_script("def step(x):\n    return x['a']\n");
        let mut step = ScriptStep::new("lookup", f.path().to_str().unwrap(), vec![]);
        step.awaken().unwrap();

        let host = ScriptHost::global();
        let arg = host.acquire(|acq| {
            let dict = pyo3::types::PyDict::new_bound(acq.py());
            dict.set_item("a", 7).unwrap();
            dict.unbind().into_any()
        });
        let result = step.invoke(Some(arg)).unwrap();
        let value: i64 = host.acquire(|acq| result.extract(acq.py()).unwrap());
        assert_eq!(value, 7);
        step.end();
    }

    #[test]
    #[serial]
    fn missing_step_function_is_a_fatal_awaken_error() {
        ensure_host();
        let f = write_script("x = 1\n");
        let mut step = ScriptStep::new("broken", f.path().to_str().unwrap(), vec![]);
        assert!(matches!(step.awaken(), Err(ScriptError::MissingStep(_))));
    }

    #[test]
    #[serial]
    fn end_function_is_invoked_once_on_shutdown() {
        ensure_host();
        let f = write_script(
            "ticks = []\ndef step():\n    return 1\ndef end():\n    ticks.append('done')\n",
        );
        let mut step = ScriptStep::new("with-end", f.path().to_str().unwrap(), vec![]);
        step.awaken().unwrap();
        assert!(step.has_end);
        step.end(); // must not panic or raise
    }
}
