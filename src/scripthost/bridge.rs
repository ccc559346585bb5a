//! Script-host bridge: a single, process-wide, thread-safe gate
//! around the embedded scripting runtime (Python via `pyo3`): init, per-module
//! namespace creation and caching, function introspection/invocation, and
//! orderly shutdown.

use std::cell::Cell;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use log::{error, info, warn};
use once_cell::sync::OnceCell;
use pyo3::prelude::*;
use pyo3::types::{PyModule, PyTuple};

use crate::errors::ScriptError;

static HOST: OnceCell<ScriptHost> = OnceCell::new();

thread_local! {
    /// `pyo3`'s GIL is already safely reentrant on one thread, so this never
    /// gates anything; it just makes nested `acquire()` calls visible if
    /// something ever goes wrong.
    static RECURSION_DEPTH: Cell<u32> = Cell::new(0);
}

/// A module, identified by an existing-import name or by inline source code
/// executed as a fresh namespace.
pub enum ModuleSource<'a> {
    Code { source: &'a str, file_name: &'a str },
    Import(&'a str),
}

/// A scoped handle to the runtime's exclusive execution right. Every bridge call that touches runtime state holds one.
pub struct Acquisition<'py> {
    py: Python<'py>,
}

impl<'py> Acquisition<'py> {
    pub fn py(&self) -> Python<'py> {
        self.py
    }
}

/// Process-wide gate around the embedded scripting runtime.
pub struct ScriptHost {
    modules: Mutex<HashMap<String, Py<PyModule>>>,
    none_value: OnceCell<Py<PyAny>>,
    next_auto_key: AtomicU64,
}

impl ScriptHost {
    fn new() -> ScriptHost {
        ScriptHost {
            modules: Mutex::new(HashMap::new()),
            none_value: OnceCell::new(),
            next_auto_key: AtomicU64::new(0),
        }
    }

    /// Initializes the process-wide host. Refuses a second initialize.
    /// Adds `module_search_root` to `sys.path` and replaces
    /// `sys.stdout`/`sys.stderr` with adapters that route into this host's
    /// logger.
    pub fn initialize(module_search_root: Option<&Path>) -> Result<(), ScriptError> {
        if HOST.get().is_some() {
            return Err(ScriptError::Runtime(
                "<bridge>".into(),
                "script host already initialized".into(),
            ));
        }
        let host = ScriptHost::new();
        host.acquire(|acq| -> Result<(), ScriptError> {
            let py = acq.py();
            if let Some(root) = module_search_root {
                add_to_sys_path(py, root)?;
            }
            install_log_adapters(py)?;
            Ok(())
        })?;
        HOST.set(host).map_err(|_| {
            ScriptError::Runtime("<bridge>".into(), "race on script host initialize".into())
        })?;
        Ok(())
    }

    /// The process-wide instance. Panics if `initialize` hasn't run yet,
    /// wired up once, early, by the driver's worker thread.
    pub fn global() -> &'static ScriptHost {
        HOST.get()
            .expect("ScriptHost::initialize was not called before first use")
    }

    pub fn is_initialized() -> bool {
        HOST.get().is_some()
    }

    /// Runs `f` with the runtime's exclusive execution right held.
    /// Reentrant-safe within a single thread; contended across threads via
    /// the underlying GIL.
    pub fn acquire<F, R>(&self, f: F) -> R
    where
        F: FnOnce(Acquisition<'_>) -> R,
    {
        RECURSION_DEPTH.with(|d| d.set(d.get() + 1));
        let result = Python::with_gil(|py| f(Acquisition { py }));
        RECURSION_DEPTH.with(|d| d.set(d.get().saturating_sub(1)));
        result
    }

    /// Creates a new namespace under `key` (or imports an existing module by
    /// name), executes its code, and caches the result. Duplicate keys fail.
    pub fn add_module(&self, key: &str, source: ModuleSource<'_>) -> Result<(), ScriptError> {
        if self.modules.lock().unwrap().contains_key(key) {
            return Err(ScriptError::DuplicateModuleKey(key.to_string()));
        }
        let module = self.acquire(|acq| -> Result<Py<PyModule>, ScriptError> {
            let py = acq.py();
            let bound = match source {
                ModuleSource::Code { source, file_name } => {
                    PyModule::from_code_bound(py, source, file_name, key).map_err(|e| {
                        ScriptError::TopLevel(key.to_string(), format_py_err(py, &e))
                    })?
                }
                ModuleSource::Import(name) => py
                    .import_bound(name)
                    .map_err(|e| ScriptError::TopLevel(key.to_string(), format_py_err(py, &e)))?,
            };
            Ok(bound.unbind())
        })?;
        self.modules.lock().unwrap().insert(key.to_string(), module);
        Ok(())
    }

    /// Generates a fresh, unused key and loads `source` under it (intended
    /// for test isolation).
    pub fn add_module_auto_key(&self, source: ModuleSource<'_>) -> Result<String, ScriptError> {
        let n = self.next_auto_key.fetch_add(1, Ordering::SeqCst);
        let key = format!("__auto_{}", n);
        self.add_module(&key, source)?;
        Ok(key)
    }

    /// Disposes a cached namespace. Idempotent.
    pub fn remove_module(&self, key: &str) {
        let removed = self.modules.lock().unwrap().remove(key);
        if let Some(module) = removed {
            self.acquire(|_acq| drop(module));
        }
    }

    /// Disposes every cached namespace. Idempotent.
    pub fn clear(&self) {
        let removed: Vec<_> = self.modules.lock().unwrap().drain().map(|(_, v)| v).collect();
        if !removed.is_empty() {
            self.acquire(|_acq| drop(removed));
        }
    }

    /// True iff `module_key.name` exists, is callable, and (for a native
    /// Python function/method) its recorded argument count equals `arity`.
    /// Non-native callables (builtins lacking `__code__`) count as true when
    /// callable; their arity isn't verified.
    pub fn is_function(&self, module_key: &str, name: &str, arity: usize) -> Result<bool, ScriptError> {
        self.with_module(module_key, |_py, module| {
            let attr = match module.getattr(name) {
                Ok(a) => a,
                Err(_) => return Ok(false),
            };
            if !attr.is_callable() {
                return Ok(false);
            }
            match attr.getattr("__code__") {
                Ok(code) => {
                    let argcount: usize = code.getattr("co_argcount")?.extract()?;
                    Ok(argcount == arity)
                }
                Err(_) => Ok(true),
            }
        })
    }

    /// Invokes `module_key.name(args...)`. Wraps any runtime error into a
    /// fatal call error naming the function and argument count.
    pub fn call_function(
        &self,
        module_key: &str,
        name: &str,
        args: &[Py<PyAny>],
    ) -> Result<Py<PyAny>, ScriptError> {
        let result = self.with_module(module_key, |py, module| {
            let func = module.getattr(name)?;
            let tuple = PyTuple::new_bound(py, args.iter().map(|a| a.bind(py)));
            let ret = func.call1(tuple)?;
            Ok(ret.unbind())
        });
        result.map_err(|e| match e {
            ScriptError::Runtime(_, message) => ScriptError::CallFailed {
                script: module_key.to_string(),
                function: name.to_string(),
                arg_count: args.len(),
                message,
            },
            other => other,
        })
    }

    pub fn is_global(&self, module_key: &str, name: &str) -> Result<bool, ScriptError> {
        self.with_module(module_key, |_py, module| Ok(module.hasattr(name)?))
    }

    pub fn set_global(&self, module_key: &str, name: &str, value: &Py<PyAny>) -> Result<(), ScriptError> {
        self.with_module(module_key, |py, module| {
            module.setattr(name, value.bind(py))?;
            Ok(())
        })
    }

    /// A cached `None`-equivalent, to avoid repeated runtime round-trips when
    /// forwarding a null argument.
    pub fn none(&self) -> Py<PyAny> {
        self.none_value
            .get_or_init(|| self.acquire(|acq| acq.py().None()))
            .clone()
    }

    fn with_module<F, R>(&self, module_key: &str, f: F) -> Result<R, ScriptError>
    where
        F: for<'py> FnOnce(Python<'py>, &Bound<'py, PyModule>) -> PyResult<R>,
    {
        let module = {
            let modules = self.modules.lock().unwrap();
            modules
                .get(module_key)
                .cloned()
                .ok_or_else(|| ScriptError::ModuleNotFound(module_key.to_string()))?
        };
        self.acquire(|acq| {
            let py = acq.py();
            let bound = module.bind(py);
            f(py, bound).map_err(|e| ScriptError::Runtime(module_key.to_string(), format_py_err(py, &e)))
        })
    }
}

fn format_py_err(py: Python<'_>, err: &PyErr) -> String {
    match err.value_bound(py).str() {
        Ok(s) => format!("{}: {}", err.get_type_bound(py).name().unwrap_or("?"), s),
        Err(_) => err.to_string(),
    }
}

fn add_to_sys_path(py: Python<'_>, root: &Path) -> Result<(), ScriptError> {
    (|| -> PyResult<()> {
        let sys = py.import_bound("sys")?;
        let path = sys.getattr("path")?;
        path.call_method1("append", (root.to_string_lossy().to_string(),))?;
        Ok(())
    })()
    .map_err(|e| ScriptError::Runtime("<bridge>".into(), format_py_err(py, &e)))
}

#[pyclass]
struct LogWriter {
    level: log::Level,
}

#[pymethods]
impl LogWriter {
    fn write(&self, s: &str) -> PyResult<usize> {
        let trimmed = s.trim_end_matches('\n');
        if !trimmed.is_empty() {
            match self.level {
                log::Level::Error => error!("[script] {}", trimmed),
                log::Level::Warn => warn!("[script] {}", trimmed),
                _ => info!("[script] {}", trimmed),
            }
        }
        Ok(s.len())
    }

    fn flush(&self) -> PyResult<()> {
        Ok(())
    }
}

/// Swallows adapter errors so a user script's stray `print()` never crashes
/// the process.
fn install_log_adapters(py: Python<'_>) -> Result<(), ScriptError> {
    let install = || -> PyResult<()> {
        let sys = py.import_bound("sys")?;
        sys.setattr(
            "stdout",
            Py::new(py, LogWriter { level: log::Level::Info })?,
        )?;
        sys.setattr(
            "stderr",
            Py::new(py, LogWriter { level: log::Level::Error })?,
        )?;
        Ok(())
    };
    if let Err(e) = install() {
        warn!("Failed to install script host log adapters: {}", format_py_err(py, &e));
    }
    Ok(())
}
