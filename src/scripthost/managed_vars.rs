//! Managed variables: host-owned bindings injected into a
//! script's top-level namespace at awaken and refreshed after every `step()`
//! call. New variable types are new implementers of `ManagedVariable`; the
//! script step itself needs no changes.

use std::sync::Mutex;
use std::time::Instant;

use pyo3::prelude::*;

/// A host-owned binding. `name()` must match an existing top-level binding
/// in the script's namespace for the step to pick it up.
pub trait ManagedVariable: Send + Sync {
    fn name(&self) -> &str;
    /// Value to bind at awaken.
    fn initial_value(&self, py: Python<'_>) -> Py<PyAny>;
    /// Value to bind after each `step()` call.
    fn per_step_value(&self, py: Python<'_>) -> Py<PyAny>;
}

/// Seconds since the previous `step` invocation of this script, or `0.0` on
/// the first invocation. The monotonic clock
/// starts at `initial_value()` (awaken) and restarts on every
/// `per_step_value()` call.
pub struct DeltaTime {
    last_tick: Mutex<Option<Instant>>,
}

impl DeltaTime {
    pub fn new() -> DeltaTime {
        DeltaTime {
            last_tick: Mutex::new(None),
        }
    }
}

impl Default for DeltaTime {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagedVariable for DeltaTime {
    fn name(&self) -> &str {
        "delta_time"
    }

    fn initial_value(&self, py: Python<'_>) -> Py<PyAny> {
        *self.last_tick.lock().unwrap() = Some(Instant::now());
        0.0f64.into_py(py)
    }

    fn per_step_value(&self, py: Python<'_>) -> Py<PyAny> {
        let now = Instant::now();
        let mut guard = self.last_tick.lock().unwrap();
        let elapsed = match *guard {
            Some(prev) => now.duration_since(prev).as_secs_f64(),
            None => 0.0,
        };
        *guard = Some(now);
        elapsed.into_py(py)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn first_tick_is_zero_then_nonnegative() {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(|py| {
            let dt = DeltaTime::new();
            let first: f64 = dt.initial_value(py).extract(py).unwrap();
            assert_eq!(first, 0.0);

            std::thread::sleep(std::time::Duration::from_millis(5));
            let second: f64 = dt.per_step_value(py).extract(py).unwrap();
            assert!(second >= 0.0);
        });
    }
}
