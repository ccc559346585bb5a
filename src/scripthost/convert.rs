//! Conversions between the codec's host-side `ScriptValue` and live Python
//! objects — the boundary where a deserialize step hands the script chain
//! its first argument, and where a serialize step turns the last script's
//! return value back into bytes.

use indexmap::IndexMap;
use pyo3::prelude::*;
use pyo3::types::{PyBool, PyBytes, PyDict, PyList, PyLong};

use crate::codec::ScriptValue;
use crate::errors::ScriptError;

pub fn to_python(py: Python<'_>, value: &ScriptValue) -> Py<PyAny> {
    match value {
        ScriptValue::None => py.None(),
        ScriptValue::Bool(b) => b.into_py(py),
        ScriptValue::Int(i) => i.into_py(py),
        ScriptValue::Float(f) => f.into_py(py),
        ScriptValue::Str(s) => s.into_py(py),
        ScriptValue::Bytes(b) => PyBytes::new_bound(py, b).unbind().into_any(),
        ScriptValue::List(items) => {
            let list = PyList::empty_bound(py);
            for item in items {
                list.append(to_python(py, item))
                    .expect("append to a freshly created list cannot fail");
            }
            list.unbind().into_any()
        }
        ScriptValue::Map(map) => {
            let dict = PyDict::new_bound(py);
            for (k, v) in map {
                dict.set_item(k, to_python(py, v))
                    .expect("set_item on a freshly created dict cannot fail");
            }
            dict.unbind().into_any()
        }
    }
}

/// Converts a Python object back into a `ScriptValue`. Anything outside the
/// supported shapes (None, bool, int, float, str, bytes, list, dict-with-
/// string-keys) is a fatal "unexpected shape" error.
pub fn from_python(py: Python<'_>, value: &Py<PyAny>) -> Result<ScriptValue, ScriptError> {
    let bound = value.bind(py);
    if bound.is_none() {
        return Ok(ScriptValue::None);
    }
    if let Ok(b) = bound.downcast::<PyBool>() {
        return Ok(ScriptValue::Bool(b.is_true()));
    }
    if let Ok(i) = bound.extract::<i64>() {
        return Ok(ScriptValue::Int(i));
    }
    if bound.downcast::<PyLong>().is_ok() {
        // Extracted above and failed only because it overflows i64; coercing
        // it to Float here would silently lose integer identity.
        let repr = bound.str().map(|s| s.to_string()).unwrap_or_else(|_| "?".into());
        return Err(ScriptError::UnexpectedArgShape(format!(
            "int {} is out of i64 range and has no lossless script value representation",
            repr
        )));
    }
    if let Ok(f) = bound.extract::<f64>() {
        return Ok(ScriptValue::Float(f));
    }
    if let Ok(s) = bound.extract::<String>() {
        return Ok(ScriptValue::Str(s));
    }
    if let Ok(b) = bound.downcast::<PyBytes>() {
        return Ok(ScriptValue::Bytes(b.as_bytes().to_vec()));
    }
    if let Ok(list) = bound.downcast::<PyList>() {
        let mut items = Vec::with_capacity(list.len());
        for item in list.iter() {
            items.push(from_python(py, &item.unbind())?);
        }
        return Ok(ScriptValue::List(items));
    }
    if let Ok(dict) = bound.downcast::<PyDict>() {
        let mut out = IndexMap::with_capacity(dict.len());
        for (k, v) in dict.iter() {
            let key: String = k
                .extract()
                .map_err(|e| ScriptError::UnexpectedArgShape(format!("non-string dict key: {}", e)))?;
            out.insert(key, from_python(py, &v.unbind())?);
        }
        return Ok(ScriptValue::Map(out));
    }
    Err(ScriptError::UnexpectedArgShape(format!(
        "cannot represent a Python value of type '{}' as a script value",
        bound.get_type().name().unwrap_or_else(|_| "?".into())
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pyo3::types::PyModule;
    use serial_test::serial;

    #[test]
    #[serial]
    fn round_trips_through_python_and_back() {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(|py| {
            let mut map = IndexMap::new();
            map.insert("count".to_string(), ScriptValue::Int(3));
            map.insert(
                "tags".to_string(),
                ScriptValue::List(vec![ScriptValue::Str("a".into()), ScriptValue::None]),
            );
            let value = ScriptValue::Map(map);

            let py_obj = to_python(py, &value);
            let back = from_python(py, &py_obj).unwrap();
            assert_eq!(back, value);
        });
    }

    #[test]
    #[serial]
    fn bool_is_not_misread_as_int() {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(|py| {
            let py_obj = to_python(py, &ScriptValue::Bool(true));
            assert_eq!(from_python(py, &py_obj).unwrap(), ScriptValue::Bool(true));
        });
    }

    #[test]
    #[serial]
    fn an_int_beyond_i64_range_is_a_fatal_error_not_a_float() {
        pyo3::prepare_freethreaded_python();
        Python::with_gil(|py| {
            let module = PyModule::from_code_bound(py, "huge = 2**200", "huge.py", "huge").unwrap();
            let py_obj = module.getattr("huge").unwrap().unbind();
            assert!(matches!(
                from_python(py, &py_obj),
                Err(ScriptError::UnexpectedArgShape(_))
            ));
        });
    }
}
