//! The scripted-project executor.
//!
//! Loads the user's entry module in the embedded interpreter, resolves
//! `(object, method)` invocations against it, and owns the two-phase
//! cleanup contract: `stop_threads` (client went away, keep the code
//! loaded) vs `cleanup` (new upload or shutdown, tear everything down).
//!
//! True module-cache eviction is impossible in-process; the interpreter is
//! process-global state. `cleanup` evicts what it can, and the worker
//! recycles itself after the next upload to make eviction real.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use pyo3::prelude::*;
use pyo3::types::{PyBool, PyDict, PyList, PyString, PyTuple, PyType};
use robolink_model::{ErrorCode, Reply};
use serde_json::{Map, Value};

const INJECTED_CALLABLE: &str = "push_message";

/// What the injected callable does with `(event, data)` pairs.
pub type PushFn = Arc<dyn Fn(&str, Value) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("no entry file (main.py or __init__.py) in `{0}`")]
    NoEntryFile(PathBuf),
    #[error("project directory name is not importable")]
    BadPackageName,
    #[error("loading the entry module failed: {0}")]
    Python(String),
}

pub struct ScriptExecutor {
    project_path: PathBuf,
    push: Option<PushFn>,
    module: Option<Py<PyAny>>,
    module_name: String,
    /// Named object instances, created lazily on first reference.
    context: HashMap<String, Py<PyAny>>,
    /// `sys.path` as it was before the load, for restoration.
    original_sys_path: Vec<String>,
    /// `sys.modules` keys before the load, so eviction only touches what
    /// the load added.
    baseline_modules: HashSet<String>,
}

impl ScriptExecutor {
    pub fn new(project_path: impl Into<PathBuf>, push: Option<PushFn>) -> Self {
        Self {
            project_path: project_path.into(),
            push,
            module: None,
            module_name: String::new(),
            context: HashMap::new(),
            original_sys_path: Vec::new(),
            baseline_modules: HashSet::new(),
        }
    }

    /// Import the entry module, inject the push callable, run `init()`.
    pub fn load(&mut self) -> Result<(), LoadError> {
        let module_name = self.entry_module_name()?;

        Python::with_gil(|py| {
            self.snapshot_interpreter_state(py)
                .map_err(|e| LoadError::Python(e.to_string()))?;

            self.import_entry_module(py, &module_name)
                .map_err(|e| LoadError::Python(e.to_string()))
        })?;

        self.module_name = module_name;
        Ok(())
    }

    fn entry_module_name(&self) -> Result<String, LoadError> {
        if self.project_path.join("main.py").is_file() {
            return Ok("main".to_owned());
        }
        if self.project_path.join("__init__.py").is_file() {
            return self
                .project_path
                .file_name()
                .and_then(|n| n.to_str())
                .map(str::to_owned)
                .ok_or(LoadError::BadPackageName);
        }

        Err(LoadError::NoEntryFile(self.project_path.clone()))
    }

    fn snapshot_interpreter_state(&mut self, py: Python<'_>) -> PyResult<()> {
        let sys = py.import("sys")?;

        self.original_sys_path = sys.getattr("path")?.extract()?;

        let modules = sys.getattr("modules")?.downcast_into::<PyDict>()?;
        self.baseline_modules = modules
            .keys()
            .iter()
            .filter_map(|k| k.extract::<String>().ok())
            .collect();

        Ok(())
    }

    fn import_entry_module(&mut self, py: Python<'_>, module_name: &str) -> PyResult<()> {
        let sys = py.import("sys")?;
        let path_list = sys.getattr("path")?.downcast_into::<PyList>()?;

        // For a package entry, the *parent* directory must be importable.
        let import_root = if module_name == "main" {
            self.project_path.clone()
        } else {
            self.project_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| self.project_path.clone())
        };
        let import_root = import_root.to_string_lossy().into_owned();
        if !self.original_sys_path.contains(&import_root) {
            path_list.insert(0, &import_root)?;
        }

        let module = py.import(module_name)?;

        if let Some(push) = &self.push {
            let handle = PushHandle { push: push.clone() };
            module.setattr(INJECTED_CALLABLE, Py::new(py, handle)?)?;
            tracing::debug!("injected {INJECTED_CALLABLE} into the entry module");
        }

        if module.hasattr("init")? {
            module.getattr("init")?.call0()?;
        }

        self.module = Some(module.into_any().unbind());
        Ok(())
    }

    /// Invoke `object.method(**args)` and wrap the outcome as a [`Reply`].
    pub fn call(&mut self, object: &str, method: &str, args: &Map<String, Value>) -> Reply {
        Python::with_gil(|py| {
            let target = match self.resolve_object(py, object) {
                Ok(target) => target,
                Err(ResolveError::NotFound) => {
                    return Reply::error_with_message(
                        ErrorCode::ObjectNotFound,
                        format!("object `{object}` not found in context or module"),
                    );
                }
                Err(ResolveError::Python(message)) => {
                    return Reply::error_with_message(ErrorCode::ExecutionFailed, message);
                }
            };
            let target = target.bind(py);

            let Ok(callable) = target.getattr(method) else {
                return Reply::error_with_message(
                    ErrorCode::MethodNotFound,
                    format!("object `{object}` has no method `{method}`"),
                );
            };
            if !callable.is_callable() {
                return Reply::error_with_message(
                    ErrorCode::MethodNotFound,
                    format!("`{object}.{method}` is not callable"),
                );
            }

            let kwargs = match map_to_kwargs(py, args) {
                Ok(kwargs) => kwargs,
                Err(error) => {
                    return Reply::error_with_message(
                        ErrorCode::ExecutionFailed,
                        format!("couldn't convert arguments: {error}"),
                    );
                }
            };

            match callable.call((), Some(&kwargs)) {
                Ok(value) => match py_to_json(&value) {
                    Ok(result) => Reply::with_result(result),
                    Err(error) => Reply::error_with_message(
                        ErrorCode::ExecutionFailed,
                        format!("return value is not serializable: {error}"),
                    ),
                },
                Err(error) => {
                    tracing::error!(object, method, %error, "user method raised");
                    Reply::error_with_message(ErrorCode::ExecutionFailed, error.to_string())
                }
            }
        })
    }

    fn resolve_object(&mut self, py: Python<'_>, name: &str) -> Result<Py<PyAny>, ResolveError> {
        if let Some(existing) = self.context.get(name) {
            return Ok(existing.clone_ref(py));
        }

        let Some(module) = &self.module else {
            return Err(ResolveError::NotFound);
        };
        let module = module.bind(py);

        let attr = if module.hasattr(name).unwrap_or(false) {
            module
                .getattr(name)
                .map_err(|e| ResolveError::Python(e.to_string()))?
        } else {
            // `sport_client` may refer to `class SportClient` that user code
            // never instantiated itself.
            match find_class_by_snake_name(&module, name) {
                Ok(Some(class)) => class,
                Ok(None) => return Err(ResolveError::NotFound),
                Err(e) => return Err(ResolveError::Python(e.to_string())),
            }
        };

        // A class is instantiated with zero arguments and memoized; an
        // existing instance is memoized as-is.
        let instance = if attr.is_instance_of::<PyType>() {
            attr.call0().map_err(|e| {
                ResolveError::Python(format!(
                    "couldn't instantiate `{name}` with zero arguments: {e}"
                ))
            })?
        } else {
            attr
        };

        let instance = instance.unbind();
        self.context.insert(name.to_owned(), instance.clone_ref(py));

        Ok(instance)
    }

    /// Best-effort stop protocol: module-level `stop()`, then `stop()` on
    /// every context instance. Failures are logged; the context and the
    /// loaded module are deliberately preserved.
    pub fn stop_threads(&self) {
        Python::with_gil(|py| {
            let mut hooks = 0usize;

            if let Some(module) = &self.module {
                let module = module.bind(py);
                if module.hasattr("stop").unwrap_or(false) {
                    match module.getattr("stop").and_then(|f| f.call0()) {
                        Ok(_) => hooks += 1,
                        Err(error) => tracing::warn!(%error, "module stop() failed"),
                    }
                }
            }

            for (name, instance) in &self.context {
                let instance = instance.bind(py);
                let Ok(stop) = instance.getattr("stop") else {
                    continue;
                };
                if !stop.is_callable() {
                    continue;
                }
                match stop.call0() {
                    Ok(_) => hooks += 1,
                    Err(error) => tracing::warn!(name, %error, "stop() failed"),
                }
            }

            tracing::info!(hooks, "user stop protocol completed");
        });
    }

    /// Full teardown: evict the injected callable, drop the context, evict
    /// modules the load added, restore `sys.path`. Idempotent.
    pub fn cleanup(&mut self) {
        Python::with_gil(|py| {
            if let Err(error) = self.cleanup_inner(py) {
                tracing::warn!(%error, "executor cleanup was incomplete");
            }
        });
    }

    fn cleanup_inner(&mut self, py: Python<'_>) -> PyResult<()> {
        if let Some(module) = self.module.take() {
            let module = module.bind(py);
            if module.hasattr(INJECTED_CALLABLE)? {
                module.delattr(INJECTED_CALLABLE)?;
            }
        }

        self.context.clear();

        let sys = py.import("sys")?;

        if !self.module_name.is_empty() {
            let modules = sys.getattr("modules")?.downcast_into::<PyDict>()?;
            let submodule_prefix = format!("{}.", self.module_name);
            let added: Vec<String> = modules
                .keys()
                .iter()
                .filter_map(|k| k.extract::<String>().ok())
                .filter(|name| !self.baseline_modules.contains(name))
                .filter(|name| *name == self.module_name || name.starts_with(&submodule_prefix))
                .collect();
            for name in added {
                tracing::debug!(module = name, "evicting module");
                modules.del_item(name)?;
            }
        }

        if !self.original_sys_path.is_empty() {
            let restored = PyList::new(py, &self.original_sys_path)?;
            sys.setattr("path", restored)?;
            self.original_sys_path.clear();
        }

        Ok(())
    }
}

enum ResolveError {
    NotFound,
    Python(String),
}

/// Find a class in the module whose snake_case name matches `name`.
fn find_class_by_snake_name<'py>(
    module: &Bound<'py, PyAny>,
    name: &str,
) -> PyResult<Option<Bound<'py, PyAny>>> {
    let namespace = module.getattr("__dict__")?.downcast_into::<PyDict>()?;

    for (attr_name, attr_value) in namespace.iter() {
        if !attr_value.is_instance_of::<PyType>() {
            continue;
        }
        let Ok(attr_name) = attr_name.extract::<String>() else {
            continue;
        };
        if camel_to_snake(&attr_name) == name {
            return Ok(Some(attr_value));
        }
    }

    Ok(None)
}

fn camel_to_snake(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);

    for (i, c) in chars.iter().enumerate() {
        if c.is_ascii_uppercase() {
            let prev_is_lower = i > 0 && (chars[i - 1].is_ascii_lowercase() || chars[i - 1].is_ascii_digit());
            let next_is_lower = chars.get(i + 1).is_some_and(|n| n.is_ascii_lowercase());
            if i > 0 && (prev_is_lower || next_is_lower) {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(*c);
        }
    }

    out
}

/// The callable injected into the user module as `push_message`.
#[pyclass]
struct PushHandle {
    push: PushFn,
}

#[pymethods]
impl PushHandle {
    #[pyo3(signature = (event, data = None))]
    fn __call__(&self, event: String, data: Option<Bound<'_, PyAny>>) -> PyResult<()> {
        let data = match &data {
            Some(value) => py_to_json(value)?,
            None => Value::Null,
        };
        (self.push)(&event, data);

        Ok(())
    }
}

fn map_to_kwargs<'py>(
    py: Python<'py>,
    args: &Map<String, Value>,
) -> PyResult<Bound<'py, PyDict>> {
    let kwargs = PyDict::new(py);
    for (key, value) in args {
        kwargs.set_item(key, json_to_py(py, value)?)?;
    }
    Ok(kwargs)
}

fn json_to_py<'py>(py: Python<'py>, value: &Value) -> PyResult<Bound<'py, PyAny>> {
    Ok(match value {
        Value::Null => py.None().into_bound(py),
        Value::Bool(b) => PyBool::new(py, *b).to_owned().into_any(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.into_pyobject(py)?.into_any()
            } else {
                n.as_f64().unwrap_or(f64::NAN).into_pyobject(py)?.into_any()
            }
        }
        Value::String(s) => PyString::new(py, s).into_any(),
        Value::Array(items) => {
            let list = PyList::empty(py);
            for item in items {
                list.append(json_to_py(py, item)?)?;
            }
            list.into_any()
        }
        Value::Object(map) => {
            let dict = PyDict::new(py);
            for (key, item) in map {
                dict.set_item(key, json_to_py(py, item)?)?;
            }
            dict.into_any()
        }
    })
}

fn py_to_json(value: &Bound<'_, PyAny>) -> PyResult<Value> {
    if value.is_none() {
        return Ok(Value::Null);
    }
    if let Ok(b) = value.downcast::<PyBool>() {
        return Ok(Value::Bool(b.is_true()));
    }
    if let Ok(i) = value.extract::<i64>() {
        return Ok(Value::from(i));
    }
    if let Ok(f) = value.extract::<f64>() {
        return Ok(serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null));
    }
    if let Ok(s) = value.extract::<String>() {
        return Ok(Value::String(s));
    }
    if let Ok(list) = value.downcast::<PyList>() {
        let mut items = Vec::with_capacity(list.len());
        for item in list.iter() {
            items.push(py_to_json(&item)?);
        }
        return Ok(Value::Array(items));
    }
    if let Ok(tuple) = value.downcast::<PyTuple>() {
        let mut items = Vec::with_capacity(tuple.len());
        for item in tuple.iter() {
            items.push(py_to_json(&item)?);
        }
        return Ok(Value::Array(items));
    }
    if let Ok(dict) = value.downcast::<PyDict>() {
        let mut object = Map::new();
        for (key, item) in dict.iter() {
            let key = key.str()?.extract::<String>()?;
            object.insert(key, py_to_json(&item)?);
        }
        return Ok(Value::Object(object));
    }

    // Anything else crosses the wire as its string form.
    Ok(Value::String(value.str()?.extract()?))
}

/// The interpreter (sys.path, sys.modules) is process-global; tests that
/// load user code take this lock so load/cleanup pairs don't interleave.
#[cfg(test)]
pub(crate) static INTERPRETER_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
