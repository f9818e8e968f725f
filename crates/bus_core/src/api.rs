//! API Registry (SPEC §4.B): the set of APIs this client serves, plus the
//! two auto-registered internal APIs (SPEC §4.J).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use serde_json::Value;

use crate::errors::{BusError, RpcError};

pub type ProcedureFuture = Pin<Box<dyn Future<Output = Result<Value, RpcError>> + Send>>;
pub type ProcedureHandler = Arc<dyn Fn(Value) -> ProcedureFuture + Send + Sync>;

/// Declares one named, possibly-required keyword parameter of a procedure.
/// Used by `cast_values` to validate/coerce incoming kwargs before dispatch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: String,
    pub required: bool,
}

impl ParamSpec {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: false,
        }
    }
}

#[derive(Clone)]
pub struct Procedure {
    pub param_schema: Vec<ParamSpec>,
    pub handler: ProcedureHandler,
}

impl Procedure {
    pub fn new(param_schema: Vec<ParamSpec>, handler: ProcedureHandler) -> Self {
        Self {
            param_schema,
            handler,
        }
    }

    /// Every required parameter present in `kwargs`'s object keys.
    pub fn validate_kwargs(&self, kwargs: &Value) -> Result<(), String> {
        let obj = kwargs.as_object();
        for spec in &self.param_schema {
            if spec.required {
                let present = obj.map(|o| o.contains_key(&spec.name)).unwrap_or(false);
                if !present {
                    return Err(format!("missing required parameter: {}", spec.name));
                }
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventDecl {
    pub kwarg_names: Vec<String>,
}

impl EventDecl {
    pub fn new(kwarg_names: Vec<String>) -> Self {
        Self { kwarg_names }
    }

    pub fn validate_kwargs(&self, kwargs: &Value) -> Result<(), String> {
        let Some(obj) = kwargs.as_object() else {
            return Err("event kwargs must be an object".to_owned());
        };
        for key in obj.keys() {
            if !self.kwarg_names.iter().any(|n| n == key) {
                return Err(format!("unexpected event argument: {key}"));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct Api {
    pub name: String,
    pub procedures: HashMap<String, Procedure>,
    pub events: HashMap<String, EventDecl>,
}

impl Api {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            procedures: HashMap::new(),
            events: HashMap::new(),
        }
    }

    pub fn with_procedure(mut self, name: impl Into<String>, procedure: Procedure) -> Self {
        self.procedures.insert(name.into(), procedure);
        self
    }

    pub fn with_event(mut self, name: impl Into<String>, decl: EventDecl) -> Self {
        self.events.insert(name.into(), decl);
        self
    }

    pub fn procedure(&self, name: &str) -> Option<&Procedure> {
        self.procedures.get(name)
    }

    pub fn event(&self, name: &str) -> Option<&EventDecl> {
        self.events.get(name)
    }
}

/// Registered APIs, keyed by name. Registration happens before `start_server`;
/// reads happen continuously from the RPC engine and event listener manager.
#[derive(Default)]
pub struct ApiRegistry {
    apis: RwLock<HashMap<String, Arc<Api>>>,
}

impl ApiRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, api: Api) {
        write(&self.apis).insert(api.name.clone(), Arc::new(api));
    }

    pub fn get(&self, name: &str) -> Result<Arc<Api>, BusError> {
        read(&self.apis)
            .get(name)
            .cloned()
            .ok_or_else(|| BusError::UnknownApi(name.to_owned()))
    }

    pub fn all(&self) -> Vec<Arc<Api>> {
        read(&self.apis).values().cloned().collect()
    }

    pub fn names(&self) -> Vec<String> {
        read(&self.apis).keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.apis).is_empty()
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop_handler() -> ProcedureHandler {
        Arc::new(|_kwargs| Box::pin(async { Ok(Value::Null) }))
    }

    #[test]
    fn registry_rejects_unknown_api() {
        let registry = ApiRegistry::new();
        let err = registry.get("missing").unwrap_err();
        assert!(matches!(err, BusError::UnknownApi(name) if name == "missing"));
    }

    #[test]
    fn procedure_validates_required_kwargs() {
        let procedure = Procedure::new(vec![ParamSpec::required("id")], noop_handler());
        assert!(procedure.validate_kwargs(&json!({"id": 1})).is_ok());
        assert!(procedure.validate_kwargs(&json!({})).is_err());
    }

    #[test]
    fn event_decl_rejects_unknown_kwargs() {
        let decl = EventDecl::new(vec!["id".to_owned()]);
        assert!(decl.validate_kwargs(&json!({"id": 1})).is_ok());
        assert!(decl.validate_kwargs(&json!({"other": 1})).is_err());
    }
}
