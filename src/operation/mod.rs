//! Reversible operations.
//!
//! An operation is a value: a kind, positional arguments and a string
//! attribute bag. What the kind *means* lives in the registry, which maps
//! it to backup/perform/undo/describe behavior. Keeping the value and the
//! behavior apart makes every operation serializable into the journal --
//! including whatever state `backup` and `perform` need to communicate to a
//! later `undo`, which they record as attributes.

pub mod builtin;

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;

use crate::errors::InstallError;
use crate::protocol;
use crate::temp;
use crate::variables::Variables;

/// Attribute naming the component an operation belongs to.
pub const ATTR_COMPONENT: &str = "component";
/// Attribute marking an operation as requiring elevation.
pub const ATTR_ADMIN: &str = "admin";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Operation {
    pub kind: String,
    pub args: Vec<String>,
    pub attrs: BTreeMap<String, String>,
}

impl Operation {
    pub fn new(kind: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            kind: kind.into(),
            args,
            attrs: BTreeMap::new(),
        }
    }

    pub fn arg(&self, index: usize) -> Result<&str> {
        self.args.get(index).map(String::as_str).ok_or_else(|| {
            InstallError::Operation {
                kind: self.kind.clone(),
                detail: format!("missing argument {index}"),
            }
            .into()
        })
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.attrs.insert(name.into(), value.into());
    }

    pub fn clear_attr(&mut self, name: &str) {
        self.attrs.remove(name);
    }

    pub fn component(&self) -> Option<&str> {
        self.attr(ATTR_COMPONENT)
    }

    pub fn set_component(&mut self, name: &str) {
        self.set_attr(ATTR_COMPONENT, name);
    }

    pub fn is_admin(&self) -> bool {
        self.attr(ATTR_ADMIN) == Some("true")
    }

    pub fn set_admin(&mut self, admin: bool) {
        if admin {
            self.set_attr(ATTR_ADMIN, "true");
        } else {
            self.clear_attr(ATTR_ADMIN);
        }
    }

    /// Apply variable substitution to every argument. Called by the
    /// executor immediately before `perform`, on a snapshot of the map.
    pub fn expand_args(&mut self, variables: &Variables) {
        for arg in &mut self.args {
            *arg = variables.expand(arg);
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        protocol::encode_operation(&self.kind, &self.args, &self.attrs)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let (kind, args, attrs) = protocol::decode_operation(payload)?;
        Ok(Self { kind, args, attrs })
    }
}

/// Everything a behavior may touch while running. `perform` and `undo`
/// execute on a worker thread; the variable snapshot and the progress sink
/// are fixed for the duration of one phase.
pub struct OpEnv<'a> {
    pub variables: Variables,
    pub temp: &'a temp::Context,
    pub progress: &'a (dyn Fn(f64) + Send + Sync),
}

const NO_PROGRESS: &(dyn Fn(f64) + Send + Sync) = &|_| {};

impl<'a> OpEnv<'a> {
    pub fn silent(temp: &'a temp::Context) -> Self {
        Self {
            variables: Variables::new(),
            temp,
            progress: NO_PROGRESS,
        }
    }
}

/// The four phases of an operation kind.
pub trait OperationBehavior: Send + Sync {
    /// Capture whatever pre-state `undo` will need. Runs before `perform`
    /// and must not modify the target.
    fn backup(&self, _op: &mut Operation, _env: &OpEnv<'_>) -> Result<()> {
        Ok(())
    }

    fn perform(&self, op: &mut Operation, env: &OpEnv<'_>) -> Result<()>;

    fn undo(&self, op: &mut Operation, env: &OpEnv<'_>) -> Result<()>;

    fn describe(&self, op: &Operation) -> String {
        op.kind.clone()
    }

    /// Whether `perform` emits intermediate progress in `0..1`.
    fn reports_progress(&self) -> bool {
        false
    }
}

/// Registry mapping operation kinds to behavior. One per process side: the
/// engine has one, the elevated helper builds its own.
pub struct OperationRegistry {
    behaviors: HashMap<String, Box<dyn OperationBehavior>>,
}

impl OperationRegistry {
    /// An empty registry. Tests use this to stub behavior wholesale.
    pub fn empty() -> Self {
        Self {
            behaviors: HashMap::new(),
        }
    }

    /// The registry with all built-in kinds. Extension points register
    /// additional kinds on top before the run starts.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        builtin::register(&mut registry);
        registry
    }

    pub fn register(&mut self, kind: impl Into<String>, behavior: Box<dyn OperationBehavior>) {
        self.behaviors.insert(kind.into(), behavior);
    }

    pub fn behavior(&self, kind: &str) -> Result<&dyn OperationBehavior> {
        self.behaviors
            .get(kind)
            .map(|behavior| &**behavior)
            .ok_or_else(|| InstallError::UnknownOperation(kind.to_owned()).into())
    }

    /// Construct an operation, verifying the kind exists.
    pub fn create(&self, kind: &str, args: Vec<String>) -> Result<Operation> {
        self.behavior(kind)?;
        Ok(Operation::new(kind, args))
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.behaviors.contains_key(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::{OpEnv, Operation, OperationBehavior, OperationRegistry};
    use crate::errors::InstallError;
    use crate::variables::Variables;

    struct Nop;
    impl OperationBehavior for Nop {
        fn perform(&self, _op: &mut Operation, _env: &OpEnv<'_>) -> anyhow::Result<()> {
            Ok(())
        }
        fn undo(&self, _op: &mut Operation, _env: &OpEnv<'_>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn unknown_kinds_are_rejected() {
        let registry = OperationRegistry::empty();
        let err = registry.create("Vanish", vec![]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<InstallError>(),
            Some(InstallError::UnknownOperation(kind)) if kind == "Vanish"
        ));
    }

    #[test]
    fn registration_makes_a_kind_constructible() {
        let mut registry = OperationRegistry::empty();
        registry.register("Nop", Box::new(Nop));
        let mut op = registry.create("Nop", vec!["@TargetDir@/x".into()]).unwrap();
        op.set_component("org.sdk");
        op.set_admin(true);
        assert!(op.is_admin());
        assert_eq!(op.component(), Some("org.sdk"));

        let mut vars = Variables::new();
        vars.set("TargetDir", "/opt/p");
        op.expand_args(&vars);
        assert_eq!(op.arg(0).unwrap(), "/opt/p/x");
    }

    #[test]
    fn operations_round_trip_through_bytes() {
        let mut op = Operation::new("Copy", vec!["a".into(), "b".into()]);
        op.set_component("c");
        op.set_attr("backup", "/tmp/bk");
        let decoded = Operation::decode(&op.encode()).unwrap();
        assert_eq!(decoded, op);
    }
}
