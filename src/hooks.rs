//! Lifecycle callbacks a component may participate in.
//!
//! The engine calls these at fixed points; the default implementation does
//! nothing. A scripting layer (or a test double) implements the trait and
//! receives the component name plus, for operation hooks, the operation
//! about to run. Hook errors are the component's errors: a failing
//! `installation_started` aborts that component like a failing operation.

use anyhow::Result;

use crate::operation::Operation;

pub trait ComponentHooks {
    /// The component's catalog data has been loaded and its script handle
    /// (if any) resolved.
    fn component_loaded(&mut self, _component: &str) -> Result<()> {
        Ok(())
    }

    /// Called before the component's first operation performs.
    fn installation_started(&mut self, _component: &str) -> Result<()> {
        Ok(())
    }

    /// Called after the component's operations committed.
    fn installation_finished(&mut self, _component: &str) -> Result<()> {
        Ok(())
    }

    fn operation_starting(&mut self, _component: &str, _operation: &Operation) -> Result<()> {
        Ok(())
    }

    fn operation_finished(&mut self, _component: &str, _operation: &Operation) -> Result<()> {
        Ok(())
    }
}

/// The hook set used when no scripting layer is attached.
#[derive(Default)]
pub struct NoHooks;

impl ComponentHooks for NoHooks {}
