//! Startup-time registry of module constructors.
//!
//! Drivers and controllers register a constructor under a stable id; the
//! application then instantiates whatever its configuration lists.

use super::module::Module;
use crate::error::{RimeError, RimeResult};
use std::collections::BTreeMap;
use std::fmt;

pub type ModuleConstructor = Box<dyn Fn() -> Box<dyn Module> + Send + Sync>;

#[derive(Default)]
pub struct ModuleFactory {
    constructors: BTreeMap<String, ModuleConstructor>,
}

impl ModuleFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, id: &str, constructor: F) -> RimeResult<()>
    where
        F: Fn() -> Box<dyn Module> + Send + Sync + 'static,
    {
        if id.is_empty() {
            return Err(RimeError::InvalidInput("empty module id".into()));
        }
        if self.constructors.contains_key(id) {
            return Err(RimeError::AlreadyRegistered(format!("module id '{}'", id)));
        }
        self.constructors.insert(id.to_string(), Box::new(constructor));
        Ok(())
    }

    pub fn create(&self, id: &str) -> RimeResult<Box<dyn Module>> {
        self.constructors
            .get(id)
            .map(|ctor| ctor())
            .ok_or_else(|| RimeError::not_found(format!("module id '{}'", id)))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.constructors.contains_key(id)
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.constructors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constructors.is_empty()
    }
}

impl fmt::Debug for ModuleFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleFactory").field("ids", &self.ids()).finish()
    }
}
