//! Bidirectional command-name ↔ wire-id table.
//!
//! [`CommandRegistry`] is generic over the handler it stores so the same
//! table backs the server's converters and the beacon's executors. A registry
//! is built once at startup, then shared behind an `Arc`; lookups never lock.
//!
//! Exactly one descriptor resolves for a given id and one for a given name.
//! [`CommandRegistry::register`] resolves collisions last-write-wins and hands
//! back whatever it shadowed; [`CommandRegistry::try_register`] refuses them.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

/// A registered command: wire id, logical name, and side-specific handler.
pub struct CommandDescriptor<H> {
    pub id: u32,
    pub name: String,
    pub handler: H,
}

impl<H> CommandDescriptor<H> {
    pub fn new(id: u32, name: impl Into<String>, handler: H) -> Self {
        Self {
            id,
            name: name.into(),
            handler,
        }
    }
}

/// Lookup key accepted by [`CommandRegistry::resolve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKey<'a> {
    Id(u32),
    Name(&'a str),
}

impl From<u32> for CommandKey<'_> {
    fn from(id: u32) -> Self {
        Self::Id(id)
    }
}

impl<'a> From<&'a str> for CommandKey<'a> {
    fn from(name: &'a str) -> Self {
        Self::Name(name)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("command id {id} already registered as '{existing}'")]
    IdTaken { id: u32, existing: String },
    #[error("command name '{name}' already registered with id {existing}")]
    NameTaken { name: String, existing: u32 },
}

pub struct CommandRegistry<H> {
    by_id: HashMap<u32, Arc<CommandDescriptor<H>>>,
    by_name: HashMap<String, u32>,
}

impl<H> Default for CommandRegistry<H> {
    fn default() -> Self {
        Self {
            by_id: HashMap::new(),
            by_name: HashMap::new(),
        }
    }
}

impl<H> CommandRegistry<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor, replacing any entry that shares its id or name.
    ///
    /// Returns the descriptors that are no longer resolvable.
    pub fn register(&mut self, descriptor: CommandDescriptor<H>) -> Vec<Arc<CommandDescriptor<H>>> {
        let mut shadowed = Vec::new();

        if let Some(old) = self.by_id.remove(&descriptor.id) {
            self.by_name.remove(&old.name);
            shadowed.push(old);
        }
        if let Some(old_id) = self.by_name.remove(&descriptor.name) {
            if let Some(old) = self.by_id.remove(&old_id) {
                shadowed.push(old);
            }
        }

        for old in &shadowed {
            warn!(
                id = descriptor.id,
                name = %descriptor.name,
                shadowed_id = old.id,
                shadowed_name = %old.name,
                "Command registration shadows an existing handler"
            );
        }

        self.by_name.insert(descriptor.name.clone(), descriptor.id);
        self.by_id.insert(descriptor.id, Arc::new(descriptor));
        shadowed
    }

    /// Register a descriptor, failing if its id or name is already taken.
    pub fn try_register(&mut self, descriptor: CommandDescriptor<H>) -> Result<(), RegistryError> {
        if let Some(existing) = self.by_id.get(&descriptor.id) {
            return Err(RegistryError::IdTaken {
                id: descriptor.id,
                existing: existing.name.clone(),
            });
        }
        if let Some(&existing) = self.by_name.get(&descriptor.name) {
            return Err(RegistryError::NameTaken {
                name: descriptor.name,
                existing,
            });
        }
        self.by_name.insert(descriptor.name.clone(), descriptor.id);
        self.by_id.insert(descriptor.id, Arc::new(descriptor));
        Ok(())
    }

    pub fn resolve<'a>(&self, key: impl Into<CommandKey<'a>>) -> Option<Arc<CommandDescriptor<H>>> {
        match key.into() {
            CommandKey::Id(id) => self.resolve_id(id),
            CommandKey::Name(name) => self.resolve_name(name),
        }
    }

    pub fn resolve_id(&self, id: u32) -> Option<Arc<CommandDescriptor<H>>> {
        self.by_id.get(&id).cloned()
    }

    pub fn resolve_name(&self, name: &str) -> Option<Arc<CommandDescriptor<H>>> {
        self.by_name
            .get(name)
            .and_then(|id| self.by_id.get(id))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Registered `(id, name)` pairs, sorted by id.
    pub fn entries(&self) -> Vec<(u32, String)> {
        let mut out: Vec<(u32, String)> = self
            .by_id
            .values()
            .map(|d| (d.id, d.name.clone()))
            .collect();
        out.sort_unstable_by_key(|(id, _)| *id);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_by_id_and_name() {
        let mut reg = CommandRegistry::new();
        reg.try_register(CommandDescriptor::new(1, "shell", "sh"))
            .unwrap();
        assert_eq!(reg.resolve(1u32).unwrap().name, "shell");
        assert_eq!(reg.resolve("shell").unwrap().id, 1);
        assert!(reg.resolve_id(2).is_none());
        assert!(reg.resolve("nope").is_none());
    }

    #[test]
    fn same_id_twice_leaves_one_resolvable() {
        let mut reg = CommandRegistry::new();
        reg.register(CommandDescriptor::new(7, "first", 1));
        let shadowed = reg.register(CommandDescriptor::new(7, "second", 2));

        assert_eq!(shadowed.len(), 1);
        assert_eq!(shadowed[0].name, "first");
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.resolve_id(7).unwrap().handler, 2);
        assert!(reg.resolve("first").is_none());
    }

    #[test]
    fn same_name_new_id_drops_old_id() {
        let mut reg = CommandRegistry::new();
        reg.register(CommandDescriptor::new(1, "shell", ()));
        reg.register(CommandDescriptor::new(9, "shell", ()));
        assert!(reg.resolve_id(1).is_none());
        assert_eq!(reg.resolve_name("shell").unwrap().id, 9);
    }

    #[test]
    fn try_register_rejects_collisions() {
        let mut reg = CommandRegistry::new();
        reg.try_register(CommandDescriptor::new(1, "shell", ()))
            .unwrap();
        assert_eq!(
            reg.try_register(CommandDescriptor::new(1, "other", ())),
            Err(RegistryError::IdTaken {
                id: 1,
                existing: "shell".into()
            })
        );
        assert_eq!(
            reg.try_register(CommandDescriptor::new(2, "shell", ())),
            Err(RegistryError::NameTaken {
                name: "shell".into(),
                existing: 1
            })
        );
        assert_eq!(reg.entries(), vec![(1, "shell".to_string())]);
    }
}
