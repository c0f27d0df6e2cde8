// Copyright 2025 The Strata Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Process-wide item registry.
//!
//! Items register a zero-argument constructor under their name and their
//! provided keys; [`Registry::summon`] constructs fresh instances for
//! either. The built-in items are registered once into the default
//! registry; embedders with custom items build their own registry value.
//! Registration order never affects resolution output.

use indexmap::IndexMap;
use once_cell::sync::Lazy;

use super::item::PipelineItem;

pub type ItemConstructor = fn() -> Box<dyn PipelineItem>;

#[derive(Clone, Default)]
pub struct Registry {
    constructors: IndexMap<&'static str, ItemConstructor>,
    providers: IndexMap<&'static str, Vec<&'static str>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a constructor. A probe instance is built once to read the
    /// item's name and provided keys.
    pub fn register(&mut self, constructor: ItemConstructor) {
        let probe = constructor();
        let name = probe.name();
        assert!(
            !self.constructors.contains_key(name),
            "pipeline item {name} registered twice",
        );
        self.constructors.insert(name, constructor);
        for key in probe.provides() {
            self.providers.entry(key).or_default().push(name);
        }
    }

    /// Registered item names, in registration order.
    pub fn names(&self) -> impl Iterator<Item = &'static str> {
        self.constructors.keys().copied()
    }

    /// Constructs fresh instances for an item name or a provided key.
    ///
    /// A name yields one instance; a provided key yields one instance per
    /// registered provider; anything else yields none.
    pub fn summon(&self, name_or_key: &str) -> Vec<Box<dyn PipelineItem>> {
        if let Some(constructor) = self.constructors.get(name_or_key) {
            return vec![constructor()];
        }
        self.providers
            .get(name_or_key)
            .into_iter()
            .flatten()
            .map(|name| self.constructors[name]())
            .collect()
    }

    /// A registry holding the built-in items.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(|| Box::new(crate::items::TicksSinceStart::new()));
        registry.register(|| Box::new(crate::items::IdentityDetector::new()));
        registry.register(|| Box::new(crate::items::TreeChangesItem::new()));
        registry.register(|| Box::new(crate::line_history::LineHistory::new()));
        registry.register(|| Box::new(crate::items::LineChurn::new()));
        registry
    }
}

/// The shared default registry, built on first use.
pub fn default_registry() -> &'static Registry {
    static REGISTRY: Lazy<Registry> = Lazy::new(Registry::builtin);
    &REGISTRY
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summon_by_name_and_key() {
        let registry = Registry::builtin();
        let by_name = registry.summon("TicksSinceStart");
        assert_eq!(by_name.len(), 1);
        assert_eq!(by_name[0].name(), "TicksSinceStart");
        let by_key = registry.summon("tick");
        assert_eq!(by_key.len(), 1);
        assert_eq!(by_key[0].name(), "TicksSinceStart");
        assert!(registry.summon("no-such-item").is_empty());
    }

    #[test]
    fn test_default_registry_has_builtins() {
        let names: Vec<_> = default_registry().names().collect();
        assert!(names.contains(&"LineHistory"));
        assert!(names.contains(&"LineChurn"));
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn test_double_registration_panics() {
        let mut registry = Registry::builtin();
        registry.register(|| Box::new(crate::items::TicksSinceStart::new()));
    }
}
