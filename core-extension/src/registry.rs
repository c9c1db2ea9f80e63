use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use serde_json::{json, Value};

use crate::error::{ProtocolError, Result};
use crate::extension::Extension;

/// Extensions known to the host, keyed by name.
///
/// Names and entry points share one namespace: registering an extension
/// whose name or any entry point is already taken fails and leaves the
/// registry unchanged.
#[derive(Default)]
pub struct ExtensionRegistry {
    extensions: BTreeMap<String, Arc<dyn Extension>>,
    symbols: HashMap<String, String>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, extension: Arc<dyn Extension>) -> Result<()> {
        let name = extension.name().to_string();
        if let Some(owner) = self.symbols.get(&name) {
            return Err(if owner == &name {
                ProtocolError::DuplicateExtension(name)
            } else {
                ProtocolError::DuplicateEntryPoint {
                    entry_point: name,
                    owner: owner.clone(),
                }
            });
        }

        let entry_points = extension.entry_points();
        for (i, entry_point) in entry_points.iter().enumerate() {
            let taken = self.symbols.get(entry_point).cloned().or_else(|| {
                (entry_point == &name || entry_points[..i].contains(entry_point))
                    .then(|| name.clone())
            });
            if let Some(owner) = taken {
                return Err(ProtocolError::DuplicateEntryPoint {
                    entry_point: entry_point.clone(),
                    owner,
                });
            }
        }

        self.symbols.insert(name.clone(), name.clone());
        for entry_point in entry_points {
            self.symbols.insert(entry_point, name.clone());
        }
        self.extensions.insert(name, extension);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Extension>> {
        self.extensions.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        self.extensions.keys().cloned().collect()
    }

    /// The `get-extensions` reply: one object per extension with `name`,
    /// `javascript_api` and `entry_points`.
    pub fn describe(&self) -> Value {
        Value::Array(
            self.extensions
                .values()
                .map(|extension| {
                    json!({
                        "name": extension.name(),
                        "javascript_api": extension.javascript_api(),
                        "entry_points": extension.entry_points(),
                    })
                })
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }
}
