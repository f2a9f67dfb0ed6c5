//! Declaration lookup by reference.

use std::collections::HashMap;
use std::sync::Arc;

use super::decl::{Decl, Ref, RefKey};
use super::{Module, Schema};

/// Prebuilt (module, name) index over a schema snapshot.
///
/// The index is immutable; replacing the schema means building a new index.
#[derive(Debug, Clone)]
pub struct SchemaIndex {
    schema: Arc<Schema>,
    decls: HashMap<RefKey, (usize, usize)>,
}

impl SchemaIndex {
    pub fn new(schema: Arc<Schema>) -> Self {
        let mut decls = HashMap::new();
        for (mi, module) in schema.modules.iter().enumerate() {
            for (di, decl) in module.decls.iter().enumerate() {
                decls
                    .entry(RefKey {
                        module: module.name.clone(),
                        name: decl.name().to_string(),
                    })
                    .or_insert((mi, di));
            }
        }
        Self { schema, decls }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn module(&self, name: &str) -> Option<&Module> {
        self.schema.module(name)
    }

    /// The declaration `r` names, if present.
    pub fn resolve(&self, r: &Ref) -> Option<&Decl> {
        self.resolve_key(&r.key())
    }

    pub fn resolve_key(&self, key: &RefKey) -> Option<&Decl> {
        let (mi, di) = *self.decls.get(key)?;
        self.schema.modules.get(mi)?.decls.get(di)
    }
}
