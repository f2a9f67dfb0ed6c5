//! Schema validation.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use regex::Regex;

use super::decl::Decl;
use super::index::SchemaIndex;
use super::topology::topological_sort;
use super::visit::{visit, visit_mut, Next, NextMut, Node, NodeMut, Visitor, VisitorMut};
use super::{Module, Result, Schema, SchemaError};

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern"));

/// Fill in the module of unqualified refs with the enclosing module's name.
///
/// Refs naming a type parameter of the enclosing data type are left alone.
pub fn qualify_refs(module: &mut Module) -> Result<()> {
    struct Qualify {
        module: String,
        params: Vec<String>,
    }

    impl VisitorMut for Qualify {
        fn visit_mut(&mut self, node: &mut NodeMut<'_>, next: NextMut) -> Result<()> {
            let params = match node {
                NodeMut::Decl(Decl::Data(data)) => Some(data.type_parameters.clone()),
                NodeMut::Ref(r) => {
                    if r.module.is_empty() && !self.params.contains(&r.name) {
                        r.module = self.module.clone();
                    }
                    None
                }
                _ => None,
            };
            match params {
                Some(params) => {
                    self.params = params;
                    let result = next.run(self, node);
                    self.params.clear();
                    result
                }
                None => next.run(self, node),
            }
        }
    }

    let mut qualify = Qualify {
        module: module.name.clone(),
        params: Vec::new(),
    };
    visit_mut(NodeMut::Module(module), &mut qualify)
}

/// Check a module in isolation: identifiers are well formed and decl names unique.
pub fn validate_module(module: &Module) -> Result<()> {
    if !IDENTIFIER.is_match(&module.name) {
        return Err(SchemaError::InvalidName(module.name.clone()));
    }
    let mut seen = HashSet::new();
    for decl in &module.decls {
        if !IDENTIFIER.is_match(decl.name()) {
            return Err(SchemaError::InvalidName(decl.name().to_string()));
        }
        if !seen.insert(decl.name()) {
            return Err(SchemaError::DuplicateDecl {
                module: module.name.clone(),
                name: decl.name().to_string(),
            });
        }
    }
    Ok(())
}

struct RefChecker<'i> {
    index: &'i SchemaIndex,
    module: String,
    params: Vec<String>,
}

impl Visitor for RefChecker<'_> {
    fn visit<'a>(&mut self, node: Node<'a>, next: Next<'a, '_>) -> Result<()> {
        match node {
            Node::Module(m) => self.module = m.name.clone(),
            Node::Decl(Decl::Data(data)) => {
                self.params = data.type_parameters.clone();
                let result = next.run(self);
                self.params.clear();
                return result;
            }
            Node::Ref(r) => {
                let is_param = (r.module.is_empty() || r.module == self.module)
                    && self.params.contains(&r.name);
                if !is_param {
                    let mut key = r.key();
                    if key.module.is_empty() {
                        key.module = self.module.clone();
                    }
                    if self.index.resolve_key(&key).is_none() {
                        return Err(SchemaError::UnresolvedRef {
                            module: self.module.clone(),
                            reference: key.to_string(),
                        });
                    }
                }
            }
            _ => {}
        }
        next.run(self)
    }
}

/// Check the whole schema: every module is valid, every ref resolves, and
/// module imports are acyclic.
pub fn validate_schema(schema: &Schema) -> Result<()> {
    let mut names = HashSet::new();
    for module in &schema.modules {
        validate_module(module)?;
        if !names.insert(module.name.as_str()) {
            return Err(SchemaError::Invalid(format!(
                "duplicate module {}",
                module.name
            )));
        }
    }

    let index = SchemaIndex::new(Arc::new(schema.with_builtins()));
    let mut checker = RefChecker {
        index: &index,
        module: String::new(),
        params: Vec::new(),
    };
    visit(Node::Schema(schema), &mut checker)?;

    topological_sort(schema)?;
    Ok(())
}
