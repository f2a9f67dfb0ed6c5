//! Schema traversal.
//!
//! A [`Visitor`] receives each node together with a [`Next`] continuation.
//! Calling `next.run(self)` descends into the node's children; returning
//! without calling it prunes the subtree. The mutable variant hands the
//! visitor a [`NodeMut`] it may rewrite before descending.

use std::collections::HashSet;

use super::decl::{Decl, EnumValue, EnumVariant, Field, Metadata, Ref, Type};
use super::index::SchemaIndex;
use super::{Module, Result, Schema, SchemaError};

/// Borrowed view of a schema node.
#[derive(Debug, Clone, Copy)]
pub enum Node<'a> {
    Schema(&'a Schema),
    Module(&'a Module),
    Decl(&'a Decl),
    Field(&'a Field),
    Type(&'a Type),
    Ref(&'a Ref),
    Metadata(&'a Metadata),
    EnumVariant(&'a EnumVariant),
}

impl<'a> Node<'a> {
    pub fn describe(&self) -> String {
        match self {
            Node::Schema(_) => "schema".to_string(),
            Node::Module(m) => format!("module {}", m.name),
            Node::Decl(d) => format!("{} {}", d.kind(), d.name()),
            Node::Field(f) => format!("field {}", f.name),
            Node::Type(t) => format!("type {:?}", t),
            Node::Ref(r) => format!("ref {}", r),
            Node::Metadata(m) => format!("metadata {:?}", m),
            Node::EnumVariant(v) => format!("variant {}", v.name),
        }
    }

    /// Identity of the node: its variant plus the address of the borrowed value.
    fn identity(&self) -> (u8, usize) {
        match self {
            Node::Schema(n) => (0, *n as *const Schema as usize),
            Node::Module(n) => (1, *n as *const Module as usize),
            Node::Decl(n) => (2, *n as *const Decl as usize),
            Node::Field(n) => (3, *n as *const Field as usize),
            Node::Type(n) => (4, *n as *const Type as usize),
            Node::Ref(n) => (5, *n as *const Ref as usize),
            Node::Metadata(n) => (6, *n as *const Metadata as usize),
            Node::EnumVariant(n) => (7, *n as *const EnumVariant as usize),
        }
    }

    /// Structural children, in declaration order.
    pub fn children(self) -> Vec<Node<'a>> {
        let mut out = Vec::new();
        match self {
            Node::Schema(s) => out.extend(s.modules.iter().map(Node::Module)),
            Node::Module(m) => {
                out.extend(m.metadata.iter().map(Node::Metadata));
                out.extend(m.decls.iter().map(Node::Decl));
            }
            Node::Decl(d) => match d {
                Decl::Verb(v) => {
                    out.push(Node::Type(&v.request));
                    out.push(Node::Type(&v.response));
                    out.extend(v.metadata.iter().map(Node::Metadata));
                }
                Decl::Data(data) => {
                    out.extend(data.fields.iter().map(Node::Field));
                    out.extend(data.metadata.iter().map(Node::Metadata));
                }
                Decl::Database(db) => out.extend(db.metadata.iter().map(Node::Metadata)),
                Decl::Topic(t) => {
                    out.push(Node::Type(&t.event));
                    out.extend(t.metadata.iter().map(Node::Metadata));
                }
                Decl::Secret(s) => out.push(Node::Type(&s.ty)),
                Decl::Config(c) => out.push(Node::Type(&c.ty)),
                Decl::Enum(e) => {
                    out.extend(e.ty.iter().map(Node::Type));
                    out.extend(e.variants.iter().map(Node::EnumVariant));
                }
                Decl::TypeAlias(a) => {
                    out.push(Node::Type(&a.ty));
                    out.extend(a.metadata.iter().map(Node::Metadata));
                }
            },
            Node::Field(f) => {
                out.push(Node::Type(&f.ty));
                out.extend(f.metadata.iter().map(Node::Metadata));
            }
            Node::Type(t) => match t {
                Type::Array { element } => out.push(Node::Type(element)),
                Type::Map { key, value } => {
                    out.push(Node::Type(key));
                    out.push(Node::Type(value));
                }
                Type::Optional { inner } => out.push(Node::Type(inner)),
                Type::Ref(r) => out.push(Node::Ref(r)),
                _ => {}
            },
            Node::Ref(r) => out.extend(r.type_parameters.iter().map(Node::Type)),
            Node::Metadata(m) => match m {
                Metadata::Calls { calls } => out.extend(calls.iter().map(Node::Ref)),
                Metadata::Databases { uses } => out.extend(uses.iter().map(Node::Ref)),
                Metadata::Publisher { topics } => out.extend(topics.iter().map(Node::Ref)),
                Metadata::Subscriber { topic } => out.push(Node::Ref(topic)),
                _ => {}
            },
            Node::EnumVariant(v) => {
                if let EnumValue::Type(t) = &v.value {
                    out.push(Node::Type(t));
                }
            }
        }
        out
    }
}

/// Receives every node of a traversal.
pub trait Visitor {
    fn visit<'a>(&mut self, node: Node<'a>, next: Next<'a, '_>) -> Result<()>;
}

/// Adapter turning an inspecting closure into a visitor that always descends.
pub struct Inspect<F>(pub F);

impl<F> Visitor for Inspect<F>
where
    F: for<'n> FnMut(Node<'n>) -> Result<()>,
{
    fn visit<'a>(&mut self, node: Node<'a>, next: Next<'a, '_>) -> Result<()> {
        (self.0)(node)?;
        next.run(self)
    }
}

struct Traversal<'a> {
    active: HashSet<(u8, usize)>,
    index: Option<&'a SchemaIndex>,
}

/// Continuation that descends into the current node's children.
pub struct Next<'a, 't> {
    node: Node<'a>,
    traversal: &'t mut Traversal<'a>,
}

impl<'a, 't> Next<'a, 't> {
    pub fn run<V: Visitor + ?Sized>(self, visitor: &mut V) -> Result<()> {
        let mut children = self.node.children();
        if let (Node::Ref(r), Some(index)) = (self.node, self.traversal.index) {
            if let Some(decl) = index.resolve(r) {
                children.push(Node::Decl(decl));
            }
        }
        for child in children {
            visit_node(child, visitor, self.traversal)?;
        }
        Ok(())
    }
}

fn visit_node<'a, V: Visitor + ?Sized>(
    node: Node<'a>,
    visitor: &mut V,
    traversal: &mut Traversal<'a>,
) -> Result<()> {
    let identity = node.identity();
    if !traversal.active.insert(identity) {
        return Err(SchemaError::CyclicReference(node.describe()));
    }
    let result = visitor.visit(
        node,
        Next {
            node,
            traversal: &mut *traversal,
        },
    );
    traversal.active.remove(&identity);
    result
}

/// Traverse the tree rooted at `node`.
pub fn visit<V: Visitor + ?Sized>(node: Node<'_>, visitor: &mut V) -> Result<()> {
    let mut traversal = Traversal {
        active: HashSet::new(),
        index: None,
    };
    visit_node(node, visitor, &mut traversal)
}

/// Traverse `node`, following every ref into the declaration it resolves to.
///
/// Fails with `CyclicReference` when a declaration is re-entered through its own refs.
pub fn visit_through_refs<'a, V: Visitor + ?Sized>(
    index: &'a SchemaIndex,
    node: Node<'a>,
    visitor: &mut V,
) -> Result<()> {
    let mut traversal = Traversal {
        active: HashSet::new(),
        index: Some(index),
    };
    visit_node(node, visitor, &mut traversal)
}

/// Pre-order walk calling `f` on every node.
pub fn walk<'a>(node: Node<'a>, f: &mut impl FnMut(Node<'a>)) {
    f(node);
    for child in node.children() {
        walk(child, f);
    }
}

/// Mutable view of a schema node.
#[derive(Debug)]
pub enum NodeMut<'a> {
    Schema(&'a mut Schema),
    Module(&'a mut Module),
    Decl(&'a mut Decl),
    Field(&'a mut Field),
    Type(&'a mut Type),
    Ref(&'a mut Ref),
    Metadata(&'a mut Metadata),
    EnumVariant(&'a mut EnumVariant),
}

impl<'a> NodeMut<'a> {
    fn children(&mut self) -> Vec<NodeMut<'_>> {
        let mut out = Vec::new();
        match self {
            NodeMut::Schema(s) => out.extend(s.modules.iter_mut().map(NodeMut::Module)),
            NodeMut::Module(m) => {
                let Module {
                    metadata, decls, ..
                } = &mut **m;
                out.extend(metadata.iter_mut().map(NodeMut::Metadata));
                out.extend(decls.iter_mut().map(NodeMut::Decl));
            }
            NodeMut::Decl(d) => match &mut **d {
                Decl::Verb(v) => {
                    out.push(NodeMut::Type(&mut v.request));
                    out.push(NodeMut::Type(&mut v.response));
                    out.extend(v.metadata.iter_mut().map(NodeMut::Metadata));
                }
                Decl::Data(data) => {
                    out.extend(data.fields.iter_mut().map(NodeMut::Field));
                    out.extend(data.metadata.iter_mut().map(NodeMut::Metadata));
                }
                Decl::Database(db) => out.extend(db.metadata.iter_mut().map(NodeMut::Metadata)),
                Decl::Topic(t) => {
                    out.push(NodeMut::Type(&mut t.event));
                    out.extend(t.metadata.iter_mut().map(NodeMut::Metadata));
                }
                Decl::Secret(s) => out.push(NodeMut::Type(&mut s.ty)),
                Decl::Config(c) => out.push(NodeMut::Type(&mut c.ty)),
                Decl::Enum(e) => {
                    out.extend(e.ty.iter_mut().map(NodeMut::Type));
                    out.extend(e.variants.iter_mut().map(NodeMut::EnumVariant));
                }
                Decl::TypeAlias(a) => {
                    out.push(NodeMut::Type(&mut a.ty));
                    out.extend(a.metadata.iter_mut().map(NodeMut::Metadata));
                }
            },
            NodeMut::Field(f) => {
                let Field { ty, metadata, .. } = &mut **f;
                out.push(NodeMut::Type(ty));
                out.extend(metadata.iter_mut().map(NodeMut::Metadata));
            }
            NodeMut::Type(t) => match &mut **t {
                Type::Array { element } => out.push(NodeMut::Type(element)),
                Type::Map { key, value } => {
                    out.push(NodeMut::Type(key));
                    out.push(NodeMut::Type(value));
                }
                Type::Optional { inner } => out.push(NodeMut::Type(inner)),
                Type::Ref(r) => out.push(NodeMut::Ref(r)),
                _ => {}
            },
            NodeMut::Ref(r) => out.extend(r.type_parameters.iter_mut().map(NodeMut::Type)),
            NodeMut::Metadata(m) => match &mut **m {
                Metadata::Calls { calls } => out.extend(calls.iter_mut().map(NodeMut::Ref)),
                Metadata::Databases { uses } => out.extend(uses.iter_mut().map(NodeMut::Ref)),
                Metadata::Publisher { topics } => out.extend(topics.iter_mut().map(NodeMut::Ref)),
                Metadata::Subscriber { topic } => out.push(NodeMut::Ref(topic)),
                _ => {}
            },
            NodeMut::EnumVariant(v) => {
                if let EnumValue::Type(t) = &mut v.value {
                    out.push(NodeMut::Type(t));
                }
            }
        }
        out
    }
}

/// Receives every node of a mutable traversal.
pub trait VisitorMut {
    fn visit_mut(&mut self, node: &mut NodeMut<'_>, next: NextMut) -> Result<()>;
}

/// Continuation that descends into the children of the node passed to `run`.
pub struct NextMut {
    _private: (),
}

impl NextMut {
    pub fn run<V: VisitorMut + ?Sized>(self, visitor: &mut V, node: &mut NodeMut<'_>) -> Result<()> {
        for child in node.children() {
            visit_mut(child, visitor)?;
        }
        Ok(())
    }
}

/// Traverse the tree rooted at `node`, allowing the visitor to rewrite nodes.
pub fn visit_mut<V: VisitorMut + ?Sized>(mut node: NodeMut<'_>, visitor: &mut V) -> Result<()> {
    visitor.visit_mut(&mut node, NextMut { _private: () })
}
