//! Declarations, types and metadata carried by a module.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Source location of a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Position {
    pub filename: String,
    pub line: u32,
    pub column: u32,
}

/// Reference to a declaration by module and name.
///
/// An empty `module` refers to the enclosing module until refs are qualified.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Ref {
    #[serde(default)]
    pub module: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub type_parameters: Vec<Type>,
}

impl Ref {
    pub fn new(module: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            name: name.into(),
            type_parameters: Vec::new(),
        }
    }

    pub fn with_type_parameters(mut self, params: Vec<Type>) -> Self {
        self.type_parameters = params;
        self
    }

    /// The (module, name) key this ref resolves against.
    pub fn key(&self) -> RefKey {
        RefKey {
            module: self.module.clone(),
            name: self.name.clone(),
        }
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.name)
    }
}

/// Lookup key for a declaration, without type parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefKey {
    pub module: String,
    pub name: String,
}

impl fmt::Display for RefKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.name)
    }
}

/// Type expressions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Type {
    Int,
    Float,
    String,
    Bool,
    Bytes,
    Time,
    Unit,
    Any,
    Array { element: Box<Type> },
    Map { key: Box<Type>, value: Box<Type> },
    Optional { inner: Box<Type> },
    Ref(Ref),
}

impl Type {
    pub fn reference(module: impl Into<String>, name: impl Into<String>) -> Self {
        Type::Ref(Ref::new(module, name))
    }

    pub fn array(element: Type) -> Self {
        Type::Array {
            element: Box::new(element),
        }
    }

    pub fn optional(inner: Type) -> Self {
        Type::Optional {
            inner: Box::new(inner),
        }
    }
}

/// Engine of a database declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseEngine {
    Postgres,
    Mysql,
}

impl fmt::Display for DatabaseEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseEngine::Postgres => write!(f, "postgres"),
            DatabaseEngine::Mysql => write!(f, "mysql"),
        }
    }
}

/// Annotations attached to modules, declarations and fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metadata {
    /// HTTP ingress route for a verb.
    Ingress { method: String, path: String },
    /// Verbs called by this verb.
    Calls { calls: Vec<Ref> },
    /// Databases used by this verb.
    Databases { uses: Vec<Ref> },
    /// Topics published to by this verb.
    Publisher { topics: Vec<Ref> },
    /// Topic this verb consumes.
    Subscriber { topic: Ref },
    Cron { schedule: String },
    Retry {
        #[serde(default)]
        count: Option<u32>,
        min_backoff: String,
        #[serde(default)]
        max_backoff: String,
    },
    /// Migration archive digest. On a database decl it migrates that database.
    SqlMigration { digest: String },
    /// Deployable artefact of the module.
    Artefact {
        path: String,
        digest: String,
        #[serde(default)]
        executable: bool,
    },
    /// Free-form annotation.
    Annotation { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: Type,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metadata: Vec<Metadata>,
    #[serde(default)]
    pub pos: Position,
}

impl Field {
    pub fn new(name: impl Into<String>, ty: Type) -> Self {
        Self {
            name: name.into(),
            ty,
            metadata: Vec::new(),
            pos: Position::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verb {
    pub name: String,
    #[serde(default)]
    pub export: bool,
    pub request: Type,
    pub response: Type,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metadata: Vec<Metadata>,
    #[serde(default)]
    pub pos: Position,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Data {
    pub name: String,
    #[serde(default)]
    pub export: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub type_parameters: Vec<String>,
    #[serde(default)]
    pub fields: Vec<Field>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metadata: Vec<Metadata>,
    #[serde(default)]
    pub pos: Position,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Database {
    pub name: String,
    pub engine: DatabaseEngine,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metadata: Vec<Metadata>,
    #[serde(default)]
    pub pos: Position,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
    pub name: String,
    #[serde(default)]
    pub export: bool,
    pub event: Type,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metadata: Vec<Metadata>,
    #[serde(default)]
    pub pos: Position,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: Type,
    #[serde(default)]
    pub pos: Position,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: Type,
    #[serde(default)]
    pub pos: Position,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnumValue {
    Int(i64),
    String(String),
    /// Variant of a type enum.
    Type(Type),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnumVariant {
    pub name: String,
    pub value: EnumValue,
    #[serde(default)]
    pub pos: Position,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Enum {
    pub name: String,
    #[serde(default)]
    pub export: bool,
    /// Underlying type of a value enum; absent for type enums.
    #[serde(default, rename = "type")]
    pub ty: Option<Type>,
    pub variants: Vec<EnumVariant>,
    #[serde(default)]
    pub pos: Position,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeAlias {
    pub name: String,
    #[serde(default)]
    pub export: bool,
    #[serde(rename = "type")]
    pub ty: Type,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metadata: Vec<Metadata>,
    #[serde(default)]
    pub pos: Position,
}

/// A named declaration inside a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decl {
    Verb(Verb),
    Data(Data),
    Database(Database),
    Topic(Topic),
    Secret(Secret),
    Config(Config),
    Enum(Enum),
    TypeAlias(TypeAlias),
}

impl Decl {
    pub fn name(&self) -> &str {
        match self {
            Decl::Verb(d) => &d.name,
            Decl::Data(d) => &d.name,
            Decl::Database(d) => &d.name,
            Decl::Topic(d) => &d.name,
            Decl::Secret(d) => &d.name,
            Decl::Config(d) => &d.name,
            Decl::Enum(d) => &d.name,
            Decl::TypeAlias(d) => &d.name,
        }
    }

    pub fn is_exported(&self) -> bool {
        match self {
            Decl::Verb(d) => d.export,
            Decl::Data(d) => d.export,
            Decl::Topic(d) => d.export,
            Decl::Enum(d) => d.export,
            Decl::TypeAlias(d) => d.export,
            Decl::Database(_) | Decl::Secret(_) | Decl::Config(_) => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Decl::Verb(_) => "verb",
            Decl::Data(_) => "data",
            Decl::Database(_) => "database",
            Decl::Topic(_) => "topic",
            Decl::Secret(_) => "secret",
            Decl::Config(_) => "config",
            Decl::Enum(_) => "enum",
            Decl::TypeAlias(_) => "typealias",
        }
    }

    pub fn metadata(&self) -> &[Metadata] {
        match self {
            Decl::Verb(d) => &d.metadata,
            Decl::Data(d) => &d.metadata,
            Decl::Database(d) => &d.metadata,
            Decl::Topic(d) => &d.metadata,
            Decl::TypeAlias(d) => &d.metadata,
            Decl::Secret(_) | Decl::Config(_) | Decl::Enum(_) => &[],
        }
    }
}
