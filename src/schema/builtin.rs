//! The builtin module every schema implicitly contains.

use super::decl::{Data, Decl, Field, Position, Type};
use super::Module;

pub const BUILTIN_MODULE: &str = "builtin";

fn data(name: &str, type_parameters: &[&str], fields: Vec<Field>) -> Decl {
    Decl::Data(Data {
        name: name.to_string(),
        export: true,
        type_parameters: type_parameters.iter().map(|p| p.to_string()).collect(),
        fields,
        metadata: Vec::new(),
        pos: Position::default(),
    })
}

fn param(name: &str) -> Type {
    Type::reference("", name)
}

/// Builtin declarations: HTTP request/response envelopes and the empty record.
pub fn builtin_module() -> Module {
    let headers = Type::Map {
        key: Box::new(Type::String),
        value: Box::new(Type::array(Type::String)),
    };

    Module {
        name: BUILTIN_MODULE.to_string(),
        builtin: true,
        decls: vec![
            data(
                "HttpRequest",
                &["Body", "Path", "Query"],
                vec![
                    Field::new("method", Type::String),
                    Field::new("path", Type::String),
                    Field::new("pathParameters", param("Path")),
                    Field::new("query", param("Query")),
                    Field::new("headers", headers.clone()),
                    Field::new("body", param("Body")),
                ],
            ),
            data(
                "HttpResponse",
                &["Body", "Error"],
                vec![
                    Field::new("status", Type::Int),
                    Field::new("headers", headers),
                    Field::new("body", Type::optional(param("Body"))),
                    Field::new("error", Type::optional(param("Error"))),
                ],
            ),
            data("Empty", &[], vec![]),
        ],
        ..Default::default()
    }
}
