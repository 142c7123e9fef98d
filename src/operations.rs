//! Operation store: binds RPC methods to GraphQL operations.
//!
//! Two construction modes. In predefined mode a collection directory of
//! `.graphql`/`.gql` documents is loaded at startup, one executable operation
//! per file, keyed by operation name. In dynamic mode an operation is
//! synthesized from the RPC method name and the method's input/output
//! descriptors the first time the method is invoked.

use crate::error::StoreError;
use crate::loader::{IdempotencyLevel, MethodEntry};
use async_graphql::parser::parse_query;
use async_graphql::parser::types::{OperationType, Selection};
use prost_reflect::{FieldDescriptor, Kind, MessageDescriptor};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Whether an operation reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Query,
    Mutation,
}

impl OperationKind {
    fn keyword(self) -> &'static str {
        match self {
            OperationKind::Query => "query",
            OperationKind::Mutation => "mutation",
        }
    }
}

/// A named GraphQL operation with its variable schema.
#[derive(Debug, Clone)]
pub struct OperationRecord {
    pub name: String,
    pub kind: OperationKind,
    /// Raw GraphQL document text sent to the upstream
    pub document: String,
    /// Collection file the operation came from, predefined mode only
    pub file_path: Option<PathBuf>,
    /// First top-level selection; used to unwrap single-rooted responses
    pub root_field: Option<String>,
    /// Declared variable names, in document order
    pub variables: Vec<String>,
    /// Proto-field-name to variable-name renames applied before execution
    pub variable_mapping: HashMap<String, String>,
}

/// Strip a `Query`/`Mutation` prefix from a method name; longest prefix wins.
pub fn strip_operation_prefix(name: &str) -> Option<(OperationKind, &str)> {
    for (prefix, kind) in [
        ("Mutation", OperationKind::Mutation),
        ("Query", OperationKind::Query),
    ] {
        if let Some(rest) = name.strip_prefix(prefix) {
            if !rest.is_empty() {
                return Some((kind, rest));
            }
        }
    }
    None
}

/// Derive the operation kind for a method: an explicit name prefix wins, then
/// the `NO_SIDE_EFFECTS` idempotency annotation, then Mutation.
pub fn operation_kind(method: &MethodEntry) -> OperationKind {
    if let Some((kind, _)) = strip_operation_prefix(method.name()) {
        return kind;
    }
    match method.idempotency {
        IdempotencyLevel::NoSideEffects => OperationKind::Query,
        _ => OperationKind::Mutation,
    }
}

/// Predefined operations keyed by name.
#[derive(Debug, Clone, Default)]
pub struct OperationStore {
    records: HashMap<String, Arc<OperationRecord>>,
}

impl OperationStore {
    /// Load every GraphQL document under `path` into the store.
    pub fn load_from_directory(path: &Path) -> Result<Self, StoreError> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(path)?
            .collect::<std::io::Result<Vec<_>>>()?
            .into_iter()
            .map(|e| e.path())
            .filter(|p| {
                matches!(
                    p.extension().and_then(|e| e.to_str()),
                    Some("graphql") | Some("gql")
                )
            })
            .collect();
        files.sort();

        if files.is_empty() {
            return Err(StoreError::Empty(path.to_path_buf()));
        }

        let mut records = HashMap::new();
        for file in files {
            let record = parse_collection_file(&file)?;
            if records
                .insert(record.name.clone(), Arc::new(record))
                .is_some()
            {
                let name = file.display().to_string();
                return Err(StoreError::DuplicateOperation(name));
            }
        }

        Ok(Self { records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<Arc<OperationRecord>> {
        self.records.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.records.keys().cloned().collect();
        names.sort();
        names
    }

    /// Resolve a method name against the store: exact match first, then a
    /// match with the `Query`/`Mutation` prefix stripped. Two candidates
    /// after prefix-stripping is an ambiguity, not a choice.
    pub fn resolve(&self, method_name: &str) -> Result<Option<Arc<OperationRecord>>, StoreError> {
        if let Some(record) = self.get(method_name) {
            return Ok(Some(record));
        }

        let Some((_, suffix)) = strip_operation_prefix(method_name) else {
            return Ok(None);
        };

        let mut candidates: Vec<String> = Vec::new();
        for name in [suffix.to_string(), lower_camel(suffix)] {
            if self.records.contains_key(&name) && !candidates.contains(&name) {
                candidates.push(name);
            }
        }

        match candidates.len() {
            0 => Ok(None),
            1 => Ok(self.get(&candidates[0])),
            _ => Err(StoreError::AmbiguousBinding(method_name.to_string())),
        }
    }
}

fn parse_collection_file(file: &Path) -> Result<OperationRecord, StoreError> {
    let source = std::fs::read_to_string(file)?;
    let file_name = file.display().to_string();

    let document = parse_query(&source).map_err(|e| StoreError::ParseFailure {
        file: file_name.clone(),
        message: e.to_string(),
    })?;

    let mut operations = document.operations.iter();
    let Some((name, operation)) = operations.next() else {
        return Err(StoreError::ParseFailure {
            file: file_name,
            message: "file contains no executable operation".to_string(),
        });
    };
    if operations.next().is_some() {
        return Err(StoreError::MultipleOperationsInFile(file_name));
    }

    let Some(name) = name else {
        return Err(StoreError::ParseFailure {
            file: file_name,
            message: "operation must be named".to_string(),
        });
    };

    let kind = match operation.node.ty {
        OperationType::Query => OperationKind::Query,
        OperationType::Mutation => OperationKind::Mutation,
        OperationType::Subscription => {
            return Err(StoreError::ParseFailure {
                file: file_name,
                message: "subscription operations are not supported".to_string(),
            })
        }
    };

    let root_field = operation
        .node
        .selection_set
        .node
        .items
        .iter()
        .find_map(|selection| match &selection.node {
            Selection::Field(field) => Some(
                field
                    .node
                    .alias
                    .as_ref()
                    .map(|a| a.node.to_string())
                    .unwrap_or_else(|| field.node.name.node.to_string()),
            ),
            _ => None,
        });

    let variables = operation
        .node
        .variable_definitions
        .iter()
        .map(|v| v.node.name.node.to_string())
        .collect();

    Ok(OperationRecord {
        name: name.to_string(),
        kind,
        document: source,
        file_path: Some(file.to_path_buf()),
        root_field,
        variables,
        variable_mapping: HashMap::new(),
    })
}

/// Synthesize an operation for a method from its descriptors.
///
/// `QueryGetEmployees` becomes `query QueryGetEmployees(...) { getEmployees(...) { ... } }`:
/// the prefix-stripped suffix, lowerCamelCased, names a field on the root
/// type; variables mirror the top-level input fields; the selection set
/// mirrors the output message, recursing through nested messages.
pub fn synthesize(method: &MethodEntry) -> OperationRecord {
    let kind = operation_kind(method);
    let suffix = strip_operation_prefix(method.name())
        .map(|(_, rest)| rest)
        .unwrap_or_else(|| method.name());
    let root_field = lower_camel(suffix);

    let mut variables = Vec::new();
    let mut declarations = Vec::new();
    let mut arguments = Vec::new();
    for field in method.input().fields() {
        if field.name().starts_with('_') {
            continue;
        }
        let variable = method
            .variable_mapping
            .get(field.name())
            .cloned()
            .unwrap_or_else(|| field.name().to_string());
        declarations.push(format!("${}: {}", variable, graphql_type(&field)));
        arguments.push(format!("{variable}: ${variable}"));
        variables.push(variable);
    }

    let mut on_stack = HashSet::new();
    let selection = selection_set(&method.output(), &mut on_stack);

    let declarations = if declarations.is_empty() {
        String::new()
    } else {
        format!("({})", declarations.join(", "))
    };
    let arguments = if arguments.is_empty() {
        String::new()
    } else {
        format!("({})", arguments.join(", "))
    };

    let document = format!(
        "{} {}{} {{ {}{}{} }}",
        kind.keyword(),
        method.name(),
        declarations,
        root_field,
        arguments,
        if selection.is_empty() {
            String::new()
        } else {
            format!(" {selection}")
        },
    );

    OperationRecord {
        name: method.name().to_string(),
        kind,
        document,
        file_path: None,
        root_field: Some(root_field),
        variables,
        variable_mapping: method.variable_mapping.clone(),
    }
}

/// GraphQL type name for a proto input field, 64-bit integers ride as String.
fn graphql_type(field: &FieldDescriptor) -> String {
    if field.is_map() {
        return "JSON".to_string();
    }
    let base = match field.kind() {
        Kind::Bool => "Boolean".to_string(),
        Kind::Float | Kind::Double => "Float".to_string(),
        Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 | Kind::Uint32 | Kind::Fixed32 => {
            "Int".to_string()
        }
        Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 | Kind::Uint64 | Kind::Fixed64 => {
            "String".to_string()
        }
        Kind::String | Kind::Bytes => "String".to_string(),
        Kind::Enum(en) => en.name().to_string(),
        Kind::Message(msg) => msg.name().to_string(),
    };
    if field.is_list() {
        format!("[{base}]")
    } else {
        base
    }
}

/// Selection set mirroring a message descriptor. Cycles are cut by skipping
/// any message already on the recursion stack; map fields stay leaves.
fn selection_set(desc: &MessageDescriptor, on_stack: &mut HashSet<String>) -> String {
    if !on_stack.insert(desc.full_name().to_string()) {
        return String::new();
    }

    let mut parts = Vec::new();
    for field in desc.fields() {
        if field.name().starts_with('_') {
            continue;
        }
        if field.is_map() {
            parts.push(field.name().to_string());
            continue;
        }
        match field.kind() {
            Kind::Message(inner) => {
                let nested = selection_set(&inner, on_stack);
                if !nested.is_empty() {
                    parts.push(format!("{} {}", field.name(), nested));
                }
            }
            _ => parts.push(field.name().to_string()),
        }
    }

    on_stack.remove(desc.full_name());

    if parts.is_empty() {
        "{ __typename }".to_string()
    } else {
        format!("{{ {} }}", parts.join(" "))
    }
}

pub(crate) fn lower_camel(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
