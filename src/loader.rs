//! Proto loader: discovers `service.proto` files and builds the service registry.
//!
//! Each subdirectory of the services directory holds one `service.proto`
//! (plus an optional `service.proto.lock.json` and `service.mapping.json`).
//! Every file is compiled at runtime with `protox` and all resulting file
//! descriptors are registered into a single `prost_reflect::DescriptorPool`
//! so cross-file references resolve. Any failure aborts the whole load; a
//! partially built registry is never returned.

use crate::error::LoaderError;
use prost::Message;
use prost_reflect::{DescriptorPool, MethodDescriptor, ServiceDescriptor};
use prost_types::FileDescriptorSet;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

const SERVICE_PROTO: &str = "service.proto";
const MAPPING_FILE: &str = "service.mapping.json";

/// Idempotency level of an RPC method, from the `idempotency_level` option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdempotencyLevel {
    #[default]
    Unknown,
    /// `NO_SIDE_EFFECTS`: safe for Connect GET dispatch
    NoSideEffects,
    /// `IDEMPOTENT`: retryable, but not read-only
    Idempotent,
}

/// A registered RPC method with its reflection descriptor.
#[derive(Debug, Clone)]
pub struct MethodEntry {
    pub descriptor: MethodDescriptor,
    pub idempotency: IdempotencyLevel,
    /// Optional proto-field-name to GraphQL-variable-name renames
    pub variable_mapping: HashMap<String, String>,
}

impl MethodEntry {
    pub fn name(&self) -> &str {
        self.descriptor.name()
    }

    pub fn input(&self) -> prost_reflect::MessageDescriptor {
        self.descriptor.input()
    }

    pub fn output(&self) -> prost_reflect::MessageDescriptor {
        self.descriptor.output()
    }
}

/// A registered service with its methods in declaration order.
#[derive(Debug, Clone)]
pub struct ServiceEntry {
    pub descriptor: ServiceDescriptor,
    pub methods: Vec<MethodEntry>,
}

impl ServiceEntry {
    pub fn full_name(&self) -> &str {
        self.descriptor.full_name()
    }

    pub fn short_name(&self) -> &str {
        self.descriptor.name()
    }

    pub fn package_name(&self) -> String {
        self.descriptor.parent_file().package_name().to_string()
    }

    pub fn method(&self, name: &str) -> Option<&MethodEntry> {
        self.methods.iter().find(|m| m.name() == name)
    }
}

/// The loader's output: a descriptor pool plus the service registry rows.
#[derive(Debug, Clone)]
pub struct LoadedServices {
    pub pool: DescriptorPool,
    pub services: BTreeMap<String, ServiceEntry>,
}

/// Compile every `service.proto` under `services_dir` into one registry.
pub fn load(services_dir: &Path) -> Result<LoadedServices, LoaderError> {
    if !services_dir.is_dir() {
        return Err(LoaderError::FileNotFound(services_dir.to_path_buf()));
    }

    let proto_dirs = discover_proto_dirs(services_dir)?;
    if proto_dirs.is_empty() {
        return Err(LoaderError::FileNotFound(services_dir.join(SERVICE_PROTO)));
    }

    let mut combined = FileDescriptorSet::default();
    let mut seen_files: HashSet<String> = HashSet::new();
    // service full name -> directory it was declared in
    let mut service_dirs: HashMap<String, PathBuf> = HashMap::new();

    for dir in &proto_dirs {
        let fds = compile_dir(dir)?;
        let label = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "services".to_string());

        // Descriptor file names are relative to their own directory, so two
        // directories both produce a file named `service.proto`. Prefix the
        // local files (and their imports) with the directory label to keep
        // names unique inside the shared registry.
        let mut renames: HashMap<String, String> = HashMap::new();
        for file in &fds.file {
            let name = file.name();
            if !name.starts_with("google/") {
                renames.insert(name.to_string(), format!("{label}/{name}"));
            }
        }

        for mut file in fds.file {
            for service in &file.service {
                let full_name = if file.package().is_empty() {
                    service.name().to_string()
                } else {
                    format!("{}.{}", file.package(), service.name())
                };
                if let Some(previous) = service_dirs.insert(full_name.clone(), dir.clone()) {
                    if &previous != dir {
                        return Err(LoaderError::DuplicateService(full_name));
                    }
                }
            }

            if let Some(renamed) = renames.get(file.name()) {
                file.name = Some(renamed.clone());
            }
            for dep in file.dependency.iter_mut() {
                if let Some(renamed) = renames.get(dep.as_str()) {
                    *dep = renamed.clone();
                }
            }

            if seen_files.insert(file.name().to_string()) {
                combined.file.push(file);
            }
        }
    }

    let pool = build_pool(&combined)?;
    let services = build_entries(&pool, &service_dirs)?;

    Ok(LoadedServices { pool, services })
}

/// The services directory itself plus one level of subdirectories, keeping
/// only those that actually hold a `service.proto`.
fn discover_proto_dirs(services_dir: &Path) -> Result<Vec<PathBuf>, LoaderError> {
    let mut dirs = Vec::new();
    if services_dir.join(SERVICE_PROTO).is_file() {
        dirs.push(services_dir.to_path_buf());
    }

    let mut entries: Vec<_> = std::fs::read_dir(services_dir)?
        .collect::<std::io::Result<Vec<_>>>()?
        .into_iter()
        .map(|e| e.path())
        .filter(|p| p.is_dir() && p.join(SERVICE_PROTO).is_file())
        .collect();
    entries.sort();
    dirs.extend(entries);
    Ok(dirs)
}

/// Compile one directory's `service.proto` with the directory as import path,
/// retrying with the bare filename against the directory as import root.
fn compile_dir(dir: &Path) -> Result<FileDescriptorSet, LoaderError> {
    let proto_path = dir.join(SERVICE_PROTO);
    match protox::compile([proto_path.as_path()], [dir]) {
        Ok(fds) => Ok(fds),
        Err(first) => protox::compile([SERVICE_PROTO], [dir]).map_err(|_| {
            LoaderError::ParseFailure {
                file: proto_path.display().to_string(),
                message: first.to_string(),
            }
        }),
    }
}

fn build_pool(fds: &FileDescriptorSet) -> Result<DescriptorPool, LoaderError> {
    // Round-trip through the encoded form so the registry accepts descriptors
    // regardless of which prost-types version produced them.
    let mut buf = Vec::new();
    fds.encode(&mut buf).map_err(|e| LoaderError::ParseFailure {
        file: "<descriptor set>".to_string(),
        message: e.to_string(),
    })?;

    DescriptorPool::decode(buf.as_slice()).map_err(|e| {
        let message = e.to_string();
        if message.contains("not defined") || message.contains("not found") {
            LoaderError::UnresolvedType(message)
        } else {
            LoaderError::ParseFailure {
                file: "<descriptor set>".to_string(),
                message,
            }
        }
    })
}

fn build_entries(
    pool: &DescriptorPool,
    service_dirs: &HashMap<String, PathBuf>,
) -> Result<BTreeMap<String, ServiceEntry>, LoaderError> {
    let mut services = BTreeMap::new();

    for descriptor in pool.services() {
        let full_name = descriptor.full_name().to_string();
        let mappings = service_dirs
            .get(&full_name)
            .map(|dir| read_mapping_file(dir))
            .transpose()?
            .unwrap_or_default();

        let mut methods = Vec::new();
        for method in descriptor.methods() {
            if method.is_client_streaming() || method.is_server_streaming() {
                return Err(LoaderError::UnsupportedStreaming {
                    service: full_name,
                    method: method.name().to_string(),
                });
            }

            let idempotency = idempotency_level(&method);
            let variable_mapping = mappings.get(method.name()).cloned().unwrap_or_default();
            methods.push(MethodEntry {
                descriptor: method,
                idempotency,
                variable_mapping,
            });
        }

        if services
            .insert(
                full_name.clone(),
                ServiceEntry {
                    descriptor,
                    methods,
                },
            )
            .is_some()
        {
            return Err(LoaderError::DuplicateService(full_name));
        }
    }

    Ok(services)
}

/// `service.mapping.json`: `{ "<MethodName>": { "<proto_field>": "<variable>" } }`
fn read_mapping_file(
    dir: &Path,
) -> Result<HashMap<String, HashMap<String, String>>, LoaderError> {
    let path = dir.join(MAPPING_FILE);
    if !path.is_file() {
        return Ok(HashMap::new());
    }
    let data = std::fs::read(&path)?;
    serde_json::from_slice(&data).map_err(|e| LoaderError::ParseFailure {
        file: path.display().to_string(),
        message: e.to_string(),
    })
}

fn idempotency_level(method: &MethodDescriptor) -> IdempotencyLevel {
    let options = method.options();
    match options.get_field_by_name("idempotency_level").as_deref() {
        Some(prost_reflect::Value::EnumNumber(1)) => IdempotencyLevel::NoSideEffects,
        Some(prost_reflect::Value::EnumNumber(2)) => IdempotencyLevel::Idempotent,
        _ => IdempotencyLevel::Unknown,
    }
}
