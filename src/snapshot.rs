//! Immutable registry snapshots.
//!
//! A snapshot bundles the service/method registry with the operation store.
//! It is built during start and reload, published atomically, and never
//! mutated afterwards apart from the per-snapshot memo of synthesized
//! operations. In-flight requests hold an `Arc<Snapshot>` for their whole
//! lifetime, so a superseded snapshot is dropped only once the last request
//! referencing it completes.

use crate::config::{GatewayConfig, Mode};
use crate::error::{Result, StoreError};
use crate::loader::{self, MethodEntry, ServiceEntry};
use crate::operations::{self, OperationRecord, OperationStore};
use prost_reflect::DescriptorPool;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

pub struct Snapshot {
    pool: DescriptorPool,
    services: BTreeMap<String, ServiceEntry>,
    mode: Mode,
    store: OperationStore,
    /// Dynamic mode: operations synthesized on first use, keyed `service/method`
    synthesized: RwLock<HashMap<String, Arc<OperationRecord>>>,
}

impl Snapshot {
    /// The placeholder published before the first load.
    pub fn empty() -> Self {
        Self {
            pool: DescriptorPool::new(),
            services: BTreeMap::new(),
            mode: Mode::Dynamic,
            store: OperationStore::default(),
            synthesized: RwLock::new(HashMap::new()),
        }
    }

    /// Build a snapshot from the configured services directory (and, in
    /// predefined mode, the operations directory). Fails whole: an error
    /// leaves nothing published.
    pub fn build(config: &GatewayConfig) -> Result<Self> {
        let loaded = loader::load(&config.services_dir)?;

        let store = match (config.mode, config.operations_dir.as_ref()) {
            (Mode::Predefined, Some(dir)) => OperationStore::load_from_directory(dir)?,
            _ => OperationStore::default(),
        };

        let snapshot = Self {
            pool: loaded.pool,
            services: loaded.services,
            mode: config.mode,
            store,
            synthesized: RwLock::new(HashMap::new()),
        };

        // Predefined mode binds eagerly: a method without an operation is a
        // startup failure, not a per-request surprise.
        if config.mode == Mode::Predefined {
            for service in snapshot.services.values() {
                for method in &service.methods {
                    if snapshot.store.resolve(method.name())?.is_none() {
                        return Err(StoreError::UnboundMethod {
                            service: service.full_name().to_string(),
                            method: method.name().to_string(),
                        }
                        .into());
                    }
                }
            }
        }

        Ok(snapshot)
    }

    pub fn pool(&self) -> &DescriptorPool {
        &self.pool
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn service(&self, full_name: &str) -> Option<&ServiceEntry> {
        self.services.get(full_name)
    }

    pub fn method(&self, service: &str, method: &str) -> Option<(&ServiceEntry, &MethodEntry)> {
        let entry = self.services.get(service)?;
        let method = entry.method(method)?;
        Some((entry, method))
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    pub fn service_names(&self) -> Vec<String> {
        self.services.keys().cloned().collect()
    }

    /// Number of operations the snapshot can serve: the store size in
    /// predefined mode, one per registered method in dynamic mode.
    pub fn operation_count(&self) -> usize {
        match self.mode {
            Mode::Predefined => self.store.len(),
            Mode::Dynamic => self.services.values().map(|s| s.methods.len()).sum(),
        }
    }

    /// Resolve the operation for a method: store binding first (exact name,
    /// then prefix-stripped), then — dynamic mode only — synthesis, memoized
    /// for the snapshot's lifetime.
    pub fn resolve_operation(
        &self,
        service: &str,
        method: &MethodEntry,
    ) -> Result<Arc<OperationRecord>> {
        if let Some(record) = self.store.resolve(method.name())? {
            return Ok(record);
        }

        if self.mode == Mode::Predefined {
            return Err(StoreError::UnboundMethod {
                service: service.to_string(),
                method: method.name().to_string(),
            }
            .into());
        }

        let key = format!("{service}/{}", method.name());
        if let Some(record) = self.synthesized.read().unwrap().get(&key) {
            return Ok(record.clone());
        }

        let record = Arc::new(operations::synthesize(method));
        let mut memo = self.synthesized.write().unwrap();
        Ok(memo.entry(key).or_insert(record).clone())
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("services", &self.services.keys().collect::<Vec<_>>())
            .field("mode", &self.mode)
            .field("operations", &self.operation_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::write_employee_service;

    fn dynamic_config(root: &std::path::Path) -> GatewayConfig {
        GatewayConfig {
            services_dir: root.to_path_buf(),
            graphql_endpoint: "http://localhost:4000/graphql".into(),
            ..Default::default()
        }
    }

    #[test]
    fn discovery_counts_services_and_operations() {
        let tmp = tempfile::tempdir().unwrap();
        write_employee_service(tmp.path());

        let snapshot = Snapshot::build(&dynamic_config(tmp.path())).unwrap();
        assert_eq!(snapshot.service_count(), 1);
        assert_eq!(
            snapshot.service_names(),
            vec!["employee.v1.EmployeeService".to_string()]
        );
        assert_eq!(snapshot.operation_count(), 3);
    }

    #[test]
    fn synthesis_is_memoized_per_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        write_employee_service(tmp.path());
        let snapshot = Snapshot::build(&dynamic_config(tmp.path())).unwrap();

        let (_, method) = snapshot
            .method("employee.v1.EmployeeService", "QueryEmployeeById")
            .unwrap();
        let method = method.clone();

        let first = snapshot
            .resolve_operation("employee.v1.EmployeeService", &method)
            .unwrap();
        let second = snapshot
            .resolve_operation("employee.v1.EmployeeService", &method)
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn synthesized_variables_stay_within_input_fields() {
        let tmp = tempfile::tempdir().unwrap();
        write_employee_service(tmp.path());
        let snapshot = Snapshot::build(&dynamic_config(tmp.path())).unwrap();

        for service in snapshot.services.values() {
            for method in &service.methods {
                let record = snapshot
                    .resolve_operation(service.full_name(), method)
                    .unwrap();
                let fields: Vec<String> = method
                    .input()
                    .fields()
                    .map(|f| f.name().to_string())
                    .collect();
                for variable in &record.variables {
                    assert!(
                        fields.contains(variable),
                        "variable {variable} is not an input field of {}",
                        method.name()
                    );
                }
            }
        }
    }

    #[test]
    fn predefined_mode_requires_every_method_bound() {
        let tmp = tempfile::tempdir().unwrap();
        write_employee_service(tmp.path());
        let ops = tempfile::tempdir().unwrap();
        std::fs::write(
            ops.path().join("employees.graphql"),
            "query QueryEmployees { employees { id name } }",
        )
        .unwrap();

        let config = GatewayConfig {
            mode: Mode::Predefined,
            operations_dir: Some(ops.path().to_path_buf()),
            ..dynamic_config(tmp.path())
        };
        let err = Snapshot::build(&config).unwrap_err();
        assert!(err.to_string().contains("no operation bound"));
    }

    #[test]
    fn predefined_mode_binds_all_methods() {
        let tmp = tempfile::tempdir().unwrap();
        write_employee_service(tmp.path());
        let ops = tempfile::tempdir().unwrap();
        for (file, doc) in [
            (
                "employees.graphql",
                "query QueryEmployees { employees { id name } }",
            ),
            (
                "employee_by_id.graphql",
                "query QueryEmployeeById($id: Int!) { employeeById(id: $id) { id name } }",
            ),
            (
                "update_employee.graphql",
                "mutation UpdateEmployee($id: Int!, $name: String) \
                 { updateEmployee(id: $id, name: $name) { id name } }",
            ),
        ] {
            std::fs::write(ops.path().join(file), doc).unwrap();
        }

        let config = GatewayConfig {
            mode: Mode::Predefined,
            operations_dir: Some(ops.path().to_path_buf()),
            ..dynamic_config(tmp.path())
        };
        let snapshot = Snapshot::build(&config).unwrap();
        assert_eq!(snapshot.operation_count(), 3);

        let (_, method) = snapshot
            .method("employee.v1.EmployeeService", "MutationUpdateEmployee")
            .unwrap();
        let record = snapshot
            .resolve_operation("employee.v1.EmployeeService", &method.clone())
            .unwrap();
        assert_eq!(record.name, "UpdateEmployee");
    }
}
