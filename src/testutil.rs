//! Shared fixtures for unit tests.

use crate::loader::{self, LoadedServices};
use std::path::Path;

pub(crate) const EMPLOYEE_PROTO: &str = r#"
syntax = "proto3";
package employee.v1;

message Employee {
  int32 id = 1;
  string name = 2;
}

message QueryEmployeesRequest {}

message QueryEmployeesResponse {
  repeated Employee employees = 1;
}

message QueryEmployeeByIdRequest {
  int32 id = 1;
}

message MutationUpdateEmployeeRequest {
  int32 id = 1;
  string name = 2;
}

message EmployeeResult {
  int32 id = 1;
  string name = 2;
}

service EmployeeService {
  rpc QueryEmployees(QueryEmployeesRequest) returns (QueryEmployeesResponse) {
    option idempotency_level = NO_SIDE_EFFECTS;
  }
  rpc QueryEmployeeById(QueryEmployeeByIdRequest) returns (EmployeeResult) {
    option idempotency_level = NO_SIDE_EFFECTS;
  }
  rpc MutationUpdateEmployee(MutationUpdateEmployeeRequest) returns (EmployeeResult);
}
"#;

pub(crate) fn write_employee_service(root: &Path) {
    let dir = root.join("employee");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("service.proto"), EMPLOYEE_PROTO).unwrap();
}

pub(crate) fn load_employee_services(root: &Path) -> LoadedServices {
    write_employee_service(root);
    loader::load(root).unwrap()
}
