//! JSON Patch (RFC 6902) documents sent to the backend.

use json_patch::{Patch, PatchOperation};
use serde_json::{json, Value};

use super::BackendError;

/// Collects operations and parses them into a [`Patch`]
#[derive(Debug, Default)]
pub struct PatchBuilder {
    operations: Vec<Value>,
}

impl PatchBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the whole patch unless the resource is still at `version_id`.
    /// No-op when the local copy carries no version.
    pub fn expect_version(mut self, version_id: Option<&str>) -> Self {
        if let Some(version_id) = version_id {
            self.operations
                .push(json!({ "op": "test", "path": "/meta/versionId", "value": version_id }));
        }
        self
    }

    /// `add` doubles as upsert on object members
    pub fn add(mut self, path: &str, value: Value) -> Self {
        self.operations
            .push(json!({ "op": "add", "path": path, "value": value }));
        self
    }

    pub fn replace(mut self, path: &str, value: Value) -> Self {
        self.operations
            .push(json!({ "op": "replace", "path": path, "value": value }));
        self
    }

    pub fn build(self) -> Result<Patch, BackendError> {
        Ok(serde_json::from_value(Value::Array(self.operations))?)
    }
}

/// Path an operation targets
pub fn operation_path(op: &PatchOperation) -> &str {
    match op {
        PatchOperation::Add(add_op) => add_op.path.as_str(),
        PatchOperation::Remove(remove_op) => remove_op.path.as_str(),
        PatchOperation::Replace(replace_op) => replace_op.path.as_str(),
        PatchOperation::Move(move_op) => move_op.path.as_str(),
        PatchOperation::Copy(copy_op) => copy_op.path.as_str(),
        PatchOperation::Test(test_op) => test_op.path.as_str(),
    }
}
