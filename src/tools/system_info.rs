//! The `system_info` tool: process/host metrics, no data source required.

use async_trait::async_trait;
use serde_json::Value;
use sysinfo::System;

use crate::error::{AppError, AppResult};

use super::registry::{DataSourceRequirement, SideEffectClass, Tool, ToolExecutionContext};

#[derive(Debug)]
pub struct SystemInfoTool;

#[async_trait]
impl Tool for SystemInfoTool {
    fn name(&self) -> &str {
        "system_info"
    }

    fn side_effect_class(&self) -> SideEffectClass {
        SideEffectClass::Introspect
    }

    fn data_source_requirement(&self) -> DataSourceRequirement {
        DataSourceRequirement::None
    }

    fn description(&self) -> &str {
        "Report host and process metrics for the machine running the orchestrator."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "include_memory": {"type": "boolean"},
                "include_disk": {"type": "boolean"},
            },
        })
    }

    fn validate(&self, args: &Value) -> AppResult<()> {
        for field in ["include_memory", "include_disk"] {
            if let Some(v) = args.get(field) {
                if !v.is_boolean() {
                    return Err(AppError::ToolValidationFailed(format!("'{field}' must be a boolean")));
                }
            }
        }
        Ok(())
    }

    async fn execute(
        &self,
        _ctx: &ToolExecutionContext,
        args: &Value,
        _data_source_config: Option<&Value>,
    ) -> AppResult<Value> {
        let include_memory = args.get("include_memory").and_then(Value::as_bool).unwrap_or(false);
        let include_disk = args.get("include_disk").and_then(Value::as_bool).unwrap_or(false);

        let mut system = System::new();
        let mut result = serde_json::json!({
            "os": System::long_os_version().unwrap_or_else(|| "unknown".to_string()),
            "hostname": System::host_name().unwrap_or_else(|| "unknown".to_string()),
            "cpu_count": num_cpus(),
        });

        if include_memory {
            system.refresh_memory();
            result["memory"] = serde_json::json!({
                "total_bytes": system.total_memory(),
                "used_bytes": system.used_memory(),
            });
        }

        if include_disk {
            // Disk enumeration is host-specific and deliberately shallow
            // here; a real deployment would wire in `sysinfo::Disks`.
            result["disk"] = serde_json::json!({ "note": "disk introspection not configured" });
        }

        Ok(result)
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_memory_only_when_requested() {
        let tool = SystemInfoTool;
        let ctx = ToolExecutionContext {
            tenant_id: "t1".into(),
            project_id: uuid::Uuid::new_v4(),
            user_id: "u1".into(),
            store: std::sync::Arc::new(crate::store::MemoryStore::new()),
            timeout: std::time::Duration::from_secs(5),
        };
        let result = tool
            .execute(&ctx, &serde_json::json!({"include_memory": true}), None)
            .await
            .unwrap();
        assert!(result.get("memory").is_some());
        assert!(result.get("disk").is_none());
    }

    #[test]
    fn validate_rejects_non_boolean_flags() {
        let tool = SystemInfoTool;
        let err = tool
            .validate(&serde_json::json!({"include_memory": "yes"}))
            .unwrap_err();
        assert_eq!(err.code(), "tool_validation_failed");
    }
}
