//! `ToolRegistry` and the `dispatch()` pipeline.
//!
//! A small async trait implemented per tool, registered immutably by name,
//! generalized into a registry the dispatcher looks up by name on every
//! tool call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{AppError, AppResult};
use crate::store::{DataSourceKind, ProjectId, Store, TenantId, UserId};

/// Side-effect classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffectClass {
    Query,
    Mutate,
    Introspect,
}

/// Which kind of project-scoped data source, if any, a tool call
/// references.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataSourceRequirement {
    None,
    Sql,
    Http,
}

/// Everything a tool needs to execute a single call, resolved by the
/// dispatcher before `execute` runs.
pub struct ToolExecutionContext {
    pub tenant_id: TenantId,
    pub project_id: ProjectId,
    pub user_id: UserId,
    pub store: Arc<dyn Store>,
    pub timeout: Duration,
}

/// An immutable tool descriptor plus its pure validator and executor.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn side_effect_class(&self) -> SideEffectClass;
    fn data_source_requirement(&self) -> DataSourceRequirement;

    /// Description handed to the model so it knows when/why to call this
    /// tool.
    fn description(&self) -> &str;

    /// JSON-schema-like parameter spec handed to the model (spec.md §3
    /// "Tool descriptor").
    fn parameters_schema(&self) -> Value;

    /// Pure schema validation of the raw call arguments. Must not perform
    /// I/O.
    fn validate(&self, args: &Value) -> AppResult<()>;

    /// Perform the call. `data_source_config`, when
    /// `data_source_requirement()` is not `None`, is the resolved and
    /// project-verified [`crate::store::DataSource::config`].
    async fn execute(
        &self,
        ctx: &ToolExecutionContext,
        args: &Value,
        data_source_config: Option<&Value>,
    ) -> AppResult<Value>;
}

/// Immutable-after-registration collection of tool descriptors, keyed by
/// name.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// The tool descriptors in the shape handed to the LLM transport for
    /// tool-calling.
    pub fn tool_specs(&self) -> Vec<crate::llm_client::LlmToolSpec> {
        self.tools
            .values()
            .map(|tool| crate::llm_client::LlmToolSpec {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                parameters: tool.parameters_schema(),
            })
            .collect()
    }

    /// The registry preloaded with `database_query`, `api_request`, and
    /// `system_info`.
    pub fn with_default_tools() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(super::database::DatabaseQueryTool));
        registry.register(Arc::new(super::http::ApiRequestTool::new()));
        registry.register(Arc::new(super::system_info::SystemInfoTool));
        registry
    }
}

/// The six-step dispatch pipeline.
pub async fn dispatch(
    registry: &ToolRegistry,
    ctx: &ToolExecutionContext,
    tool_name: &str,
    raw_args: &Value,
) -> AppResult<Value> {
    // 1. lookup by name
    let tool = registry
        .get(tool_name)
        .ok_or_else(|| AppError::NotFound(format!("unknown tool '{tool_name}'")))?;

    // 2. schema-validate raw_args
    tool.validate(raw_args)
        .map_err(|e| AppError::ToolValidationFailed(e.to_string()))?;

    // 3 & 4. project-scoped access check + resolve the data-source handle
    let data_source_config = match tool.data_source_requirement() {
        DataSourceRequirement::None => None,
        requirement => {
            let datasource_id = raw_args
                .get("datasource_id")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    AppError::ToolValidationFailed("missing required field 'datasource_id'".into())
                })?;

            let data_source = tokio::time::timeout(ctx.timeout, ctx.store.get_data_source(datasource_id))
                .await
                .map_err(|_| AppError::UpstreamUnavailable("data source lookup timed out".into()))??;

            if data_source.project_id != ctx.project_id {
                return Err(AppError::Forbidden(format!(
                    "data source '{datasource_id}' does not belong to this project"
                )));
            }

            let expected_kind = match requirement {
                DataSourceRequirement::Sql => DataSourceKind::Sql,
                DataSourceRequirement::Http => DataSourceKind::Http,
                DataSourceRequirement::None => unreachable!(),
            };
            if data_source.kind != expected_kind {
                return Err(AppError::ToolValidationFailed(format!(
                    "data source '{datasource_id}' is not a {expected_kind:?} source"
                )));
            }

            Some(data_source.config)
        }
    };

    // 5. execute
    let result = tokio::time::timeout(
        ctx.timeout,
        tool.execute(ctx, raw_args, data_source_config.as_ref()),
    )
    .await
    .map_err(|_| AppError::ToolExecutionFailed("tool execution timed out".into()))??;

    // 6. shape the result — tools already return their own `Value` shape;
    // the dispatcher's job is only to guarantee it's present.
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use uuid::Uuid;

    fn ctx(store: Arc<dyn Store>, project_id: ProjectId) -> ToolExecutionContext {
        ToolExecutionContext {
            tenant_id: "t1".into(),
            project_id,
            user_id: "u1".into(),
            store,
            timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn dispatch_rejects_unknown_tool() {
        let registry = ToolRegistry::with_default_tools();
        let store = Arc::new(MemoryStore::new());
        let err = dispatch(&registry, &ctx(store, Uuid::new_v4()), "nope", &Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "not_found");
    }

    #[tokio::test]
    async fn dispatch_system_info_needs_no_data_source() {
        let registry = ToolRegistry::with_default_tools();
        let store = Arc::new(MemoryStore::new());
        let result = dispatch(
            &registry,
            &ctx(store, Uuid::new_v4()),
            "system_info",
            &serde_json::json!({}),
        )
        .await
        .unwrap();
        assert!(result.is_object());
    }

    #[tokio::test]
    async fn dispatch_rejects_datasource_from_another_project() {
        let registry = ToolRegistry::with_default_tools();
        let store = Arc::new(MemoryStore::new());
        let owning_project = Uuid::new_v4();
        store.insert_data_source(crate::store::DataSource {
            id: "ds-1".into(),
            project_id: owning_project,
            kind: DataSourceKind::Sql,
            config: serde_json::json!({"dsn": "postgres://x"}),
        });
        let other_project = Uuid::new_v4();
        let err = dispatch(
            &registry,
            &ctx(store, other_project),
            "database_query",
            &serde_json::json!({"datasource_id": "ds-1", "query": "SELECT 1"}),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "forbidden");
    }
}
