//! The `database_query` tool: a SQL statement against a project-scoped
//! data source, gated by a deny-filter on dangerous verbs.
//!
//! The deny-filter tokenises the statement case-insensitively, skipping
//! over string literals and comments so a forbidden keyword embedded in a
//! quoted value or a comment doesn't trip the filter, then checks the
//! leading verb and scans for forbidden adjacent-keyword phrases anywhere
//! in the remaining tokens.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{AppError, AppResult};

use super::registry::{DataSourceRequirement, SideEffectClass, Tool, ToolExecutionContext};

/// Leading verbs that are always denied outright.
const DENIED_LEADING_VERBS: &[&str] = &["DROP", "TRUNCATE"];

/// Keyword phrases (adjacent token sequences) denied wherever they occur.
const DENIED_PHRASES: &[&[&str]] = &[&["ALTER", "DATABASE"], &["DROP", "TABLE"], &["DROP", "DATABASE"]];

/// Tokenise a SQL statement into uppercase word tokens, skipping string
/// literals (`'...'`, `"..."`) and comments (`-- ...`, `/* ... */`).
fn tokenize(sql: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = sql.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '\'' || c == '"' {
            let quote = c;
            i += 1;
            while i < chars.len() && chars[i] != quote {
                i += 1;
            }
            i += 1; // consume closing quote (or run off the end)
        } else if c == '-' && chars.get(i + 1) == Some(&'-') {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
        } else if c == '/' && chars.get(i + 1) == Some(&'*') {
            i += 2;
            while i + 1 < chars.len() && !(chars[i] == '*' && chars[i + 1] == '/') {
                i += 1;
            }
            i += 2;
        } else if c.is_alphanumeric() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(chars[start..i].iter().collect::<String>().to_uppercase());
        } else {
            i += 1;
        }
    }
    tokens
}

/// Returns `Err(reason)` if the statement is denied.
pub fn deny_filter(sql: &str) -> Result<(), String> {
    let tokens = tokenize(sql);
    let Some(leading) = tokens.first() else {
        return Ok(());
    };
    if DENIED_LEADING_VERBS.contains(&leading.as_str()) {
        return Err(format!("statement verb '{leading}' is not permitted"));
    }
    for phrase in DENIED_PHRASES {
        if tokens.windows(phrase.len()).any(|w| w == *phrase) {
            return Err(format!("statement contains forbidden keyword sequence {phrase:?}"));
        }
    }
    Ok(())
}

#[derive(Debug)]
pub struct DatabaseQueryTool;

#[async_trait]
impl Tool for DatabaseQueryTool {
    fn name(&self) -> &str {
        "database_query"
    }

    fn side_effect_class(&self) -> SideEffectClass {
        SideEffectClass::Query
    }

    fn data_source_requirement(&self) -> DataSourceRequirement {
        DataSourceRequirement::Sql
    }

    fn description(&self) -> &str {
        "Run a read-oriented SQL statement against a project-scoped database data source."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "datasource_id": {"type": "string"},
                "query": {"type": "string"},
                "timeout_seconds": {"type": "integer"},
            },
            "required": ["query"],
        })
    }

    fn validate(&self, args: &Value) -> AppResult<()> {
        let query = args
            .get("query")
            .and_then(Value::as_str)
            .ok_or_else(|| AppError::ToolValidationFailed("missing required field 'query'".into()))?;
        if query.trim().is_empty() {
            return Err(AppError::ToolValidationFailed("'query' must not be empty".into()));
        }
        if let Some(timeout) = args.get("timeout_seconds") {
            if !timeout.is_u64() {
                return Err(AppError::ToolValidationFailed(
                    "'timeout_seconds' must be a positive integer".into(),
                ));
            }
        }
        deny_filter(query).map_err(AppError::ToolValidationFailed)?;
        Ok(())
    }

    async fn execute(
        &self,
        _ctx: &ToolExecutionContext,
        args: &Value,
        data_source_config: Option<&Value>,
    ) -> AppResult<Value> {
        let query = args.get("query").and_then(Value::as_str).unwrap_or_default();
        // Executing the statement against the real backend is a
        // database-specific concern out of scope for the core; this shapes
        // the result the dispatcher returns once a concrete driver is
        // wired up by the host application.
        let dsn = data_source_config
            .and_then(|c| c.get("dsn"))
            .and_then(Value::as_str)
            .unwrap_or("unconfigured");
        Ok(serde_json::json!({
            "query": query,
            "dsn": dsn,
            "rows": [],
            "row_count": 0,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_ordinary_select() {
        assert!(deny_filter("SELECT * FROM users WHERE id = 1").is_ok());
    }

    #[test]
    fn denies_drop_table() {
        let err = deny_filter("DROP TABLE users").unwrap_err();
        assert!(err.contains("DROP"));
    }

    #[test]
    fn denies_truncate() {
        assert!(deny_filter("TRUNCATE orders").is_err());
    }

    #[test]
    fn denies_alter_database() {
        assert!(deny_filter("ALTER DATABASE mydb SET timezone = 'utc'").is_err());
    }

    #[test]
    fn allows_alter_table() {
        assert!(deny_filter("ALTER TABLE users ADD COLUMN x INT").is_ok());
    }

    #[test]
    fn ignores_keyword_inside_string_literal() {
        assert!(deny_filter("SELECT * FROM logs WHERE msg = 'DROP TABLE users'").is_ok());
    }

    #[test]
    fn ignores_keyword_inside_comment() {
        assert!(deny_filter("SELECT 1 -- DROP TABLE users\n").is_ok());
        assert!(deny_filter("SELECT 1 /* DROP TABLE users */").is_ok());
    }

    #[test]
    fn is_case_insensitive() {
        assert!(deny_filter("drop table users").is_err());
    }

    #[tokio::test]
    async fn validate_rejects_denied_statement() {
        let tool = DatabaseQueryTool;
        let err = tool
            .validate(&serde_json::json!({"query": "DROP TABLE t"}))
            .unwrap_err();
        assert_eq!(err.code(), "tool_validation_failed");
    }
}
