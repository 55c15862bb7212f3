use serde::{Deserialize, Serialize};

/// Host→guest request. One JSON object followed by `\n`.
#[derive(Debug, Clone, Serialize)]
pub struct ExecRequest {
    pub code: String,
    pub show_tables: bool,
    pub show_table_meta: bool,
}

/// A table preview included in [`ExecResponse::tables`] when
/// `show_tables` was requested.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TablePreview {
    pub name: String,
    pub row_count: u64,
    pub is_refreshing: bool,
    pub preview: String,
}

/// Guest→host reply. One JSON object followed by `\n`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecResponse {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub result_repr: Option<String>,
    pub error: Option<String>,
    #[serde(default)]
    pub tables: Vec<TablePreview>,
    #[serde(default, rename = "_timing")]
    pub timing: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_request_serializes_expected_fields() {
        let req = ExecRequest {
            code: "x = 1".into(),
            show_tables: false,
            show_table_meta: true,
        };
        let json = serde_json::to_string(&req).unwrap_or_else(|e| panic!("{e}"));
        assert!(json.contains("\"code\":\"x = 1\""));
        assert!(json.contains("\"show_table_meta\":true"));
    }

    #[test]
    fn exec_response_round_trips_with_missing_optional_fields() {
        let raw = r#"{"exit_code":0,"stdout":"","stderr":"","result_repr":null,"error":null}"#;
        let resp: ExecResponse = serde_json::from_str(raw).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(resp.exit_code, 0);
        assert!(resp.tables.is_empty());
        assert!(resp.timing.is_none());
    }

    #[test]
    fn exec_response_parses_table_preview() {
        let raw = r#"{"exit_code":0,"stdout":"","stderr":"","result_repr":null,"error":null,
            "tables":[{"name":"t","row_count":5,"is_refreshing":false,"preview":"..."}]}"#;
        let resp: ExecResponse = serde_json::from_str(raw).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(resp.tables.len(), 1);
        assert_eq!(resp.tables[0].row_count, 5);
    }
}
