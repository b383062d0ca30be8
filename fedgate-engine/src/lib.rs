//! Adapter over the embedded DuckDB engine.
//!
//! The adapter is the single authority over SQL execution; the other
//! subsystems never touch the engine connection directly.

use std::{
    path::Path,
    sync::Mutex,
};

use duckdb::{params_from_iter, types::Value, Connection};
use fedgate_core::{
    config::EngineConfig,
    data::{DataType, DataValue, JsonRow, QueryRows, ResourceFormat},
    err::{bail, Context, GatewayError, Result},
};
use fedgate_logging::{debug, trace};

/// A table known to the engine catalog
#[derive(Debug, Clone, PartialEq)]
pub struct TableInfo {
    pub schema: String,
    pub name: String,
}

/// A column of a table
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnInfo {
    pub name: String,
    /// The engine's declared type name, e.g. `VARCHAR`
    pub declared_type: String,
    pub r#type: DataType,
}

/// The embedded analytical engine
pub struct DuckdbEngine {
    conn: Mutex<Connection>,
}

/// Doubles embedded double quotes, for identifiers
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Doubles embedded single quotes, for string literals
pub fn quote_literal(literal: &str) -> String {
    format!("'{}'", literal.replace('\'', "''"))
}

impl DuckdbEngine {
    pub fn new(conf: &EngineConfig) -> Result<Self> {
        let conn = match &conf.database {
            Some(path) => Connection::open(path)
                .map_err(|e| GatewayError::Engine(e.to_string()))
                .with_context(|| format!("Failed to open database: {}", path.display()))?,
            None => Connection::open_in_memory()
                .map_err(|e| GatewayError::Engine(e.to_string()))
                .context("Failed to open in-memory database")?,
        };

        for setting in Self::settings(conf) {
            debug!("Applying engine setting: {}", setting);
            conn.execute_batch(&setting)
                .map_err(|e| GatewayError::Engine(e.to_string()))
                .with_context(|| format!("Failed to apply setting: {setting}"))?;
        }

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn settings(conf: &EngineConfig) -> Vec<String> {
        let mut settings = vec![];

        if let Some(limit) = &conf.memory_limit {
            settings.push(format!("SET memory_limit={}", quote_literal(limit)));
        }
        if let Some(threads) = conf.threads {
            settings.push(format!("SET threads={threads}"));
        }
        if let Some(store) = &conf.object_store {
            if let Some(region) = &store.region {
                settings.push(format!("SET s3_region={}", quote_literal(region)));
            }
            if let Some(endpoint) = &store.endpoint {
                settings.push(format!("SET s3_endpoint={}", quote_literal(endpoint)));
            }
            if let Some(key) = &store.access_key_id {
                settings.push(format!("SET s3_access_key_id={}", quote_literal(key)));
            }
            if let Some(secret) = &store.secret_access_key {
                settings.push(format!(
                    "SET s3_secret_access_key={}",
                    quote_literal(secret)
                ));
            }
        }

        settings
    }

    /// Runs a query and materializes the full result set
    pub fn execute(&self, sql: &str) -> Result<QueryRows> {
        trace!("Executing: {}", sql);
        let conn = self.conn.lock().unwrap();

        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| GatewayError::Engine(e.to_string()))?;
        let mut rows_iter = stmt
            .query([])
            .map_err(|e| GatewayError::Engine(e.to_string()))?;

        // column info is only available from the executed statement
        let (column_count, columns) = {
            let stmt = rows_iter
                .as_ref()
                .context("Statement unavailable after query")?;
            (stmt.column_count(), stmt.column_names())
        };

        let mut rows = vec![];
        while let Some(row) = rows_iter
            .next()
            .map_err(|e| GatewayError::Engine(e.to_string()))?
        {
            let mut values = Vec::with_capacity(column_count);
            for i in 0..column_count {
                let value = row.get_ref(i).map(|v| v.to_owned()).unwrap_or(Value::Null);
                values.push(Self::to_data_value(value));
            }
            rows.push(values);
        }

        Ok(QueryRows::new(columns, rows))
    }

    /// Runs one or more statements with no result
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        trace!("Executing batch: {}", sql);
        self.conn
            .lock()
            .unwrap()
            .execute_batch(sql)
            .map_err(|e| GatewayError::Engine(e.to_string()))?;
        Ok(())
    }

    fn to_data_value(value: Value) -> DataValue {
        match value {
            Value::Null => DataValue::Null,
            Value::Boolean(b) => DataValue::Boolean(b),
            Value::TinyInt(i) => DataValue::Int64(i as i64),
            Value::SmallInt(i) => DataValue::Int64(i as i64),
            Value::Int(i) => DataValue::Int64(i as i64),
            Value::BigInt(i) => DataValue::Int64(i),
            Value::HugeInt(i) => match i64::try_from(i) {
                Ok(i) => DataValue::Int64(i),
                Err(_) => DataValue::Utf8String(i.to_string()),
            },
            Value::UTinyInt(i) => DataValue::Int64(i as i64),
            Value::USmallInt(i) => DataValue::Int64(i as i64),
            Value::UInt(i) => DataValue::Int64(i as i64),
            Value::UBigInt(i) => match i64::try_from(i) {
                Ok(i) => DataValue::Int64(i),
                Err(_) => DataValue::Utf8String(i.to_string()),
            },
            Value::Float(f) => DataValue::Float64(f as f64),
            Value::Double(f) => DataValue::Float64(f),
            Value::Decimal(d) => DataValue::Utf8String(d.to_string()),
            Value::Text(s) => DataValue::Utf8String(s),
            Value::Blob(b) => DataValue::Binary(b),
            other => DataValue::Utf8String(format!("{other:?}")),
        }
    }

    /// Creates a table from JSON row objects.
    ///
    /// Columns are inferred from the first record's keys; every non-null
    /// value is coerced to a string, nulls stay null.
    pub fn create_table_from_rows(&self, name: &str, rows: &[JsonRow]) -> Result<()> {
        let first = match rows.first() {
            Some(first) => first,
            None => bail!("Cannot infer columns from an empty row set for table '{name}'"),
        };

        let columns: Vec<String> = first.keys().cloned().collect();

        let ddl = format!(
            "CREATE TABLE {} ({})",
            quote_ident(name),
            columns
                .iter()
                .map(|c| format!("{} VARCHAR", quote_ident(c)))
                .collect::<Vec<_>>()
                .join(", ")
        );

        let insert = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(name),
            columns
                .iter()
                .map(|c| quote_ident(c))
                .collect::<Vec<_>>()
                .join(", "),
            columns.iter().map(|_| "?").collect::<Vec<_>>().join(", ")
        );

        let conn = self.conn.lock().unwrap();
        conn.execute_batch(&ddl)
            .map_err(|e| GatewayError::Engine(e.to_string()))?;

        let mut stmt = conn
            .prepare(&insert)
            .map_err(|e| GatewayError::Engine(e.to_string()))?;

        for row in rows {
            let params: Vec<Option<String>> = columns
                .iter()
                .map(|column| match row.get(column) {
                    None | Some(serde_json::Value::Null) => None,
                    Some(serde_json::Value::String(s)) => Some(s.clone()),
                    Some(value) => Some(value.to_string()),
                })
                .collect();

            stmt.execute(params_from_iter(params))
                .map_err(|e| GatewayError::Engine(e.to_string()))?;
        }

        debug!("Created table '{}' with {} rows", name, rows.len());
        Ok(())
    }

    /// Creates a temp table by reading a local file with the engine reader
    /// for the format
    pub fn create_temp_table_from_file(
        &self,
        name: &str,
        path: &Path,
        format: ResourceFormat,
    ) -> Result<()> {
        let sql = format!(
            "CREATE TEMP TABLE {} AS SELECT * FROM {}({})",
            quote_ident(name),
            format.reader_function(),
            quote_literal(&path.to_string_lossy())
        );

        self.execute_batch(&sql)
            .with_context(|| format!("Failed to materialize '{}' from {}", name, path.display()))
    }

    /// Drops a table. Idempotent.
    pub fn drop_table(&self, name: &str) -> Result<()> {
        self.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_ident(name)))
    }

    /// Lists the tables in the engine catalog
    pub fn schema(&self) -> Result<Vec<TableInfo>> {
        let rows = self.execute(
            "SELECT table_schema, table_name FROM information_schema.tables \
             ORDER BY table_schema, table_name",
        )?;

        Ok(rows
            .rows
            .iter()
            .map(|row| TableInfo {
                schema: string_at(row, 0),
                name: string_at(row, 1),
            })
            .collect())
    }

    pub fn table_columns(&self, name: &str, schema: Option<&str>) -> Result<Vec<ColumnInfo>> {
        let sql = format!(
            "SELECT column_name, data_type FROM information_schema.columns \
             WHERE table_name = {} AND table_schema = {} ORDER BY ordinal_position",
            quote_literal(name),
            quote_literal(schema.unwrap_or("main")),
        );

        let rows = self.execute(&sql)?;

        Ok(rows
            .rows
            .iter()
            .map(|row| {
                let declared = string_at(row, 1);
                ColumnInfo {
                    name: string_at(row, 0),
                    r#type: DataType::from_engine_type(&declared),
                    declared_type: declared,
                }
            })
            .collect())
    }

    pub fn row_count(&self, name: &str, schema: Option<&str>) -> Result<u64> {
        let target = match schema {
            Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(name)),
            None => quote_ident(name),
        };

        let rows = self.execute(&format!("SELECT COUNT(*) FROM {target}"))?;

        match rows.rows.first().and_then(|row| row.first()) {
            Some(DataValue::Int64(count)) => Ok(*count as u64),
            other => bail!("Unexpected row count result: {:?}", other),
        }
    }

    pub fn table_exists(&self, name: &str, schema: Option<&str>) -> Result<bool> {
        let sql = format!(
            "SELECT COUNT(*) FROM information_schema.tables \
             WHERE table_name = {} AND table_schema = {}",
            quote_literal(name),
            quote_literal(schema.unwrap_or("main")),
        );

        let rows = self.execute(&sql)?;
        Ok(matches!(
            rows.rows.first().and_then(|row| row.first()),
            Some(DataValue::Int64(count)) if *count > 0
        ))
    }

    /// Copies a query result to a file in the given format
    pub fn export_to_file(&self, sql: &str, path: &Path, format: ResourceFormat) -> Result<()> {
        let options = match format {
            ResourceFormat::Csv => "(FORMAT CSV, HEADER)",
            ResourceFormat::Json => "(FORMAT JSON)",
            ResourceFormat::Parquet => "(FORMAT PARQUET)",
            other => bail!("Unsupported export format: {other}"),
        };

        self.execute_batch(&format!(
            "COPY ({}) TO {} {}",
            sql,
            quote_literal(&path.to_string_lossy()),
            options
        ))
    }

    /// Whether the engine responds to a trivial query
    pub fn healthy(&self) -> bool {
        self.execute("SELECT 1").is_ok()
    }
}

fn string_at(row: &[DataValue], idx: usize) -> String {
    row.get(idx)
        .and_then(|v| v.to_string_coerced())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fedgate_core::config::ObjectStoreConfig;
    use std::io::Write;

    fn engine() -> DuckdbEngine {
        DuckdbEngine::new(&EngineConfig::default()).unwrap()
    }

    fn json_rows(json: &str) -> Vec<JsonRow> {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_execute_select() {
        let rows = engine().execute("SELECT 1 AS x, 'a' AS y").unwrap();

        assert_eq!(rows.columns, vec!["x".to_string(), "y".to_string()]);
        assert_eq!(
            rows.rows,
            vec![vec![
                DataValue::Int64(1),
                DataValue::Utf8String("a".into())
            ]]
        );
    }

    #[test]
    fn test_execute_error_carries_engine_kind() {
        let err = engine().execute("SELECT FROM WHERE").unwrap_err();

        assert!(matches!(
            GatewayError::of(&err),
            Some(GatewayError::Engine(_))
        ));
    }

    #[test]
    fn test_create_table_from_rows() {
        let engine = engine();
        let rows = json_rows(r#"[{"id":1,"n":"A"},{"id":2,"n":null}]"#);

        engine.create_table_from_rows("t", &rows).unwrap();

        let result = engine
            .execute("SELECT id, n FROM t ORDER BY id")
            .unwrap();
        assert_eq!(result.rows.len(), 2);
        // values are coerced to strings, nulls stay null
        assert_eq!(result.rows[0][0], DataValue::Utf8String("1".into()));
        assert_eq!(result.rows[1][1], DataValue::Null);
    }

    #[test]
    fn test_create_table_from_empty_rows_fails() {
        assert!(engine().create_table_from_rows("t", &[]).is_err());
    }

    #[test]
    fn test_create_temp_table_from_csv_file() {
        let engine = engine();

        let mut file = tempfile::Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(file, "id,name\n1,alice\n2,bob").unwrap();
        file.flush().unwrap();

        engine
            .create_temp_table_from_file("people", file.path(), ResourceFormat::Csv)
            .unwrap();

        assert_eq!(engine.row_count("people", None).unwrap(), 2);
    }

    #[test]
    fn test_drop_table_idempotent() {
        let engine = engine();

        engine.execute_batch("CREATE TABLE t (x INTEGER)").unwrap();
        engine.drop_table("t").unwrap();
        engine.drop_table("t").unwrap();

        assert!(!engine.table_exists("t", None).unwrap());
    }

    #[test]
    fn test_catalog_helpers() {
        let engine = engine();
        engine
            .execute_batch("CREATE TABLE t (id INTEGER, name VARCHAR)")
            .unwrap();

        assert!(engine.table_exists("t", None).unwrap());
        assert!(!engine.table_exists("missing", None).unwrap());

        let columns = engine.table_columns("t", None).unwrap();
        assert_eq!(columns.len(), 2);
        assert_eq!(columns[0].name, "id");
        assert_eq!(columns[0].r#type, DataType::Int64);
        assert_eq!(columns[1].r#type, DataType::Utf8String);

        let tables = engine.schema().unwrap();
        assert!(tables.iter().any(|t| t.name == "t"));
    }

    #[test]
    fn test_export_to_csv() {
        let engine = engine();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");

        engine
            .export_to_file("SELECT 1 AS a, 2 AS b", &path, ResourceFormat::Csv)
            .unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.starts_with("a,b"));
    }

    #[test]
    fn test_engine_settings_applied() {
        let conf = EngineConfig {
            memory_limit: Some("512MB".into()),
            threads: Some(2),
            ..EngineConfig::default()
        };

        let engine = DuckdbEngine::new(&conf).unwrap();
        assert!(engine.healthy());
    }

    #[test]
    fn test_object_store_settings_render() {
        let conf = EngineConfig {
            object_store: Some(ObjectStoreConfig {
                region: Some("eu-west-1".into()),
                endpoint: None,
                access_key_id: Some("key".into()),
                secret_access_key: None,
            }),
            ..EngineConfig::default()
        };

        let settings = DuckdbEngine::settings(&conf);
        assert!(settings.contains(&"SET s3_region='eu-west-1'".to_string()));
        assert!(settings.contains(&"SET s3_access_key_id='key'".to_string()));
    }

    #[test]
    fn test_quote_helpers() {
        assert_eq!(quote_ident("temp_a_1"), "\"temp_a_1\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_literal("o'brien"), "'o''brien'");
    }
}
