//! QF-009: Result store — tab-separated result files into SQLite tables.
//!
//! Each `load` runs in a single transaction, so a failed load leaves the
//! table exactly as it was. Column types are inferred from the data.

use super::error::StoreError;
use super::types::LoadMode;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};
use std::path::{Path, PathBuf};
use tracing::debug;

/// SQLite-backed pipeline database.
pub struct ResultStore {
    conn: Connection,
    path: PathBuf,
}

/// What a `load` wrote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadSummary {
    pub table: String,
    pub rows: usize,
    pub columns: Vec<String>,
    pub indexes: Vec<String>,
    pub mode: LoadMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnType {
    Integer,
    Real,
    Text,
}

impl ColumnType {
    fn sql(self) -> &'static str {
        match self {
            Self::Integer => "INTEGER",
            Self::Real => "REAL",
            Self::Text => "TEXT",
        }
    }

    fn infer<'a>(values: impl Iterator<Item = &'a str>) -> Self {
        let mut ty = Self::Integer;
        for v in values {
            if ty == Self::Integer && v.parse::<i64>().is_err() {
                ty = Self::Real;
            }
            if ty == Self::Real && v.parse::<f64>().is_err() {
                return Self::Text;
            }
        }
        ty
    }

    fn value(self, raw: &str) -> Value {
        if is_null(raw) {
            return Value::Null;
        }
        match self {
            Self::Integer => raw.parse().map(Value::Integer).unwrap_or_else(|_| Value::Text(raw.into())),
            Self::Real => raw.parse().map(Value::Real).unwrap_or_else(|_| Value::Text(raw.into())),
            Self::Text => Value::Text(raw.to_string()),
        }
    }
}

fn is_null(raw: &str) -> bool {
    raw.is_empty() || raw == "NA"
}

/// Double-quote an SQL identifier.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Table name derived from a load target: file name without `.load`, with
/// `-` and `.` replaced by `_`.
pub fn table_name_for(target: &str) -> String {
    let file = Path::new(target)
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_else(|| target.to_string());
    let body = file.strip_suffix(".load").unwrap_or(&file);
    body.replace(['-', '.'], "_")
}

/// Parsed tab-separated file.
struct Table {
    header: Vec<String>,
    rows: Vec<Vec<String>>,
}

fn parse_tsv(path: &Path, content: &str) -> Result<Table, StoreError> {
    let load_err = |line: usize, message: String| StoreError::Load {
        path: path.to_path_buf(),
        line,
        message,
    };

    let mut header: Option<Vec<String>> = None;
    let mut rows = Vec::new();

    for (i, raw) in content.lines().enumerate() {
        let line_no = i + 1;
        let line = raw.trim_end_matches('\r');
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<String> = line.split('\t').map(|f| f.trim().to_string()).collect();

        match &header {
            None => {
                let mut seen = std::collections::HashSet::new();
                for name in &fields {
                    if name.is_empty() {
                        return Err(load_err(line_no, "empty column name in header".into()));
                    }
                    if !seen.insert(name.as_str()) {
                        return Err(load_err(line_no, format!("duplicate column '{name}' in header")));
                    }
                }
                header = Some(fields);
            }
            Some(h) => {
                if fields.len() != h.len() {
                    return Err(load_err(
                        line_no,
                        format!("expected {} columns, found {}", h.len(), fields.len()),
                    ));
                }
                rows.push(fields);
            }
        }
    }

    let header = header.ok_or_else(|| load_err(0, "no header row".into()))?;
    Ok(Table { header, rows })
}

impl ResultStore {
    /// Open or create the database file.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        debug!(path = %path.display(), "result store opened");
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    /// In-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Ok(Self {
            conn: Connection::open_in_memory()?,
            path: PathBuf::from(":memory:"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Attach a secondary database for shared reference data.
    pub fn attach(&self, path: &Path, alias: &str) -> Result<(), StoreError> {
        let sql = format!("ATTACH DATABASE ?1 AS {}", quote_ident(alias));
        self.conn
            .execute(&sql, params![path.to_string_lossy().to_string()])?;
        debug!(path = %path.display(), alias, "database attached");
        Ok(())
    }

    pub fn table_exists(&self, table: &str) -> Result<bool, StoreError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![table],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    pub fn row_count(&self, table: &str) -> Result<usize, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_ident(table));
        let count: i64 = self.conn.query_row(&sql, [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Load `source` into `table`, then build the requested indexes.
    pub fn load(
        &mut self,
        source: &Path,
        table: &str,
        index_columns: &[String],
        mode: LoadMode,
    ) -> Result<LoadSummary, StoreError> {
        let content = std::fs::read_to_string(source).map_err(|e| StoreError::Io {
            path: source.to_path_buf(),
            source: e,
        })?;
        let data = parse_tsv(source, &content)?;

        if let Some(missing) = index_columns.iter().find(|c| !data.header.contains(c)) {
            return Err(StoreError::Load {
                path: source.to_path_buf(),
                line: 1,
                message: format!("index column '{missing}' not in header"),
            });
        }

        let types: Vec<ColumnType> = (0..data.header.len())
            .map(|col| {
                ColumnType::infer(
                    data.rows
                        .iter()
                        .map(|r| r[col].as_str())
                        .filter(|v| !is_null(v)),
                )
            })
            .collect();

        let exists = self.table_exists(table)?;
        let quoted = quote_ident(table);
        let tx = self.conn.transaction()?;

        match (mode, exists) {
            (LoadMode::Fail, true) => return Err(StoreError::TableExists(table.to_string())),
            (LoadMode::Replace, true) => {
                tx.execute_batch(&format!("DROP TABLE {quoted}"))?;
            }
            _ => {}
        }

        if !exists || mode == LoadMode::Replace {
            let columns: Vec<String> = data
                .header
                .iter()
                .zip(&types)
                .map(|(name, ty)| format!("{} {}", quote_ident(name), ty.sql()))
                .collect();
            tx.execute_batch(&format!("CREATE TABLE {quoted} ({})", columns.join(", ")))?;
        }

        {
            let names: Vec<String> = data.header.iter().map(|c| quote_ident(c)).collect();
            let slots: Vec<String> = (1..=names.len()).map(|i| format!("?{i}")).collect();
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO {quoted} ({}) VALUES ({})",
                names.join(", "),
                slots.join(", ")
            ))?;
            for row in &data.rows {
                let values = row.iter().zip(&types).map(|(raw, ty)| ty.value(raw));
                stmt.execute(params_from_iter(values))?;
            }
        }

        let mut indexes = Vec::new();
        for col in index_columns {
            let name = format!("{table}_{col}_idx");
            tx.execute_batch(&format!(
                "CREATE INDEX IF NOT EXISTS {} ON {quoted} ({})",
                quote_ident(&name),
                quote_ident(col)
            ))?;
            indexes.push(name);
        }

        tx.commit()?;
        debug!(table, rows = data.rows.len(), %mode, "table loaded");

        Ok(LoadSummary {
            table: table.to_string(),
            rows: data.rows.len(),
            columns: data.header,
            indexes,
            mode,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let p = dir.join(name);
        std::fs::write(&p, content).unwrap();
        p
    }

    const CIS: &str = "SNP\tgene\tbeta\tp-value\nrs1\tG1\t0.5\t1e-8\nrs2\tG2\t-0.25\t0.03\n";

    #[test]
    fn test_qf009_table_name_for() {
        assert_eq!(table_name_for("words_counts.load"), "words_counts");
        assert_eq!(
            table_name_for("out/airwave-illumina_exome_all_chrs-NMR_blood.MxEQTL_cis.load"),
            "airwave_illumina_exome_all_chrs_NMR_blood_MxEQTL_cis"
        );
        assert_eq!(table_name_for("plain"), "plain");
    }

    #[test]
    fn test_qf009_load_creates_table_and_indexes() {
        let dir = tempfile::tempdir().unwrap();
        let src = write(dir.path(), "r.cis", CIS);
        let mut store = ResultStore::open(&dir.path().join("db/csvdb")).unwrap();
        let summary = store
            .load(&src, "cis", &["SNP".to_string()], LoadMode::Fail)
            .unwrap();
        assert_eq!(summary.rows, 2);
        assert_eq!(summary.columns, vec!["SNP", "gene", "beta", "p-value"]);
        assert_eq!(summary.indexes, vec!["cis_SNP_idx"]);
        assert!(store.table_exists("cis").unwrap());
        assert_eq!(store.row_count("cis").unwrap(), 2);
        assert!(dir.path().join("db/csvdb").exists());
    }

    #[test]
    fn test_qf009_inferred_types() {
        let dir = tempfile::tempdir().unwrap();
        let src = write(dir.path(), "r.tsv", "n\tx\tlabel\n1\t1.5\ta\n2\tNA\tb\n\t3\t\n");
        let mut store = ResultStore::open_in_memory().unwrap();
        store.load(&src, "t", &[], LoadMode::Fail).unwrap();
        let ty: String = store
            .conn
            .query_row("SELECT typeof(x) FROM t WHERE n = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(ty, "real");
        let nulls: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM t WHERE n IS NULL AND label IS NULL", [], |r| r.get(0))
            .unwrap();
        assert_eq!(nulls, 1);
        let n_type: String = store
            .conn
            .query_row("SELECT typeof(n) FROM t WHERE label = 'b'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n_type, "integer");
    }

    #[test]
    fn test_qf009_existing_table_without_mode_fails() {
        let dir = tempfile::tempdir().unwrap();
        let src = write(dir.path(), "r.cis", CIS);
        let mut store = ResultStore::open_in_memory().unwrap();
        store.load(&src, "cis", &[], LoadMode::Fail).unwrap();
        let err = store.load(&src, "cis", &[], LoadMode::Fail).unwrap_err();
        assert!(matches!(err, StoreError::TableExists(ref t) if t == "cis"));
        assert_eq!(store.row_count("cis").unwrap(), 2);
    }

    #[test]
    fn test_qf009_replace_and_append() {
        let dir = tempfile::tempdir().unwrap();
        let src = write(dir.path(), "r.cis", CIS);
        let mut store = ResultStore::open_in_memory().unwrap();
        store.load(&src, "cis", &[], LoadMode::Fail).unwrap();
        store.load(&src, "cis", &[], LoadMode::Append).unwrap();
        assert_eq!(store.row_count("cis").unwrap(), 4);
        store.load(&src, "cis", &["gene".into()], LoadMode::Replace).unwrap();
        assert_eq!(store.row_count("cis").unwrap(), 2);
    }

    #[test]
    fn test_qf009_column_mismatch_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let good = write(dir.path(), "good.tsv", "a\tb\n1\t2\n");
        let bad = write(dir.path(), "bad.tsv", "a\tb\n3\t4\n5\n");
        let mut store = ResultStore::open_in_memory().unwrap();
        store.load(&good, "t", &[], LoadMode::Fail).unwrap();

        let err = store.load(&bad, "t", &[], LoadMode::Append).unwrap_err();
        assert!(matches!(err, StoreError::Load { line: 3, .. }));
        assert_eq!(store.row_count("t").unwrap(), 1);
    }

    #[test]
    fn test_qf009_replace_failure_keeps_old_table() {
        let dir = tempfile::tempdir().unwrap();
        let good = write(dir.path(), "good.tsv", "a\tb\n1\t2\n");
        let mut store = ResultStore::open_in_memory().unwrap();
        store.load(&good, "t", &[], LoadMode::Fail).unwrap();
        let err = store
            .load(&good, "t", &["missing".into()], LoadMode::Replace)
            .unwrap_err();
        assert!(matches!(err, StoreError::Load { .. }));
        assert_eq!(store.row_count("t").unwrap(), 1);
    }

    #[test]
    fn test_qf009_comments_blank_lines_and_crlf() {
        let dir = tempfile::tempdir().unwrap();
        let src = write(dir.path(), "w.counts", "# generated\nword\tcount\r\n\nthe\t3\r\nqtl\t1\r\n");
        let mut store = ResultStore::open_in_memory().unwrap();
        let s = store.load(&src, "w", &[], LoadMode::Fail).unwrap();
        assert_eq!(s.columns, vec!["word", "count"]);
        assert_eq!(s.rows, 2);
    }

    #[test]
    fn test_qf009_bad_headers() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ResultStore::open_in_memory().unwrap();
        let empty = write(dir.path(), "e.tsv", "\n# nothing\n");
        assert!(matches!(
            store.load(&empty, "e", &[], LoadMode::Fail),
            Err(StoreError::Load { line: 0, .. })
        ));
        let dup = write(dir.path(), "d.tsv", "a\ta\n1\t2\n");
        assert!(matches!(
            store.load(&dup, "d", &[], LoadMode::Fail),
            Err(StoreError::Load { line: 1, .. })
        ));
    }

    #[test]
    fn test_qf009_missing_source_is_io() {
        let mut store = ResultStore::open_in_memory().unwrap();
        let err = store
            .load(Path::new("/nonexistent/x.tsv"), "x", &[], LoadMode::Fail)
            .unwrap_err();
        assert!(matches!(err, StoreError::Io { .. }));
    }

    #[test]
    fn test_qf009_attach_annotations() {
        let dir = tempfile::tempdir().unwrap();
        let annot_path = dir.path().join("annotations.db");
        {
            let annot = Connection::open(&annot_path).unwrap();
            annot
                .execute_batch("CREATE TABLE genes (id TEXT); INSERT INTO genes VALUES ('G1');")
                .unwrap();
        }
        let store = ResultStore::open(&dir.path().join("csvdb")).unwrap();
        store.attach(&annot_path, "annotations").unwrap();
        let n: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM annotations.genes", [], |r| r.get(0))
            .unwrap();
        assert_eq!(n, 1);
    }
}
