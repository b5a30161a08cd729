//! Read-only access to the PIRLS survey database.

use crate::models::prompt::value_to_text;
use crate::services::metrics::DB_QUERY_DURATION;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Row, TypeInfo, ValueRef};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{info, instrument};

const MAX_RESULT_CHARS: usize = 3_000;
const TRUNCATION_NOTICE: &str = "...\n(results too long. Output truncated.)";

/// Questionnaire subject. Each one has an answers table and an entries table
/// joined on its entity id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SurveyTable {
    Students,
    Curricula,
    Homes,
    Teachers,
    Schools,
}

impl SurveyTable {
    pub fn as_str(&self) -> &'static str {
        match self {
            SurveyTable::Students => "Students",
            SurveyTable::Curricula => "Curricula",
            SurveyTable::Homes => "Homes",
            SurveyTable::Teachers => "Teachers",
            SurveyTable::Schools => "Schools",
        }
    }

    fn singular(&self) -> &'static str {
        match self {
            SurveyTable::Students => "Student",
            SurveyTable::Curricula => "Curriculum",
            SurveyTable::Homes => "Home",
            SurveyTable::Teachers => "Teacher",
            SurveyTable::Schools => "School",
        }
    }

    pub fn answers_table(&self) -> String {
        format!("{}QuestionnaireAnswers", self.singular())
    }

    pub fn entries_table(&self) -> String {
        format!("{}QuestionnaireEntries", self.singular())
    }

    pub fn entity_id(&self) -> String {
        format!("{}_id", self.singular().to_lowercase())
    }

    fn questionnaire_join(&self) -> String {
        format!(
            "FROM {general} AS GTab \
             JOIN {answers} AS ATab ON ATab.{id} = GTab.{id} \
             JOIN {entries} AS ETab ON ETab.Code = ATab.Code",
            general = self.as_str(),
            answers = self.answers_table(),
            entries = self.entries_table(),
            id = self.entity_id(),
        )
    }
}

/// Survey database connection pool.
#[derive(Clone)]
pub struct SurveyDb {
    pool: PgPool,
}

impl SurveyDb {
    /// Create the pool without connecting; connections are opened per query.
    #[instrument(skip(database_url), fields(service = "survey-qa-service"))]
    pub fn connect_lazy(database_url: &str, max_connections: u32) -> Result<Self, AppError> {
        info!(max_connections = max_connections, "Configuring PostgreSQL pool");

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect_lazy(database_url)
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Invalid database URL: {}", e)))?;

        Ok(Self { pool })
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }

    /// Run `sql` in a read-only transaction and return each row's columns
    /// as text, in column order. NULL columns come back as `None`.
    async fn fetch_rows(
        &self,
        operation: &str,
        sql: &str,
        params: &[&str],
    ) -> Result<Vec<Vec<Option<String>>>, sqlx::Error> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&[operation])
            .start_timer();

        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await?;

        let mut query = sqlx::query(sql);
        for param in params {
            query = query.bind(*param);
        }
        let rows = query.fetch_all(&mut *tx).await?;
        tx.rollback().await?;

        timer.observe_duration();

        rows.iter().map(row_text).collect()
    }

    /// Run an arbitrary query. Failures are reported in the returned text so
    /// the caller can correct the query.
    #[instrument(skip(self))]
    pub async fn query_database(&self, query: &str) -> String {
        match self.fetch_rows("query_database", query, &[]).await {
            Ok(rows) => format_query_result(query, &rows),
            Err(e) => {
                tracing::warn!(error = %e, "Survey query failed");
                wrong_query(&e)
            }
        }
    }

    /// Distinct answers given to one questionnaire question.
    #[instrument(skip(self), fields(table = table.as_str()))]
    pub async fn possible_answers(&self, table: SurveyTable, question_code: &str) -> String {
        let sql = format!(
            "SELECT DISTINCT ATab.Answer::text {} WHERE ETab.Code = $1",
            table.questionnaire_join()
        );
        let code = strip_quotes(question_code);

        match self.fetch_rows("possible_answers", &sql, &[code.as_str()]).await {
            Ok(rows) => rows
                .iter()
                .map(|row| format!("{}\n", join_row(row)))
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "Possible answers lookup failed");
                wrong_query(&e)
            }
        }
    }

    /// Questions of one type with their codes.
    #[instrument(skip(self), fields(table = table.as_str()))]
    pub async fn questions_of_type(&self, table: SurveyTable, question_type: &str) -> String {
        let sql = format!(
            "SELECT DISTINCT ETab.Question::text, ETab.Code::text {} WHERE ETab.Type = $1",
            table.questionnaire_join()
        );
        let question_type = strip_quotes(question_type);

        match self.fetch_rows("questions_of_type", &sql, &[question_type.as_str()]).await {
            Ok(rows) => rows
                .iter()
                .map(|row| {
                    let question = row.first().map(cell_text).unwrap_or_default();
                    let code = row.get(1).map(cell_text).unwrap_or_default();
                    format!("(Code: {}) {}\n", code, question)
                })
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "Questions by type lookup failed");
                wrong_query(&e)
            }
        }
    }
}

fn wrong_query(e: &sqlx::Error) -> String {
    format!("Wrong query, encountered exception {}.", e)
}

fn strip_quotes(value: &str) -> String {
    value.replace(['\'', '"'], "")
}

/// Decode every column of `row` by position, so repeated or unnamed columns
/// are all kept.
fn row_text(row: &PgRow) -> Result<Vec<Option<String>>, sqlx::Error> {
    (0..row.len()).map(|index| column_text(row, index)).collect()
}

fn column_text(row: &PgRow, index: usize) -> Result<Option<String>, sqlx::Error> {
    let type_name = row.try_get_raw(index)?.type_info().name().to_string();

    let text = match type_name.as_str() {
        "BOOL" => row.try_get::<Option<bool>, _>(index)?.map(|v| v.to_string()),
        "INT2" => row.try_get::<Option<i16>, _>(index)?.map(|v| v.to_string()),
        "INT4" => row.try_get::<Option<i32>, _>(index)?.map(|v| v.to_string()),
        "INT8" => row.try_get::<Option<i64>, _>(index)?.map(|v| v.to_string()),
        "FLOAT4" => row.try_get::<Option<f32>, _>(index)?.map(|v| v.to_string()),
        "FLOAT8" => row.try_get::<Option<f64>, _>(index)?.map(|v| v.to_string()),
        "NUMERIC" => row
            .try_get::<Option<Decimal>, _>(index)?
            .map(|v| v.to_string()),
        "DATE" => row
            .try_get::<Option<NaiveDate>, _>(index)?
            .map(|v| v.to_string()),
        "TIME" => row
            .try_get::<Option<NaiveTime>, _>(index)?
            .map(|v| v.to_string()),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(index)?
            .map(|v| v.to_string()),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(index)?
            .map(|v| v.to_string()),
        "JSON" | "JSONB" => row
            .try_get::<Option<Value>, _>(index)?
            .map(|v| value_to_text(&v)),
        // Text-like types, including enums and SHOW/EXPLAIN output. Other
        // binary values surface as a decode error; `::text` in the query avoids it.
        _ => row.try_get_unchecked::<Option<String>, _>(index)?,
    };

    Ok(text)
}

fn cell_text(cell: &Option<String>) -> String {
    cell.clone().unwrap_or_else(|| "null".to_string())
}

fn join_row(row: &[Option<String>]) -> String {
    row.iter().map(cell_text).collect::<Vec<_>>().join(", ")
}

/// `Query: {query}\nResult: {rows}`, rows newline separated and truncated to
/// a bounded length.
pub fn format_query_result(query: &str, rows: &[Vec<Option<String>>]) -> String {
    let mut result = rows
        .iter()
        .map(|row| join_row(row))
        .collect::<Vec<_>>()
        .join("\n");

    if result.chars().count() > MAX_RESULT_CHARS {
        result = result.chars().take(MAX_RESULT_CHARS).collect();
        result.push_str(TRUNCATION_NOTICE);
    }

    format!("Query: {}\nResult: {}", query, result)
}

/// Survey lookups available to the analyst.
pub trait SurveyTools: Send + Sync {
    fn query_database(&self, query: &str) -> String;
    fn possible_answers(&self, table: SurveyTable, question_code: &str) -> String;
    fn questions_of_type(&self, table: SurveyTable, question_type: &str) -> String;
}

/// [`SurveyTools`] backed by [`SurveyDb`], callable from blocking threads.
#[derive(Clone)]
pub struct PgSurveyTools {
    db: SurveyDb,
    runtime: Handle,
}

impl PgSurveyTools {
    pub fn new(db: SurveyDb, runtime: Handle) -> Self {
        Self { db, runtime }
    }
}

impl SurveyTools for PgSurveyTools {
    fn query_database(&self, query: &str) -> String {
        self.runtime.block_on(self.db.query_database(query))
    }

    fn possible_answers(&self, table: SurveyTable, question_code: &str) -> String {
        self.runtime
            .block_on(self.db.possible_answers(table, question_code))
    }

    fn questions_of_type(&self, table: SurveyTable, question_type: &str) -> String {
        self.runtime
            .block_on(self.db.questions_of_type(table, question_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn table_names_follow_questionnaire_convention() {
        assert_eq!(SurveyTable::Students.answers_table(), "StudentQuestionnaireAnswers");
        assert_eq!(SurveyTable::Homes.entries_table(), "HomeQuestionnaireEntries");
        assert_eq!(SurveyTable::Teachers.entity_id(), "teacher_id");
        assert_eq!(SurveyTable::Curricula.entity_id(), "curriculum_id");
        assert_eq!(
            SurveyTable::Curricula.answers_table(),
            "CurriculumQuestionnaireAnswers"
        );
    }

    #[test]
    fn query_result_joins_columns_and_rows() {
        let rows = vec![
            vec![Some("Germany".to_string()), Some("82".to_string())],
            vec![Some("Austria".to_string()), None],
        ];

        let text = format_query_result("SELECT name, pct FROM t", &rows);

        assert_eq!(
            text,
            "Query: SELECT name, pct FROM t\nResult: Germany, 82\nAustria, null"
        );
    }

    #[test]
    fn long_results_are_truncated() {
        let rows: Vec<Vec<Option<String>>> =
            (0..1_000).map(|i| vec![Some(format!("row {i}"))]).collect();

        let text = format_query_result("SELECT *", &rows);

        assert!(text.ends_with(TRUNCATION_NOTICE));
        let body = text
            .strip_prefix("Query: SELECT *\nResult: ")
            .unwrap()
            .strip_suffix(TRUNCATION_NOTICE)
            .unwrap();
        assert_eq!(body.chars().count(), MAX_RESULT_CHARS);
    }

    #[test]
    fn quotes_are_stripped_from_codes() {
        assert_eq!(strip_quotes(r#"AS'R"01"#), "ASR01");
    }

    #[test]
    fn table_deserializes_from_plural_name() {
        let table: SurveyTable = serde_json::from_value(json!("Schools")).unwrap();
        assert_eq!(table, SurveyTable::Schools);
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL with the PIRLS schema
    async fn query_database_reports_errors_as_text() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let db = SurveyDb::connect_lazy(&url, 2).unwrap();

        let text = db.query_database("SELECT * FROM no_such_table").await;

        assert!(text.starts_with("Wrong query, encountered exception"));
    }

    #[tokio::test]
    #[ignore] // Requires PostgreSQL
    async fn query_database_keeps_every_column() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let db = SurveyDb::connect_lazy(&url, 2).unwrap();

        assert_eq!(
            db.query_database("SELECT 1, 2").await,
            "Query: SELECT 1, 2\nResult: 1, 2"
        );

        let same_names = "SELECT 'Germany' AS name, 'DE' AS name";
        assert_eq!(
            db.query_database(same_names).await,
            format!("Query: {same_names}\nResult: Germany, DE")
        );

        let mixed = "SELECT true, 2.50::numeric, NULL::int, DATE '2021-05-01' -- trailing note";
        assert_eq!(
            db.query_database(mixed).await,
            format!("Query: {mixed}\nResult: true, 2.50, null, 2021-05-01")
        );

        let show = db.query_database("SHOW transaction_read_only").await;
        assert_eq!(show, "Query: SHOW transaction_read_only\nResult: on");
    }
}
