//! Lesson Plan and Roster Sources
//!
//! Read-only lookups the agent bootstraps from: the lesson plan taught on a
//! given date and the students enrolled in a class. Both are usually kept
//! in a spreadsheet, so the shared [`SheetRows`] type does the row matching
//! and the sources only differ in where the cells come from.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{info, warn};

const SHEETS_API_BASE: &str = "https://sheets.googleapis.com/v4/spreadsheets";

/// The lesson taught to one class on one day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LessonPlan {
    pub date: NaiveDate,
    pub topic: String,
    pub class_name: String,
    pub teacher: String,
    pub subject: String,
}

/// A student who receives the recap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentContact {
    pub name: String,
    pub phone: String,
}

#[derive(Debug, thiserror::Error)]
pub enum LessonError {
    #[error("Lesson source failed: {0}")]
    Source(String),
    #[error("Malformed row {row}: {reason}")]
    MalformedRow { row: usize, reason: String },
}

/// Looks up the lesson plan for a date.
#[async_trait]
pub trait LessonPlanSource: Send + Sync {
    /// Returns `Ok(None)` when no row matches `date`.
    async fn lesson_for(&self, date: NaiveDate) -> Result<Option<LessonPlan>, LessonError>;
}

/// Looks up the students of a class.
#[async_trait]
pub trait RosterSource: Send + Sync {
    async fn roster_for(&self, class_name: &str) -> Result<Vec<StudentContact>, LessonError>;
}

/// Parses the date formats teachers actually type into lesson sheets.
pub fn parse_sheet_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    ["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y"]
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(raw, fmt).ok())
}

/// Header-addressed rows of a sheet. The first row names the columns.
#[derive(Debug, Clone, Default)]
pub struct SheetRows {
    header: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl SheetRows {
    pub fn from_values(mut values: Vec<Vec<String>>) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let header = values
            .remove(0)
            .into_iter()
            .map(|h| h.trim().to_lowercase())
            .collect();
        Self {
            header,
            rows: values,
        }
    }

    fn column(&self, name: &str) -> Result<usize, LessonError> {
        self.header
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| LessonError::Source(format!("sheet has no '{name}' column")))
    }

    fn cell<'a>(row: &'a [String], idx: usize) -> &'a str {
        row.get(idx).map(|c| c.trim()).unwrap_or("")
    }

    /// Returns the first row whose date cell equals `date`.
    pub fn lesson_for(&self, date: NaiveDate) -> Result<Option<LessonPlan>, LessonError> {
        let date_col = self.column("date")?;
        let topic_col = self.column("topic")?;
        let class_col = self.column("class")?;
        let teacher_col = self.column("teacher")?;
        let subject_col = self.column("subject")?;

        for (i, row) in self.rows.iter().enumerate() {
            // Sheet rows are 1-based and row 1 is the header.
            let row_number = i + 2;
            let raw_date = Self::cell(row, date_col);
            let Some(row_date) = parse_sheet_date(raw_date) else {
                if !raw_date.is_empty() {
                    warn!(row = row_number, value = %raw_date, "Skipping row with unparseable date");
                }
                continue;
            };
            if row_date != date {
                continue;
            }

            let field = |col: usize, name: &str| {
                let value = Self::cell(row, col);
                if value.is_empty() {
                    Err(LessonError::MalformedRow {
                        row: row_number,
                        reason: format!("empty '{name}' cell"),
                    })
                } else {
                    Ok(value.to_string())
                }
            };

            return Ok(Some(LessonPlan {
                date,
                topic: field(topic_col, "topic")?,
                class_name: field(class_col, "class")?,
                teacher: field(teacher_col, "teacher")?,
                subject: field(subject_col, "subject")?,
            }));
        }
        Ok(None)
    }

    /// Returns every student whose class cell matches `class_name`,
    /// ignoring case and surrounding whitespace.
    pub fn roster_for(&self, class_name: &str) -> Result<Vec<StudentContact>, LessonError> {
        let name_col = self.column("name")?;
        let phone_col = self.column("phone")?;
        let class_col = self.column("class")?;
        let wanted = class_name.trim();

        Ok(self
            .rows
            .iter()
            .filter(|row| Self::cell(row, class_col).eq_ignore_ascii_case(wanted))
            .filter(|row| !Self::cell(row, name_col).is_empty())
            .map(|row| StudentContact {
                name: Self::cell(row, name_col).to_string(),
                phone: Self::cell(row, phone_col).to_string(),
            })
            .collect())
    }
}

// --- Google Sheets ---

#[derive(Deserialize, Debug)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<serde_json::Value>>,
}

fn cell_to_string(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Reads lesson and roster tabs of a Google spreadsheet with an API key.
pub struct GoogleSheetsSource {
    client: reqwest::Client,
    spreadsheet_id: String,
    api_key: String,
    lesson_range: String,
    roster_range: String,
}

impl GoogleSheetsSource {
    pub fn new(
        spreadsheet_id: impl Into<String>,
        api_key: impl Into<String>,
        lesson_range: impl Into<String>,
        roster_range: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            spreadsheet_id: spreadsheet_id.into(),
            api_key: api_key.into(),
            lesson_range: lesson_range.into(),
            roster_range: roster_range.into(),
        }
    }

    fn values_url(&self, range: &str) -> Result<reqwest::Url, LessonError> {
        let mut url = reqwest::Url::parse(SHEETS_API_BASE)
            .map_err(|e| LessonError::Source(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| LessonError::Source("invalid Sheets API base URL".into()))?
            .push(&self.spreadsheet_id)
            .push("values")
            .push(range);
        Ok(url)
    }

    async fn fetch(&self, range: &str) -> Result<SheetRows, LessonError> {
        let response = self
            .client
            .get(self.values_url(range)?)
            .query(&[("key", self.api_key.as_str())])
            .send()
            .await
            .map_err(|e| LessonError::Source(e.to_string()))?;

        if !response.status().is_success() {
            return Err(LessonError::Source(format!(
                "Sheets API error ({}) reading {range}",
                response.status()
            )));
        }

        let body: ValueRange = response
            .json()
            .await
            .map_err(|e| LessonError::Source(e.to_string()))?;
        Ok(SheetRows::from_values(
            body.values
                .into_iter()
                .map(|row| row.into_iter().map(cell_to_string).collect())
                .collect(),
        ))
    }
}

#[async_trait]
impl LessonPlanSource for GoogleSheetsSource {
    async fn lesson_for(&self, date: NaiveDate) -> Result<Option<LessonPlan>, LessonError> {
        info!(range = %self.lesson_range, %date, "Reading lesson plan from Google Sheets");
        self.fetch(&self.lesson_range).await?.lesson_for(date)
    }
}

#[async_trait]
impl RosterSource for GoogleSheetsSource {
    async fn roster_for(&self, class_name: &str) -> Result<Vec<StudentContact>, LessonError> {
        self.fetch(&self.roster_range).await?.roster_for(class_name)
    }
}

// --- Local file ---

#[derive(Deserialize, Debug, Default)]
struct LessonFile {
    #[serde(default)]
    lessons: Vec<Vec<String>>,
    #[serde(default)]
    roster: Vec<Vec<String>>,
}

/// Reads the same tabular layout from a local JSON export:
/// `{"lessons": [[header...], [row...]], "roster": [[header...], [row...]]}`.
///
/// The file is re-read on every lookup so edits take effect without a restart.
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    async fn load(&self) -> Result<LessonFile, LessonError> {
        let raw = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            LessonError::Source(format!("failed to read {}: {e}", self.path.display()))
        })?;
        serde_json::from_str(&raw).map_err(|e| {
            LessonError::Source(format!("failed to parse {}: {e}", self.path.display()))
        })
    }
}

#[async_trait]
impl LessonPlanSource for FileSource {
    async fn lesson_for(&self, date: NaiveDate) -> Result<Option<LessonPlan>, LessonError> {
        SheetRows::from_values(self.load().await?.lessons).lesson_for(date)
    }
}

#[async_trait]
impl RosterSource for FileSource {
    async fn roster_for(&self, class_name: &str) -> Result<Vec<StudentContact>, LessonError> {
        SheetRows::from_values(self.load().await?.roster).roster_for(class_name)
    }
}

/// A fixed set of lesson plans held in memory.
#[derive(Debug, Clone, Default)]
pub struct StaticLessonSource {
    lessons: Vec<LessonPlan>,
}

impl StaticLessonSource {
    pub fn new(lessons: Vec<LessonPlan>) -> Self {
        Self { lessons }
    }
}

#[async_trait]
impl LessonPlanSource for StaticLessonSource {
    async fn lesson_for(&self, date: NaiveDate) -> Result<Option<LessonPlan>, LessonError> {
        Ok(self.lessons.iter().find(|l| l.date == date).cloned())
    }
}
