//! Core domain model for salewatch: listing records, column sets and tab naming.

use chrono::NaiveDate;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "salewatch-core";

/// Canonical label of the id column; always the first column of a header row.
pub const ID_COLUMN: &str = "Property ID";
/// Column carrying the group (county) name on the aggregate tab.
pub const GROUP_COLUMN: &str = "County";
pub const ALL_DATA_TAB: &str = "All Data";
/// Backend tab title limit applied to county display names.
pub const TAB_TITLE_MAX_CHARS: usize = 30;
pub const SNAPSHOT_LABEL_PREFIX: &str = "Snapshot for";
pub const NO_NEW_DATA_SUFFIX: &str = "(no new data)";

/// Field names produced by the listing extractors.
pub mod fields {
    pub const ADDRESS: &str = "Address";
    pub const DEFENDANT: &str = "Defendant";
    pub const SALES_DATE: &str = "Sales Date";
    pub const APPROX_JUDGMENT: &str = "Approx Judgment";
    /// Only some jurisdictions expose this one.
    pub const SALE_TYPE: &str = "Sale Type";
}

/// One configured source partition (a county) with its own storage tab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupSource {
    pub id: String,
    pub display_name: String,
}

impl GroupSource {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }

    pub fn tab_title(&self) -> String {
        tab_title(&self.display_name, TAB_TITLE_MAX_CHARS)
    }
}

/// Deterministic fixed-prefix truncation so repeated runs address the same tab.
pub fn tab_title(name: &str, max_chars: usize) -> String {
    name.chars().take(max_chars).collect()
}

/// Collapse internal whitespace runs to one space and trim.
pub fn normalize_text(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Whether a cell names the id column: case-insensitive, internal whitespace ignored.
pub fn is_id_column_label(cell: &str) -> bool {
    let squashed: String = cell
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect();
    let canonical: String = ID_COLUMN
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect();
    squashed == canonical
}

pub fn snapshot_label(date: NaiveDate) -> String {
    format!("{SNAPSHOT_LABEL_PREFIX} {}", date.format("%A - %Y-%m-%d"))
}

pub fn snapshot_label_today() -> String {
    snapshot_label(chrono::Local::now().date_naive())
}

/// A single extracted listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub fields: IndexMap<String, String>,
    pub group: String,
}

impl Record {
    pub fn new(id: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: IndexMap::new(),
            group: group.into(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_field(name, value);
        self
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Missing fields read as the empty string.
    pub fn field(&self, name: &str) -> &str {
        self.fields.get(name).map(String::as_str).unwrap_or("")
    }

    pub fn has_id(&self) -> bool {
        !self.id.trim().is_empty()
    }

    pub fn cell(&self, column: &str) -> &str {
        if column == ID_COLUMN {
            return &self.id;
        }
        match self.fields.get(column) {
            Some(value) => value.as_str(),
            None if column == GROUP_COLUMN => self.group.as_str(),
            None => "",
        }
    }

    pub fn to_row(&self, header: &FieldSet) -> Vec<String> {
        header
            .columns()
            .iter()
            .map(|column| self.cell(column).to_string())
            .collect()
    }
}

/// Ordered, duplicate-free list of column names; the id column leads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSet {
    columns: Vec<String>,
}

impl FieldSet {
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = Self::default();
        for column in columns {
            set.push(column.into());
        }
        set
    }

    /// Header for a batch: the id column, then every field name in first-seen order.
    pub fn for_records(records: &[Record]) -> Self {
        let mut set = Self::new([ID_COLUMN]);
        for record in records {
            for name in record.fields.keys() {
                set.push(name.clone());
            }
        }
        set
    }

    fn push(&mut self, column: String) {
        let column = column.trim().to_string();
        if !self.columns.contains(&column) {
            self.columns.push(column);
        }
    }

    /// Moves (or adds) the group column to the end.
    pub fn with_group_column(mut self) -> Self {
        self.columns.retain(|c| c != GROUP_COLUMN);
        self.columns.push(GROUP_COLUMN.to_string());
        self
    }

    pub fn union(&self, other: &FieldSet) -> Self {
        let mut merged = self.clone();
        for column in &other.columns {
            merged.push(column.clone());
        }
        merged
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn contains(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    /// Order-insensitive equality.
    pub fn same_fields(&self, other: &FieldSet) -> bool {
        self.len() == other.len() && self.columns.iter().all(|c| other.contains(c))
    }

    pub fn to_row(&self) -> Vec<String> {
        self.columns.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tab_titles_truncate_to_a_stable_prefix() {
        let county = GroupSource::new("52", "Cape May County, NJ - Sheriff's Office Sales");
        assert_eq!(county.tab_title(), "Cape May County, NJ - Sheriff'");
        assert_eq!(county.tab_title(), county.tab_title());
        assert_eq!(tab_title("Camden County, NJ", 30), "Camden County, NJ");
        assert_eq!(tab_title("Ñandú County", 4), "Ñand");
    }

    #[test]
    fn id_label_matching_ignores_case_and_whitespace() {
        assert!(is_id_column_label("Property ID"));
        assert!(is_id_column_label("propertyid"));
        assert!(is_id_column_label("  PROPERTY   id "));
        assert!(!is_id_column_label("Property"));
        assert!(!is_id_column_label("Snapshot for Monday - 2026-10-19"));
    }

    #[test]
    fn snapshot_label_uses_weekday_and_iso_date() {
        let date = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        assert_eq!(snapshot_label(date), "Snapshot for Monday - 2026-10-19");
    }

    #[test]
    fn field_sets_compare_as_sets_and_union_in_first_seen_order() {
        let base = FieldSet::new([ID_COLUMN, "Address", "Defendant"]);
        let reordered = FieldSet::new([ID_COLUMN, "Defendant", "Address"]);
        let extended = FieldSet::new([ID_COLUMN, "Address", "Sale Type"]);

        assert!(base.same_fields(&reordered));
        assert!(!base.same_fields(&extended));

        let merged = base.union(&extended).with_group_column();
        assert_eq!(
            merged.columns(),
            &[ID_COLUMN, "Address", "Defendant", "Sale Type", GROUP_COLUMN]
        );
    }

    #[test]
    fn batch_header_collects_optional_fields() {
        let records = vec![
            Record::new("1", "Camden County, NJ").with_field("Address", "1 Main St"),
            Record::new("2", "Camden County, NJ")
                .with_field("Address", "2 Main St")
                .with_field("Sale Type", "Mortgage Foreclosure"),
        ];
        let header = FieldSet::for_records(&records);
        assert_eq!(header.columns(), &[ID_COLUMN, "Address", "Sale Type"]);
        assert_eq!(records[0].to_row(&header), vec!["1", "1 Main St", ""]);
    }

    #[test]
    fn group_column_falls_back_to_record_group() {
        let record = Record::new("7", "Salem County, NJ").with_field("Address", "x");
        let header = FieldSet::new([ID_COLUMN, "Address"]).with_group_column();
        assert_eq!(record.to_row(&header), vec!["7", "x", "Salem County, NJ"]);
    }

    #[test]
    fn normalize_text_collapses_whitespace() {
        assert_eq!(normalize_text("  12 Oak\n\t Ave  "), "12 Oak Ave");
        assert_eq!(normalize_text(""), "");
    }

    #[test]
    fn records_round_trip_through_json_with_field_order() {
        let record = Record::new("9", "Union County, NJ")
            .with_field("Sales Date", "1/2/2026")
            .with_field("Address", "9 Elm");
        let text = serde_json::to_string(&record).unwrap();
        let back: Record = serde_json::from_str(&text).unwrap();
        assert_eq!(back, record);
        assert_eq!(back.fields.keys().next().map(String::as_str), Some("Sales Date"));
    }
}
