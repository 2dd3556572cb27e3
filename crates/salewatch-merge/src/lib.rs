//! Incremental reconciliation of freshly extracted listings against stored snapshot tabs.
//!
//! A tab is a stack of snapshot blocks, newest first. Each block is a label row,
//! a header row, data rows and one blank separator row. The engine never talks
//! to storage: it reads the raw grid of a tab and returns a [`WritePlan`].

use std::collections::HashSet;

use salewatch_core::{
    is_id_column_label, FieldSet, Record, GROUP_COLUMN, ID_COLUMN, NO_NEW_DATA_SUFFIX,
    SNAPSHOT_LABEL_PREFIX,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub const CRATE_NAME: &str = "salewatch-merge";

// ---------------------------------------------------------------------------
// Stored tab parsing
// ---------------------------------------------------------------------------

fn is_blank(row: &[String]) -> bool {
    row.iter().all(|cell| cell.trim().is_empty())
}

fn is_header(row: &[String]) -> bool {
    row.first().is_some_and(|cell| is_id_column_label(cell))
}

fn looks_like_label(row: &[String]) -> bool {
    let mut filled = row.iter().filter(|cell| !cell.trim().is_empty());
    match (filled.next(), filled.next()) {
        (Some(only), None) => only.trim_start().starts_with(SNAPSHOT_LABEL_PREFIX),
        _ => false,
    }
}

fn is_single_cell(row: &[String]) -> bool {
    row.iter().filter(|cell| !cell.trim().is_empty()).count() == 1
}

fn first_text(row: &[String]) -> Option<String> {
    row.iter()
        .map(|cell| cell.trim())
        .find(|cell| !cell.is_empty())
        .map(str::to_string)
}

/// Header cells as a comparable column set; id-label spellings collapse to [`ID_COLUMN`].
fn header_field_set(header: &[String]) -> FieldSet {
    FieldSet::new(
        header
            .iter()
            .map(|cell| cell.trim())
            .filter(|cell| !cell.is_empty())
            .map(|cell| if is_id_column_label(cell) { ID_COLUMN } else { cell }),
    )
}

/// One stored snapshot block, as found in a tab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlock {
    pub label: Option<String>,
    pub header: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl StoredBlock {
    /// Column index of `column` under this block's own header. The id column
    /// falls back to the first column when the header does not name it.
    pub fn column_index(&self, column: &str) -> Option<usize> {
        if column == ID_COLUMN {
            return Some(
                self.header
                    .iter()
                    .position(|cell| is_id_column_label(cell))
                    .unwrap_or(0),
            );
        }
        self.header.iter().position(|cell| cell.trim() == column)
    }

    pub fn cell<'a>(&self, row: &'a [String], column: &str) -> Option<&'a str> {
        self.column_index(column)
            .and_then(|idx| row.get(idx))
            .map(|cell| cell.trim())
    }

    /// Re-emit a stored row under another header; absent columns become `""`.
    pub fn reposition(&self, row: &[String], header: &FieldSet) -> Vec<String> {
        header
            .columns()
            .iter()
            .map(|column| self.cell(row, column).unwrap_or("").to_string())
            .collect()
    }
}

/// A tab's raw grid split into snapshot blocks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredTab {
    pub blocks: Vec<StoredBlock>,
    /// False when no id-labelled header row was found and the positional
    /// fallback (second row) was used instead.
    pub header_located: bool,
}

impl StoredTab {
    pub fn parse(raw: &[Vec<String>]) -> Self {
        let Some(first_header) = raw.iter().position(|row| is_header(row)) else {
            return Self::parse_fallback(raw);
        };

        let mut blocks: Vec<StoredBlock> = Vec::new();
        let mut pending_label = raw[..first_header]
            .iter()
            .rev()
            .find(|row| !is_blank(row))
            .and_then(|row| first_text(row));

        for (idx, row) in raw.iter().enumerate().skip(first_header) {
            if is_header(row) {
                blocks.push(StoredBlock {
                    label: pending_label.take(),
                    header: row.clone(),
                    rows: Vec::new(),
                });
                continue;
            }
            if is_blank(row) {
                continue;
            }
            // Only a lone cell above a header is a label; a wider row is data.
            let precedes_header = raw.get(idx + 1).is_some_and(|next| is_header(next));
            if (precedes_header && is_single_cell(row)) || looks_like_label(row) {
                pending_label = first_text(row);
                continue;
            }
            if let Some(block) = blocks.last_mut() {
                block.rows.push(row.clone());
            }
        }

        Self {
            blocks,
            header_located: true,
        }
    }

    fn parse_fallback(raw: &[Vec<String>]) -> Self {
        if raw.len() < 2 {
            return Self::default();
        }
        let rows = raw[2..]
            .iter()
            .filter(|row| !is_blank(row) && !looks_like_label(row))
            .cloned()
            .collect();
        Self {
            blocks: vec![StoredBlock {
                label: first_text(&raw[0]),
                header: raw[1].clone(),
                rows,
            }],
            header_located: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Header of the most recent block.
    pub fn newest_header(&self) -> Option<FieldSet> {
        self.blocks
            .first()
            .map(|block| header_field_set(&block.header))
            .filter(|set| !set.is_empty())
    }

    pub fn data_row_count(&self) -> usize {
        self.blocks.iter().map(|block| block.rows.len()).sum()
    }

    /// Every data row paired with the block it belongs to, newest first.
    pub fn rows(&self) -> impl Iterator<Item = (&StoredBlock, &[String])> {
        self.blocks
            .iter()
            .flat_map(|block| block.rows.iter().map(move |row| (block, row.as_slice())))
    }
}

// ---------------------------------------------------------------------------
// Schema reconciliation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reconciliation {
    /// Same column set: a new block can be prepended as-is.
    Match,
    /// Column sets differ (or nothing is stored): the tab is flattened under the new header.
    Migrate,
}

pub fn reconcile(existing: Option<&FieldSet>, incoming: &FieldSet) -> Reconciliation {
    match existing {
        Some(existing) if !existing.is_empty() && existing.same_fields(incoming) => {
            Reconciliation::Match
        }
        _ => Reconciliation::Migrate,
    }
}

// ---------------------------------------------------------------------------
// Merge engine
// ---------------------------------------------------------------------------

/// What to do with records that carry no extractable id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MissingIdPolicy {
    /// Never matched by dedup, so written on every run.
    #[default]
    AlwaysNew,
    Drop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeConfig {
    /// Label of the block this run writes.
    pub label: String,
    /// Write an empty labelled block when a run finds nothing new.
    pub emit_empty_marker: bool,
    pub missing_id_policy: MissingIdPolicy,
    /// Widen the incoming header with the stored columns so a field missing
    /// from this run's batch does not erase it from history.
    pub retain_stored_columns: bool,
}

impl MergeConfig {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            emit_empty_marker: false,
            missing_id_policy: MissingIdPolicy::AlwaysNew,
            retain_stored_columns: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotBlock {
    pub label: String,
    pub header: FieldSet,
    pub rows: Vec<Vec<String>>,
}

impl SnapshotBlock {
    /// Label row, header row, data rows, blank separator.
    pub fn to_rows(&self) -> Vec<Vec<String>> {
        let mut out = Vec::with_capacity(self.rows.len() + 3);
        out.push(vec![self.label.clone()]);
        out.push(self.header.to_row());
        out.extend(self.rows.iter().cloned());
        out.push(vec![String::new()]);
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanKind {
    FullOverwrite,
    Prepend,
    MigrateAndWrite,
    NoOp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePlan {
    /// Replace the whole tab with one block.
    FullOverwrite { block: SnapshotBlock },
    /// Put a block above the untouched existing content.
    Prepend { block: SnapshotBlock },
    /// Replace the tab with one flattened block: carried history, then new rows.
    MigrateAndWrite {
        block: SnapshotBlock,
        carried_rows: usize,
        new_records: usize,
    },
    /// Nothing new; optionally prepend an empty marker block.
    NoOp { marker: Option<SnapshotBlock> },
}

impl WritePlan {
    pub fn kind(&self) -> PlanKind {
        match self {
            WritePlan::FullOverwrite { .. } => PlanKind::FullOverwrite,
            WritePlan::Prepend { .. } => PlanKind::Prepend,
            WritePlan::MigrateAndWrite { .. } => PlanKind::MigrateAndWrite,
            WritePlan::NoOp { .. } => PlanKind::NoOp,
        }
    }

    pub fn new_records(&self) -> usize {
        match self {
            WritePlan::FullOverwrite { block } | WritePlan::Prepend { block } => block.rows.len(),
            WritePlan::MigrateAndWrite { new_records, .. } => *new_records,
            WritePlan::NoOp { .. } => 0,
        }
    }

    pub fn header(&self) -> Option<&FieldSet> {
        match self {
            WritePlan::FullOverwrite { block }
            | WritePlan::Prepend { block }
            | WritePlan::MigrateAndWrite { block, .. } => Some(&block.header),
            WritePlan::NoOp { marker } => marker.as_ref().map(|block| &block.header),
        }
    }

    /// Full tab content after applying the plan, or `None` when nothing is written.
    pub fn render(&self, existing: &[Vec<String>]) -> Option<Vec<Vec<String>>> {
        match self {
            WritePlan::FullOverwrite { block } | WritePlan::MigrateAndWrite { block, .. } => {
                Some(block.to_rows())
            }
            WritePlan::Prepend { block } => {
                let mut rows = block.to_rows();
                rows.extend(existing.iter().cloned());
                Some(rows)
            }
            WritePlan::NoOp { marker: Some(block) } => {
                let mut rows = block.to_rows();
                rows.extend(existing.iter().cloned());
                Some(rows)
            }
            WritePlan::NoOp { marker: None } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MergeTarget {
    /// One county's tab: keyed by id.
    Group,
    /// "All Data": keyed by (group, id).
    Aggregate,
}

type DedupKey = (String, String);

#[derive(Debug, Clone)]
pub struct MergeEngine {
    config: MergeConfig,
}

impl MergeEngine {
    pub fn new(config: MergeConfig) -> Self {
        Self { config }
    }

    /// Plan the write of one county's batch into its tab.
    pub fn merge(
        &self,
        group: &str,
        first_run: bool,
        incoming: &[Record],
        existing: &[Vec<String>],
    ) -> WritePlan {
        self.plan(MergeTarget::Group, group, first_run, incoming, existing)
    }

    /// Plan the write of every county's batch into the aggregate tab.
    pub fn merge_aggregate(
        &self,
        tab: &str,
        first_run: bool,
        incoming: &[Record],
        existing: &[Vec<String>],
    ) -> WritePlan {
        self.plan(MergeTarget::Aggregate, tab, first_run, incoming, existing)
    }

    fn plan(
        &self,
        target: MergeTarget,
        tab: &str,
        first_run: bool,
        incoming: &[Record],
        existing: &[Vec<String>],
    ) -> WritePlan {
        let batch_header = match target {
            MergeTarget::Group => FieldSet::for_records(incoming),
            MergeTarget::Aggregate => FieldSet::for_records(incoming).with_group_column(),
        };

        if first_run {
            let rows = self.new_rows(target, incoming, &HashSet::new(), &batch_header);
            info!(tab, rows = rows.len(), "first run: full overwrite");
            return WritePlan::FullOverwrite {
                block: self.block(batch_header, rows),
            };
        }

        let stored = StoredTab::parse(existing);
        let stored_header = stored.newest_header();
        let widen = self.config.retain_stored_columns && stored.header_located;
        let header = match (&stored_header, widen) {
            (Some(stored_header), true) => {
                let widened = stored_header.union(&batch_header);
                match target {
                    MergeTarget::Group => widened,
                    MergeTarget::Aggregate => widened.with_group_column(),
                }
            }
            _ => batch_header,
        };

        let known = stored_keys(target, &stored);
        let rows = self.new_rows(target, incoming, &known, &header);
        debug!(tab, known = known.len(), new = rows.len(), "deduplicated batch");

        match reconcile(stored_header.as_ref(), &header) {
            Reconciliation::Match if rows.is_empty() => {
                info!(tab, "no new records");
                let marker = self.config.emit_empty_marker.then(|| SnapshotBlock {
                    label: format!("{} {NO_NEW_DATA_SUFFIX}", self.config.label),
                    header,
                    rows: Vec::new(),
                });
                WritePlan::NoOp { marker }
            }
            Reconciliation::Match => {
                info!(tab, rows = rows.len(), "prepending snapshot");
                WritePlan::Prepend {
                    block: self.block(header, rows),
                }
            }
            Reconciliation::Migrate => {
                let mut carried: Vec<Vec<String>> = stored
                    .rows()
                    .map(|(block, row)| block.reposition(row, &header))
                    .collect();
                let carried_rows = carried.len();
                let new_records = rows.len();
                info!(tab, carried_rows, new_records, "schema changed: migrating tab");
                carried.extend(rows);
                WritePlan::MigrateAndWrite {
                    block: self.block(header, carried),
                    carried_rows,
                    new_records,
                }
            }
        }
    }

    fn block(&self, header: FieldSet, rows: Vec<Vec<String>>) -> SnapshotBlock {
        SnapshotBlock {
            label: self.config.label.clone(),
            header,
            rows,
        }
    }

    /// Incoming records not in `known`, in extraction order, as rows under `header`.
    fn new_rows(
        &self,
        target: MergeTarget,
        incoming: &[Record],
        known: &HashSet<DedupKey>,
        header: &FieldSet,
    ) -> Vec<Vec<String>> {
        let mut seen: HashSet<DedupKey> = HashSet::new();
        let mut rows = Vec::new();
        for record in incoming {
            match incoming_key(target, record) {
                Some(key) => {
                    if known.contains(&key) || !seen.insert(key) {
                        continue;
                    }
                }
                None => match self.config.missing_id_policy {
                    MissingIdPolicy::AlwaysNew => {}
                    MissingIdPolicy::Drop => {
                        debug!(group = %record.group, "dropping record without id");
                        continue;
                    }
                },
            }
            rows.push(record.to_row(header));
        }
        rows
    }
}

fn incoming_key(target: MergeTarget, record: &Record) -> Option<DedupKey> {
    if !record.has_id() {
        return None;
    }
    let id = record.id.trim();
    match target {
        MergeTarget::Group => Some((String::new(), id.to_string())),
        MergeTarget::Aggregate => {
            let group = record.cell(GROUP_COLUMN).trim();
            (!group.is_empty()).then(|| (group.to_string(), id.to_string()))
        }
    }
}

fn stored_keys(target: MergeTarget, stored: &StoredTab) -> HashSet<DedupKey> {
    stored
        .rows()
        .filter_map(|(block, row)| {
            let id = block.cell(row, ID_COLUMN).filter(|id| !id.is_empty())?;
            match target {
                MergeTarget::Group => Some((String::new(), id.to_string())),
                MergeTarget::Aggregate => {
                    let group = block.cell(row, GROUP_COLUMN).filter(|g| !g.is_empty())?;
                    Some((group.to_string(), id.to_string()))
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use salewatch_core::ALL_DATA_TAB;

    const LABEL: &str = "Snapshot for Monday - 2026-10-19";
    const CAMDEN: &str = "Camden County, NJ";
    const CAPE_MAY: &str = "Cape May County, NJ";

    fn row(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|c| c.to_string()).collect()
    }

    fn listing(id: &str, group: &str) -> Record {
        Record::new(id, group)
            .with_field("Address", format!("{id} Main St"))
            .with_field("Defendant", format!("Owner {id}"))
    }

    fn engine() -> MergeEngine {
        MergeEngine::new(MergeConfig::new(LABEL))
    }

    fn apply(plan: &WritePlan, existing: &[Vec<String>]) -> Vec<Vec<String>> {
        plan.render(existing).unwrap_or_else(|| existing.to_vec())
    }

    fn ids_in(tab: &[Vec<String>]) -> Vec<String> {
        StoredTab::parse(tab)
            .rows()
            .filter_map(|(block, row)| block.cell(row, ID_COLUMN).map(str::to_string))
            .collect()
    }

    fn stored_tab(ids: &[&str]) -> Vec<Vec<String>> {
        let mut rows = vec![
            row(&["Snapshot for Friday - 2026-10-16"]),
            row(&["Property ID", "Address", "Defendant"]),
        ];
        for id in ids {
            rows.push(row(&[id, &format!("{id} Main St"), &format!("Owner {id}")]));
        }
        rows.push(row(&[""]));
        rows
    }

    #[test]
    fn parse_splits_blocks_and_skips_labels_and_separators() {
        let raw = vec![
            row(&["Snapshot for Monday - 2026-10-19"]),
            row(&["Property ID", "Address"]),
            row(&["3", "c"]),
            row(&[""]),
            row(&["Snapshot for Friday - 2026-10-16"]),
            row(&["property  id", "Address"]),
            row(&["1", "a"]),
            row(&["2", "b"]),
            vec![],
        ];
        let tab = StoredTab::parse(&raw);
        assert!(tab.header_located);
        assert_eq!(tab.blocks.len(), 2);
        assert_eq!(tab.blocks[0].label.as_deref(), Some("Snapshot for Monday - 2026-10-19"));
        assert_eq!(tab.blocks[1].rows, vec![row(&["1", "a"]), row(&["2", "b"])]);
        assert_eq!(tab.data_row_count(), 3);
        assert_eq!(
            tab.newest_header().unwrap().columns(),
            &[ID_COLUMN.to_string(), "Address".to_string()]
        );
    }

    #[test]
    fn rows_directly_above_a_header_stay_data_unless_single_cell() {
        let raw = vec![
            row(&["Property ID", "Address", "Defendant"]),
            row(&["5", "5 Main St", "Owner 5"]),
            row(&["Property ID", "Address"]),
            row(&["1", "1 Main St"]),
            row(&["2", "2 Main St"]),
            row(&["Imported 2026-09-01"]),
            row(&["Property ID", "Address"]),
            row(&["0", "0 Main St"]),
        ];
        let tab = StoredTab::parse(&raw);
        assert_eq!(tab.blocks.len(), 3);
        assert_eq!(tab.blocks[1].rows.len(), 2);
        assert_eq!(tab.blocks[2].label.as_deref(), Some("Imported 2026-09-01"));
        assert_eq!(ids_in(&raw), vec!["5", "1", "2", "0"]);

        let incoming = vec![listing("9", CAMDEN).with_field("Sale Type", "Tax Sale")];
        let plan = engine().merge(CAMDEN, false, &incoming, &raw);
        assert_eq!(plan.kind(), PlanKind::MigrateAndWrite);
        let written = apply(&plan, &raw);
        assert_eq!(ids_in(&written), vec!["5", "1", "2", "0", "9"]);
    }

    #[test]
    fn parse_falls_back_to_second_row_header() {
        let raw = vec![row(&["Old export"]), row(&["PID", "Address"]), row(&["7", "x"])];
        let tab = StoredTab::parse(&raw);
        assert!(!tab.header_located);
        assert_eq!(tab.blocks.len(), 1);
        assert_eq!(tab.blocks[0].header, row(&["PID", "Address"]));
        assert_eq!(ids_in(&raw), vec!["7"]);

        assert!(StoredTab::parse(&[row(&["lonely"])]).is_empty());
        assert!(StoredTab::parse(&[]).is_empty());
    }

    #[test]
    fn reconcile_is_order_insensitive() {
        let ab = FieldSet::new([ID_COLUMN, "A", "B"]);
        let ba = FieldSet::new([ID_COLUMN, "B", "A"]);
        let abc = FieldSet::new([ID_COLUMN, "A", "B", "C"]);
        assert_eq!(reconcile(Some(&ab), &ba), Reconciliation::Match);
        assert_eq!(reconcile(Some(&ab), &abc), Reconciliation::Migrate);
        assert_eq!(reconcile(Some(&abc), &ab), Reconciliation::Migrate);
        assert_eq!(reconcile(None, &ab), Reconciliation::Migrate);
    }

    #[test]
    fn first_run_overwrites_with_every_record() {
        let incoming: Vec<_> = (1..=5).map(|i| listing(&i.to_string(), CAMDEN)).collect();
        let junk = vec![row(&["leftover"]), row(&["Property ID", "Zzz"]), row(&["99", "old"])];

        let plan = engine().merge(CAMDEN, true, &incoming, &junk);
        assert_eq!(plan.kind(), PlanKind::FullOverwrite);
        let tab = apply(&plan, &junk);
        let parsed = StoredTab::parse(&tab);
        assert_eq!(parsed.blocks.len(), 1);
        assert_eq!(parsed.blocks[0].rows.len(), 5);
        assert_eq!(tab[0], row(&[LABEL]));
        assert_eq!(tab.last().unwrap(), &row(&[""]));
    }

    #[test]
    fn only_unseen_ids_are_prepended() {
        let existing = stored_tab(&["101", "102"]);
        let incoming = vec![listing("101", CAMDEN), listing("103", CAMDEN)];

        let plan = engine().merge(CAMDEN, false, &incoming, &existing);
        let WritePlan::Prepend { block } = &plan else {
            panic!("expected prepend, got {plan:?}");
        };
        assert_eq!(block.rows, vec![row(&["103", "103 Main St", "Owner 103"])]);

        let tab = apply(&plan, &existing);
        assert_eq!(&tab[tab.len() - existing.len()..], existing.as_slice());
        assert_eq!(ids_in(&tab), vec!["103", "101", "102"]);
    }

    #[test]
    fn rerunning_the_same_batch_is_a_no_op() {
        let incoming = vec![listing("1", CAMDEN), listing("2", CAMDEN)];
        for (first_run, start) in [(true, vec![]), (false, stored_tab(&["0"])), (false, vec![])] {
            let once = apply(&engine().merge(CAMDEN, first_run, &incoming, &start), &start);
            let again = engine().merge(CAMDEN, false, &incoming, &once);
            assert_eq!(again, WritePlan::NoOp { marker: None });
        }
    }

    #[test]
    fn empty_marker_block_is_emitted_when_configured() {
        let mut config = MergeConfig::new(LABEL);
        config.emit_empty_marker = true;
        let engine = MergeEngine::new(config);
        let existing = stored_tab(&["1"]);

        let plan = engine.merge(CAMDEN, false, &[listing("1", CAMDEN)], &existing);
        assert_eq!(plan.kind(), PlanKind::NoOp);
        assert_eq!(plan.new_records(), 0);
        let tab = apply(&plan, &existing);
        assert_eq!(tab[0], row(&[&format!("{LABEL} (no new data)")]));
        assert_eq!(tab[2], row(&[""]));
        assert_eq!(&tab[3..], existing.as_slice());

        let again = engine.merge(CAMDEN, false, &[listing("1", CAMDEN)], &tab);
        assert_eq!(again.kind(), PlanKind::NoOp);
    }

    #[test]
    fn new_field_migrates_history_into_one_block() {
        let existing = stored_tab(&["1", "2"]);
        let incoming = vec![listing("3", CAPE_MAY).with_field("Sale Type", "Tax Sale")];

        let plan = engine().merge(CAPE_MAY, false, &incoming, &existing);
        let WritePlan::MigrateAndWrite {
            block,
            carried_rows,
            new_records,
        } = &plan
        else {
            panic!("expected migration, got {plan:?}");
        };
        assert_eq!((*carried_rows, *new_records), (2, 1));
        assert_eq!(
            block.header.columns(),
            &["Property ID", "Address", "Defendant", "Sale Type"]
        );
        assert_eq!(
            block.rows,
            vec![
                row(&["1", "1 Main St", "Owner 1", ""]),
                row(&["2", "2 Main St", "Owner 2", ""]),
                row(&["3", "3 Main St", "Owner 3", "Tax Sale"]),
            ]
        );

        let tab = apply(&plan, &existing);
        assert_eq!(StoredTab::parse(&tab).blocks.len(), 1);
        assert_eq!(
            engine().merge(CAPE_MAY, false, &incoming, &tab),
            WritePlan::NoOp { marker: None }
        );
    }

    #[test]
    fn migration_flattens_blocks_with_differing_headers() {
        let existing = vec![
            row(&["Snapshot for Friday - 2026-10-16"]),
            row(&["Property ID", "Defendant", "Address"]),
            row(&["2", "Owner 2", "2 Main St"]),
            row(&[""]),
            row(&["Snapshot for Thursday - 2026-10-15"]),
            row(&["Property ID", "Address"]),
            row(&["1", "1 Main St"]),
            row(&[""]),
        ];
        let incoming = vec![listing("2", CAMDEN).with_field("Sale Type", "Sheriff")];

        let plan = engine().merge(CAMDEN, false, &incoming, &existing);
        let WritePlan::MigrateAndWrite { block, .. } = plan else {
            panic!("expected migration");
        };
        assert_eq!(
            block.header.columns(),
            &["Property ID", "Defendant", "Address", "Sale Type"]
        );
        assert_eq!(
            block.rows,
            vec![
                row(&["2", "Owner 2", "2 Main St", ""]),
                row(&["1", "", "1 Main St", ""]),
            ]
        );
    }

    #[test]
    fn missing_batch_field_keeps_stored_column_by_default() {
        let existing = vec![
            row(&["Snapshot for Friday - 2026-10-16"]),
            row(&["Property ID", "Address", "Defendant", "Sale Type"]),
            row(&["1", "1 Main St", "Owner 1", "Tax"]),
            row(&[""]),
        ];
        let incoming = vec![listing("2", CAPE_MAY)];

        let plan = engine().merge(CAPE_MAY, false, &incoming, &existing);
        let WritePlan::Prepend { block } = &plan else {
            panic!("expected prepend, got {plan:?}");
        };
        assert_eq!(block.rows, vec![row(&["2", "2 Main St", "Owner 2", ""])]);

        let mut strict = MergeConfig::new(LABEL);
        strict.retain_stored_columns = false;
        let plan = MergeEngine::new(strict).merge(CAPE_MAY, false, &incoming, &existing);
        let WritePlan::MigrateAndWrite { block, .. } = plan else {
            panic!("expected migration");
        };
        assert_eq!(block.header.columns(), &["Property ID", "Address", "Defendant"]);
        assert_eq!(block.rows[0], row(&["1", "1 Main St", "Owner 1"]));
    }

    #[test]
    fn aggregate_dedups_by_group_and_id() {
        let first = vec![listing("1", CAMDEN), listing("1", CAPE_MAY)];
        let plan = engine().merge_aggregate(ALL_DATA_TAB, true, &first, &[]);
        assert_eq!(plan.new_records(), 2);
        let tab = apply(&plan, &[]);
        assert_eq!(tab[1].last().map(String::as_str), Some(GROUP_COLUMN));

        let second = vec![
            listing("1", CAMDEN),
            listing("2", CAMDEN),
            listing("1", "Salem County, NJ"),
        ];
        let plan = engine().merge_aggregate(ALL_DATA_TAB, false, &second, &tab);
        let WritePlan::Prepend { block } = &plan else {
            panic!("expected prepend, got {plan:?}");
        };
        let keys: Vec<_> = block.rows.iter().map(|r| (r[0].clone(), r[3].clone())).collect();
        assert_eq!(
            keys,
            vec![
                ("2".to_string(), CAMDEN.to_string()),
                ("1".to_string(), "Salem County, NJ".to_string()),
            ]
        );
    }

    #[test]
    fn aggregate_reads_group_column_from_each_blocks_header() {
        let existing = vec![
            row(&["Snapshot for Friday - 2026-10-16"]),
            row(&["Property ID", "Address", "Defendant", "Sale Type", "County"]),
            row(&["5", "a", "b", "Tax", CAPE_MAY]),
            row(&[""]),
            row(&["Snapshot for Thursday - 2026-10-15"]),
            row(&["Property ID", "Address", "Defendant", "County"]),
            row(&["6", "a", "b", CAMDEN]),
            row(&[""]),
        ];
        let incoming = vec![
            listing("5", CAPE_MAY).with_field("Sale Type", "Tax"),
            listing("6", CAMDEN),
            listing("6", CAPE_MAY).with_field("Sale Type", "Tax"),
        ];
        let plan = engine().merge_aggregate(ALL_DATA_TAB, false, &incoming, &existing);
        let WritePlan::Prepend { block } = &plan else {
            panic!("expected prepend, got {plan:?}");
        };
        assert_eq!(block.rows, vec![row(&["6", "6 Main St", "Owner 6", "Tax", CAPE_MAY])]);
    }

    #[test]
    fn missing_ids_follow_the_configured_policy() {
        let existing = stored_tab(&["1"]);
        let incoming = vec![listing("", CAMDEN), listing("2", CAMDEN)];

        let plan = engine().merge(CAMDEN, false, &incoming, &existing);
        assert_eq!(plan.new_records(), 2);
        let tab = apply(&plan, &existing);
        let again = engine().merge(CAMDEN, false, &incoming, &tab);
        assert_eq!(again.new_records(), 1, "id-less records are always new");

        let mut config = MergeConfig::new(LABEL);
        config.missing_id_policy = MissingIdPolicy::Drop;
        let plan = MergeEngine::new(config).merge(CAMDEN, false, &incoming, &existing);
        assert_eq!(plan.new_records(), 1);
    }

    #[test]
    fn extraction_order_is_preserved_and_batch_duplicates_collapse() {
        let incoming = vec![
            listing("30", CAMDEN),
            listing("10", CAMDEN),
            listing("30", CAMDEN),
            listing("20", CAMDEN),
        ];
        let plan = engine().merge(CAMDEN, true, &incoming, &[]);
        let tab = apply(&plan, &[]);
        assert_eq!(ids_in(&tab), vec!["30", "10", "20"]);
    }

    #[test]
    fn subsequent_run_on_empty_tab_writes_single_block() {
        let incoming = vec![listing("1", CAMDEN)];
        let plan = engine().merge(CAMDEN, false, &incoming, &[]);
        assert_eq!(plan.kind(), PlanKind::MigrateAndWrite);
        assert_eq!(plan.new_records(), 1);
        assert_eq!(StoredTab::parse(&apply(&plan, &[])).data_row_count(), 1);
    }

    #[test]
    fn plan_kinds_serialize_in_snake_case() {
        assert_eq!(
            serde_json::to_string(&PlanKind::MigrateAndWrite).unwrap(),
            "\"migrate_and_write\""
        );
        assert_eq!(
            serde_json::to_string(&MissingIdPolicy::AlwaysNew).unwrap(),
            "\"always-new\""
        );
    }
}
