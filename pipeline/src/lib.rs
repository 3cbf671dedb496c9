//! Sales-pipeline stage ledger.
//!
//! Every pipeline stage (raw leads, callbacks, booked meetings, active deals, ...) is a flat
//! CSV file holding the full state of that stage. The modules below keep the core free of any
//! presentation concerns: `core` holds the value types, `codec` and `storage` own the file
//! contract, `ledger` moves records between stages, `editable` defines which fields a person may
//! change, and `report` produces the per-AppSetter counts used for charts.

pub mod core {
    use chrono::{DateTime, NaiveDate, NaiveDateTime};
    use serde::{Deserialize, Serialize};
    use std::{collections::HashMap, collections::HashSet, fmt, str::FromStr};
    use uuid::Uuid;

    /* ------------------------------- Stages ------------------------------- */

    /// A named step of the pipeline, each backed by one table file.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum Stage {
        Raw,
        NotPicked,
        Callback,
        MeetingBooked,
        Qualified,
        Disqualified,
        DealsActive,
        FollowUp,
        ClosedDeal,
        LostDeal,
        Bin,
        /// Reference list of permitted AppSetter names; not a pipeline step.
        #[serde(rename = "appsetter")]
        AppSetter,
    }

    impl Stage {
        pub const ALL: [Stage; 12] = [
            Stage::Raw,
            Stage::NotPicked,
            Stage::Callback,
            Stage::MeetingBooked,
            Stage::Qualified,
            Stage::Disqualified,
            Stage::DealsActive,
            Stage::FollowUp,
            Stage::ClosedDeal,
            Stage::LostDeal,
            Stage::Bin,
            Stage::AppSetter,
        ];

        /// Stable key used on the command line and in config files.
        pub fn key(self) -> &'static str {
            match self {
                Stage::Raw => "raw",
                Stage::NotPicked => "not_picked",
                Stage::Callback => "callback",
                Stage::MeetingBooked => "meeting_booked",
                Stage::Qualified => "qualified",
                Stage::Disqualified => "disqualified",
                Stage::DealsActive => "deals_active",
                Stage::FollowUp => "follow_up",
                Stage::ClosedDeal => "closed_deal",
                Stage::LostDeal => "lost_deal",
                Stage::Bin => "bin",
                Stage::AppSetter => "appsetter",
            }
        }

        pub fn title(self) -> &'static str {
            match self {
                Stage::Raw => "Raw Data",
                Stage::NotPicked => "Not Picked",
                Stage::Callback => "Callback",
                Stage::MeetingBooked => "Meeting Booked",
                Stage::Qualified => "Qualified",
                Stage::Disqualified => "Disqualified",
                Stage::DealsActive => "Active Deals",
                Stage::FollowUp => "Follow-Up Deals",
                Stage::ClosedDeal => "Closed Deals",
                Stage::LostDeal => "Lost Deals",
                Stage::Bin => "Bin",
                Stage::AppSetter => "AppSetter List",
            }
        }

        /// File name used when no override is configured.
        ///
        /// Raw leads keep their historical `raw_data.csv` name so existing data directories load
        /// unchanged.
        pub fn default_file_name(self) -> String {
            match self {
                Stage::Raw => "raw_data.csv".to_string(),
                other => format!("{}.csv", other.key()),
            }
        }

        pub fn is_reference(self) -> bool {
            matches!(self, Stage::AppSetter)
        }

        /// An absent file for these stages almost always means a misconfigured data directory.
        pub fn warns_when_missing(self) -> bool {
            matches!(self, Stage::Raw | Stage::AppSetter)
        }
    }

    impl fmt::Display for Stage {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.key())
        }
    }

    impl FromStr for Stage {
        type Err = DomainError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            let norm = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
            let stage = match norm.as_str() {
                "raw" | "raw_data" => Stage::Raw,
                "not_picked" | "notpicked" => Stage::NotPicked,
                "callback" => Stage::Callback,
                "meeting_booked" | "meeting" => Stage::MeetingBooked,
                "qualified" => Stage::Qualified,
                "disqualified" => Stage::Disqualified,
                "deals_active" | "active" | "deals" => Stage::DealsActive,
                "follow_up" | "followup" => Stage::FollowUp,
                "closed_deal" | "closed" => Stage::ClosedDeal,
                "lost_deal" | "lost" => Stage::LostDeal,
                "bin" => Stage::Bin,
                "appsetter" | "app_setter" | "appsetters" => Stage::AppSetter,
                _ => return Err(DomainError::UnknownStage(s.to_string())),
            };
            Ok(stage)
        }
    }

    /* ------------------------------- Tables ------------------------------- */

    /// One stage's table: a header row plus text cells.
    ///
    /// Absent values are empty strings. A table read from a missing file has no columns.
    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct Table {
        pub columns: Vec<String>,
        pub rows: Vec<Vec<String>>,
    }

    impl Table {
        pub fn new(columns: Vec<String>) -> Self {
            Self {
                columns,
                rows: vec![],
            }
        }

        /// Build a table from literal cells; handy for callers assembling rows by hand.
        pub fn from_rows<C, R, S>(columns: C, rows: R) -> Self
        where
            C: IntoIterator<Item = S>,
            R: IntoIterator<Item = Vec<S>>,
            S: Into<String>,
        {
            let mut table = Self::new(columns.into_iter().map(Into::into).collect());
            for row in rows {
                table.push_row(row.into_iter().map(Into::into).collect());
            }
            table
        }

        pub fn len(&self) -> usize {
            self.rows.len()
        }

        pub fn is_empty(&self) -> bool {
            self.rows.is_empty()
        }

        pub fn column_index(&self, name: &str) -> Option<usize> {
            self.columns.iter().position(|c| c == name)
        }

        pub fn has_column(&self, name: &str) -> bool {
            self.column_index(name).is_some()
        }

        /// Append a row, padding it with empty cells up to the header width.
        pub fn push_row(&mut self, mut row: Vec<String>) {
            if row.len() < self.columns.len() {
                row.resize(self.columns.len(), String::new());
            }
            self.rows.push(row);
        }

        pub fn cell(&self, row: usize, column: &str) -> Option<&str> {
            let col = self.column_index(column)?;
            self.rows
                .get(row)
                .map(|cells| cells.get(col).map(String::as_str).unwrap_or(""))
        }

        pub fn set_cell(
            &mut self,
            row: usize,
            column: &str,
            value: impl Into<String>,
        ) -> Result<(), DomainError> {
            let col = self
                .column_index(column)
                .ok_or_else(|| DomainError::MissingColumn(column.to_string()))?;
            let len = self.rows.len();
            let cells = self
                .rows
                .get_mut(row)
                .ok_or(DomainError::RowOutOfRange { index: row, len })?;
            if cells.len() <= col {
                cells.resize(col + 1, String::new());
            }
            cells[col] = value.into();
            Ok(())
        }

        /// Copy the rows at `positions` (in that order) into a table with the same header.
        ///
        /// Positions must be valid; callers resolve selections first.
        pub fn take_rows(&self, positions: &[usize]) -> Table {
            Table {
                columns: self.columns.clone(),
                rows: positions.iter().map(|&p| self.rows[p].clone()).collect(),
            }
        }

        /// Drop the rows at `positions`, keeping the order of the remainder.
        pub fn remove_rows(&mut self, positions: &[usize]) {
            let doomed: HashSet<usize> = positions.iter().copied().collect();
            let mut idx = 0;
            self.rows.retain(|_| {
                let keep = !doomed.contains(&idx);
                idx += 1;
                keep
            });
        }

        /// Identity of every row, in row order.
        pub fn record_ids(&self) -> Vec<RecordId> {
            let mut seen: HashMap<&[String], usize> = HashMap::new();
            self.rows
                .iter()
                .map(|row| {
                    let occurrence = seen.entry(row.as_slice()).or_insert(0);
                    let id = RecordId::fingerprint(row, *occurrence);
                    *occurrence += 1;
                    id
                })
                .collect()
        }

        pub fn position_of(&self, id: RecordId) -> Option<usize> {
            self.record_ids().into_iter().position(|x| x == id)
        }
    }

    /* ------------------------------ Record IDs ------------------------------ */

    const RECORD_NAMESPACE: Uuid = Uuid::from_u128(0x3f6c_1a52_9d0e_4b7a_8c21_5e90_d4a7_16b3);

    /// Stable identity of a record inside a stage.
    ///
    /// Derived from the row's cells plus its ordinal among identical rows, so it survives
    /// reloads without adding a column to stage files. Editing or moving the row retires the id.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
    #[serde(transparent)]
    pub struct RecordId(pub Uuid);

    impl RecordId {
        pub fn fingerprint(cells: &[String], occurrence: usize) -> Self {
            let mut key = String::new();
            for cell in cells {
                // length-prefixed so ["a,b"] and ["a", "b"] differ
                key.push_str(&cell.len().to_string());
                key.push(':');
                key.push_str(cell);
            }
            key.push('#');
            key.push_str(&occurrence.to_string());
            Self(Uuid::new_v5(&RECORD_NAMESPACE, key.as_bytes()))
        }
    }

    impl fmt::Display for RecordId {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            self.0.fmt(f)
        }
    }

    impl FromStr for RecordId {
        type Err = DomainError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            Uuid::parse_str(s.trim())
                .map(RecordId)
                .map_err(|_| DomainError::InvalidRecordId(s.to_string()))
        }
    }

    /* -------------------------------- Dates -------------------------------- */

    const DATE_FORMATS: [&str; 9] = [
        "%Y-%m-%d",
        "%m/%d/%y",
        "%m/%d/%Y",
        "%Y/%m/%d",
        "%d.%m.%Y",
        "%d %b %Y",
        "%d %B %Y",
        "%b %d, %Y",
        "%B %d, %Y",
    ];

    const DATETIME_FORMATS: [&str; 8] = [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
        "%m/%d/%Y %H:%M",
        "%m/%d/%Y %H:%M:%S",
        "%Y/%m/%d %H:%M:%S",
    ];

    /// Permissive calendar-date parser. Time-of-day is discarded.
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct DateParser {
        extra_formats: Vec<String>,
    }

    impl DateParser {
        pub fn with_formats(extra_formats: Vec<String>) -> Self {
            Self { extra_formats }
        }

        pub fn parse(&self, raw: &str) -> Option<NaiveDate> {
            let s = raw.trim();
            if s.is_empty() {
                return None;
            }
            for fmt in DATE_FORMATS {
                if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
                    return Some(d);
                }
            }
            for fmt in DATETIME_FORMATS {
                if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
                    return Some(dt.date());
                }
            }
            if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
                return Some(dt.date_naive());
            }
            for fmt in &self.extra_formats {
                if let Ok(d) = NaiveDate::parse_from_str(s, fmt) {
                    return Some(d);
                }
                if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
                    return Some(dt.date());
                }
            }
            None
        }

        /// Canonical `YYYY-MM-DD` rendering, or empty when the value is not a date.
        pub fn normalize(&self, raw: &str) -> String {
            self.parse(raw)
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_default()
        }
    }

    /* ---------------------------- Errors (domain) ---------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum DomainError {
        #[error("unknown stage {0:?}")]
        UnknownStage(String),
        #[error("unknown editable field {0:?} (expected Date, priority, comment or AppSetter)")]
        UnknownField(String),
        #[error("column {0:?} is read-only")]
        ReadOnlyColumn(String),
        #[error("column {0:?} is not present in this stage")]
        MissingColumn(String),
        #[error("row {index} is out of range (stage has {len} rows)")]
        RowOutOfRange { index: usize, len: usize },
        #[error("invalid record id {0:?}")]
        InvalidRecordId(String),
        #[error("unknown transition {0:?}")]
        UnknownTransition(String),
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn stage_names_accept_keys_and_aliases() {
            for stage in Stage::ALL {
                assert_eq!(stage.key().parse::<Stage>().unwrap(), stage);
            }
            assert_eq!("Raw Data".parse::<Stage>().unwrap(), Stage::Raw);
            assert_eq!("meeting-booked".parse::<Stage>().unwrap(), Stage::MeetingBooked);
            assert_eq!("closed".parse::<Stage>().unwrap(), Stage::ClosedDeal);
            assert!(matches!(
                "archive".parse::<Stage>(),
                Err(DomainError::UnknownStage(_))
            ));
        }

        #[test]
        fn default_file_names_match_existing_layout() {
            assert_eq!(Stage::Raw.default_file_name(), "raw_data.csv");
            assert_eq!(Stage::ClosedDeal.default_file_name(), "closed_deal.csv");
            assert_eq!(Stage::AppSetter.default_file_name(), "appsetter.csv");
        }

        #[test]
        fn record_ids_are_stable_and_distinguish_duplicates() {
            let table = Table::from_rows(
                ["Name", "AppSetter"],
                [vec!["Ann", "Alice"], vec!["Bo", "Bob"], vec!["Ann", "Alice"]],
            );
            let ids = table.record_ids();
            assert_eq!(ids, table.clone().record_ids());
            assert_ne!(ids[0], ids[2]);
            assert_eq!(table.position_of(ids[2]), Some(2));

            let mut edited = table.clone();
            edited.set_cell(1, "AppSetter", "Carol").unwrap();
            assert_eq!(edited.position_of(ids[1]), None);
            assert_eq!(edited.position_of(ids[0]), Some(0));
        }

        #[test]
        fn record_id_round_trips_through_text() {
            let id = RecordId::fingerprint(&["a".to_string()], 0);
            assert_eq!(id.to_string().parse::<RecordId>().unwrap(), id);
            assert!("not-an-id".parse::<RecordId>().is_err());
        }

        #[test]
        fn remove_rows_keeps_remaining_order() {
            let mut table =
                Table::from_rows(["n"], [vec!["0"], vec!["1"], vec!["2"], vec!["3"]]);
            table.remove_rows(&[2, 0]);
            assert_eq!(table.rows, vec![vec!["1".to_string()], vec!["3".to_string()]]);
        }

        #[test]
        fn short_rows_are_padded_and_cells_are_addressable() {
            let mut table = Table::new(vec!["a".into(), "b".into()]);
            table.push_row(vec!["x".into()]);
            assert_eq!(table.cell(0, "b"), Some(""));
            assert_eq!(table.cell(0, "c"), None);
            assert_eq!(
                table.set_cell(3, "a", "y"),
                Err(DomainError::RowOutOfRange { index: 3, len: 1 })
            );
        }

        #[test]
        fn date_parser_is_permissive() {
            let p = DateParser::default();
            let jan5 = NaiveDate::from_ymd_opt(2024, 1, 5).unwrap();
            assert_eq!(p.parse("2024-01-05"), Some(jan5));
            assert_eq!(p.parse("2024-01-05 13:45:00"), Some(jan5));
            assert_eq!(p.parse("2024-01-05T13:45:00+02:00"), Some(jan5));
            assert_eq!(p.parse("01/05/2024"), Some(jan5));
            assert_eq!(p.parse("01/05/24"), Some(jan5));
            assert_eq!(p.parse("5 Jan 2024"), Some(jan5));
            assert_eq!(p.parse(""), None);
            assert_eq!(p.parse("next tuesday"), None);
            assert_eq!(p.normalize("2024/01/05"), "2024-01-05");
            assert_eq!(p.normalize("garbage"), "");
        }

        #[test]
        fn extra_date_formats_are_tried_last() {
            let p = DateParser::with_formats(vec!["%d-%m-%Y".into()]);
            assert_eq!(
                p.parse("05-01-2024"),
                Some(NaiveDate::from_ymd_opt(2024, 1, 5).unwrap())
            );
            assert_eq!(DateParser::default().parse("05-01-2024"), None);
        }
    }
}

pub mod codec {
    //! CSV codec for stage files, built on `nom`.
    //!
    //! Reading accepts RFC 4180 style input: a header row, comma separators, double-quoted
    //! fields with `""` escapes and embedded newlines, LF or CRLF endings, blank lines skipped.
    //! Writing quotes only when a field needs it and always terminates rows with `\n`.

    use crate::core::Table;
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::{is_not, tag, take_while},
        character::complete::{char, line_ending},
        combinator::{cut, eof, map, value},
        error::VerboseError,
        multi::{fold_many0, many0_count, separated_list1},
        sequence::{preceded, terminated},
    };

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum CodecError {
        #[error("line {line}: {detail}")]
        Malformed { line: usize, detail: String },
        #[error("line {line}: expected at most {expected} fields, found {found}")]
        RaggedRow {
            line: usize,
            expected: usize,
            found: usize,
        },
    }

    /* ------------------------ Public entry points ------------------------ */

    /// Parse a whole stage file. Empty input yields a table without columns.
    pub fn parse_table_from_str(input: &str) -> Result<Table, CodecError> {
        let input = input.strip_prefix('\u{feff}').unwrap_or(input);
        if input.trim().is_empty() {
            return Ok(Table::default());
        }

        let (input, skipped) = leading_blank_lines(input);
        let (mut rest, header) = row(input).map_err(to_codec_error(1 + skipped))?;
        let mut line = 1 + skipped + consumed_newlines(input, rest);
        let mut table = Table::new(header);
        let width = table.columns.len();

        while !rest.is_empty() {
            if let Ok((after, _)) = line_ending::<&str, VerboseError<&str>>(rest) {
                rest = after;
                line += 1;
                continue;
            }
            let (after, cells) = row(rest).map_err(to_codec_error(line))?;
            if cells.len() > width {
                return Err(CodecError::RaggedRow {
                    line,
                    expected: width,
                    found: cells.len(),
                });
            }
            table.push_row(cells);
            line += consumed_newlines(rest, after);
            rest = after;
        }
        Ok(table)
    }

    /// Parse only the header row of a stage file.
    pub fn parse_header(input: &str) -> Result<Vec<String>, CodecError> {
        let input = input.strip_prefix('\u{feff}').unwrap_or(input);
        if input.trim().is_empty() {
            return Ok(vec![]);
        }
        let (input, skipped) = leading_blank_lines(input);
        let (_, header) = row(input).map_err(to_codec_error(1 + skipped))?;
        Ok(header)
    }

    /// Header plus rows. A table without columns encodes as an empty file.
    pub fn format_table(table: &Table) -> String {
        if table.columns.is_empty() {
            return String::new();
        }
        let mut out = String::new();
        push_record(&mut out, &table.columns);
        for cells in &table.rows {
            push_record(&mut out, cells);
        }
        out
    }

    /// Rows only, for appending under an existing header.
    pub fn format_rows(rows: &[Vec<String>]) -> String {
        let mut out = String::new();
        for cells in rows {
            push_record(&mut out, cells);
        }
        out
    }

    /* ------------------------------- Reading ------------------------------- */

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    fn row(i: &str) -> PResult<'_, Vec<String>> {
        terminated(separated_list1(char(','), field), row_end)(i)
    }

    fn row_end(i: &str) -> PResult<'_, ()> {
        alt((value((), line_ending), value((), eof)))(i)
    }

    fn field(i: &str) -> PResult<'_, String> {
        alt((quoted_field, bare_field))(i)
    }

    fn quoted_field(i: &str) -> PResult<'_, String> {
        preceded(
            char('"'),
            cut(terminated(
                fold_many0(
                    alt((value("\"", tag("\"\"")), is_not("\""))),
                    String::new,
                    |mut acc: String, chunk: &str| {
                        acc.push_str(chunk);
                        acc
                    },
                ),
                char('"'),
            )),
        )(i)
    }

    fn bare_field(i: &str) -> PResult<'_, String> {
        map(
            take_while(|c: char| c != ',' && c != '\r' && c != '\n'),
            String::from,
        )(i)
    }

    /// Blank lines ahead of the header, and how many there were.
    fn leading_blank_lines(i: &str) -> (&str, usize) {
        many0_count(line_ending::<&str, VerboseError<&str>>)(i).unwrap_or((i, 0))
    }

    fn consumed_newlines(before: &str, after: &str) -> usize {
        before[..before.len() - after.len()].matches('\n').count()
    }

    fn to_codec_error(line: usize) -> impl Fn(nom::Err<VerboseError<&str>>) -> CodecError {
        move |e| match e {
            nom::Err::Error(ve) | nom::Err::Failure(ve) => CodecError::Malformed {
                line,
                detail: pretty_verbose_error(ve),
            },
            nom::Err::Incomplete(_) => CodecError::Malformed {
                line,
                detail: "incomplete input".to_string(),
            },
        }
    }

    fn pretty_verbose_error(ve: VerboseError<&str>) -> String {
        let mut parts = Vec::new();
        for (frag, kind) in ve.errors {
            let show = frag
                .get(0..frag.find('\n').unwrap_or(frag.len()))
                .unwrap_or(frag);
            parts.push(format!("at {:?} ({:?})", show, kind));
        }
        if parts.is_empty() {
            "malformed row".to_string()
        } else {
            parts.join("; ")
        }
    }

    /* ------------------------------- Writing ------------------------------- */

    fn push_record(out: &mut String, cells: &[String]) {
        // a lone empty cell would otherwise be a blank line, which readers skip
        if cells.len() == 1 && cells[0].is_empty() {
            out.push_str("\"\"\n");
            return;
        }
        for (idx, cell) in cells.iter().enumerate() {
            if idx > 0 {
                out.push(',');
            }
            push_field(out, cell);
        }
        out.push('\n');
    }

    fn push_field(out: &mut String, cell: &str) {
        if cell.contains([',', '"', '\r', '\n']) {
            out.push('"');
            out.push_str(&cell.replace('"', "\"\""));
            out.push('"');
        } else {
            out.push_str(cell);
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn parses_quoted_fields_with_commas_quotes_and_newlines() {
            let input = "Name,comment\n\"Doe, Jane\",\"said \"\"hi\"\"\nthen left\"\nBob,plain\n";
            let table = parse_table_from_str(input).expect("parse");
            assert_eq!(table.columns, vec!["Name", "comment"]);
            assert_eq!(table.rows.len(), 2);
            assert_eq!(table.rows[0][0], "Doe, Jane");
            assert_eq!(table.rows[0][1], "said \"hi\"\nthen left");
            assert_eq!(table.rows[1], vec!["Bob", "plain"]);
        }

        #[test]
        fn accepts_crlf_bom_blank_lines_and_missing_final_newline() {
            let input = "\u{feff}a,b\r\n1,2\r\n\r\n3,4";
            let table = parse_table_from_str(input).expect("parse");
            assert_eq!(table.columns, vec!["a", "b"]);
            assert_eq!(table.rows, vec![vec!["1", "2"], vec!["3", "4"]]);
        }

        #[test]
        fn blank_lines_before_the_header_are_skipped() {
            let input = "\n\r\nName,AppSetter\nAnn,Alice\n";
            let table = parse_table_from_str(input).expect("parse");
            assert_eq!(table.columns, vec!["Name", "AppSetter"]);
            assert_eq!(table.rows, vec![vec!["Ann", "Alice"]]);
            assert_eq!(parse_header(input).expect("header"), vec!["Name", "AppSetter"]);

            let err = parse_table_from_str("\n\na\n1,2\n").unwrap_err();
            assert_eq!(
                err,
                CodecError::RaggedRow {
                    line: 4,
                    expected: 1,
                    found: 2
                }
            );
        }

        #[test]
        fn short_rows_are_padded_and_long_rows_rejected() {
            let table = parse_table_from_str("a,b,c\n1\n").expect("parse");
            assert_eq!(table.rows[0], vec!["1", "", ""]);

            let err = parse_table_from_str("a,b\n1,2\n1,2,3\n").unwrap_err();
            assert_eq!(
                err,
                CodecError::RaggedRow {
                    line: 3,
                    expected: 2,
                    found: 3
                }
            );
        }

        #[test]
        fn unterminated_quote_is_reported_with_line() {
            let err = parse_table_from_str("a\nok\n\"never closed\n").unwrap_err();
            match err {
                CodecError::Malformed { line, .. } => assert_eq!(line, 3),
                other => panic!("expected malformed error, got {other:?}"),
            }
        }

        #[test]
        fn empty_input_is_a_table_without_columns() {
            assert_eq!(parse_table_from_str("").unwrap(), Table::default());
            assert_eq!(parse_table_from_str("\n\n").unwrap(), Table::default());
            assert_eq!(parse_header("").unwrap(), Vec::<String>::new());
        }

        #[test]
        fn writer_quotes_only_when_needed() {
            let table = Table::from_rows(
                ["Name", "comment"],
                [vec!["Doe, Jane", "said \"hi\""], vec!["Bob", ""]],
            );
            assert_eq!(
                format_table(&table),
                "Name,comment\n\"Doe, Jane\",\"said \"\"hi\"\"\"\nBob,\n"
            );
        }

        #[test]
        fn lone_empty_cell_survives_reload() {
            let table = Table::from_rows(["AppSetter"], [vec!["Alice"], vec![""], vec!["Bob"]]);
            let text = format_table(&table);
            assert_eq!(parse_table_from_str(&text).unwrap(), table);
        }

        #[test]
        fn header_can_be_read_alone() {
            assert_eq!(
                parse_header("Date,\"Full Name\"\n2024-01-01,x\n").unwrap(),
                vec!["Date", "Full Name"]
            );
        }
    }
}

pub mod storage {
    //! File-as-table persistence for stages.
    //!
    //! Each stage file is the authoritative state of its stage. Every write goes through a
    //! temporary file in the same directory that is flushed, synced and then renamed over the
    //! target, so a failed write never leaves a truncated stage file behind.

    use crate::codec::{self, CodecError};
    use crate::core::{Stage, Table};
    use std::{
        collections::BTreeMap,
        fs,
        io::{self, Write},
        path::{Path, PathBuf},
    };
    use tempfile::NamedTempFile;
    use tracing::{debug, warn};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum SaveMode {
        /// Replace header and rows.
        Overwrite,
        /// Add rows under the existing header; creates the file (with header) when absent.
        Append,
    }

    /// Raw prior contents of a stage file, used to undo a write.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Snapshot {
        Absent,
        Bytes(Vec<u8>),
    }

    #[derive(Debug, thiserror::Error)]
    pub enum StoreError {
        #[error("{op} {path:?}: {source}")]
        Io {
            op: &'static str,
            path: PathBuf,
            #[source]
            source: io::Error,
        },
        #[error("decoding {path:?}: {source}")]
        Decode {
            path: PathBuf,
            #[source]
            source: CodecError,
        },
        #[error("{path:?} is not valid UTF-8: {source}")]
        Encoding {
            path: PathBuf,
            #[source]
            source: std::str::Utf8Error,
        },
    }

    /// Storage seam for the ledger.
    pub trait StageRepository {
        /// Read a stage; `None` when its file does not exist.
        fn load(&self, stage: Stage) -> Result<Option<Table>, StoreError>;

        /// Persist `table` according to `mode`.
        fn save(&self, stage: Stage, table: &Table, mode: SaveMode) -> Result<(), StoreError>;

        /// Capture the current on-disk state of a stage.
        fn snapshot(&self, stage: Stage) -> Result<Snapshot, StoreError>;

        /// Put a stage back to a previously captured state.
        fn restore(&self, stage: Stage, snapshot: Snapshot) -> Result<(), StoreError>;
    }

    /// Directory of CSV files, one per stage.
    #[derive(Debug, Clone)]
    pub struct FsStageStore {
        root: PathBuf,
        file_names: BTreeMap<Stage, String>,
    }

    impl FsStageStore {
        pub fn new(root: impl Into<PathBuf>) -> Self {
            Self {
                root: root.into(),
                file_names: BTreeMap::new(),
            }
        }

        /// Use `file_names` instead of the default `<stage>.csv` names where given.
        pub fn with_file_names(mut self, file_names: BTreeMap<Stage, String>) -> Self {
            self.file_names = file_names;
            self
        }

        pub fn root(&self) -> &Path {
            &self.root
        }

        pub fn path_for(&self, stage: Stage) -> PathBuf {
            match self.file_names.get(&stage) {
                Some(name) => self.root.join(name),
                None => self.root.join(stage.default_file_name()),
            }
        }

        fn read_optional(&self, path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
            match fs::read(path) {
                Ok(bytes) => Ok(Some(bytes)),
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(source) => Err(StoreError::Io {
                    op: "reading",
                    path: path.to_path_buf(),
                    source,
                }),
            }
        }

        fn write_replacing(&self, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
            let dir = path.parent().unwrap_or(&self.root);
            fs::create_dir_all(dir).map_err(io_error("creating directory", dir))?;
            let mut tmp = NamedTempFile::new_in(dir).map_err(io_error("creating temp file in", dir))?;
            tmp.write_all(bytes).map_err(io_error("writing", path))?;
            tmp.flush().map_err(io_error("flushing", path))?;
            tmp.as_file().sync_all().map_err(io_error("syncing", path))?;
            tmp.persist(path).map_err(|err| StoreError::Io {
                op: "replacing",
                path: path.to_path_buf(),
                source: err.error,
            })?;
            Ok(())
        }

        fn append_rows(&self, stage: Stage, path: &Path, table: &Table) -> Result<(), StoreError> {
            let existing = match self.read_optional(path)? {
                Some(bytes) if !bytes.iter().all(|b| b.is_ascii_whitespace()) => bytes,
                _ => {
                    debug!(stage = %stage, path = ?path, "append to absent stage file; creating it with a header");
                    return self.write_replacing(path, codec::format_table(table).as_bytes());
                }
            };
            if table.rows.is_empty() {
                return Ok(());
            }

            let text = decode_utf8(path, &existing)?;
            match codec::parse_header(text) {
                Ok(header) if header != table.columns => warn!(
                    stage = %stage,
                    existing = ?header,
                    appended = ?table.columns,
                    "appending rows whose columns differ from the stage header; cells are written by position"
                ),
                Ok(_) => {}
                Err(err) => warn!(stage = %stage, error = %err, "stage header is unreadable; appending anyway"),
            }

            let mut out = existing;
            if !out.ends_with(b"\n") {
                out.push(b'\n');
            }
            out.extend_from_slice(codec::format_rows(&table.rows).as_bytes());
            self.write_replacing(path, &out)
        }
    }

    impl StageRepository for FsStageStore {
        fn load(&self, stage: Stage) -> Result<Option<Table>, StoreError> {
            let path = self.path_for(stage);
            let Some(bytes) = self.read_optional(&path)? else {
                debug!(stage = %stage, path = ?path, "stage file not found");
                return Ok(None);
            };
            let text = decode_utf8(&path, &bytes)?;
            let table = codec::parse_table_from_str(text)
                .map_err(|source| StoreError::Decode { path, source })?;
            debug!(stage = %stage, rows = table.len(), "loaded stage");
            Ok(Some(table))
        }

        fn save(&self, stage: Stage, table: &Table, mode: SaveMode) -> Result<(), StoreError> {
            let path = self.path_for(stage);
            match mode {
                SaveMode::Overwrite => {
                    self.write_replacing(&path, codec::format_table(table).as_bytes())?
                }
                SaveMode::Append => self.append_rows(stage, &path, table)?,
            }
            debug!(stage = %stage, ?mode, rows = table.len(), "saved stage");
            Ok(())
        }

        fn snapshot(&self, stage: Stage) -> Result<Snapshot, StoreError> {
            let path = self.path_for(stage);
            Ok(match self.read_optional(&path)? {
                Some(bytes) => Snapshot::Bytes(bytes),
                None => Snapshot::Absent,
            })
        }

        fn restore(&self, stage: Stage, snapshot: Snapshot) -> Result<(), StoreError> {
            let path = self.path_for(stage);
            match snapshot {
                Snapshot::Bytes(bytes) => self.write_replacing(&path, &bytes)?,
                Snapshot::Absent => match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                    Err(source) => {
                        return Err(StoreError::Io {
                            op: "removing",
                            path,
                            source,
                        });
                    }
                },
            }
            debug!(stage = %stage, "restored stage from snapshot");
            Ok(())
        }
    }

    /// Strict decode; a lossy one would rewrite rows nobody touched once the stage is saved.
    fn decode_utf8<'a>(path: &Path, bytes: &'a [u8]) -> Result<&'a str, StoreError> {
        std::str::from_utf8(bytes).map_err(|source| StoreError::Encoding {
            path: path.to_path_buf(),
            source,
        })
    }

    fn io_error(op: &'static str, path: &Path) -> impl FnOnce(io::Error) -> StoreError {
        let path = path.to_path_buf();
        move |source| StoreError::Io { op, path, source }
    }

}

pub mod config {
    //! Optional per-data-directory settings read from `pipeline.json`.

    use crate::core::{DateParser, DomainError, Stage};
    use crate::storage::FsStageStore;
    use indexmap::IndexMap;
    use serde::{Deserialize, Serialize};
    use std::{
        collections::BTreeMap,
        fs, io,
        path::{Path, PathBuf},
    };
    use tracing::debug;

    pub const CONFIG_FILE_NAME: &str = "pipeline.json";
    pub const DATA_DIR_ENV: &str = "PIPELINE_DATA_DIR";
    pub const DEFAULT_DATA_DIR: &str = "data";

    #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(deny_unknown_fields)]
    pub struct PipelineConfig {
        /// Stage key → file name inside the data directory.
        #[serde(default)]
        pub stage_files: IndexMap<String, String>,

        /// Extra `chrono` formats accepted when reading `Date` cells.
        #[serde(default)]
        pub date_formats: Vec<String>,
    }

    #[derive(Debug, thiserror::Error)]
    pub enum ConfigError {
        #[error("reading {path:?}: {source}")]
        Io {
            path: PathBuf,
            #[source]
            source: io::Error,
        },
        #[error("parsing {path:?}: {source}")]
        Parse {
            path: PathBuf,
            #[source]
            source: serde_json::Error,
        },
        #[error("in {path:?}: {source}")]
        Stage {
            path: PathBuf,
            #[source]
            source: DomainError,
        },
    }

    impl PipelineConfig {
        /// Read `pipeline.json` from `data_dir`; defaults when the file is absent.
        pub fn load(data_dir: &Path) -> Result<Self, ConfigError> {
            let path = data_dir.join(CONFIG_FILE_NAME);
            let text = match fs::read_to_string(&path) {
                Ok(text) => text,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    debug!(path = ?path, "no config file; using defaults");
                    return Ok(Self::default());
                }
                Err(source) => return Err(ConfigError::Io { path, source }),
            };
            let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?;
            config
                .file_name_overrides()
                .map_err(|source| ConfigError::Stage { path, source })?;
            Ok(config)
        }

        pub fn file_name_overrides(&self) -> Result<BTreeMap<Stage, String>, DomainError> {
            self.stage_files
                .iter()
                .map(|(key, name)| Ok::<_, DomainError>((key.parse::<Stage>()?, name.clone())))
                .collect()
        }

        pub fn date_parser(&self) -> DateParser {
            DateParser::with_formats(self.date_formats.clone())
        }

        pub fn open_store(&self, data_dir: &Path) -> Result<FsStageStore, DomainError> {
            Ok(FsStageStore::new(data_dir).with_file_names(self.file_name_overrides()?))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use chrono::NaiveDate;

        #[test]
        fn missing_config_means_defaults() {
            let tmp = tempfile::tempdir().expect("tempdir");
            assert_eq!(
                PipelineConfig::load(tmp.path()).unwrap(),
                PipelineConfig::default()
            );
        }

        #[test]
        fn overrides_and_date_formats_are_applied() {
            let tmp = tempfile::tempdir().expect("tempdir");
            fs::write(
                tmp.path().join(CONFIG_FILE_NAME),
                r#"{"stage_files": {"raw": "leads.csv"}, "date_formats": ["%d-%m-%Y"]}"#,
            )
            .unwrap();

            let config = PipelineConfig::load(tmp.path()).unwrap();
            let store = config.open_store(tmp.path()).unwrap();
            assert_eq!(store.path_for(Stage::Raw), tmp.path().join("leads.csv"));
            assert_eq!(
                config.date_parser().parse("05-01-2024"),
                NaiveDate::from_ymd_opt(2024, 1, 5)
            );
        }

        #[test]
        fn unknown_stage_and_unknown_keys_are_rejected() {
            let tmp = tempfile::tempdir().expect("tempdir");
            let path = tmp.path().join(CONFIG_FILE_NAME);

            fs::write(&path, r#"{"stage_files": {"archive": "a.csv"}}"#).unwrap();
            assert!(matches!(
                PipelineConfig::load(tmp.path()),
                Err(ConfigError::Stage { .. })
            ));

            fs::write(&path, r#"{"stage_file": {}}"#).unwrap();
            assert!(matches!(
                PipelineConfig::load(tmp.path()),
                Err(ConfigError::Parse { .. })
            ));
        }
    }
}

pub mod editable {
    //! Which columns a person may change, and the vocabularies offered for them.
    //!
    //! The editable set is the same on every stage: `Date`, `priority`, `comment` and
    //! `AppSetter`, limited to the ones the stage's file actually has. Everything else is shown
    //! read-only. `priority` and `AppSetter` are offered as choices but stored as plain text, so
    //! values from outside the vocabulary still display and round-trip unchanged.

    use crate::core::{DateParser, DomainError, Table};
    use indexmap::IndexSet;
    use serde::{Deserialize, Serialize};
    use std::{fmt, str::FromStr};

    pub const DATE_COLUMN: &str = "Date";
    pub const PRIORITY_COLUMN: &str = "priority";
    pub const COMMENT_COLUMN: &str = "comment";
    pub const APP_SETTER_COLUMN: &str = "AppSetter";

    /// Spellings that spreadsheet exports use for "no value".
    const NULL_SPELLINGS: [&str; 9] = ["NaN", "nan", "NA", "N/A", "n/a", "NULL", "null", "None", "<NA>"];

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum EditableField {
        Date,
        Priority,
        Comment,
        AppSetter,
    }

    impl EditableField {
        pub const ALL: [EditableField; 4] = [
            EditableField::Date,
            EditableField::Priority,
            EditableField::Comment,
            EditableField::AppSetter,
        ];

        pub fn column(self) -> &'static str {
            match self {
                EditableField::Date => DATE_COLUMN,
                EditableField::Priority => PRIORITY_COLUMN,
                EditableField::Comment => COMMENT_COLUMN,
                EditableField::AppSetter => APP_SETTER_COLUMN,
            }
        }

        fn is_text(self) -> bool {
            !matches!(self, EditableField::Date)
        }
    }

    impl FromStr for EditableField {
        type Err = DomainError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            let norm = s.trim().to_ascii_lowercase().replace(['-', '_', ' '], "");
            match norm.as_str() {
                "date" => Ok(EditableField::Date),
                "priority" => Ok(EditableField::Priority),
                "comment" => Ok(EditableField::Comment),
                "appsetter" => Ok(EditableField::AppSetter),
                _ => Err(DomainError::UnknownField(s.to_string())),
            }
        }
    }

    /// Text of a cell with null spellings (`nan`, `None`, ...) read as empty.
    pub fn text_or_empty(cell: &str) -> &str {
        if NULL_SPELLINGS.contains(&cell.trim()) {
            ""
        } else {
            cell
        }
    }

    /// Editable fields present in `table`, in canonical order.
    pub fn editable_columns(table: &Table) -> Vec<EditableField> {
        EditableField::ALL
            .into_iter()
            .filter(|f| table.has_column(f.column()))
            .collect()
    }

    pub fn is_editable(column: &str) -> bool {
        EditableField::ALL.iter().any(|f| f.column() == column)
    }

    pub fn read_only_columns(table: &Table) -> Vec<&str> {
        table
            .columns
            .iter()
            .map(String::as_str)
            .filter(|c| !is_editable(c))
            .collect()
    }

    /// Prepare a freshly loaded table for display and editing.
    ///
    /// `Date` cells become `YYYY-MM-DD` (or empty when unparsable); text fields lose null
    /// spellings. Other columns are left exactly as read.
    pub fn normalize_for_view(table: &mut Table, dates: &DateParser) {
        for field in editable_columns(table) {
            let Some(col) = table.column_index(field.column()) else {
                continue;
            };
            for row in &mut table.rows {
                let Some(cell) = row.get_mut(col) else {
                    continue;
                };
                if field.is_text() {
                    if text_or_empty(cell).is_empty() {
                        cell.clear();
                    }
                } else {
                    *cell = dates.normalize(cell);
                }
            }
        }
    }

    /// Set one editable field on one row.
    ///
    /// Dates are stored normalized; an unparsable date is stored as unknown (empty) rather than
    /// failing the edit.
    pub fn apply_edit(
        table: &mut Table,
        row: usize,
        field: EditableField,
        value: &str,
        dates: &DateParser,
    ) -> Result<(), DomainError> {
        let stored = match field {
            EditableField::Date => dates.normalize(value),
            _ => value.to_string(),
        };
        table.set_cell(row, field.column(), stored)
    }

    /// Like [`apply_edit`], addressing the field by column name.
    pub fn apply_named_edit(
        table: &mut Table,
        row: usize,
        column: &str,
        value: &str,
        dates: &DateParser,
    ) -> Result<(), DomainError> {
        match column.parse::<EditableField>() {
            Ok(field) => apply_edit(table, row, field, value, dates),
            Err(_) if table.has_column(column) => Err(DomainError::ReadOnlyColumn(column.to_string())),
            Err(err) => Err(err),
        }
    }

    /* ------------------------------ Priority ------------------------------ */

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum Priority {
        High,
        Medium,
        Low,
    }

    impl Priority {
        pub const ALL: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

        pub fn as_str(self) -> &'static str {
            match self {
                Priority::High => "High",
                Priority::Medium => "Medium",
                Priority::Low => "Low",
            }
        }
    }

    impl fmt::Display for Priority {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    /// A stored priority cell: one of the offered choices, or whatever text the file holds.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub enum PriorityValue {
        Known(Priority),
        Other(String),
    }

    impl PriorityValue {
        /// Only exact spellings are `Known`, so stored text never changes on a round trip.
        pub fn from_cell(cell: &str) -> Self {
            Priority::ALL
                .into_iter()
                .find(|p| p.as_str() == cell)
                .map(PriorityValue::Known)
                .unwrap_or_else(|| PriorityValue::Other(cell.to_string()))
        }

        pub fn as_text(&self) -> &str {
            match self {
                PriorityValue::Known(p) => p.as_str(),
                PriorityValue::Other(text) => text,
            }
        }

        pub fn is_known(&self) -> bool {
            matches!(self, PriorityValue::Known(_))
        }
    }

    /* ------------------------------ AppSetter ------------------------------ */

    /// Names offered for the `AppSetter` field, from the `appsetter` reference stage.
    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct AppSetterRoster {
        names: IndexSet<String>,
    }

    impl AppSetterRoster {
        /// Blank entries are ignored; first-seen order is kept.
        pub fn from_table(table: &Table) -> Self {
            let mut names = IndexSet::new();
            if let Some(col) = table.column_index(APP_SETTER_COLUMN) {
                for row in &table.rows {
                    let name = row.get(col).map(|c| c.trim()).unwrap_or("");
                    if !name.is_empty() && !NULL_SPELLINGS.contains(&name) {
                        names.insert(name.to_string());
                    }
                }
            }
            Self { names }
        }

        pub fn names(&self) -> impl Iterator<Item = &str> {
            self.names.iter().map(String::as_str)
        }

        pub fn len(&self) -> usize {
            self.names.len()
        }

        pub fn is_empty(&self) -> bool {
            self.names.is_empty()
        }

        pub fn contains(&self, name: &str) -> bool {
            self.names.contains(name)
        }

        pub fn classify(&self, cell: &str) -> AppSetterValue {
            if self.contains(cell) {
                AppSetterValue::Known(cell.to_string())
            } else {
                AppSetterValue::Other(cell.to_string())
            }
        }
    }

    /// A stored AppSetter cell relative to the roster. Never enforced on write.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub enum AppSetterValue {
        Known(String),
        Other(String),
    }

    impl AppSetterValue {
        pub fn as_text(&self) -> &str {
            match self {
                AppSetterValue::Known(text) | AppSetterValue::Other(text) => text,
            }
        }

        pub fn is_known(&self) -> bool {
            matches!(self, AppSetterValue::Known(_))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn deal_table() -> Table {
            Table::from_rows(
                ["Name", "Date", "priority", "AppSetter", "Phone"],
                [
                    vec!["Ann", "2024-01-05 10:30:00", "High", "Alice", "555"],
                    vec!["Bo", "not a date", "nan", "None", "556"],
                ],
            )
        }

        #[test]
        fn editable_set_is_intersected_with_present_columns() {
            let table = deal_table();
            assert_eq!(
                editable_columns(&table),
                vec![
                    EditableField::Date,
                    EditableField::Priority,
                    EditableField::AppSetter
                ]
            );
            assert_eq!(read_only_columns(&table), vec!["Name", "Phone"]);
        }

        #[test]
        fn view_normalization_fixes_dates_and_null_text() {
            let mut table = deal_table();
            normalize_for_view(&mut table, &DateParser::default());
            assert_eq!(table.cell(0, "Date"), Some("2024-01-05"));
            assert_eq!(table.cell(1, "Date"), Some(""));
            assert_eq!(table.cell(1, "priority"), Some(""));
            assert_eq!(table.cell(1, "AppSetter"), Some(""));
            assert_eq!(table.cell(1, "Phone"), Some("556"));
        }

        #[test]
        fn edits_respect_the_field_policy() {
            let dates = DateParser::default();
            let mut table = deal_table();

            apply_named_edit(&mut table, 0, "date", "03/15/2024", &dates).unwrap();
            assert_eq!(table.cell(0, "Date"), Some("2024-03-15"));

            apply_named_edit(&mut table, 0, "Date", "someday", &dates).unwrap();
            assert_eq!(table.cell(0, "Date"), Some(""));

            apply_named_edit(&mut table, 1, "priority", "urgent", &dates).unwrap();
            assert_eq!(table.cell(1, "priority"), Some("urgent"));

            assert_eq!(
                apply_named_edit(&mut table, 0, "Phone", "000", &dates),
                Err(DomainError::ReadOnlyColumn("Phone".into()))
            );
            assert_eq!(
                apply_named_edit(&mut table, 0, "comment", "hi", &dates),
                Err(DomainError::MissingColumn("comment".into()))
            );
            assert!(matches!(
                apply_named_edit(&mut table, 0, "Email", "x", &dates),
                Err(DomainError::UnknownField(_))
            ));
            assert_eq!(
                apply_edit(&mut table, 9, EditableField::Priority, "Low", &dates),
                Err(DomainError::RowOutOfRange { index: 9, len: 2 })
            );
        }

        #[test]
        fn priority_outside_vocabulary_round_trips() {
            assert_eq!(
                PriorityValue::from_cell("Medium"),
                PriorityValue::Known(Priority::Medium)
            );
            let odd = PriorityValue::from_cell("high-ish");
            assert!(!odd.is_known());
            assert_eq!(odd.as_text(), "high-ish");
            assert_eq!(PriorityValue::from_cell("").as_text(), "");
        }

        #[test]
        fn roster_skips_blanks_and_duplicates() {
            let reference = Table::from_rows(
                ["AppSetter"],
                [vec!["Alice"], vec![""], vec!["Bob"], vec!["Alice"], vec!["nan"]],
            );
            let roster = AppSetterRoster::from_table(&reference);
            assert_eq!(roster.names().collect::<Vec<_>>(), vec!["Alice", "Bob"]);
            assert!(roster.classify("Bob").is_known());
            let outsider = roster.classify("Mallory");
            assert!(!outsider.is_known());
            assert_eq!(outsider.as_text(), "Mallory");
        }

        #[test]
        fn roster_without_column_is_empty() {
            let reference = Table::from_rows(["Name"], [vec!["Alice"]]);
            assert!(AppSetterRoster::from_table(&reference).is_empty());
        }
    }
}

pub mod report {
    //! Read-only counts over a date-filtered stage, shaped for a bar chart.

    use crate::core::{DateParser, Table};
    use crate::editable::{self, APP_SETTER_COLUMN, DATE_COLUMN};
    use chrono::NaiveDate;
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeMap;

    /// AppSetter value (empty string included) → number of records.
    pub type AppSetterCounts = BTreeMap<String, usize>;

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum ReportError {
        #[error("start date {start} is after end date {end}")]
        InvalidRange { start: NaiveDate, end: NaiveDate },
        #[error("stage is missing required columns: {}", .0.join(", "))]
        MissingColumns(Vec<String>),
    }

    /// Inclusive calendar range.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct DateRange {
        start: NaiveDate,
        end: NaiveDate,
    }

    impl DateRange {
        pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, ReportError> {
            if start > end {
                return Err(ReportError::InvalidRange { start, end });
            }
            Ok(Self { start, end })
        }

        pub fn start(&self) -> NaiveDate {
            self.start
        }

        pub fn end(&self) -> NaiveDate {
            self.end
        }

        pub fn contains(&self, date: NaiveDate) -> bool {
            date >= self.start && date <= self.end
        }
    }

    /// Count records per AppSetter among rows whose `Date` falls in `range`.
    ///
    /// Rows with an unparsable date are neither counted nor errors. A stage without any
    /// columns (no file) yields no counts.
    pub fn aggregate_by_app_setter(
        table: &Table,
        range: &DateRange,
        dates: &DateParser,
    ) -> Result<AppSetterCounts, ReportError> {
        let mut counts = AppSetterCounts::new();
        if table.columns.is_empty() {
            return Ok(counts);
        }
        let (date_col, setter_col) = required_columns(table)?;
        for row in &table.rows {
            let Some(date) = row.get(date_col).and_then(|c| dates.parse(c)) else {
                continue;
            };
            if !range.contains(date) {
                continue;
            }
            let setter = row.get(setter_col).map(String::as_str).unwrap_or("");
            *counts
                .entry(editable::text_or_empty(setter).to_string())
                .or_insert(0) += 1;
        }
        Ok(counts)
    }

    /// Earliest and latest parseable `Date`, the default range for a report.
    ///
    /// Holds tables to the same column requirement as [`aggregate_by_app_setter`], so a report
    /// without an explicit range fails the same way one with a range would.
    pub fn date_bounds(table: &Table, dates: &DateParser) -> Result<Option<DateRange>, ReportError> {
        if table.columns.is_empty() {
            return Ok(None);
        }
        let (col, _) = required_columns(table)?;
        let mut parsed = table
            .rows
            .iter()
            .filter_map(|row| row.get(col).and_then(|c| dates.parse(c)));
        let Some(first) = parsed.next() else {
            return Ok(None);
        };
        let (start, end) = parsed.fold((first, first), |(lo, hi), d| (lo.min(d), hi.max(d)));
        Ok(Some(DateRange { start, end }))
    }

    fn required_columns(table: &Table) -> Result<(usize, usize), ReportError> {
        match (
            table.column_index(DATE_COLUMN),
            table.column_index(APP_SETTER_COLUMN),
        ) {
            (Some(d), Some(a)) => Ok((d, a)),
            (d, a) => {
                let mut missing = Vec::new();
                if d.is_none() {
                    missing.push(DATE_COLUMN.to_string());
                }
                if a.is_none() {
                    missing.push(APP_SETTER_COLUMN.to_string());
                }
                Err(ReportError::MissingColumns(missing))
            }
        }
    }

}

pub mod ledger {
    //! Moving records between stages and saving edits back to a stage.
    //!
    //! A move appends the selected rows to every destination and then rewrites the source
    //! without them. Destinations are snapshotted before they are touched; if any write fails the
    //! snapshots are put back, so a failed move leaves every stage as it was (best effort, a
    //! second failure during restore is reported through `rolled_back: false`).

    use crate::core::{DateParser, DomainError, RecordId, Stage, Table};
    use crate::editable::{self, AppSetterRoster};
    use crate::report::{self, AppSetterCounts, DateRange, ReportError};
    use crate::storage::{SaveMode, Snapshot, StageRepository, StoreError};
    use serde::{Deserialize, Serialize};
    use indexmap::IndexSet;
    use std::{fmt, str::FromStr};
    use tracing::{debug, error, info, warn};

    /* ------------------------------ Selections ------------------------------ */

    /// Which records of a stage an operation applies to.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum Selection {
        /// Row positions in the table as it was last shown.
        Rows(Vec<usize>),
        /// Stable identities, see [`RecordId`].
        Records(Vec<RecordId>),
    }

    impl Selection {
        pub fn is_empty(&self) -> bool {
            match self {
                Selection::Rows(rows) => rows.is_empty(),
                Selection::Records(ids) => ids.is_empty(),
            }
        }

        /// Row positions in `table` in selection order, without duplicates.
        pub fn resolve(&self, table: &Table) -> Result<Vec<usize>, SelectionError> {
            let mut positions = IndexSet::new();
            match self {
                Selection::Rows(rows) => {
                    for &index in rows {
                        if index >= table.len() {
                            return Err(SelectionError::RowOutOfRange {
                                index,
                                len: table.len(),
                            });
                        }
                        positions.insert(index);
                    }
                }
                Selection::Records(ids) => {
                    let current = table.record_ids();
                    for id in ids {
                        let pos = current
                            .iter()
                            .position(|x| x == id)
                            .ok_or(SelectionError::StaleRecord(*id))?;
                        positions.insert(pos);
                    }
                }
            }
            Ok(positions.into_iter().collect())
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
    pub enum SelectionError {
        #[error("row {index} is out of range (stage has {len} rows)")]
        RowOutOfRange { index: usize, len: usize },
        #[error("record {0} is no longer in this stage")]
        StaleRecord(RecordId),
        #[error("{0} cannot be moved into itself")]
        DestinationIsSource(Stage),
        #[error("no destination stage given")]
        NoDestination,
        #[error("view of {stage} is out of date: {reason}")]
        StaleView { stage: Stage, reason: String },
    }

    /* -------------------------------- Errors -------------------------------- */

    #[derive(Debug, thiserror::Error)]
    pub enum LedgerError {
        #[error("invalid selection: {0}")]
        InvalidSelection(#[from] SelectionError),
        #[error(
            "writing to {failed} failed after [{}] succeeded (rolled back: {rolled_back})",
            stage_list(.completed)
        )]
        PartialMoveFailure {
            failed: Stage,
            completed: Vec<Stage>,
            rolled_back: bool,
            #[source]
            source: StoreError,
        },
        #[error("removing records from {stage} failed (destinations rolled back: {rolled_back})")]
        SourceCommitFailed {
            stage: Stage,
            rolled_back: bool,
            #[source]
            source: StoreError,
        },
        #[error(transparent)]
        Store(#[from] StoreError),
        #[error(transparent)]
        Report(#[from] ReportError),
    }

    fn stage_list(stages: &[Stage]) -> String {
        stages
            .iter()
            .map(|s| s.key())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /* ------------------------------ Transitions ------------------------------ */

    /// The stage-to-stage moves offered on each stage.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    #[serde(rename_all = "kebab-case")]
    pub enum Transition {
        RawToNotPicked,
        RawToCallback,
        RawToMeetingBooked,
        RawToBin,
        NotPickedToMeetingBooked,
        NotPickedToBin,
        CallbackToMeetingBooked,
        CallbackToBin,
        Qualify,
        Disqualify,
        DealToFollowUp,
        DealToClosed,
        DealToLost,
    }

    impl Transition {
        pub const ALL: [Transition; 13] = [
            Transition::RawToNotPicked,
            Transition::RawToCallback,
            Transition::RawToMeetingBooked,
            Transition::RawToBin,
            Transition::NotPickedToMeetingBooked,
            Transition::NotPickedToBin,
            Transition::CallbackToMeetingBooked,
            Transition::CallbackToBin,
            Transition::Qualify,
            Transition::Disqualify,
            Transition::DealToFollowUp,
            Transition::DealToClosed,
            Transition::DealToLost,
        ];

        pub fn name(self) -> &'static str {
            match self {
                Transition::RawToNotPicked => "raw-to-not-picked",
                Transition::RawToCallback => "raw-to-callback",
                Transition::RawToMeetingBooked => "raw-to-meeting-booked",
                Transition::RawToBin => "raw-to-bin",
                Transition::NotPickedToMeetingBooked => "not-picked-to-meeting-booked",
                Transition::NotPickedToBin => "not-picked-to-bin",
                Transition::CallbackToMeetingBooked => "callback-to-meeting-booked",
                Transition::CallbackToBin => "callback-to-bin",
                Transition::Qualify => "qualify",
                Transition::Disqualify => "disqualify",
                Transition::DealToFollowUp => "deal-to-follow-up",
                Transition::DealToClosed => "deal-to-closed",
                Transition::DealToLost => "deal-to-lost",
            }
        }

        pub fn source(self) -> Stage {
            match self {
                Transition::RawToNotPicked
                | Transition::RawToCallback
                | Transition::RawToMeetingBooked
                | Transition::RawToBin => Stage::Raw,
                Transition::NotPickedToMeetingBooked | Transition::NotPickedToBin => {
                    Stage::NotPicked
                }
                Transition::CallbackToMeetingBooked | Transition::CallbackToBin => Stage::Callback,
                Transition::Qualify | Transition::Disqualify => Stage::MeetingBooked,
                Transition::DealToFollowUp | Transition::DealToClosed | Transition::DealToLost => {
                    Stage::DealsActive
                }
            }
        }

        /// Qualifying a meeting both records it as qualified and opens it as an active deal.
        pub fn destinations(self) -> &'static [Stage] {
            match self {
                Transition::RawToNotPicked => &[Stage::NotPicked],
                Transition::RawToCallback => &[Stage::Callback],
                Transition::RawToMeetingBooked
                | Transition::NotPickedToMeetingBooked
                | Transition::CallbackToMeetingBooked => &[Stage::MeetingBooked],
                Transition::RawToBin | Transition::NotPickedToBin | Transition::CallbackToBin => {
                    &[Stage::Bin]
                }
                Transition::Qualify => &[Stage::Qualified, Stage::DealsActive],
                Transition::Disqualify => &[Stage::Disqualified],
                Transition::DealToFollowUp => &[Stage::FollowUp],
                Transition::DealToClosed => &[Stage::ClosedDeal],
                Transition::DealToLost => &[Stage::LostDeal],
            }
        }

        pub fn from_stage(stage: Stage) -> Vec<Transition> {
            Self::ALL
                .into_iter()
                .filter(|t| t.source() == stage)
                .collect()
        }
    }

    impl fmt::Display for Transition {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.name())
        }
    }

    impl FromStr for Transition {
        type Err = DomainError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            let norm = s.trim().to_ascii_lowercase().replace(['_', ' '], "-");
            Self::ALL
                .into_iter()
                .find(|t| t.name() == norm)
                .ok_or_else(|| DomainError::UnknownTransition(s.to_string()))
        }
    }

    /* -------------------------------- Outcomes -------------------------------- */

    /// A stage as loaded; `missing` is set when its file did not exist.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Loaded {
        pub table: Table,
        pub missing: bool,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct MoveReport {
        pub source: Stage,
        pub destinations: Vec<Stage>,
        /// Number of records written to each destination.
        pub records: usize,
        pub removed_from_source: bool,
        pub source_remaining: usize,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    #[serde(rename_all = "snake_case")]
    pub enum MoveOutcome {
        NothingSelected,
        Moved(MoveReport),
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    #[serde(rename_all = "snake_case")]
    pub enum SaveOutcome {
        NoChanges,
        /// Positions of the rows that were rewritten.
        Saved { rows: Vec<usize> },
    }

    /* --------------------------------- Ledger --------------------------------- */

    pub struct Ledger<R> {
        repo: R,
        dates: DateParser,
    }

    impl<R: StageRepository> Ledger<R> {
        pub fn new(repo: R) -> Self {
            Self {
                repo,
                dates: DateParser::default(),
            }
        }

        pub fn with_dates(mut self, dates: DateParser) -> Self {
            self.dates = dates;
            self
        }

        pub fn repository(&self) -> &R {
            &self.repo
        }

        pub fn dates(&self) -> &DateParser {
            &self.dates
        }

        /// Load a stage as stored. A missing file is an empty table, not an error.
        pub fn load(&self, stage: Stage) -> Result<Loaded, LedgerError> {
            match self.repo.load(stage)? {
                Some(table) => Ok(Loaded {
                    table,
                    missing: false,
                }),
                None => {
                    if stage.warns_when_missing() {
                        warn!(stage = %stage, "{} file not found; showing an empty table", stage.title());
                    } else {
                        debug!(stage = %stage, "stage has no file yet");
                    }
                    Ok(Loaded {
                        table: Table::default(),
                        missing: true,
                    })
                }
            }
        }

        /// Load a stage prepared for display and editing.
        pub fn load_view(&self, stage: Stage) -> Result<Loaded, LedgerError> {
            let mut loaded = self.load(stage)?;
            editable::normalize_for_view(&mut loaded.table, &self.dates);
            Ok(loaded)
        }

        pub fn save(&self, stage: Stage, table: &Table, mode: SaveMode) -> Result<(), LedgerError> {
            self.repo.save(stage, table, mode)?;
            Ok(())
        }

        pub fn app_setters(&self) -> Result<AppSetterRoster, LedgerError> {
            let loaded = self.load(Stage::AppSetter)?;
            Ok(AppSetterRoster::from_table(&loaded.table))
        }

        /// Move the selected records of `source` into every stage in `destinations`.
        pub fn move_records(
            &self,
            source: Stage,
            selection: &Selection,
            destinations: &[Stage],
        ) -> Result<MoveOutcome, LedgerError> {
            self.relocate(source, selection, destinations, true)
        }

        /// Like [`Ledger::move_records`] but the source keeps its records.
        pub fn copy_records(
            &self,
            source: Stage,
            selection: &Selection,
            destinations: &[Stage],
        ) -> Result<MoveOutcome, LedgerError> {
            self.relocate(source, selection, destinations, false)
        }

        pub fn apply(
            &self,
            transition: Transition,
            selection: &Selection,
        ) -> Result<MoveOutcome, LedgerError> {
            info!(transition = %transition, "applying transition");
            self.move_records(transition.source(), selection, transition.destinations())
        }

        /// Write back the rows of an edited view that differ from the stored stage.
        ///
        /// `edited` must have been produced by [`Ledger::load_view`] on the current contents:
        /// a different header or row count means the stage changed underneath and nothing is
        /// written. Unchanged rows keep their stored text byte for byte.
        pub fn save_edits(&self, stage: Stage, edited: &Table) -> Result<SaveOutcome, LedgerError> {
            let mut stored = self.load(stage)?.table;
            if stored.columns != edited.columns {
                return Err(SelectionError::StaleView {
                    stage,
                    reason: "columns differ".to_string(),
                }
                .into());
            }
            if stored.len() != edited.len() {
                return Err(SelectionError::StaleView {
                    stage,
                    reason: format!("expected {} rows, view has {}", stored.len(), edited.len()),
                }
                .into());
            }

            let mut baseline = stored.clone();
            editable::normalize_for_view(&mut baseline, &self.dates);

            let mut changed = Vec::new();
            for (index, (before, after)) in baseline.rows.iter().zip(&edited.rows).enumerate() {
                if before != after {
                    stored.rows[index] = after.clone();
                    changed.push(index);
                }
            }

            if changed.is_empty() {
                warn!(stage = %stage, "no changes detected");
                return Ok(SaveOutcome::NoChanges);
            }
            self.repo.save(stage, &stored, SaveMode::Overwrite)?;
            info!(stage = %stage, rows = changed.len(), "saved edits");
            Ok(SaveOutcome::Saved { rows: changed })
        }

        /// AppSetter counts for a stage's records dated within `range`.
        pub fn aggregate_by_app_setter(
            &self,
            stage: Stage,
            range: &DateRange,
        ) -> Result<AppSetterCounts, LedgerError> {
            let table = self.load(stage)?.table;
            let counts = report::aggregate_by_app_setter(&table, range, &self.dates)?;
            debug!(stage = %stage, buckets = counts.len(), "aggregated by AppSetter");
            Ok(counts)
        }

        /// Range spanning every parseable date in a stage, if any.
        pub fn date_bounds(&self, stage: Stage) -> Result<Option<DateRange>, LedgerError> {
            let table = self.load(stage)?.table;
            Ok(report::date_bounds(&table, &self.dates)?)
        }

        fn relocate(
            &self,
            source: Stage,
            selection: &Selection,
            destinations: &[Stage],
            remove: bool,
        ) -> Result<MoveOutcome, LedgerError> {
            if selection.is_empty() {
                warn!(stage = %source, "no records selected");
                return Ok(MoveOutcome::NothingSelected);
            }
            let destinations = checked_destinations(source, destinations)?;

            let mut table = self.load(source)?.table;
            let positions = selection.resolve(&table)?;
            let picked = table.take_rows(&positions);

            let mut written: Vec<(Stage, Snapshot)> = Vec::with_capacity(destinations.len());
            for &dest in &destinations {
                let snapshot = match self.repo.snapshot(dest) {
                    Ok(snapshot) => snapshot,
                    Err(err) => {
                        let completed = written.iter().map(|(s, _)| *s).collect();
                        let rolled_back = self.roll_back(written);
                        return Err(LedgerError::PartialMoveFailure {
                            failed: dest,
                            completed,
                            rolled_back,
                            source: err,
                        });
                    }
                };
                if let Err(err) = self.repo.save(dest, &picked, SaveMode::Append) {
                    let completed = written.iter().map(|(s, _)| *s).collect();
                    // the failed append may have left a partial tail behind
                    written.push((dest, snapshot));
                    let rolled_back = self.roll_back(written);
                    return Err(LedgerError::PartialMoveFailure {
                        failed: dest,
                        completed,
                        rolled_back,
                        source: err,
                    });
                }
                written.push((dest, snapshot));
            }

            if remove {
                table.remove_rows(&positions);
                if let Err(err) = self.repo.save(source, &table, SaveMode::Overwrite) {
                    let rolled_back = self.roll_back(written);
                    return Err(LedgerError::SourceCommitFailed {
                        stage: source,
                        rolled_back,
                        source: err,
                    });
                }
            }

            info!(
                source = %source,
                destinations = %stage_list(&destinations),
                records = picked.len(),
                removed = remove,
                "relocated records"
            );
            Ok(MoveOutcome::Moved(MoveReport {
                source,
                destinations,
                records: picked.len(),
                removed_from_source: remove,
                source_remaining: table.len(),
            }))
        }

        /// Restore snapshots newest first. Returns false if any restore failed.
        fn roll_back(&self, written: Vec<(Stage, Snapshot)>) -> bool {
            let mut clean = true;
            for (stage, snapshot) in written.into_iter().rev() {
                if let Err(err) = self.repo.restore(stage, snapshot) {
                    error!(stage = %stage, error = %err, "rollback failed; stage left modified");
                    clean = false;
                }
            }
            clean
        }
    }

    fn checked_destinations(source: Stage, destinations: &[Stage]) -> Result<Vec<Stage>, SelectionError> {
        if destinations.is_empty() {
            return Err(SelectionError::NoDestination);
        }
        let mut unique = Vec::with_capacity(destinations.len());
        for &dest in destinations {
            if dest == source {
                return Err(SelectionError::DestinationIsSource(source));
            }
            if !unique.contains(&dest) {
                unique.push(dest);
            }
        }
        Ok(unique)
    }

}
