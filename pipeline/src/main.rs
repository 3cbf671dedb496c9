use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use pipeline::config::{DATA_DIR_ENV, DEFAULT_DATA_DIR, PipelineConfig};
use pipeline::core::{RecordId, Stage};
use pipeline::editable::{
    self, APP_SETTER_COLUMN, AppSetterRoster, PRIORITY_COLUMN, PriorityValue,
};
use pipeline::ledger::{Ledger, MoveOutcome, SaveOutcome, Selection, Transition};
use pipeline::report::{AppSetterCounts, DateRange};
use pipeline::storage::FsStageStore;
use serde::Serialize;
use tracing::debug;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(
    name = "pipeline",
    about = "Track sales leads through pipeline stages stored as CSV files",
    version
)]
struct Cli {
    /// Directory holding the stage files.
    #[arg(long, global = true, env = DATA_DIR_ENV, default_value = DEFAULT_DATA_DIR)]
    data_dir: PathBuf,
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List every stage with its file and record count.
    Stages,

    /// Print a stage as it would be shown for editing.
    Show(ShowArgs),

    /// Change editable fields of one record and save.
    Edit(EditArgs),

    /// Move records from one stage into others.
    Move(RelocateArgs),

    /// Copy records into other stages, leaving the source as is.
    Copy(RelocateArgs),

    /// Apply a named stage transition to records.
    Advance(AdvanceArgs),

    /// List transitions, optionally only those leaving one stage.
    Transitions(TransitionsArgs),

    /// Count records per AppSetter within a date range.
    Report(ReportArgs),

    /// Print the AppSetter reference list.
    Appsetters,
}

#[derive(Debug, Args)]
struct ShowArgs {
    stage: Stage,
    /// Emit JSON instead of a table.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct EditArgs {
    stage: Stage,
    /// Row position as printed by `show`.
    #[arg(long)]
    row: usize,
    /// Field assignment such as `priority=High`; repeatable.
    #[arg(long = "set", required = true, value_parser = parse_assignment)]
    assignments: Vec<(String, String)>,
}

#[derive(Debug, Args)]
#[group(required = true, multiple = false)]
struct SelectionArgs {
    /// Row positions as printed by `show` (comma separated).
    #[arg(long, value_delimiter = ',')]
    rows: Vec<usize>,
    /// Record ids as printed by `show` (comma separated).
    #[arg(long, value_delimiter = ',')]
    ids: Vec<RecordId>,
}

impl SelectionArgs {
    fn into_selection(self) -> Selection {
        if self.ids.is_empty() {
            Selection::Rows(self.rows)
        } else {
            Selection::Records(self.ids)
        }
    }
}

#[derive(Debug, Args)]
struct RelocateArgs {
    source: Stage,
    /// Destination stages (comma separated or repeated).
    #[arg(long = "to", required = true, value_delimiter = ',')]
    destinations: Vec<Stage>,
    #[command(flatten)]
    selection: SelectionArgs,
}

#[derive(Debug, Args)]
struct AdvanceArgs {
    transition: Transition,
    #[command(flatten)]
    selection: SelectionArgs,
}

#[derive(Debug, Args)]
struct TransitionsArgs {
    stage: Option<Stage>,
}

#[derive(Debug, Args)]
struct ReportArgs {
    stage: Stage,
    /// Inclusive start date (YYYY-MM-DD). Defaults to the earliest date in the stage.
    #[arg(long)]
    from: Option<NaiveDate>,
    /// Inclusive end date (YYYY-MM-DD). Defaults to the latest date in the stage.
    #[arg(long)]
    to: Option<NaiveDate>,
    /// Emit JSON instead of a bar list.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_json);
    let data_dir = cli.data_dir;
    match cli.command {
        Commands::Stages => handle_stages(&data_dir),
        Commands::Show(args) => handle_show(&data_dir, args),
        Commands::Edit(args) => handle_edit(&data_dir, args),
        Commands::Move(args) => handle_relocate(&data_dir, args, true),
        Commands::Copy(args) => handle_relocate(&data_dir, args, false),
        Commands::Advance(args) => handle_advance(&data_dir, args),
        Commands::Transitions(args) => handle_transitions(args),
        Commands::Report(args) => handle_report(&data_dir, args),
        Commands::Appsetters => handle_appsetters(&data_dir),
    }
}

fn init_tracing(verbose: bool, json: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(layer.json()).init();
    } else {
        registry.with(layer).init();
    }
}

fn open_ledger(data_dir: &Path) -> Result<Ledger<FsStageStore>> {
    let config = PipelineConfig::load(data_dir)
        .with_context(|| format!("loading configuration from {:?}", data_dir))?;
    let store = config
        .open_store(data_dir)
        .with_context(|| format!("configuring stage files in {:?}", data_dir))?;
    debug!(root = ?store.root(), "opened data directory");
    Ok(Ledger::new(store).with_dates(config.date_parser()))
}

fn handle_stages(data_dir: &Path) -> Result<()> {
    let ledger = open_ledger(data_dir)?;
    for stage in Stage::ALL {
        let loaded = ledger
            .load(stage)
            .with_context(|| format!("loading {}", stage))?;
        let path = ledger.repository().path_for(stage);
        let file = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let status = if loaded.missing {
            "missing".to_string()
        } else {
            format!("{} records", loaded.table.len())
        };
        println!("{:<15} {:<20} {:<22} {}", stage.key(), stage.title(), file, status);
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct StageView<'a> {
    stage: Stage,
    missing: bool,
    columns: &'a [String],
    editable: Vec<&'static str>,
    rows: Vec<RowView<'a>>,
}

#[derive(Debug, Serialize)]
struct RowView<'a> {
    index: usize,
    id: RecordId,
    cells: &'a [String],
}

fn handle_show(data_dir: &Path, args: ShowArgs) -> Result<()> {
    let ShowArgs { stage, json } = args;
    let ledger = open_ledger(data_dir)?;
    let loaded = ledger
        .load_view(stage)
        .with_context(|| format!("loading {}", stage))?;
    let table = &loaded.table;
    let editable: Vec<&'static str> = editable::editable_columns(table)
        .into_iter()
        .map(|field| field.column())
        .collect();
    // ids are fingerprints of the stored cells, not the normalized view
    let ids = ledger
        .load(stage)
        .with_context(|| format!("loading {}", stage))?
        .table
        .record_ids();

    if json {
        let view = StageView {
            stage,
            missing: loaded.missing,
            columns: &table.columns,
            editable,
            rows: table
                .rows
                .iter()
                .zip(ids)
                .enumerate()
                .map(|(index, (cells, id))| RowView { index, id, cells })
                .collect(),
        };
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    if table.columns.is_empty() {
        eprintln!("{} has no records.", stage.title());
        return Ok(());
    }

    // the roster is only worth loading when there is a column to check against it
    let roster = if table.has_column(APP_SETTER_COLUMN) && stage != Stage::AppSetter {
        ledger.app_setters()?
    } else {
        AppSetterRoster::default()
    };

    let header: Vec<String> = table
        .columns
        .iter()
        .map(|c| {
            if editable.contains(&c.as_str()) {
                format!("{c}*")
            } else {
                c.clone()
            }
        })
        .collect();
    println!("{:>4}  {:<36}  {}", "#", "id", header.join(" | "));
    for (index, (cells, id)) in table.rows.iter().zip(ids).enumerate() {
        let shown: Vec<String> = table
            .columns
            .iter()
            .zip(cells)
            .map(|(column, cell)| flag_cell(column, cell, &roster))
            .collect();
        println!("{:>4}  {}  {}", index, id, shown.join(" | "));
    }
    Ok(())
}

/// Mark values outside the offered choices with a trailing `(?)`.
fn flag_cell(column: &str, cell: &str, roster: &AppSetterRoster) -> String {
    let unknown = !cell.is_empty()
        && match column {
            PRIORITY_COLUMN => !PriorityValue::from_cell(cell).is_known(),
            APP_SETTER_COLUMN => !roster.is_empty() && !roster.classify(cell).is_known(),
            _ => false,
        };
    if unknown {
        format!("{cell} (?)")
    } else {
        cell.to_string()
    }
}

fn handle_edit(data_dir: &Path, args: EditArgs) -> Result<()> {
    let EditArgs {
        stage,
        row,
        assignments,
    } = args;
    let ledger = open_ledger(data_dir)?;
    let mut view = ledger
        .load_view(stage)
        .with_context(|| format!("loading {}", stage))?
        .table;
    for (column, value) in &assignments {
        editable::apply_named_edit(&mut view, row, column, value, ledger.dates())
            .with_context(|| format!("setting {column} on row {row} of {stage}"))?;
    }
    match ledger
        .save_edits(stage, &view)
        .with_context(|| format!("saving {}", stage))?
    {
        SaveOutcome::NoChanges => eprintln!("No changes detected."),
        SaveOutcome::Saved { rows } => println!("Saved {} row(s) in {}.", rows.len(), stage),
    }
    Ok(())
}

fn handle_relocate(data_dir: &Path, args: RelocateArgs, remove: bool) -> Result<()> {
    let RelocateArgs {
        source,
        destinations,
        selection,
    } = args;
    let ledger = open_ledger(data_dir)?;
    let selection = selection.into_selection();
    let outcome = if remove {
        ledger.move_records(source, &selection, &destinations)
    } else {
        ledger.copy_records(source, &selection, &destinations)
    }
    .with_context(|| format!("relocating records from {}", source))?;
    print_outcome(&outcome);
    Ok(())
}

fn handle_advance(data_dir: &Path, args: AdvanceArgs) -> Result<()> {
    let AdvanceArgs {
        transition,
        selection,
    } = args;
    let ledger = open_ledger(data_dir)?;
    let outcome = ledger
        .apply(transition, &selection.into_selection())
        .with_context(|| format!("applying {}", transition))?;
    print_outcome(&outcome);
    Ok(())
}

fn print_outcome(outcome: &MoveOutcome) {
    match outcome {
        MoveOutcome::NothingSelected => eprintln!("No records selected."),
        MoveOutcome::Moved(report) => {
            let verb = if report.removed_from_source {
                "Moved"
            } else {
                "Copied"
            };
            let targets = report
                .destinations
                .iter()
                .map(|s| s.key())
                .collect::<Vec<_>>()
                .join(", ");
            println!(
                "{} {} record(s) from {} to {} ({} left in {}).",
                verb, report.records, report.source, targets, report.source_remaining, report.source
            );
        }
    }
}

fn handle_transitions(args: TransitionsArgs) -> Result<()> {
    let transitions = match args.stage {
        Some(stage) => Transition::from_stage(stage),
        None => Transition::ALL.to_vec(),
    };
    if transitions.is_empty() {
        eprintln!("No transitions leave this stage.");
        return Ok(());
    }
    for transition in transitions {
        let targets = transition
            .destinations()
            .iter()
            .map(|s| s.key())
            .collect::<Vec<_>>()
            .join(" + ");
        println!(
            "{:<30} {:<15} -> {}",
            transition.name(),
            transition.source().key(),
            targets
        );
    }
    Ok(())
}

fn handle_report(data_dir: &Path, args: ReportArgs) -> Result<()> {
    let ReportArgs {
        stage,
        from,
        to,
        json,
    } = args;
    let ledger = open_ledger(data_dir)?;
    let bounds = ledger
        .date_bounds(stage)
        .with_context(|| format!("loading {}", stage))?;
    let (Some(start), Some(end)) = (
        from.or(bounds.map(|b| b.start())),
        to.or(bounds.map(|b| b.end())),
    ) else {
        eprintln!("{} has no dated records.", stage.title());
        return Ok(());
    };
    let range = DateRange::new(start, end)?;
    let counts = ledger
        .aggregate_by_app_setter(stage, &range)
        .with_context(|| format!("counting {} by AppSetter", stage))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&counts)?);
    } else if counts.is_empty() {
        eprintln!("No records between {} and {}.", start, end);
    } else {
        println!("{} records by AppSetter, {} to {}", stage.title(), start, end);
        for line in render_bars(&counts, 40) {
            println!("{line}");
        }
    }
    Ok(())
}

/// One text bar per AppSetter, scaled so the largest count is `width` wide.
fn render_bars(counts: &AppSetterCounts, width: usize) -> Vec<String> {
    let max = counts.values().copied().max().unwrap_or(0).max(1);
    let label_width = counts
        .keys()
        .map(|k| if k.is_empty() { 6 } else { k.chars().count() })
        .max()
        .unwrap_or(0);
    counts
        .iter()
        .map(|(name, &count)| {
            let label = if name.is_empty() { "(none)" } else { name.as_str() };
            let bar = "#".repeat((count * width).div_ceil(max));
            format!("{label:<label_width$}  {count:>5}  {bar}")
        })
        .collect()
}

fn handle_appsetters(data_dir: &Path) -> Result<()> {
    let ledger = open_ledger(data_dir)?;
    let roster = ledger.app_setters().context("loading AppSetter list")?;
    if roster.is_empty() {
        eprintln!("No AppSetters found.");
        return Ok(());
    }
    for name in roster.names() {
        println!("{name}");
    }
    Ok(())
}

fn parse_assignment(raw: &str) -> Result<(String, String), String> {
    let (field, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected FIELD=VALUE, got {raw:?}"))?;
    let field = field.trim();
    if field.is_empty() {
        return Err(format!("missing field name in {raw:?}"));
    }
    Ok((field.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::fs;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_assignment_splits_on_first_equals() {
        assert_eq!(
            parse_assignment("comment=call back after 5=ok").unwrap(),
            ("comment".to_string(), "call back after 5=ok".to_string())
        );
        assert_eq!(
            parse_assignment("priority=").unwrap(),
            ("priority".to_string(), String::new())
        );
        assert!(parse_assignment("priority").is_err());
        assert!(parse_assignment("=High").is_err());
    }

    #[test]
    fn selection_flags_are_exclusive() {
        let cli = Cli::try_parse_from([
            "pipeline", "move", "raw", "--to", "bin,callback", "--rows", "0,2",
        ])
        .expect("parse move");
        match cli.command {
            Commands::Move(args) => {
                assert_eq!(args.destinations, vec![Stage::Bin, Stage::Callback]);
                assert_eq!(args.selection.into_selection(), Selection::Rows(vec![0, 2]));
            }
            other => panic!("unexpected command {other:?}"),
        }

        assert!(
            Cli::try_parse_from(["pipeline", "advance", "qualify", "--rows", "0", "--ids", "x"])
                .is_err()
        );
        assert!(Cli::try_parse_from(["pipeline", "advance", "qualify"]).is_err());
    }

    #[test]
    fn bars_scale_to_the_largest_count() {
        let counts = AppSetterCounts::from([
            ("Alice".to_string(), 4),
            ("Bob".to_string(), 1),
            (String::new(), 2),
        ]);
        let lines = render_bars(&counts, 8);
        assert_eq!(
            lines,
            vec![
                "(none)      2  ####".to_string(),
                "Alice       4  ########".to_string(),
                "Bob         1  ##".to_string(),
            ]
        );
    }

    #[test]
    fn unknown_choices_are_flagged() {
        let roster = AppSetterRoster::from_table(&pipeline::core::Table::from_rows(
            ["AppSetter"],
            [vec!["Alice"]],
        ));
        assert_eq!(flag_cell("priority", "High", &roster), "High");
        assert_eq!(flag_cell("priority", "urgent", &roster), "urgent (?)");
        assert_eq!(flag_cell("AppSetter", "Mallory", &roster), "Mallory (?)");
        assert_eq!(flag_cell("AppSetter", "", &roster), "");
        assert_eq!(flag_cell("Name", "anything", &roster), "anything");
    }

    #[test]
    fn edit_and_advance_update_the_data_directory() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path();
        fs::write(
            dir.join("meeting_booked.csv"),
            "Name,Date,priority\nAnn,2024-01-05,Low\nBo,2024-01-06,\n",
        )
        .expect("seed meetings");

        handle_edit(
            dir,
            EditArgs {
                stage: Stage::MeetingBooked,
                row: 1,
                assignments: vec![("priority".to_string(), "High".to_string())],
            },
        )
        .expect("edit");
        handle_advance(
            dir,
            AdvanceArgs {
                transition: Transition::Qualify,
                selection: SelectionArgs {
                    rows: vec![1],
                    ids: vec![],
                },
            },
        )
        .expect("advance");

        assert_eq!(
            fs::read_to_string(dir.join("meeting_booked.csv")).expect("meetings"),
            "Name,Date,priority\nAnn,2024-01-05,Low\n"
        );
        let expected = "Name,Date,priority\nBo,2024-01-06,High\n";
        assert_eq!(
            fs::read_to_string(dir.join("qualified.csv")).expect("qualified"),
            expected
        );
        assert_eq!(
            fs::read_to_string(dir.join("deals_active.csv")).expect("deals"),
            expected
        );
    }

    #[test]
    fn report_without_range_names_missing_columns() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(
            tmp.path().join("deals_active.csv"),
            "Name,Date\nAnn,2024-01-05\n",
        )
        .expect("seed deals");
        let err = handle_report(
            tmp.path(),
            ReportArgs {
                stage: Stage::DealsActive,
                from: None,
                to: None,
                json: false,
            },
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("missing required columns: AppSetter"));
    }

    #[test]
    fn editing_a_read_only_column_fails() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(tmp.path().join("callback.csv"), "Name,comment\nAnn,\n").expect("seed");
        let err = handle_edit(
            tmp.path(),
            EditArgs {
                stage: Stage::Callback,
                row: 0,
                assignments: vec![("Name".to_string(), "Bo".to_string())],
            },
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("read-only"));
    }
}
