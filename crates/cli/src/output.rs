// Output formatting for CLI

use txcost_bench::{EntryOutcome, RunReport};

/// Print a simple key-value pair for text output
pub fn print_field(label: &str, value: &str) {
    println!("{:<14} {}", format!("{}:", label), value);
}

/// Print a table header
pub fn print_table_header(columns: &[(&str, usize)]) {
    let header: String = columns
        .iter()
        .map(|(name, width)| format!("{:<width$}", name, width = width))
        .collect::<Vec<_>>()
        .join("  ");
    println!("{}", header);
}

/// Print a table row
pub fn print_table_row(values: &[(&str, usize)]) {
    let row: String = values
        .iter()
        .map(|(val, width)| {
            let s = if val.chars().count() > *width {
                let cut: String = val.chars().take(width.saturating_sub(3)).collect();
                format!("{}...", cut)
            } else {
                val.to_string()
            };
            format!("{:<width$}", s, width = width)
        })
        .collect::<Vec<_>>()
        .join("  ");
    println!("{}", row);
}

const COLUMNS: [(&str, usize); 6] = [
    ("#", 3),
    ("CONFIGURATION", 60),
    ("MEDIAN", 9),
    ("P99", 9),
    ("VIOLATIONS", 10),
    ("STATUS", 18),
];

/// One table row per matrix entry
pub fn print_run_summary(run: &RunReport) {
    println!();
    print_table_header(&COLUMNS);

    for entry in &run.entries {
        let index = (entry.index + 1).to_string();
        let description = entry.entry.description();
        let (median, p99) = match entry.statistics() {
            Some(stats) => (format!("{:.3}", stats.median), format!("{:.3}", stats.p99)),
            None => ("-".to_string(), "-".to_string()),
        };
        let violations = entry.violations().to_string();
        let status = match &entry.outcome {
            EntryOutcome::Completed { .. } => "ok".to_string(),
            EntryOutcome::Failed { stage, .. } => format!("failed: {}", stage),
        };

        print_table_row(&[
            (&index, COLUMNS[0].1),
            (&description, COLUMNS[1].1),
            (&median, COLUMNS[2].1),
            (&p99, COLUMNS[3].1),
            (&violations, COLUMNS[4].1),
            (&status, COLUMNS[5].1),
        ]);
    }

    println!();
    print_field("Completed", &run.completed().to_string());
    print_field("Failed", &run.failed().to_string());
}
