use itertools::Itertools;
use prettytable::{format, row, Table};

use crate::codegen::{CodegenReport, InstanceReport};
use crate::kernel::TileSizes;

pub fn print_report(report: &CodegenReport) {
    if report.instances.is_empty() {
        println!(
            "No kernels lowered; {} view rewrites applied",
            report.test_pattern_rewrites
        );
        return;
    }
    report_table(report).printstd();
}

pub fn report_string(report: &CodegenReport) -> String {
    report_table(report).to_string()
}

fn report_table(report: &CodegenReport) -> Table {
    let mut table = Table::new();
    table.set_titles(row!["Caller", "Callee", "Kernel", "Tile sizes", "Reached", "Stalled"]);
    for instance in &report.instances {
        table.add_row(instance_row(instance));
    }

    let format = format::FormatBuilder::new()
        .separator(
            format::LinePosition::Title,
            format::LineSeparator::new('-', ' ', ' ', ' '),
        )
        .column_separator(' ')
        .build();
    table.set_format(format);
    table
}

fn instance_row(instance: &InstanceReport) -> prettytable::Row {
    let reached = instance
        .reached
        .map_or_else(|| String::from("-"), |s| s.to_string());
    row![
        format!("@{}", instance.caller),
        instance.callee,
        instance.kind,
        tile_sizes_string(&instance.tile_sizes),
        reached,
        if instance.stalled { "yes" } else { "no" },
    ]
}

fn tile_sizes_string(levels: &[TileSizes]) -> String {
    levels
        .iter()
        .map(|sizes| sizes.iter().join("x"))
        .join(" / ")
}
