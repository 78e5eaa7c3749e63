//! Terminal rendering of operation results.
//!
//! Colors follow the usual convention: green for success, red for failure,
//! yellow for things worth a second look.

use colored::Colorize;
use shardctl_cluster::{
    format_slots, Diff, HealthReport, NodeAddr, NodeEntry, Preview, TaskReport, Transfer,
};

/// A one-line error for stderr.
pub fn error_line(msg: impl std::fmt::Display) -> String {
    format!("{}", format!("error: {msg}").red())
}

/// A task report as an indented tree, colored by outcome.
pub fn task_tree(report: &TaskReport) -> String {
    report
        .tree()
        .lines()
        .map(|line| {
            if line.ends_with('✓') {
                line.green().to_string()
            } else {
                line.red().to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn transfers(moves: &[Transfer<NodeAddr>]) -> String {
    if moves.is_empty() {
        return "nothing to move".dimmed().to_string();
    }
    moves
        .iter()
        .map(|t| format!("{} -> {}: {} slots", t.from, t.to, t.count))
        .collect::<Vec<_>>()
        .join("\n")
}

/// One line per primary: name, address, slot count and replica addresses.
pub fn primary_line(primary: &NodeEntry, replicas: &[&NodeEntry]) -> String {
    let replicas: Vec<String> = replicas.iter().map(|r| r.addr.to_string()).collect();
    format!(
        "{} {} {} {}",
        primary.name.dimmed(),
        primary.addr.to_string().green(),
        primary.slots.len(),
        replicas.join(",")
    )
}

pub fn preview(preview: &Preview) -> String {
    format!(
        "{}\n{}\n{}\n{}",
        "before:".bold(),
        preview.before.render(),
        "after:".bold(),
        preview.after.render()
    )
}

/// Human-readable health report, one section per failing check.
pub fn health(report: &HealthReport) -> String {
    if report.is_healthy() {
        return "cluster is healthy".green().to_string();
    }

    let mut out = Vec::new();
    if !report.down_nodes.is_empty() {
        let down: Vec<String> = report.down_nodes.iter().map(ToString::to_string).collect();
        out.push(format!("{} {}", "unreachable:".red(), down.join(", ")));
    }
    for (check, groups) in &report.checks {
        out.push(format!("{}", format!("## {check}").yellow()));
        for group in groups {
            let reporters: Vec<String> = group.nodes.iter().map(ToString::to_string).collect();
            out.push(format!("  seen by {}", reporters.join(", ")));
            match &group.diff {
                Diff::Listed(addrs) => {
                    for addr in addrs {
                        out.push(format!("    {addr}"));
                    }
                }
                Diff::Values(values) => {
                    for (addr, value) in values {
                        let shown = value.as_deref().unwrap_or("(not listed)");
                        out.push(format!("    {addr}: {shown}"));
                    }
                }
            }
        }
    }
    out.join("\n")
}

/// Slot summary for a listing, e.g. `3 primaries, 16384 slots (0-16383)`.
pub fn slot_summary(entries: &[NodeEntry]) -> String {
    let primaries: Vec<&NodeEntry> = entries.iter().filter(|e| e.is_primary()).collect();
    let slots: std::collections::BTreeSet<u16> =
        primaries.iter().flat_map(|e| e.slots.iter().copied()).collect();
    format!(
        "{} primaries, {} slots ({})",
        primaries.len(),
        slots.len(),
        format_slots(&slots)
    )
}
