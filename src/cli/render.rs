use serde::Serialize;

use crate::prelude::*;
use crate::snapshot::{Pid, ProcessRecord, Snapshot};
use crate::tree::ProcessTree;

const ARGS_PREVIEW_LIMIT: usize = 100;

#[derive(Serialize)]
struct ProcessRow<'a> {
    pid: Pid,
    parent_pid: Option<Pid>,
    name: Option<&'a str>,
    arguments: &'a [String],
}

pub fn render(tree: &ProcessTree, root: Option<Pid>, json: bool) -> Result<()> {
    let snapshot = tree.snapshot();
    let records = selected_records(snapshot, root)?;

    if json {
        let rows: Vec<ProcessRow> = records
            .iter()
            .map(|record| ProcessRow {
                pid: record.pid(),
                parent_pid: record.parent_pid(),
                name: record.name(),
                arguments: record.arguments(),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    match root {
        Some(pid) => print_subtree(snapshot, pid, 0),
        None => {
            // roots are the records whose parent is unknown or outside the
            // snapshot
            let roots: Vec<&ProcessRecord> = snapshot
                .iter()
                .filter(|record| snapshot.parent_of(record.pid()).is_none())
                .sorted_by_key(|record| record.pid())
                .collect();
            for record in roots {
                print_subtree(snapshot, record.pid(), 0);
            }
        }
    }
    Ok(())
}

fn selected_records<'a>(
    snapshot: &'a Snapshot,
    root: Option<Pid>,
) -> Result<Vec<&'a ProcessRecord>> {
    match root {
        Some(pid) => {
            let record = snapshot
                .get(pid)
                .ok_or_else(|| anyhow!("pid {pid} is not in the current process table"))?;
            let mut records = vec![record];
            records.extend(snapshot.descendants(pid));
            Ok(records)
        }
        None => Ok(snapshot.iter().collect()),
    }
}

fn print_subtree(snapshot: &Snapshot, pid: Pid, depth: usize) {
    let Some(record) = snapshot.get(pid) else {
        return;
    };
    println!(
        "{:indent$}{} {} {}",
        "",
        record.pid(),
        record.name().unwrap_or("?"),
        args_preview(record.arguments()),
        indent = depth * 2
    );
    for child in snapshot.children(pid) {
        print_subtree(snapshot, child.pid(), depth + 1);
    }
}

fn args_preview(arguments: &[String]) -> String {
    let mut preview = arguments.join(" ");
    if preview.len() > ARGS_PREVIEW_LIMIT {
        preview.truncate(
            (0..=ARGS_PREVIEW_LIMIT)
                .rev()
                .find(|&i| preview.is_char_boundary(i))
                .unwrap_or(0),
        );
        preview.push('…');
    }
    preview
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_preview_truncates_long_command_lines() {
        let short = vec!["prog".to_string(), "-v".to_string()];
        assert_eq!(args_preview(&short), "prog -v");

        let long = vec!["x".repeat(400)];
        let preview = args_preview(&long);
        assert!(preview.chars().count() <= ARGS_PREVIEW_LIMIT + 1);
        assert!(preview.ends_with('…'));
    }
}
