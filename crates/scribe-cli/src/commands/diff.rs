use anyhow::{Context, Result};
use scribe_core::AppConfig;
use scribe_diff::{audit_diff, compute_diff, diff_stats, render_unified};
use serde_json::json;
use std::fs;
use std::path::Path;

use crate::DiffArgs;
use crate::output::*;

pub(crate) fn run_diff(cwd: &Path, args: DiffArgs, json_mode: bool) -> Result<()> {
    let read = |path: &Path| {
        fs::read_to_string(cwd.join(path))
            .with_context(|| format!("failed to read {}", path.display()))
    };
    let old_text = read(args.old.as_path())?;
    let new_text = read(args.new.as_path())?;

    if args.audit {
        let cap = AppConfig::load(cwd)?.store.audit_change_cap;
        let diff = audit_diff(&old_text, &new_text, cap);
        if json_mode {
            print_json(&diff)?;
        } else {
            println!(
                "lines {} → {}, {} change(s)",
                diff.lines_before,
                diff.lines_after,
                diff.changes.len()
            );
            println!("{}", serde_json::to_string_pretty(&diff.changes)?);
        }
        return Ok(());
    }

    let entries = compute_diff(&old_text, &new_text);
    let stats = diff_stats(&entries);
    if json_mode {
        print_json(&json!({
            "stats": stats,
            "entries": entries,
        }))?;
        return Ok(());
    }
    if stats.added == 0 && stats.deleted == 0 {
        println!("No changes.");
        return Ok(());
    }
    println!("--- {}", args.old.display());
    println!("+++ {}", args.new.display());
    print!("{}", render_unified(&entries));
    println!("+{} -{}", stats.added, stats.deleted);
    Ok(())
}
