use anyhow::Result;
use scribe_core::{AppConfig, TemplateHint};
use scribe_store::{FileNode, NodeKind, WriteIntent};
use std::io::Read;
use std::path::Path;

use crate::context::*;
use crate::output::*;
use crate::{CreateArgs, LogsArgs, PathArg, WriteArgs};

pub(crate) fn run_files(cwd: &Path, json_mode: bool) -> Result<()> {
    let cfg = AppConfig::load(cwd)?;
    let tree = open_store(cwd, &cfg)?.list_files()?;
    if json_mode {
        print_json(&tree)?;
        return Ok(());
    }
    if tree.is_empty() {
        println!("No files.");
        return Ok(());
    }
    print_tree(&tree, 0);
    Ok(())
}

pub(crate) fn print_tree(nodes: &[FileNode], depth: usize) {
    let indent = "  ".repeat(depth);
    for node in nodes {
        match node.kind {
            NodeKind::Directory => {
                println!("{indent}📁 {}/", node.name);
                print_tree(&node.children, depth + 1);
            }
            NodeKind::File => println!(
                "{indent}📄 {} ({})",
                node.name,
                format_size(node.size.unwrap_or(0))
            ),
        }
    }
}

pub(crate) fn run_read(cwd: &Path, args: PathArg, json_mode: bool) -> Result<()> {
    let cfg = AppConfig::load(cwd)?;
    let file = open_store(cwd, &cfg)?.read_file(&args.path)?;
    if json_mode {
        print_json(&file)?;
    } else {
        print!("{}", file.content);
    }
    Ok(())
}

pub(crate) fn run_write(cwd: &Path, args: WriteArgs, json_mode: bool) -> Result<()> {
    let content = match args.content {
        Some(content) => content,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    let intent = if args.new {
        WriteIntent::Create
    } else {
        WriteIntent::Modify
    };
    let cfg = AppConfig::load(cwd)?;
    let written = open_store(cwd, &cfg)?.write_file(&args.path, &content, intent)?;
    if json_mode {
        print_json(&written)?;
    } else {
        println!(
            "{} {} ({})",
            written.logged_action.as_str(),
            written.path,
            format_size(written.size)
        );
    }
    Ok(())
}

pub(crate) fn run_create(cwd: &Path, args: CreateArgs, json_mode: bool) -> Result<()> {
    let name = args.template.as_deref().unwrap_or("blank");
    let template = TemplateHint::from_name_or_blank(name);
    if TemplateHint::from_name(name).is_none() {
        let known: Vec<&str> = TemplateHint::ALL.iter().map(TemplateHint::as_str).collect();
        eprintln!(
            "warning: unknown template `{name}` (known: {}), creating an empty file",
            known.join(", ")
        );
    }
    let cfg = AppConfig::load(cwd)?;
    let created = open_store(cwd, &cfg)?.create_file(&args.path, template)?;
    if json_mode {
        print_json(&created)?;
    } else {
        println!(
            "created {} from template {} ({})",
            created.path,
            created.template,
            format_size(created.size)
        );
    }
    Ok(())
}

pub(crate) fn run_logs(cwd: &Path, args: LogsArgs, json_mode: bool) -> Result<()> {
    let cfg = AppConfig::load(cwd)?;
    let entries = open_store(cwd, &cfg)?.fetch_logs(args.path.as_deref())?;
    if json_mode {
        print_json(&entries)?;
        return Ok(());
    }
    if entries.is_empty() {
        println!("No log entries.");
        return Ok(());
    }
    for entry in entries {
        let mut line = format!(
            "{} {:<6} {} size={}",
            entry.timestamp,
            entry.action.as_str(),
            entry.path,
            entry.size_after
        );
        if let Some(before) = entry.size_before {
            line.push_str(&format!(" (was {before})"));
        }
        if let Some(diff) = &entry.diff {
            line.push_str(&format!(
                " lines {}→{} changes={}",
                diff.lines_before,
                diff.lines_after,
                diff.changes.len()
            ));
        }
        println!("{line}");
    }
    Ok(())
}
