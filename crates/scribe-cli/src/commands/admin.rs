use anyhow::Result;
use scribe_core::AppConfig;
use serde_json::json;
use std::path::Path;

use crate::ConfigCmd;
use crate::output::*;

pub(crate) fn run_config(cwd: &Path, cmd: ConfigCmd, json_mode: bool) -> Result<()> {
    let cfg = AppConfig::ensure(cwd)?;

    match cmd {
        ConfigCmd::Show => {
            let display_cfg = redact_config_for_display(&cfg)?;
            if json_mode {
                print_json(&display_cfg)?;
            } else {
                println!("{}", serde_json::to_string_pretty(&display_cfg)?);
            }
        }
        ConfigCmd::Path => {
            let user = AppConfig::user_settings_path();
            let project = AppConfig::project_settings_path(cwd);
            let local = AppConfig::project_local_settings_path(cwd);
            if json_mode {
                print_json(&json!({
                    "user": user,
                    "project": project,
                    "project_local": local,
                }))?;
            } else {
                if let Some(user) = user {
                    println!("user:          {}", user.display());
                }
                println!("project:       {}", project.display());
                println!("project local: {}", local.display());
            }
        }
    }
    Ok(())
}
