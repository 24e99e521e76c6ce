use anyhow::Result;
use scribe_core::AppConfig;
use serde::Serialize;
use serde_json::json;

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

pub(crate) fn redact_config_for_display(cfg: &AppConfig) -> Result<serde_json::Value> {
    let mut value = serde_json::to_value(cfg)?;
    if let Some(llm) = value.get_mut("llm").and_then(|entry| entry.as_object_mut())
        && llm.get("api_key").is_some_and(|key| !key.is_null())
    {
        llm.insert("api_key".to_string(), json!("***REDACTED***"));
    }
    Ok(value)
}

/// Human size, bytes below 1 KiB.
pub(crate) fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else {
        format!("{:.1} KiB", bytes as f64 / 1024.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_is_redacted_only_when_set() {
        let mut cfg = AppConfig::default();
        let shown = redact_config_for_display(&cfg).expect("value");
        assert!(shown["llm"]["api_key"].is_null());

        cfg.llm.api_key = Some("sk-secret".to_string());
        let shown = redact_config_for_display(&cfg).expect("value");
        assert_eq!(shown["llm"]["api_key"], "***REDACTED***");
    }

    #[test]
    fn sizes_switch_units_at_one_kib() {
        assert_eq!(format_size(12), "12 B");
        assert_eq!(format_size(2048), "2.0 KiB");
    }
}
