//! Tables command implementation.

use crate::schema::{BuiltinSchema, TableTranslator};
use anyhow::Result;
use clap::Args;
use std::sync::Arc;

/// Print the table numbering a protocol version uses.
#[derive(Args, Debug)]
pub struct TablesArgs {
    /// Protocol version; suffixed versions resolve to their base version.
    #[arg(long = "version")]
    pub protocol_version: String,

    /// Output format (text, json).
    #[arg(long, default_value = "text")]
    pub format: String,
}

/// Run the tables command.
pub fn run_tables(args: TablesArgs) -> Result<()> {
    println!("{}", render_tables(&args.protocol_version, &args.format)?);
    Ok(())
}

/// Render the ordinal → table listing for `version`.
pub fn render_tables(version: &str, format: &str) -> Result<String> {
    let translator = TableTranslator::new(Arc::new(BuiltinSchema::new()));
    let negotiated = translator.negotiate(version)?;
    let map = translator.map_for(&negotiated.name);

    match format {
        "json" => {
            let tables: Vec<_> = map
                .tables()
                .iter()
                .enumerate()
                .map(|(ordinal, table)| {
                    serde_json::json!({ "ordinal": ordinal, "table": table.name() })
                })
                .collect();
            Ok(serde_json::to_string_pretty(&serde_json::json!({
                "version": negotiated.name,
                "tables": tables,
            }))?)
        }
        "text" => {
            let mut out = format!("protocol {} ({} tables)\n", negotiated.name, map.len());
            for (ordinal, table) in map.tables().iter().enumerate() {
                out.push_str(&format!("{:>4}  {}\n", ordinal, table.name()));
            }
            Ok(out)
        }
        other => anyhow::bail!("unknown format {}, expected text or json", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_tables_for_suffixed_version() {
        let out = render_tables("1.83.0-SNAPSHOT", "text").unwrap();
        assert!(out.starts_with("protocol 1.83.0 "));
        assert!(out.contains("   0  "));
    }

    #[test]
    fn json_listing_names_version() {
        let out = render_tables("1.30", "json").unwrap();
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["version"], "1.30");
        assert!(!value["tables"].as_array().unwrap().is_empty());
    }

    #[test]
    fn unsupported_version_fails() {
        assert!(render_tables("0.9", "text").is_err());
    }
}
