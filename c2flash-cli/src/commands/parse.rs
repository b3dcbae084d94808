//! Offline HEX image inspection.

use anyhow::{Context, Result};
use c2flash::{HexImage, RecordType};
use console::style;
use std::path::PathBuf;

use crate::Cli;

fn record_type_str(record_type: RecordType) -> String {
    match record_type {
        RecordType::Data => "data".into(),
        RecordType::EndOfFile => "eof".into(),
        RecordType::ExtendedSegmentAddress => "ext-segment".into(),
        RecordType::StartSegmentAddress => "start-segment".into(),
        RecordType::ExtendedLinearAddress => "ext-linear".into(),
        RecordType::StartLinearAddress => "start-linear".into(),
        RecordType::Other(t) => format!("0x{t:02X}"),
    }
}

fn to_json(image: &HexImage) -> serde_json::Value {
    let records: Vec<_> = image
        .records()
        .iter()
        .map(|r| {
            serde_json::json!({
                "line": r.line,
                "address": r.address,
                "type": record_type_str(r.record_type),
                "byte_count": r.byte_count,
                "payload": r.is_payload(),
            })
        })
        .collect();
    let errors: Vec<_> = image
        .errors()
        .iter()
        .map(|e| serde_json::json!({ "line": e.line, "reason": e.reason }))
        .collect();
    serde_json::json!({
        "valid": image.is_valid(),
        "payload_records": image.data_records().count(),
        "payload_bytes": image.data_len(),
        "records": records,
        "errors": errors,
    })
}

/// `parse`: list records and malformed lines of an image.
///
/// Fails when the image has malformed lines, after reporting them.
pub(crate) fn cmd_parse(cli: &Cli, hex: &PathBuf, json: bool) -> Result<()> {
    let image = HexImage::from_file(hex)
        .with_context(|| format!("Failed to read {}", hex.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&to_json(&image))?);
    } else {
        if !cli.quiet {
            for r in image.records() {
                println!(
                    "{:>5}  {:<13} @ 0x{:04X}  {:>3} byte(s)",
                    r.line,
                    record_type_str(r.record_type),
                    r.address,
                    r.byte_count
                );
            }
        }
        for e in image.errors() {
            eprintln!("{} {e}", style("✗").red());
        }
        println!(
            "{} payload record(s), {} bytes",
            image.data_records().count(),
            image.data_len()
        );
    }

    image.into_valid()?;
    Ok(())
}
