use std::path::Path;

use anyhow::Result;
use comfy_table::Cell;
use serde_json::{Map, Value};

use super::{Layers, Source, KNOWN_KEYS};
use crate::args::BaseArgs;
use crate::ui::styled_table;

struct Entry {
    key: &'static str,
    value: String,
    source: Source,
}

fn entries(layers: &Layers) -> Vec<Entry> {
    KNOWN_KEYS
        .iter()
        .filter_map(|&key| {
            layers
                .lookup(key)
                .map(|(value, source)| Entry { key, value, source })
        })
        .collect()
}

/// Paths under the working directory are shown relative to it.
fn display_path(path: &Path) -> String {
    std::env::current_dir()
        .ok()
        .filter(|cwd| path.starts_with(cwd))
        .and_then(|cwd| pathdiff::diff_paths(path, &cwd))
        .unwrap_or_else(|| path.to_path_buf())
        .display()
        .to_string()
}

fn origin(layers: &Layers, source: Source, by_source: bool) -> String {
    match layers.path(source) {
        Some(path) if by_source => display_path(path),
        _ => source.as_str().to_string(),
    }
}

pub fn run(base: &BaseArgs, layers: &Layers, by_source: bool) -> Result<()> {
    let entries = entries(layers);

    if base.json {
        let value = if by_source {
            let mut grouped: Map<String, Value> = Map::new();
            for entry in &entries {
                let group = grouped
                    .entry(origin(layers, entry.source, true))
                    .or_insert_with(|| Value::Object(Map::new()));
                if let Value::Object(fields) = group {
                    fields.insert(entry.key.to_string(), Value::String(entry.value.clone()));
                }
            }
            Value::Object(grouped)
        } else {
            Value::Object(
                entries
                    .iter()
                    .map(|entry| (entry.key.to_string(), Value::String(entry.value.clone())))
                    .collect(),
            )
        };
        println!("{}", serde_json::to_string(&value)?);
        return Ok(());
    }

    if entries.is_empty() {
        return Ok(());
    }
    let mut table = styled_table(&["Key", "Value", "Source"]);
    for entry in &entries {
        table.add_row(vec![
            Cell::new(entry.key),
            Cell::new(&entry.value),
            Cell::new(origin(layers, entry.source, by_source)),
        ]);
    }
    println!("{table}");
    Ok(())
}
