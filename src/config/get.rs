use anyhow::{bail, Result};
use serde_json::json;

use super::Layers;
use crate::args::BaseArgs;

pub fn run(base: &BaseArgs, key: &str, layers: &Layers) -> Result<()> {
    let Some((value, source)) = layers.lookup(key) else {
        bail!("{key} is not set");
    };

    if base.json {
        let origin = layers.path(source);
        println!(
            "{}",
            json!({ "key": key, "value": value, "source": source, "path": origin })
        );
    } else {
        println!("{value}");
    }
    Ok(())
}
