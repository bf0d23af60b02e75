use std::fmt::Display;

use comfy_table::{presets::NOTHING, Attribute, Cell, CellAlignment, ContentArrangement, Table};

/// Borderless, non-wrapping table with the given header and two spaces between columns.
pub fn styled_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.load_preset(NOTHING);
    table.set_content_arrangement(ContentArrangement::Disabled);
    table.set_header(headers.iter().map(|text| header(text)).collect::<Vec<_>>());
    for i in 0..table.column_count() {
        if let Some(col) = table.column_mut(i) {
            col.set_padding((0, 2));
        }
    }
    table
}

pub fn header(text: &str) -> Cell {
    Cell::new(text)
        .add_attribute(Attribute::Bold)
        .add_attribute(Attribute::Dim)
}

pub fn count_cell(value: impl Display) -> Cell {
    Cell::new(value).set_alignment(CellAlignment::Right)
}

/// Milliseconds with two decimals, right-aligned.
pub fn millis_cell(value: f64) -> Cell {
    Cell::new(format!("{value:.2}")).set_alignment(CellAlignment::Right)
}
