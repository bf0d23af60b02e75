mod fs;
mod plurals;

pub use fs::write_json_atomic;
pub use plurals::counted;
