pub mod mapping;

pub use mapping::{map_schema, map_type};
