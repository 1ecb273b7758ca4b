pub mod claude;
pub mod json_schema;
