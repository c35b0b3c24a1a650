pub mod remote_write_models;
pub mod remote_write_parser;

pub use remote_write_parser::{parse_remote_write_request, to_incoming_series};
