pub mod db;
pub mod extract;
pub mod parse;
pub mod report;
pub mod status;
