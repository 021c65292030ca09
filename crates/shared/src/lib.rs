pub mod assist;
pub mod domain;
pub mod error;
pub mod time;
