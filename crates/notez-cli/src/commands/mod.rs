pub mod common;
pub mod edit;
pub mod get;
pub mod image;
pub mod put;
pub mod strength;
pub mod watch;
