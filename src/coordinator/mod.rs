pub mod poll;
pub mod registry;
