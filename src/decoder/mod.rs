pub mod domain;
pub mod logic;
pub mod profile;
