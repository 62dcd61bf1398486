pub mod clean;
pub mod jwt;
