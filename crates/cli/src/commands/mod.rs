pub mod check_config;
pub mod pricing;
pub mod simulate;
