pub mod detector;
pub mod engine_config;
pub mod regressors;
