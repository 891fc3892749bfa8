pub mod date_normalization;
pub mod status_emit;
