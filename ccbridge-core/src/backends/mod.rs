pub mod anthropic;
pub mod cli;
