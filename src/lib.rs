pub mod commands;
pub mod config;
pub mod consolidator;
pub mod data_service;
pub mod error;
pub mod models;
pub mod name_filter;
pub mod normalizer;
pub mod parser;
pub mod pipeline;
pub mod pool;
pub mod rules;
pub mod variants;

use std::process::ExitCode;

use commands::{execute, parse_args, print_usage};

fn init_logger(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .try_init();
}

pub fn run() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let cli = match parse_args(&args) {
        Ok(cli) => cli,
        Err(err) => {
            init_logger(false);
            log::error!("{:#}", err);
            print_usage();
            return ExitCode::from(2);
        }
    };

    init_logger(cli.verbose);
    match execute(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{:#}", err);
            ExitCode::FAILURE
        }
    }
}
