use hreflex_closed_loop::config::{load_config, Config};
use hreflex_closed_loop::local::{client, server};
use hreflex_closed_loop::processing::stages::StageSelector;

use colored::Colorize;
use env_logger::Env;
use std::error::Error;

const USAGE: &str = "Usage:\n  main client <subject_id> <s0a|s0b|s1|s2|s3> [config.yaml]\n  main server [config.yaml] [signals.csv]";

fn config_from(path: Option<&String>) -> Result<Config, String> {
    match path {
        Some(path) => load_config(path),
        None => Ok(Config::default()),
    }
}

fn run(args: &[String]) -> Result<(), Box<dyn Error>> {
    match args.get(1).map(String::as_str) {
        Some("client") => {
            let (Some(subject_id), Some(stage)) = (args.get(2), args.get(3)) else {
                return Err(USAGE.into());
            };
            let selector: StageSelector = stage.parse()?;
            let config = config_from(args.get(4))?;
            client::run(subject_id, selector, config)
        }
        Some("server") => {
            let config = config_from(args.get(2))?;
            server::run(&config, args.get(3).map(String::as_str))
        }
        _ => Err(USAGE.into()),
    }
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    if let Err(e) = run(&args) {
        eprintln!("{}", e.to_string().red());
        std::process::exit(1);
    }
}
