use webserv::prelude::*;
use webserv::{AppConfig, PageCache, Server};

use env_logger::{Builder, Env, Target};
use std::process::ExitCode;

const DEFAULT_CONFIG: &str = "./config_files/default.json";

/// Entry point. With no arguments the default config file is used; the first
/// optional argument is the config file and the second a log output file.
fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e @ FatalError::Usage) => {
            println!("{}", e);
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("Error caught at main: {}", e);
            eprintln!("Exiting");
            ExitCode::FAILURE
        }
    }
}

fn run(args: &[String]) -> Result<()> {
    if args.len() > 3 {
        return Err(FatalError::Usage);
    }

    init_logger(args.get(2).map(String::as_str));

    let config_file = match args.get(1) {
        Some(path) => path.as_str(),
        None => {
            println!("No config file provided, using default: {}", DEFAULT_CONFIG);
            DEFAULT_CONFIG
        }
    };

    let config = AppConfig::load(config_file)?;

    let mut pages = PageCache::new();
    pages.load_defaults();

    let mut server = Server::new(&config, pages)?;
    server.run()
}

fn init_logger(log_file: Option<&str>) {
    let mut builder = Builder::from_env(Env::default().default_filter_or("info"));

    match log_file.map(File::create) {
        Some(Ok(file)) => {
            builder.target(Target::Pipe(Box::new(file)));
        }
        Some(Err(_)) => {
            eprintln!("Failed to set output file, logging to standard output instead");
        }
        None => {}
    }

    builder.init();
}
