use agentflow::cli;
use agentflow::shared::logging::init_logging;

fn run() -> Result<(), String> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (level, format) = cli::log_preferences(&args);
    init_logging(&level, format);
    let output = cli::run_cli(args)?;
    println!("{output}");
    Ok(())
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{err}");
        std::process::exit(1);
    }
}
