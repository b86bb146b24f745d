use std::{path::PathBuf, process, time::Duration};

use clap::Parser;
use log::debug;
use site_cloner::{
    driver::DriverOptions,
    listener::DEFAULT_WRITE_CONCURRENCY,
    runner::{Runner, RunnerOptions},
    types::ToolResult,
};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Capture a rendered web page and its assets for offline use", long_about = None)]
struct Args {
    /// Page to capture
    url: String,
    /// Directory the capture is written to
    output_dir: PathBuf,
    /// Remove the output directory before capturing
    #[arg(long)]
    clean: bool,
    /// Skip zipping the output directory
    #[arg(long)]
    no_archive: bool,
    /// Print the result as a JSON tool result
    #[arg(long)]
    json: bool,
    /// Browser viewport width
    #[arg(long, default_value_t = 1920)]
    width: u32,
    /// Browser viewport height
    #[arg(long, default_value_t = 1080)]
    height: u32,
    /// Maximum time in seconds for the page to reach network idle
    #[arg(long, default_value_t = 120)]
    navigation_timeout: u64,
    /// Quiet time in milliseconds after which the network counts as idle
    #[arg(long, default_value_t = 500)]
    network_idle_ms: u64,
    /// Maximum time in seconds for the whole capture
    #[arg(long, default_value_t = 300)]
    session_timeout: u64,
    /// Time in milliseconds to wait after scrolling for late requests
    #[arg(long, default_value_t = 1500)]
    settle_ms: u64,
    /// Pixels scrolled per step
    #[arg(long, default_value_t = 500)]
    scroll_step: u32,
    /// Time in milliseconds between scroll steps
    #[arg(long, default_value_t = 200)]
    scroll_delay_ms: u64,
    /// Number of assets written to disk concurrently
    #[arg(short = 'c', long, default_value_t = DEFAULT_WRITE_CONCURRENCY)]
    concurrency: usize,
    /// Chrome binary to use instead of $CHROME or the default install
    #[arg(long)]
    chrome_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();
    debug!("Starting capture with {:#?}", args.clone());

    let driver = DriverOptions::default_builder()
        .viewport((args.width, args.height))
        .navigation_timeout(Duration::from_secs(args.navigation_timeout))
        .session_timeout(Duration::from_secs(args.session_timeout))
        .network_idle(Duration::from_millis(args.network_idle_ms))
        .settle_delay(Duration::from_millis(args.settle_ms))
        .scroll_step(args.scroll_step)
        .scroll_delay(Duration::from_millis(args.scroll_delay_ms))
        .write_concurrency(args.concurrency)
        .build()?;

    let options = RunnerOptions::default_builder()
        .output_dir(args.output_dir)
        .clean(args.clean)
        .with_archive(!args.no_archive)
        .chrome_path(args.chrome_path)
        .driver(driver)
        .build()?;

    let runner = Runner::new(options)?;

    match runner.run(&args.url).await {
        Ok(outcome) => {
            if args.json {
                println!("{}", serde_json::to_string_pretty(&outcome.tool_result())?);
            } else {
                println!("{}", outcome.summary());
            }
            Ok(())
        }
        Err(e) => {
            if args.json {
                println!("{}", serde_json::to_string_pretty(&ToolResult::from(&e))?);
            } else {
                eprintln!("{}", e);
            }
            process::exit(1);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn output_dir_is_required() {
        assert!(Args::try_parse_from(["site-cloner", "https://example.com/"]).is_err());
        let args =
            Args::try_parse_from(["site-cloner", "https://example.com/", "out"]).unwrap();
        assert_eq!(args.output_dir, PathBuf::from("out"));
        assert_eq!(args.network_idle_ms, 500);
    }
}
