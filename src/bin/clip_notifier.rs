//! clip_notifier - sends finished clips to Telegram
//!
//! Watches the clipwatchd output directory, sends each published clip with a
//! timestamped caption, and deletes it once the Bot API accepts it. Clips that
//! fail to send stay on disk and are retried on the next poll.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use clipwatch::{
    deliver::{telegram_sink, DEFAULT_API_BASE},
    DirectoryWatcher, StopSignal,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Deliver clipwatch clips to a Telegram chat")]
struct Args {
    /// Directory clipwatchd publishes clips into.
    #[arg(long, env = "CLIPWATCH_OUTPUT_DIR", default_value = "videos")]
    watch_dir: PathBuf,

    /// Bot API token.
    #[arg(long, env = "TELEGRAM_TOKEN", hide_env_values = true)]
    telegram_token: Option<String>,

    /// Destination chat.
    #[arg(long, env = "TELEGRAM_CHAT_ID")]
    chat_id: Option<String>,

    /// Poll interval in milliseconds.
    #[arg(long, default_value_t = 1000)]
    poll_ms: u64,

    /// Bot API base URL.
    #[arg(long, default_value = DEFAULT_API_BASE)]
    api_base: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let sink = telegram_sink(args.telegram_token, args.chat_id, &args.api_base);
    let mut watcher = DirectoryWatcher::new(args.watch_dir, sink)?;

    let stop = StopSignal::new();
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || {
        handler_stop.trigger();
    })
    .expect("error setting Ctrl-C handler");

    watcher.run(&stop, Duration::from_millis(args.poll_ms.max(1)))
}
