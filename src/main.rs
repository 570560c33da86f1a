use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;

use structopt::StructOpt;
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use promcheck::config::{configure, CheckDefaults, CheckFile};
use promcheck::model::Submission;
use promcheck::scraper::{OpenMetricsScraper, ScrapeWorker};

#[derive(StructOpt, Debug)]
pub struct Command {
    /// Check file with `init_config` and `instances`.
    #[structopt(short, long, parse(from_os_str))]
    pub config: PathBuf,
    /// Scrape every instance once, print what would be submitted and exit.
    #[structopt(long)]
    pub once: bool,
}

/// Slots preallocated by the broadcast channel. The writer drains it
/// continuously, so it only absorbs the burst of a single scrape pass.
const QUEUE_CAPACITY: usize = 16 * 1024;
const FLUSH_INTERVAL: tokio::time::Duration = tokio::time::Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(filter)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    // parse the command line args
    let opt: Command = Command::from_args();

    let check = CheckFile::load_from_file(&opt.config)?;
    let defaults = CheckDefaults::from(check.init_config);

    let mut scrapers = Vec::with_capacity(check.instances.len());
    for instance in &check.instances {
        let config = configure(instance, &defaults)?;
        scrapers.push(OpenMetricsScraper::new(config)?);
    }
    tracing::info!(
        "loaded {} instance(s) from {}",
        scrapers.len(),
        opt.config.display()
    );

    if opt.once {
        let stdout = std::io::stdout();
        for mut scraper in scrapers {
            if !scraper.config().label_joins.is_empty() {
                tracing::warn!(
                    "{} has label joins, a single scrape only fills the join cache",
                    scraper.config().endpoint
                );
            }
            let mut sink: Vec<Submission> = Vec::new();
            if let Err(e) = scraper.process(&mut sink).await {
                tracing::error!("{:?}", e);
            }
            let mut out = stdout.lock();
            for submission in sink {
                writeln!(out, "{}", submission)?;
            }
        }
        return Ok(());
    }

    let (tx, mut rx) = broadcast::channel(QUEUE_CAPACITY);

    // workers stop when dropped
    let _workers: Vec<ScrapeWorker> = scrapers
        .into_iter()
        .map(|scraper| ScrapeWorker::new(scraper, tx.clone()))
        .collect();

    let mut interval =
        tokio::time::interval_at(tokio::time::Instant::now() + FLUSH_INTERVAL, FLUSH_INTERVAL);

    let mut buf = VecDeque::<Submission>::new();
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if buf.is_empty() {
                    continue;
                }

                let count = buf.len();
                let stdout = std::io::stdout();
                let mut out = stdout.lock();
                for submission in buf.drain(..) {
                    writeln!(out, "{}", submission)?;
                }

                tracing::info!("flushed {} submissions", count);
            }
            received = rx.recv() => match received {
                Ok(submission) => buf.push_back(submission),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("output lagging behind, dropped {} submissions", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    Ok(())
}
