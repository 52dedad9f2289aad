use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod features;
mod recommend;

#[derive(Debug, Parser)]
#[command(name = "bidfee_worker")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Recommend fees for one record or an array of records read from a JSON file.
    Recommend {
        #[arg(long)]
        input: PathBuf,

        /// Artifact bundle. Defaults to ARTIFACTS_PATH.
        #[arg(long)]
        artifacts: Option<PathBuf>,

        #[arg(long)]
        range_fraction: Option<f64>,

        #[arg(long)]
        steps: Option<usize>,

        /// Write each recommendation to the database.
        #[arg(long)]
        persist: bool,
    },

    /// Enrich historical bids with calendar, rolling, lag and external features.
    BuildFeatures {
        #[arg(long)]
        data_path: PathBuf,

        #[arg(long)]
        output: PathBuf,

        #[arg(long, default_value = bidfee_core::timeseries::DEFAULT_DATE_COLUMN)]
        date_column: String,

        #[arg(long = "group-key")]
        group_keys: Vec<String>,

        #[arg(long = "target")]
        targets: Vec<String>,

        #[arg(long = "window")]
        windows: Vec<usize>,

        #[arg(long = "lag")]
        lags: Vec<usize>,

        #[arg(long)]
        win_column: Option<String>,

        /// Skip rolling win rates even if the win column exists.
        #[arg(long)]
        no_win_rate: bool,

        #[arg(long = "fred-series")]
        fred_series: Vec<String>,

        /// Series cache consulted before the FRED API and refreshed after fetching.
        #[arg(long)]
        fred_cache: Option<PathBuf>,
    },

    /// Fetch FRED series into a local cache file.
    FetchSeries {
        #[arg(long = "series", required = true)]
        series: Vec<String>,

        #[arg(long)]
        cache: PathBuf,

        /// YYYY-MM-DD
        #[arg(long)]
        start: Option<String>,

        /// YYYY-MM-DD
        #[arg(long)]
        end: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let settings = bidfee_core::config::Settings::from_env()?;
    let _sentry_guard = init_sentry(&settings);

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_tracing::layer())
        .init();

    let args = Args::parse();

    let res = run(args.command, &settings).await;
    if let Err(err) = &res {
        sentry_anyhow::capture_anyhow(err);
        tracing::error!(error = %err, "worker run failed");
    }
    res
}

async fn run(command: Command, settings: &bidfee_core::config::Settings) -> anyhow::Result<()> {
    match command {
        Command::Recommend {
            input,
            artifacts,
            range_fraction,
            steps,
            persist,
        } => {
            let mut optimizer = bidfee_core::config::OptimizerSettings::from_env()?;
            if let Some(r) = range_fraction {
                optimizer.grid.range_fraction = r;
            }
            if let Some(n) = steps {
                optimizer.grid.steps = n;
            }
            let artifacts_path =
                artifacts.unwrap_or_else(|| PathBuf::from(&settings.artifacts_path));

            let pool = if persist {
                let db_url = settings.require_database_url()?;
                let pool = sqlx::postgres::PgPoolOptions::new()
                    .max_connections(5)
                    .connect(db_url)
                    .await
                    .context("connect DATABASE_URL failed")?;
                bidfee_core::storage::migrate(&pool).await?;
                Some(pool)
            } else {
                None
            };

            let outcomes =
                recommend::run(&input, &artifacts_path, &optimizer, pool.as_ref()).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&outcomes).context("serialize output failed")?
            );
            Ok(())
        }
        Command::BuildFeatures {
            data_path,
            output,
            date_column,
            group_keys,
            targets,
            windows,
            lags,
            win_column,
            no_win_rate,
            fred_series,
            fred_cache,
        } => {
            let builder = features::builder_from_args(
                group_keys,
                targets,
                windows,
                lags,
                win_column,
                no_win_rate,
            );
            let opts = features::BuildOptions {
                data_path,
                output,
                date_column,
                fred_series,
                fred_cache,
            };
            features::build_features(&opts, &builder, settings).await
        }
        Command::FetchSeries {
            series,
            cache,
            start,
            end,
        } => {
            let start = start.as_deref().map(parse_date).transpose()?;
            let end = end.as_deref().map(parse_date).transpose()?;
            features::fetch_series(settings, &series, &cache, start, end).await
        }
    }
}

fn parse_date(s: &str) -> anyhow::Result<chrono::NaiveDate> {
    chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| format!("invalid date: {s}"))
}

fn init_sentry(settings: &bidfee_core::config::Settings) -> Option<sentry::ClientInitGuard> {
    let dsn = settings.sentry_dsn.as_deref()?;
    Some(sentry::init((
        dsn,
        sentry::ClientOptions {
            release: sentry::release_name!(),
            ..Default::default()
        },
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_repeated_build_options() {
        let args = Args::try_parse_from([
            "bidfee_worker",
            "build-features",
            "--data-path",
            "bids.json",
            "--output",
            "out.json",
            "--window",
            "7",
            "--window",
            "30",
            "--fred-series",
            "UNRATE",
        ])
        .unwrap();

        match args.command {
            Command::BuildFeatures {
                windows,
                fred_series,
                date_column,
                ..
            } => {
                assert_eq!(windows, vec![7, 30]);
                assert_eq!(fred_series, vec!["UNRATE"]);
                assert_eq!(date_column, "BidDate");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn fetch_series_requires_a_series() {
        let res = Args::try_parse_from(["bidfee_worker", "fetch-series", "--cache", "c.json"]);
        assert!(res.is_err());
    }

    #[test]
    fn rejects_malformed_dates() {
        assert!(parse_date("2024-13-01").is_err());
        assert_eq!(
            parse_date("2024-02-29").unwrap(),
            chrono::NaiveDate::from_ymd_opt(2024, 2, 29).unwrap()
        );
    }
}
