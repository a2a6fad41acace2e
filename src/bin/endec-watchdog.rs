use std::sync::Arc;
use std::time::Duration;

use chrono_tz::Tz;
use clap::Parser;
use colored::Colorize;
use endec_relay::broker::{Broker, Route};
use endec_relay::error::{RelayError, Result};
use endec_relay::logging;
use endec_relay::sink::{http_client, DiscordNotifier};
use endec_relay::{NatsBroker, NatsConfig, RetryPolicy, Watchdog, WatchdogConfig};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(
    name = "endec-watchdog",
    version,
    about = "Alert on Discord when ENDEC relay heartbeats stop arriving"
)]
struct Cli {
    #[arg(long, env = "NATS_URL", default_value = "nats://127.0.0.1:4222")]
    nats_url: String,

    #[arg(long, env = "NATS_TOKEN", hide_env_values = true)]
    nats_token: Option<String>,

    /// Durable queue the watchdog consumes from
    #[arg(long, env = "HEALTH_CHECK_QUEUE", default_value = "health_checks")]
    queue: String,

    #[arg(long, env = "HEALTHCHECK_EXCHANGE", default_value = "healthcheck")]
    exchange: String,

    #[arg(long, env = "HEALTHCHECK_ROUTING_KEY", default_value = "health.wbor-endec")]
    routing_key: String,

    #[arg(long, env = "DISCORD_WEBHOOK_URL", hide_env_values = true)]
    discord_webhook_url: String,

    /// Seconds between timeout checks
    #[arg(long, env = "CHECK_INTERVAL_SECONDS", default_value_t = 300)]
    check_interval_seconds: u64,

    /// Silence longer than this raises an alert
    #[arg(long, env = "TIMEOUT_THRESHOLD_SECONDS", default_value_t = 600)]
    timeout_threshold_seconds: u64,

    /// Zone used for times in notices and logs
    #[arg(
        long,
        env = "TIMEZONE",
        default_value = "America/New_York",
        value_parser = parse_timezone
    )]
    timezone: Tz,

    /// Enable debug logging
    #[arg(short = 'd', long)]
    debug: bool,
}

impl Cli {
    /// Application name taken from the routing key (`health.<app>`)
    fn application(&self) -> &str {
        self.routing_key
            .strip_prefix("health.")
            .unwrap_or(&self.routing_key)
    }

    fn watchdog_config(&self) -> WatchdogConfig {
        WatchdogConfig {
            application: self.application().to_string(),
            route: Route::new(self.exchange.clone(), self.routing_key.clone()),
            queue: self.queue.clone(),
            check_interval: Duration::from_secs(self.check_interval_seconds),
            timeout_threshold: Duration::from_secs(self.timeout_threshold_seconds),
            notify_retry: RetryPolicy::default(),
            timezone: self.timezone,
            ..Default::default()
        }
    }
}

fn parse_timezone(name: &str) -> std::result::Result<Tz, String> {
    name.parse::<Tz>()
        .map_err(|e| format!("unknown timezone '{name}': {e}"))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("{} {e}", "[endec]".red().bold());
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    logging::init(logging::level(cli.debug, "info"), None)?;

    if cli.check_interval_seconds == 0 {
        return Err(RelayError::Config("CHECK_INTERVAL_SECONDS must be positive".into()));
    }
    reqwest::Url::parse(&cli.discord_webhook_url)
        .map_err(|e| RelayError::Config(format!("invalid DISCORD_WEBHOOK_URL: {e}")))?;

    let config = cli.watchdog_config();
    let broker = NatsBroker::connect(NatsConfig {
        url: cli.nats_url.clone(),
        token: cli.nats_token.clone(),
        ..Default::default()
    })
    .await?;
    let broker: Arc<dyn Broker> = Arc::new(broker);

    let notifier = Arc::new(
        DiscordNotifier::new(
            http_client(Duration::from_secs(30))?,
            cli.discord_webhook_url.clone(),
            config.application.clone(),
        )
        .with_timezone(config.timezone),
    );

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutdown requested");
            shutdown.cancel();
        });
    }

    let mut watchdog = Watchdog::new(config, notifier);
    watchdog.run(broker, shutdown).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_flags() {
        let cli = Cli::try_parse_from([
            "endec-watchdog",
            "--discord-webhook-url",
            "https://discord.test/api/webhooks/1/x",
            "--routing-key",
            "health.studio-a",
            "--timeout-threshold-seconds",
            "120",
        ])
        .unwrap();
        let config = cli.watchdog_config();

        assert_eq!(config.application, "studio-a");
        assert_eq!(config.route.routing_key, "health.studio-a");
        assert_eq!(config.timeout_threshold, Duration::from_secs(120));
        assert_eq!(config.timezone, chrono_tz::America::New_York);
    }

    #[test]
    fn test_timezone_flag() {
        let cli = Cli::try_parse_from([
            "endec-watchdog",
            "--discord-webhook-url",
            "https://discord.test/api/webhooks/1/x",
            "--timezone",
            "America/Chicago",
        ])
        .unwrap();
        assert_eq!(cli.watchdog_config().timezone, chrono_tz::America::Chicago);

        assert!(Cli::try_parse_from([
            "endec-watchdog",
            "--discord-webhook-url",
            "https://discord.test/api/webhooks/1/x",
            "--timezone",
            "Mars/Olympus_Mons",
        ])
        .is_err());
    }
}
