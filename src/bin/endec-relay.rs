use std::path::PathBuf;
use std::sync::Arc;

use clap::{ArgGroup, Parser};
use colored::Colorize;
use endec_relay::broker::Broker;
use endec_relay::config::{RelayConfig, Secrets};
use endec_relay::error::Result;
use endec_relay::logging::{self, DEFAULT_LOG_FILE};
use endec_relay::serial::SerialOpener;
use endec_relay::{NatsBroker, Relay};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(
    name = "endec-relay",
    version,
    about = "Relay ENDEC alert frames from a serial port to webhooks, GroupMe, Discord and NATS"
)]
#[command(group(ArgGroup::new("mode").args(["trim", "fork", "quiet"])))]
struct Cli {
    /// JSON config file
    #[arg(long)]
    config: Option<PathBuf>,

    /// JSON secrets file merged over the config
    #[arg(long)]
    secrets: Option<PathBuf>,

    /// Serial port the ENDEC is on (default /dev/ttyUSB0)
    #[arg(short = 'c', long = "com")]
    port: Option<String>,

    /// Webhook URL(s) to send to
    #[arg(short = 'w', long = "webhook", num_args = 1..)]
    webhooks: Vec<String>,

    /// GroupMe bot id(s) to post as
    #[arg(short = 'g', long = "groupme", num_args = 1..)]
    groupme: Vec<String>,

    /// Discord webhook URL(s) to post embeds to
    #[arg(long = "discord", num_args = 1..)]
    discord: Vec<String>,

    /// Enable debug logging
    #[arg(short = 'd', long)]
    debug: bool,

    /// Send only the alert code line
    #[arg(short = 't', long)]
    trim: bool,

    /// Send the human-readable text as the message and the alert line as "eas"
    #[arg(short = 'f', long)]
    fork: bool,

    /// Drop the human-readable text, send only the trimmed alert line
    #[arg(short = 'q', long)]
    quiet: bool,

    /// NATS server; enables broker publishing and heartbeats
    #[arg(long, env = "NATS_URL")]
    broker_url: Option<String>,

    #[arg(long, env = "NATS_TOKEN", hide_env_values = true)]
    broker_token: Option<String>,

    /// Append logs to a file instead of stderr
    #[arg(long, num_args = 0..=1, default_missing_value = DEFAULT_LOG_FILE)]
    log_file: Option<PathBuf>,
}

impl Cli {
    /// Flags override the config file
    fn apply(&self, config: &mut RelayConfig) {
        if let Some(port) = &self.port {
            config.port = port.clone();
        }
        config.webhooks.extend(self.webhooks.iter().cloned());
        config.groupme_bot_ids.extend(self.groupme.iter().cloned());
        config.discord_webhooks.extend(self.discord.iter().cloned());

        if self.trim || self.fork || self.quiet {
            config.normalize.trim_to_alert_line = self.trim;
            config.normalize.fork = self.fork;
            config.normalize.quiet = self.quiet;
        }
        if let Some(url) = &self.broker_url {
            config.broker.enabled = true;
            config.broker.nats.url = url.clone();
        }
        if self.broker_token.is_some() {
            config.broker.nats.token = self.broker_token.clone();
        }
        if self.log_file.is_some() {
            config.log_file = self.log_file.clone();
        }
    }
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
    let mut config = match &cli.config {
        Some(path) => RelayConfig::from_file(path)?,
        None => RelayConfig::default(),
    };
    if let Some(path) = &cli.secrets {
        config.merge_secrets(Secrets::from_file(path)?);
    }
    cli.apply(&mut config);

    logging::init(
        logging::level(cli.debug, &config.log_level),
        config.log_file.as_deref(),
    )?;
    config.validate()?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        port = %config.port,
        "endec-relay starting"
    );

    let broker: Option<Arc<dyn Broker>> = if config.broker.enabled {
        let broker = NatsBroker::connect(config.broker.nats.clone()).await?;
        Some(Arc::new(broker))
    } else {
        None
    };
    let opener = serial_opener(&config)?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("Shutdown requested");
            shutdown.cancel();
        });
    }

    Relay::new(config, opener, broker).run(shutdown).await?;
    Ok(())
}

#[cfg(feature = "serial")]
fn serial_opener(config: &RelayConfig) -> Result<Arc<dyn SerialOpener>> {
    use endec_relay::serial::SerialPortOpener;
    use std::time::Duration;

    Ok(Arc::new(SerialPortOpener::new(
        config.serial.baud_rate,
        Duration::from_millis(config.serial.read_timeout_ms),
    )))
}

#[cfg(not(feature = "serial"))]
fn serial_opener(_config: &RelayConfig) -> Result<Arc<dyn SerialOpener>> {
    use endec_relay::error::RelayError;

    Err(RelayError::Config(
        "built without the `serial` feature, no serial port support".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modes_are_exclusive() {
        assert!(
            Cli::try_parse_from(["endec-relay", "-w", "https://a.test", "-t", "-q"]).is_err()
        );
        assert!(Cli::try_parse_from(["endec-relay", "-w", "https://a.test", "-f"]).is_ok());
    }

    #[test]
    fn test_flags_override_config() {
        let cli = Cli::try_parse_from([
            "endec-relay",
            "-c",
            "/dev/ttyS1",
            "-w",
            "https://a.test/1",
            "https://a.test/2",
            "-g",
            "bot",
            "-q",
            "--log-file",
        ])
        .unwrap();
        let mut config = RelayConfig::default();
        cli.apply(&mut config);

        assert_eq!(config.port, "/dev/ttyS1");
        assert_eq!(config.webhooks.len(), 2);
        assert_eq!(config.groupme_bot_ids, vec!["bot".to_string()]);
        assert!(config.normalize.quiet);
        assert_eq!(config.log_file, Some(PathBuf::from(DEFAULT_LOG_FILE)));
        assert!(config.validate().is_ok());
    }
}
