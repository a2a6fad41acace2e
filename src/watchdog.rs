//! Heartbeat watchdog
//!
//! Consumes heartbeats from the broker and raises one alert per outage when
//! the relay goes silent for longer than the configured threshold.
//!
//! ```text
//! UNKNOWN --heartbeat--> OK --poll: elapsed > threshold--> ALERTING
//!                        ^                                    |
//!                        +-------------heartbeat--------------+
//! ```
//!
//! [`AlertState`] holds the whole state machine and is pure, so every
//! transition can be tested without a broker or a clock. [`Watchdog::run`]
//! drives it from a single `tokio::select!` loop over the subscription, the
//! poll timer and the shutdown token. Polling continues while the
//! subscription is being re-established.

use crate::broker::{Broker, BrokerMessage, Route, Subscription};
use crate::error::Result;
use crate::retry::{with_retry, RetryPolicy};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Zone used to display times in notices and logs
pub const DEFAULT_TIMEZONE: Tz = chrono_tz::America::New_York;

/// Consecutive subscription errors tolerated before resubscribing
const MAX_CONSECUTIVE_ERRORS: u32 = 3;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S %Z";

fn local(at: DateTime<Utc>, tz: Tz) -> String {
    at.with_timezone(&tz).format(TIME_FORMAT).to_string()
}

/// Coarse liveness as seen by the watchdog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    /// No heartbeat since the watchdog started
    Unknown,
    Ok,
    Alerting,
}

/// Result of recording a heartbeat
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    FirstSeen,
    Refreshed,
    /// The heartbeat ended an outage that had been alerted on
    Recovered {
        previous: DateTime<Utc>,
        outage: Duration,
    },
}

/// Result of one poll tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    NeverSeen,
    Healthy {
        elapsed: Duration,
    },
    /// First poll past the threshold in this outage; alert now
    TimedOut {
        elapsed: Duration,
        last_seen: DateTime<Utc>,
    },
    /// Already alerted for this outage
    StillAlerting {
        elapsed: Duration,
    },
}

/// Liveness state owned by the watchdog loop
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AlertState {
    last_seen: Option<DateTime<Utc>>,
    alert_active: bool,
}

fn since(earlier: DateTime<Utc>, later: DateTime<Utc>) -> Duration {
    (later - earlier).to_std().unwrap_or(Duration::ZERO)
}

impl AlertState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        self.last_seen
    }

    pub fn is_alerting(&self) -> bool {
        self.alert_active
    }

    pub fn health(&self) -> Health {
        match (self.last_seen, self.alert_active) {
            (_, true) => Health::Alerting,
            (Some(_), false) => Health::Ok,
            (None, false) => Health::Unknown,
        }
    }

    /// Record a heartbeat received at `seen_at`
    pub fn record_heartbeat(&mut self, seen_at: DateTime<Utc>) -> HeartbeatOutcome {
        let previous = self.last_seen.replace(seen_at);
        match previous {
            None => {
                self.alert_active = false;
                HeartbeatOutcome::FirstSeen
            }
            Some(previous) if self.alert_active => {
                self.alert_active = false;
                HeartbeatOutcome::Recovered {
                    previous,
                    outage: since(previous, seen_at),
                }
            }
            Some(_) => HeartbeatOutcome::Refreshed,
        }
    }

    /// Compare the time since the last heartbeat with `threshold`.
    ///
    /// Only an elapsed time strictly greater than the threshold fires, and
    /// only once until the next heartbeat.
    pub fn poll(&mut self, now: DateTime<Utc>, threshold: Duration) -> PollOutcome {
        let Some(last_seen) = self.last_seen else {
            return PollOutcome::NeverSeen;
        };
        let elapsed = since(last_seen, now);

        if self.alert_active {
            PollOutcome::StillAlerting { elapsed }
        } else if elapsed > threshold {
            self.alert_active = true;
            PollOutcome::TimedOut { elapsed, last_seen }
        } else {
            PollOutcome::Healthy { elapsed }
        }
    }
}

/// Notice sent to operators on an outage transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchdogNotice {
    Timeout {
        last_seen: DateTime<Utc>,
        elapsed: Duration,
        threshold: Duration,
    },
    Recovered {
        previous: DateTime<Utc>,
        seen_at: DateTime<Utc>,
        outage: Duration,
    },
}

impl WatchdogNotice {
    /// Human-readable text for `application`, with times shown in `tz`
    pub fn render(&self, application: &str, tz: Tz) -> String {
        match self {
            WatchdogNotice::Timeout {
                last_seen,
                elapsed,
                threshold,
            } => format!(
                "🚨 **{app} Health Check Alert** 🚨\n\
                 No health check received from `{app}` for {secs} seconds\n\
                 Last health check: `{last}`\n\
                 Threshold: `{threshold}` seconds\n\n\
                 Please investigate that the ENDEC system is powered on and the \
                 serial connection is working properly.",
                app = application,
                secs = elapsed.as_secs(),
                last = local(*last_seen, tz),
                threshold = threshold.as_secs(),
            ),
            WatchdogNotice::Recovered {
                seen_at, outage, ..
            } => format!(
                "✅ **{app} Health Check Recovered** ✅\n\
                 Health check received from `{app}` after {secs} seconds of silence\n\
                 Received at: `{at}`",
                app = application,
                secs = outage.as_secs(),
                at = local(*seen_at, tz),
            ),
        }
    }
}

/// Delivers watchdog notices to operators
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notice: &WatchdogNotice) -> Result<()>;
}

/// Wall clock used for receipt and poll times
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Watchdog settings
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Application named in notices
    pub application: String,
    /// Route heartbeats arrive on
    pub route: Route,
    /// Durable queue name
    pub queue: String,
    pub check_interval: Duration,
    pub timeout_threshold: Duration,
    pub notify_retry: RetryPolicy,
    /// Backoff between attempts to re-establish the subscription
    pub resubscribe: RetryPolicy,
    /// Zone for times in log lines
    pub timezone: Tz,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            application: "wbor-endec".to_string(),
            route: Route::healthcheck("wbor-endec"),
            queue: "health_checks".to_string(),
            check_interval: Duration::from_secs(300),
            timeout_threshold: Duration::from_secs(600),
            notify_retry: RetryPolicy::default(),
            resubscribe: RetryPolicy {
                base_delay_ms: 1_000,
                max_delay_ms: 60_000,
                ..Default::default()
            },
            timezone: DEFAULT_TIMEZONE,
        }
    }
}

/// Heartbeat consumer plus poll timer
pub struct Watchdog {
    config: WatchdogConfig,
    state: AlertState,
    notifier: Arc<dyn Notifier>,
    clock: Clock,
}

impl Watchdog {
    pub fn new(config: WatchdogConfig, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            config,
            state: AlertState::new(),
            notifier,
            clock: Arc::new(Utc::now),
        }
    }

    /// Replace the wall clock
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    pub fn state(&self) -> &AlertState {
        &self.state
    }

    /// Consume heartbeats from `broker` and poll until `cancel` fires.
    ///
    /// Subscription errors are logged. A closed subscription, or a run of
    /// consecutive errors, is replaced by a new one after a backoff delay.
    pub async fn run(&mut self, broker: Arc<dyn Broker>, cancel: CancellationToken) -> Result<()> {
        let interval = self.config.check_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            route = %self.config.route,
            queue = %self.config.queue,
            check_interval_secs = interval.as_secs(),
            threshold_secs = self.config.timeout_threshold.as_secs(),
            timezone = %self.config.timezone,
            "Watchdog started"
        );

        let mut subscription: Option<Box<dyn Subscription>> = None;
        let mut resubscribe_at = Instant::now();
        let mut failed_subscribes = 0u32;
        let mut consecutive_errors = 0u32;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!("Watchdog shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep_until(resubscribe_at), if subscription.is_none() => {
                    match broker.subscribe(&self.config.route, &self.config.queue).await {
                        Ok(sub) => {
                            tracing::info!(
                                route = %self.config.route,
                                queue = %self.config.queue,
                                "Subscribed to heartbeats"
                            );
                            subscription = Some(sub);
                            failed_subscribes = 0;
                            consecutive_errors = 0;
                        }
                        Err(e) => {
                            failed_subscribes += 1;
                            let delay = self
                                .config
                                .resubscribe
                                .delay_for_attempt(failed_subscribes, &mut rand::thread_rng());
                            tracing::warn!(
                                error = %e,
                                attempt = failed_subscribes,
                                retry_in_ms = delay.as_millis() as u64,
                                "Heartbeat subscription failed"
                            );
                            resubscribe_at = Instant::now() + delay;
                        }
                    }
                }
                received = next_message(&mut subscription) => match received {
                    Ok(Some(message)) => {
                        consecutive_errors = 0;
                        self.on_message(message, &cancel).await;
                    }
                    Ok(None) => {
                        tracing::warn!("Heartbeat subscription closed, resubscribing");
                        subscription = None;
                        resubscribe_at =
                            Instant::now() + self.config.resubscribe.nominal_delay(1);
                    }
                    Err(e) => {
                        consecutive_errors += 1;
                        tracing::warn!(
                            error = %e,
                            consecutive = consecutive_errors,
                            "Heartbeat subscription error"
                        );
                        if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                            subscription = None;
                            resubscribe_at =
                                Instant::now() + self.config.resubscribe.nominal_delay(1);
                        }
                    }
                },
                _ = ticker.tick() => {
                    self.on_tick(&cancel).await;
                }
            }
        }
    }

    /// Handle one broker message; returns true when it counted as a heartbeat
    pub async fn on_message(
        &mut self,
        message: BrokerMessage,
        cancel: &CancellationToken,
    ) -> bool {
        if message.route.routing_key != self.config.route.routing_key {
            tracing::debug!(
                routing_key = %message.route.routing_key,
                "Ignoring message for other routing key"
            );
            return false;
        }

        let record: serde_json::Value = match serde_json::from_slice(&message.payload) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(error = %e, "Malformed heartbeat ignored");
                return false;
            }
        };

        let seen_at = (self.clock)();
        tracing::info!(
            at = %local(seen_at, self.config.timezone),
            source = record
                .get("source_application")
                .and_then(|v| v.as_str())
                .unwrap_or("?"),
            "Received health check"
        );

        if let HeartbeatOutcome::Recovered { previous, outage } =
            self.state.record_heartbeat(seen_at)
        {
            tracing::info!(outage_secs = outage.as_secs(), "Heartbeats resumed");
            self.send(
                WatchdogNotice::Recovered {
                    previous,
                    seen_at,
                    outage,
                },
                cancel,
            )
            .await;
        }
        true
    }

    /// Run one poll against the current time
    pub async fn on_tick(&mut self, cancel: &CancellationToken) -> PollOutcome {
        let now = (self.clock)();
        let threshold = self.config.timeout_threshold;
        let outcome = self.state.poll(now, threshold);

        match &outcome {
            PollOutcome::NeverSeen => {
                tracing::warn!(
                    "No health check messages received yet, waiting for first ping"
                );
            }
            PollOutcome::Healthy { elapsed } => {
                tracing::info!(
                    elapsed_secs = elapsed.as_secs(),
                    threshold_secs = threshold.as_secs(),
                    "Heartbeat within threshold"
                );
            }
            PollOutcome::TimedOut { elapsed, last_seen } => {
                tracing::warn!(
                    elapsed_secs = elapsed.as_secs(),
                    last_seen = %local(*last_seen, self.config.timezone),
                    "Health check timeout detected"
                );
                self.send(
                    WatchdogNotice::Timeout {
                        last_seen: *last_seen,
                        elapsed: *elapsed,
                        threshold,
                    },
                    cancel,
                )
                .await;
            }
            PollOutcome::StillAlerting { elapsed } => {
                tracing::debug!(
                    elapsed_secs = elapsed.as_secs(),
                    "Outage continues, already alerted"
                );
            }
        }
        outcome
    }

    async fn send(&self, notice: WatchdogNotice, cancel: &CancellationToken) {
        let notifier = self.notifier.clone();
        let report = with_retry(&self.config.notify_retry, cancel, "watchdog-notifier", |_| {
            let notifier = notifier.clone();
            let notice = notice.clone();
            async move { notifier.notify(&notice).await }
        })
        .await;

        if let Err(e) = report.result {
            tracing::error!(
                attempts = report.attempts,
                error = %e,
                "Failed to send watchdog notice"
            );
        }
    }
}

/// Next message from the current subscription, pending while there is none
async fn next_message(
    subscription: &mut Option<Box<dyn Subscription>>,
) -> Result<Option<BrokerMessage>> {
    match subscription {
        Some(sub) => sub.next().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::broker::{Broker, PublishOptions};
    use crate::error::RelayError;
    use bytes::Bytes;
    use chrono::TimeZone;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    #[test]
    fn test_one_alert_and_one_recovery() {
        let threshold = Duration::from_secs(60);
        let mut state = AlertState::new();
        assert_eq!(state.health(), Health::Unknown);

        assert_eq!(state.record_heartbeat(t(0)), HeartbeatOutcome::FirstSeen);
        assert_eq!(
            state.poll(t(70), threshold),
            PollOutcome::TimedOut {
                elapsed: Duration::from_secs(70),
                last_seen: t(0),
            }
        );
        assert_eq!(state.health(), Health::Alerting);
        assert_eq!(
            state.record_heartbeat(t(100)),
            HeartbeatOutcome::Recovered {
                previous: t(0),
                outage: Duration::from_secs(100),
            }
        );
        assert_eq!(
            state.poll(t(130), threshold),
            PollOutcome::Healthy {
                elapsed: Duration::from_secs(30)
            }
        );
        assert_eq!(state.health(), Health::Ok);
    }

    #[test]
    fn test_threshold_is_strict() {
        let threshold = Duration::from_secs(600);
        let mut state = AlertState::new();
        state.record_heartbeat(t(0));

        assert!(matches!(state.poll(t(300), threshold), PollOutcome::Healthy { .. }));
        assert!(matches!(state.poll(t(600), threshold), PollOutcome::Healthy { .. }));
        assert_eq!(state.health(), Health::Ok);
        assert!(matches!(state.poll(t(601), threshold), PollOutcome::TimedOut { .. }));
        assert_eq!(state.health(), Health::Alerting);
    }

    #[test]
    fn test_single_alert_per_outage() {
        let threshold = Duration::from_secs(10);
        let mut state = AlertState::new();
        state.record_heartbeat(t(0));

        assert!(matches!(state.poll(t(20), threshold), PollOutcome::TimedOut { .. }));
        assert!(matches!(state.poll(t(30), threshold), PollOutcome::StillAlerting { .. }));
        assert!(matches!(state.poll(t(40), threshold), PollOutcome::StillAlerting { .. }));
    }

    #[test]
    fn test_poll_before_first_heartbeat() {
        let mut state = AlertState::new();
        assert_eq!(state.poll(t(10_000), Duration::from_secs(1)), PollOutcome::NeverSeen);
        assert_eq!(state.health(), Health::Unknown);
    }

    #[test]
    fn test_refresh_without_alert() {
        let mut state = AlertState::new();
        state.record_heartbeat(t(0));
        assert_eq!(state.record_heartbeat(t(5)), HeartbeatOutcome::Refreshed);
        assert_eq!(state.last_seen(), Some(t(5)));
    }

    #[test]
    fn test_clock_skew_counts_as_zero() {
        let mut state = AlertState::new();
        state.record_heartbeat(t(100));
        assert_eq!(
            state.poll(t(50), Duration::from_secs(1)),
            PollOutcome::Healthy { elapsed: Duration::ZERO }
        );
    }

    #[test]
    fn test_render_timeout() {
        let notice = WatchdogNotice::Timeout {
            last_seen: t(0),
            elapsed: Duration::from_secs(601),
            threshold: Duration::from_secs(600),
        };
        let text = notice.render("wbor-endec", chrono_tz::UTC);
        assert!(text.contains("for 601 seconds"));
        assert!(text.contains("`2024-01-01 00:00:00 UTC`"));
        assert!(text.contains("Threshold: `600` seconds"));
    }

    #[test]
    fn test_render_in_local_zone() {
        let winter = WatchdogNotice::Timeout {
            last_seen: t(0),
            elapsed: Duration::from_secs(601),
            threshold: Duration::from_secs(600),
        };
        assert!(winter
            .render("wbor-endec", DEFAULT_TIMEZONE)
            .contains("Last health check: `2023-12-31 19:00:00 EST`"));

        let summer = Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).unwrap();
        let recovered = WatchdogNotice::Recovered {
            previous: summer,
            seen_at: summer,
            outage: Duration::from_secs(700),
        };
        assert!(recovered
            .render("wbor-endec", DEFAULT_TIMEZONE)
            .contains("Received at: `2024-07-01 08:00:00 EDT`"));
    }

    #[test]
    fn test_render_recovered() {
        let notice = WatchdogNotice::Recovered {
            previous: t(0),
            seen_at: t(900),
            outage: Duration::from_secs(900),
        };
        let text = notice.render("app", chrono_tz::UTC);
        assert!(text.contains("Recovered"));
        assert!(text.contains("after 900 seconds"));
    }

    #[derive(Default)]
    struct RecordingNotifier {
        notices: Mutex<Vec<WatchdogNotice>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, notice: &WatchdogNotice) -> Result<()> {
            self.notices.lock().unwrap().push(notice.clone());
            Ok(())
        }
    }

    struct FailingNotifier;

    #[async_trait]
    impl Notifier for FailingNotifier {
        async fn notify(&self, _notice: &WatchdogNotice) -> Result<()> {
            Err(RelayError::delivery("discord", "HTTP 500"))
        }
    }

    fn paused_clock() -> Clock {
        let base = t(0);
        let start = Instant::now();
        Arc::new(move || base + chrono::Duration::from_std(start.elapsed()).unwrap())
    }

    fn config() -> WatchdogConfig {
        let quick = RetryPolicy {
            base_delay_ms: 10,
            max_delay_ms: 10,
            ..Default::default()
        };
        WatchdogConfig {
            notify_retry: quick.clone(),
            resubscribe: quick,
            ..Default::default()
        }
    }

    /// Replays scripted results, then stays silent or reports closed
    struct ScriptedSubscription {
        script: VecDeque<Result<Option<BrokerMessage>>>,
        close_when_done: bool,
    }

    #[async_trait]
    impl Subscription for ScriptedSubscription {
        async fn next(&mut self) -> Result<Option<BrokerMessage>> {
            if let Some(item) = self.script.pop_front() {
                return item;
            }
            if self.close_when_done {
                return Ok(None);
            }
            std::future::pending().await
        }
    }

    /// Hands out queued subscriptions, failing when none are left
    #[derive(Default)]
    struct FlakyBroker {
        subscriptions: Mutex<VecDeque<ScriptedSubscription>>,
        subscribes: AtomicU32,
    }

    impl FlakyBroker {
        fn with(subscriptions: Vec<ScriptedSubscription>) -> Arc<Self> {
            Arc::new(Self {
                subscriptions: Mutex::new(subscriptions.into()),
                subscribes: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Broker for FlakyBroker {
        async fn publish(
            &self,
            _route: &Route,
            _payload: Bytes,
            _opts: &PublishOptions,
        ) -> Result<()> {
            Ok(())
        }

        async fn subscribe(&self, route: &Route, _queue: &str) -> Result<Box<dyn Subscription>> {
            self.subscribes.fetch_add(1, Ordering::SeqCst);
            match self.subscriptions.lock().unwrap().pop_front() {
                Some(sub) => Ok(Box::new(sub)),
                None => Err(RelayError::Subscribe {
                    subject: route.to_string(),
                    reason: "broker unavailable".to_string(),
                }),
            }
        }

        fn name(&self) -> &str {
            "flaky"
        }
    }

    fn alive(route: &Route) -> Result<Option<BrokerMessage>> {
        Ok(Some(heartbeat(route, b"{\"status\":\"alive\"}")))
    }

    fn heartbeat(route: &Route, payload: &'static [u8]) -> BrokerMessage {
        BrokerMessage {
            route: route.clone(),
            payload: Bytes::from_static(payload),
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_foreign_and_malformed_messages_are_not_liveness() {
        let notifier = Arc::new(RecordingNotifier::default());
        let mut watchdog = Watchdog::new(config(), notifier);
        let cancel = CancellationToken::new();

        let other = Route::healthcheck("other-app");
        assert!(!watchdog.on_message(heartbeat(&other, b"{}"), &cancel).await);

        let route = watchdog.config().route.clone();
        assert!(!watchdog.on_message(heartbeat(&route, b"not json"), &cancel).await);
        assert_eq!(watchdog.state().health(), Health::Unknown);

        assert!(
            watchdog
                .on_message(heartbeat(&route, b"{\"status\":\"alive\"}"), &cancel)
                .await
        );
        assert_eq!(watchdog.state().health(), Health::Ok);
    }

    #[tokio::test(start_paused = true)]
    async fn test_notifier_failure_is_not_fatal() {
        let mut watchdog =
            Watchdog::new(config(), Arc::new(FailingNotifier)).with_clock(paused_clock());
        let cancel = CancellationToken::new();
        let route = watchdog.config().route.clone();

        watchdog.on_message(heartbeat(&route, b"{}"), &cancel).await;
        tokio::time::advance(Duration::from_secs(700)).await;

        let outcome = watchdog.on_tick(&cancel).await;
        assert!(matches!(outcome, PollOutcome::TimedOut { .. }));
        assert_eq!(watchdog.state().health(), Health::Alerting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_loop_alerts_then_recovers() {
        let broker = Arc::new(MemoryBroker::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let cfg = config();
        let route = cfg.route.clone();

        let mut watchdog = Watchdog::new(cfg, notifier.clone()).with_clock(paused_clock());
        let cancel = CancellationToken::new();
        let task = {
            let cancel = cancel.clone();
            let broker: Arc<dyn Broker> = broker.clone();
            tokio::spawn(async move {
                watchdog.run(broker, cancel).await.unwrap();
                watchdog
            })
        };
        // Let the loop subscribe before the first publish
        tokio::time::sleep(Duration::from_millis(1)).await;

        broker
            .publish(
                &route,
                Bytes::from_static(b"{\"status\":\"alive\"}"),
                &PublishOptions::default(),
            )
            .await
            .unwrap();

        // Polls at 300 and 600 are within the threshold, 900 is past it
        tokio::time::sleep(Duration::from_secs(900)).await;
        assert_eq!(notifier.notices.lock().unwrap().len(), 1);

        broker
            .publish(
                &route,
                Bytes::from_static(b"{\"status\":\"alive\"}"),
                &PublishOptions::default(),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        cancel.cancel();
        let watchdog = task.await.unwrap();
        assert_eq!(watchdog.state().health(), Health::Ok);

        let notices = notifier.notices.lock().unwrap();
        assert_eq!(notices.len(), 2);
        assert!(matches!(
            notices[0],
            WatchdogNotice::Timeout { elapsed, .. } if elapsed.as_secs() == 899
        ));
        assert!(matches!(notices[1], WatchdogNotice::Recovered { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscription_error_does_not_stop_watchdog() {
        let cfg = config();
        let route = cfg.route.clone();
        let broker = FlakyBroker::with(vec![ScriptedSubscription {
            script: VecDeque::from(vec![
                alive(&route),
                Err(RelayError::Consumer("missed idle heartbeat".to_string())),
                alive(&route),
            ]),
            close_when_done: false,
        }]);
        let notifier = Arc::new(RecordingNotifier::default());

        let mut watchdog = Watchdog::new(cfg, notifier.clone()).with_clock(paused_clock());
        let cancel = CancellationToken::new();
        let task = {
            let cancel = cancel.clone();
            let broker: Arc<dyn Broker> = broker.clone();
            tokio::spawn(async move {
                let result = watchdog.run(broker, cancel).await;
                (watchdog, result)
            })
        };

        // The poll at 900 still fires after the consumer error
        tokio::time::sleep(Duration::from_secs(901)).await;
        assert!(!task.is_finished());
        assert_eq!(notifier.notices.lock().unwrap().len(), 1);
        assert_eq!(broker.subscribes.load(Ordering::SeqCst), 1);

        cancel.cancel();
        let (watchdog, result) = task.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(watchdog.state().health(), Health::Alerting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_subscription_is_replaced() {
        let cfg = config();
        let route = cfg.route.clone();
        let broker = FlakyBroker::with(vec![
            ScriptedSubscription {
                script: VecDeque::from(vec![alive(&route)]),
                close_when_done: true,
            },
            ScriptedSubscription {
                script: VecDeque::from(vec![alive(&route)]),
                close_when_done: false,
            },
        ]);
        let notifier = Arc::new(RecordingNotifier::default());

        let mut watchdog = Watchdog::new(cfg, notifier.clone()).with_clock(paused_clock());
        let cancel = CancellationToken::new();
        let task = {
            let cancel = cancel.clone();
            let broker: Arc<dyn Broker> = broker.clone();
            tokio::spawn(async move {
                watchdog.run(broker, cancel).await.unwrap();
                watchdog
            })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(broker.subscribes.load(Ordering::SeqCst), 2);

        cancel.cancel();
        let watchdog = task.await.unwrap();
        assert_eq!(watchdog.state().health(), Health::Ok);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_subscribe_keeps_polling_and_retrying() {
        let broker = FlakyBroker::with(Vec::new());
        let notifier = Arc::new(RecordingNotifier::default());

        let mut watchdog = Watchdog::new(config(), notifier).with_clock(paused_clock());
        let cancel = CancellationToken::new();
        let task = {
            let cancel = cancel.clone();
            let broker: Arc<dyn Broker> = broker.clone();
            tokio::spawn(async move {
                watchdog.run(broker, cancel).await.unwrap();
                watchdog
            })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!task.is_finished());
        assert!(broker.subscribes.load(Ordering::SeqCst) > 1);

        cancel.cancel();
        let watchdog = task.await.unwrap();
        assert_eq!(watchdog.state().health(), Health::Unknown);
    }
}
