//! Verbindungsqualität und Reconnection
//!
//! Fragt periodisch die Statistiken der Peer Connection ab, bewertet die
//! Qualität über ein rollendes Fenster und begrenzt Reconnect-Versuche mit
//! exponentiellem Backoff.

use crate::observer::{Observers, Subscription};
use crate::peer::{PeerConnection, StatsSnapshot};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

// ============================================================================
// CONFIG
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    pub poll_interval: Duration,
    pub history_size: usize,
    pub max_reconnect_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Aufeinanderfolgende schlechte Samples bis zur Degradation
    pub degradation_threshold: u32,
    pub fair_loss_ratio: f64,
    pub poor_loss_ratio: f64,
    pub fair_rtt_ms: f64,
    pub poor_rtt_ms: f64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            history_size: 30,
            max_reconnect_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            degradation_threshold: 3,
            fair_loss_ratio: 0.02,
            poor_loss_ratio: 0.05,
            fair_rtt_ms: 200.0,
            poor_rtt_ms: 400.0,
        }
    }
}

// ============================================================================
// BACKOFF
// ============================================================================

/// Exponentieller Backoff: `base × 2^(attempt-1)`, begrenzt auf `max_delay`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl BackoffPolicy {
    /// Wartezeit vor Versuch `attempt` (1-basiert)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

impl From<&MonitorConfig> for BackoffPolicy {
    fn from(config: &MonitorConfig) -> Self {
        Self {
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            max_attempts: config.max_reconnect_attempts,
        }
    }
}

// ============================================================================
// QUALITY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualitySample {
    pub timestamp: DateTime<Utc>,
    pub packets_lost: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub round_trip_time_ms: Option<f64>,
}

impl From<StatsSnapshot> for QualitySample {
    fn from(stats: StatsSnapshot) -> Self {
        Self {
            timestamp: Utc::now(),
            packets_lost: stats.packets_lost,
            packets_received: stats.packets_received,
            bytes_received: stats.bytes_received,
            bytes_sent: stats.bytes_sent,
            round_trip_time_ms: stats.round_trip_time_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLevel {
    Good,
    Fair,
    Poor,
}

/// Bewertung nach einem neuen Sample
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityReport {
    pub level: QualityLevel,
    /// Paketverlust im Fenster (0.0 - 1.0)
    pub loss_ratio: f64,
    pub sample: QualitySample,
}

#[derive(Default)]
struct Tracking {
    history: VecDeque<QualitySample>,
    poor_streak: u32,
    degraded: bool,
}

// ============================================================================
// CONNECTION MONITOR
// ============================================================================

struct MonitorInner {
    config: MonitorConfig,
    tracking: Mutex<Tracking>,
    quality_listeners: Observers<QualityReport>,
    degradation_listeners: Observers<QualityReport>,
}

impl MonitorInner {
    fn record(&self, sample: QualitySample) -> QualityReport {
        let (report, degraded_now) = {
            let mut tracking = self.tracking.lock();
            if tracking.history.len() >= self.config.history_size.max(1) {
                tracking.history.pop_front();
            }
            tracking.history.push_back(sample.clone());

            let loss_ratio = window_loss_ratio(&tracking.history);
            let level = self.classify(loss_ratio, sample.round_trip_time_ms);

            let mut degraded_now = false;
            if level == QualityLevel::Poor {
                tracking.poor_streak += 1;
                if tracking.poor_streak >= self.config.degradation_threshold && !tracking.degraded {
                    tracking.degraded = true;
                    degraded_now = true;
                }
            } else {
                tracking.poor_streak = 0;
                tracking.degraded = false;
            }

            (
                QualityReport {
                    level,
                    loss_ratio,
                    sample,
                },
                degraded_now,
            )
        };

        self.quality_listeners.notify(&report);
        if degraded_now {
            tracing::warn!(
                "Connection quality degraded (loss {:.1}%)",
                report.loss_ratio * 100.0
            );
            self.degradation_listeners.notify(&report);
        }
        report
    }

    fn classify(&self, loss_ratio: f64, rtt_ms: Option<f64>) -> QualityLevel {
        let rtt = rtt_ms.unwrap_or(0.0);
        if loss_ratio >= self.config.poor_loss_ratio || rtt >= self.config.poor_rtt_ms {
            QualityLevel::Poor
        } else if loss_ratio >= self.config.fair_loss_ratio || rtt >= self.config.fair_rtt_ms {
            QualityLevel::Fair
        } else {
            QualityLevel::Good
        }
    }
}

/// Verlust zwischen ältestem und neuestem Sample (Zähler sind kumulativ)
fn window_loss_ratio(history: &VecDeque<QualitySample>) -> f64 {
    let (first, last) = match (history.front(), history.back()) {
        (Some(first), Some(last)) => (first, last),
        _ => return 0.0,
    };

    let (lost, received) = if history.len() == 1 {
        (last.packets_lost, last.packets_received)
    } else {
        (
            last.packets_lost.saturating_sub(first.packets_lost),
            last.packets_received.saturating_sub(first.packets_received),
        )
    };

    let total = lost + received;
    if total == 0 {
        0.0
    } else {
        lost as f64 / total as f64
    }
}

pub struct ConnectionMonitor {
    inner: Arc<MonitorInner>,
    backoff: BackoffPolicy,
    attempts: AtomicU32,
    source: Mutex<Option<Arc<dyn PeerConnection>>>,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        let backoff = BackoffPolicy::from(&config);
        Self {
            inner: Arc::new(MonitorInner {
                config,
                tracking: Mutex::new(Tracking::default()),
                quality_listeners: Observers::new(),
                degradation_listeners: Observers::new(),
            }),
            backoff,
            attempts: AtomicU32::new(0),
            source: Mutex::new(None),
            poller: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.inner.config
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        self.backoff
    }

    /// Startet das Polling der Statistiken; ein laufendes Polling wird ersetzt
    pub fn start(&self, source: Arc<dyn PeerConnection>) {
        self.stop();
        *self.source.lock() = Some(Arc::clone(&source));

        let weak: Weak<MonitorInner> = Arc::downgrade(&self.inner);
        let interval = self.inner.config.poll_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let stats = match source.stats().await {
                    Ok(stats) => stats,
                    Err(e) => {
                        tracing::warn!("Failed to read connection stats: {}", e);
                        continue;
                    }
                };
                match weak.upgrade() {
                    Some(inner) => {
                        inner.record(QualitySample::from(stats));
                    }
                    None => break,
                }
            }
        });

        *self.poller.lock() = Some(handle);
        tracing::debug!("Connection monitor started ({:?} interval)", interval);
    }

    pub fn is_running(&self) -> bool {
        self.poller.lock().is_some()
    }

    /// Nimmt ein Sample auf (vom Polling oder direkt)
    pub fn record_sample(&self, stats: StatsSnapshot) -> QualityReport {
        self.inner.record(QualitySample::from(stats))
    }

    pub fn history(&self) -> Vec<QualitySample> {
        self.inner.tracking.lock().history.iter().cloned().collect()
    }

    pub fn on_quality<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&QualityReport) + Send + Sync + 'static,
    {
        self.inner.quality_listeners.subscribe(listener)
    }

    /// Einmal pro Episode schlechter Qualität
    pub fn on_degradation<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&QualityReport) + Send + Sync + 'static,
    {
        self.inner.degradation_listeners.subscribe(listener)
    }

    // ========================================================================
    // RECONNECTION
    // ========================================================================

    pub fn reset_reconnection(&self) {
        self.attempts.store(0, Ordering::SeqCst);
    }

    /// Zählt einen Versuch; `false` sobald das Budget erschöpft ist
    pub fn attempt_reconnection(&self) -> bool {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let allowed = attempt <= self.backoff.max_attempts;
        if allowed {
            tracing::info!(
                "Reconnection attempt {}/{}",
                attempt,
                self.backoff.max_attempts
            );
        } else {
            tracing::warn!("Reconnection attempts exhausted");
        }
        allowed
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt)
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Stoppt das Polling; die Historie bleibt erhalten
    pub fn stop(&self) {
        if let Some(handle) = self.poller.lock().take() {
            handle.abort();
            tracing::debug!("Connection monitor stopped");
        }
    }

    /// Stoppt das Polling und verwirft Historie und Quelle
    pub fn dispose(&self) {
        self.stop();
        self.source.lock().take();
        *self.inner.tracking.lock() = Tracking::default();
        self.reset_reconnection();
    }
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new(MonitorConfig::default())
    }
}

impl Drop for ConnectionMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerFactory;
    use crate::testing::FakePeerFactory;
    use tokio::sync::mpsc;

    fn stats(lost: u64, received: u64, rtt: f64) -> StatsSnapshot {
        StatsSnapshot {
            packets_lost: lost,
            packets_received: received,
            bytes_received: received * 160,
            bytes_sent: received * 160,
            round_trip_time_ms: Some(rtt),
        }
    }

    #[test]
    fn test_attempt_budget_and_reset() {
        let monitor = ConnectionMonitor::default();
        for _ in 0..5 {
            assert!(monitor.attempt_reconnection());
        }
        assert!(!monitor.attempt_reconnection());

        monitor.reset_reconnection();
        assert!(monitor.attempt_reconnection());
        assert_eq!(monitor.reconnect_attempts(), 1);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let monitor = ConnectionMonitor::default();
        assert_eq!(monitor.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(monitor.backoff_delay(2), Duration::from_secs(2));
        assert_eq!(monitor.backoff_delay(3), Duration::from_secs(4));
        assert_eq!(monitor.backoff_delay(6), Duration::from_secs(30));
        assert_eq!(monitor.backoff_delay(60), Duration::from_secs(30));
    }

    #[test]
    fn test_history_is_bounded() {
        let monitor = ConnectionMonitor::new(MonitorConfig {
            history_size: 3,
            ..MonitorConfig::default()
        });
        for i in 0..5 {
            monitor.record_sample(stats(0, i * 50, 20.0));
        }
        let history = monitor.history();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].packets_received, 100);
    }

    #[test]
    fn test_quality_levels() {
        let monitor = ConnectionMonitor::default();
        assert_eq!(monitor.record_sample(stats(0, 100, 30.0)).level, QualityLevel::Good);
        assert_eq!(monitor.record_sample(stats(0, 200, 250.0)).level, QualityLevel::Fair);
        // 30 verloren, 200 empfangen seit dem ersten Sample
        assert_eq!(monitor.record_sample(stats(30, 300, 30.0)).level, QualityLevel::Poor);
    }

    #[test]
    fn test_degradation_fires_once_per_episode() {
        let monitor = ConnectionMonitor::default();
        let fired = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&fired);
        let _ = monitor.on_degradation(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..5 {
            monitor.record_sample(stats(0, 100, 900.0));
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        monitor.record_sample(stats(0, 100, 20.0));
        for _ in 0..3 {
            monitor.record_sample(stats(0, 100, 900.0));
        }
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polling_collects_samples() {
        let factory = FakePeerFactory::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let pc = factory.create(tx).await.unwrap();
        factory.last().unwrap().set_stats(stats(0, 500, 40.0));

        let monitor = ConnectionMonitor::default();
        monitor.start(pc);
        tokio::time::sleep(Duration::from_millis(4100)).await;
        assert_eq!(monitor.history().len(), 2);

        monitor.stop();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(monitor.history().len(), 2);

        monitor.dispose();
        monitor.dispose();
        assert!(monitor.history().is_empty());
        assert!(!monitor.is_running());
    }
}
