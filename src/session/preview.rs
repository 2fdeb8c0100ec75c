use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::KilnError;
use crate::fragment::{Fragment, SandboxResult};
use crate::session::SessionIdentity;
use crate::session::collaborators::{BuildStore, Sandbox, persist_build};

pub const MIN_PREVIEW_VISIBLE: Duration = Duration::from_millis(3000);
pub const PHASE_TICK: Duration = Duration::from_millis(1500);

pub const DEFAULT_PHASES: &[&str] = &[
    "Spinning up sandbox",
    "Installing dependencies",
    "Building preview",
    "Almost ready",
];

/// Loading state shown while a sandbox is being created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreviewIndicator {
    Hidden,
    Loading { phase: usize, label: String },
}

impl PreviewIndicator {
    pub fn is_loading(&self) -> bool {
        matches!(self, Self::Loading { .. })
    }
}

#[derive(Debug, Clone)]
pub struct PreviewSettings {
    /// Minimum time the indicator stays visible, measured from request start.
    pub min_visible: Duration,
    pub tick: Duration,
    pub phases: Vec<String>,
}

impl Default for PreviewSettings {
    fn default() -> Self {
        Self {
            min_visible: MIN_PREVIEW_VISIBLE,
            tick: PHASE_TICK,
            phases: DEFAULT_PHASES.iter().map(|p| p.to_string()).collect(),
        }
    }
}

/// Phase index shown after `tick` ticks. Cycles through the list.
pub fn phase_at(phase_count: usize, tick: u64) -> usize {
    if phase_count == 0 {
        return 0;
    }
    (tick % phase_count as u64) as usize
}

fn loading(phases: &[String], tick: u64) -> PreviewIndicator {
    let phase = phase_at(phases.len(), tick);
    PreviewIndicator::Loading {
        phase,
        label: phases.get(phase).cloned().unwrap_or_default(),
    }
}

/// Requests sandbox materialization for a finished fragment and drives the
/// cosmetic loading indicator around it.
pub struct PreviewOrchestrator {
    sandbox: Arc<dyn Sandbox>,
    builds: Option<Arc<dyn BuildStore>>,
    settings: PreviewSettings,
    indicator: Arc<watch::Sender<PreviewIndicator>>,
    /// Bumped on every materialization and reset; stale timers compare it.
    epoch: Arc<AtomicU64>,
    ticker: Option<CancellationToken>,
}

impl PreviewOrchestrator {
    pub fn new(sandbox: Arc<dyn Sandbox>, settings: PreviewSettings) -> Self {
        let (indicator, _) = watch::channel(PreviewIndicator::Hidden);
        Self {
            sandbox,
            builds: None,
            settings,
            indicator: Arc::new(indicator),
            epoch: Arc::new(AtomicU64::new(0)),
            ticker: None,
        }
    }

    pub fn with_build_store(mut self, store: Arc<dyn BuildStore>) -> Self {
        self.builds = Some(store);
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<PreviewIndicator> {
        self.indicator.subscribe()
    }

    pub fn indicator(&self) -> PreviewIndicator {
        self.indicator.borrow().clone()
    }

    /// Hide the indicator and invalidate any pending timers.
    pub fn reset(&mut self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(token) = self.ticker.take() {
            token.cancel();
        }
        self.indicator.send_replace(PreviewIndicator::Hidden);
    }

    /// Create a sandbox for `fragment`. Returns once the result is known;
    /// the indicator stays up until `min_visible` has passed since the call.
    pub async fn materialize(
        &mut self,
        fragment: &Fragment,
        identity: &SessionIdentity,
    ) -> Result<SandboxResult, KilnError> {
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(old) = self.ticker.take() {
            old.cancel();
        }
        let started = Instant::now();
        let token = CancellationToken::new();
        self.ticker = Some(token.clone());

        self.indicator.send_replace(loading(&self.settings.phases, 0));
        self.spawn_ticker(started, token.clone());

        let result = match self.sandbox.create(fragment, identity).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(error = %e, "sandbox creation failed");
                self.clear_if_current(epoch, &token);
                return Err(e);
            }
        };

        let remaining = self.settings.min_visible.saturating_sub(started.elapsed());
        let indicator = self.indicator.clone();
        let epochs = self.epoch.clone();
        tokio::spawn(async move {
            tokio::time::sleep(remaining).await;
            clear(&indicator, &epochs, epoch, &token);
        });

        if let Some(store) = self.builds.clone() {
            let fragment = fragment.clone();
            let saved = result.clone();
            let identity = identity.clone();
            tokio::spawn(async move {
                match persist_build(store.as_ref(), &fragment, &saved, &identity).await {
                    Ok(build_id) => tracing::info!(build_id = %build_id, "build saved"),
                    Err(e) => tracing::warn!(error = %e, "build persistence failed"),
                }
            });
        }

        Ok(result)
    }

    fn spawn_ticker(&self, started: Instant, token: CancellationToken) {
        let tick = self.settings.tick;
        if tick.is_zero() || self.settings.phases.len() < 2 {
            return;
        }
        let phases = self.settings.phases.clone();
        let indicator = self.indicator.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(started + tick, tick);
            let mut n: u64 = 0;
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        n += 1;
                        // Checked under the channel lock so no tick lands after a clear.
                        indicator.send_if_modified(|state| {
                            if token.is_cancelled() {
                                return false;
                            }
                            *state = loading(&phases, n);
                            true
                        });
                    }
                }
            }
        });
    }

    fn clear_if_current(&self, epoch: u64, token: &CancellationToken) {
        clear(&self.indicator, &self.epoch, epoch, token);
    }
}

fn clear(
    indicator: &watch::Sender<PreviewIndicator>,
    epochs: &AtomicU64,
    epoch: u64,
    token: &CancellationToken,
) {
    indicator.send_if_modified(|state| {
        if epochs.load(Ordering::SeqCst) != epoch {
            return false;
        }
        token.cancel();
        *state = PreviewIndicator::Hidden;
        true
    });
}
