use std::sync::Arc;

use futures::future::join_all;
use log::{debug, error, info};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::kismet::SnapshotFetcher;
use crate::messages::PresenceEvent;
use crate::notify::{Dispatcher, Notifier};
use crate::tracker::{Tracker, TrackerExit};

const EVENT_CHANNEL_CAPACITY: usize = 64;

pub struct Manager<F> {
    config: Arc<AppConfig>,
    fetcher: Arc<F>,
    notifiers: Vec<Notifier>,
}

impl<F: SnapshotFetcher + 'static> Manager<F> {
    pub fn new(config: AppConfig, fetcher: F, notifiers: Vec<Notifier>) -> Self {
        Manager {
            config: Arc::new(config),
            fetcher: Arc::new(fetcher),
            notifiers,
        }
    }

    fn spawn_tracker(
        &self,
        tracker: Tracker,
        events: mpsc::Sender<PresenceEvent>,
        cancel: &CancellationToken,
    ) -> JoinHandle<()> {
        let fetcher = Arc::clone(&self.fetcher);
        let stops_all = self.config.errors.fatal_stops_all;
        let root = cancel.clone();
        let cancel = cancel.child_token();

        tokio::spawn(async move {
            let label = tracker.label().to_string();
            match tracker.run(fetcher.as_ref(), events, cancel).await {
                TrackerExit::Cancelled => debug!("Tracker for {} cancelled", label),
                TrackerExit::Fatal(err) => {
                    error!("Tracker for {} stopped: {}", label, err);
                    if stops_all {
                        root.cancel();
                    }
                }
            }
        })
    }

    /// Runs every enabled device's tracker until `cancel` fires or all of them
    /// have stopped, then lets the notifiers drain what is queued.
    pub async fn run_loop(mut self, cancel: CancellationToken) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let notifiers = std::mem::take(&mut self.notifiers);
        let dispatcher = tokio::spawn(Dispatcher::new(rx, notifiers).run());

        let poll_interval = self.config.poll_interval();
        let handles: Vec<JoinHandle<()>> = self
            .config
            .enabled_devices()
            .map(|device| {
                let tracker = Tracker::new(device, poll_interval, self.config.errors);
                self.spawn_tracker(tracker, tx.clone(), &cancel)
            })
            .collect();
        info!("Tracking {} device(s)", handles.len());

        // Trackers hold the only senders from here on.
        drop(tx);

        for result in join_all(handles).await {
            if let Err(err) = result {
                error!("Tracker task failed: {:?}", err);
            }
        }
        info!("All trackers stopped");

        if let Err(err) = dispatcher.await {
            error!("Notifier task failed: {:?}", err);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::{ErrorPolicy, KismetConfig, NotifyConfig};
    use crate::presence::tests::device;
    use crate::tracker::tests::{ScriptedFetcher, Step};

    fn app_config(policy: ErrorPolicy) -> AppConfig {
        let mut disabled = device(0, 0);
        disabled.address = "00:11:22:33:44:55".parse().unwrap();
        disabled.enabled = false;
        AppConfig {
            poll_interval_millis: 1000,
            kismet: KismetConfig::default(),
            errors: policy,
            notify: NotifyConfig::default(),
            mqtt: None,
            devices: vec![device(0, 0), disabled],
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_stops_all_trackers() {
        let manager = Manager::new(
            app_config(ErrorPolicy::default()),
            ScriptedFetcher::new([Step::Seen(1), Step::Seen(2)]),
            vec![Notifier::Console],
        );
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(manager.run_loop(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!handle.is_finished());
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_can_stop_everything() {
        let policy = ErrorPolicy {
            malformed_is_fatal: true,
            fatal_stops_all: true,
        };
        let manager = Manager::new(
            app_config(policy),
            ScriptedFetcher::new([Step::Seen(1), Step::Malformed]),
            Vec::new(),
        );
        let cancel = CancellationToken::new();

        manager.run_loop(cancel.clone()).await;
        assert!(cancel.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_stays_local_by_default() {
        let policy = ErrorPolicy {
            malformed_is_fatal: true,
            fatal_stops_all: false,
        };
        let manager = Manager::new(
            app_config(policy),
            ScriptedFetcher::new([Step::Malformed]),
            Vec::new(),
        );
        let cancel = CancellationToken::new();

        // the only tracker exits, so the loop returns without a cancel
        manager.run_loop(cancel.clone()).await;
        assert!(!cancel.is_cancelled());
    }
}
