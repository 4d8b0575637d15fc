//! Control scheduling: the pending-action mailbox and polling cadence.
//!
//! A single cooperative task drives [`Scheduler::run`]. Each tick, in
//! order:
//!
//! 1. Without a refresh token nothing happens until an external trigger
//!    posts an action (the authorization callback, in practice).
//! 2. When the access token is due and the five-second renewal limit has a
//!    free slot, the token is renewed and the tick ends; success posts
//!    [`Action::Poll`].
//! 3. Otherwise the pending action is dispatched. The slot is read fresh at
//!    the top of the dispatch and reverted by compare-and-swap, so an
//!    external write landing mid-service is never lost; it is simply the
//!    next tick's action.
//!
//! Polling is adaptive: when the current track will end inside the base
//! interval, a one-shot override schedules the next poll right after track
//! end, and every successful control command forces a near-immediate
//! re-poll instead of predicting the outcome.

use std::{
    io,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::time::Instant;

use crate::{
    player::{PlaybackSnapshot, PlayerClient},
    token::TokenManager,
};

/// The single next operation the scheduler must perform.
///
/// Last write wins: producers overwrite freely, and only the value present
/// at the start of a tick is ever serviced.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum Action {
    /// Nothing to do until an external trigger.
    #[default]
    Idle,

    /// Exchange a one-shot authorization code from the consent callback.
    AcquireToken(String),

    /// Steady state: poll playback when the cadence says so.
    Poll,

    /// Skip to the next track.
    Next,

    /// Skip to the previous track.
    Previous,

    /// Toggle play/pause.
    TogglePlayback,
}

/// Single-slot action mailbox.
#[derive(Clone, Debug, Default)]
pub struct ActionSlot(Arc<Mutex<Action>>);

impl ActionSlot {
    #[must_use]
    pub fn new(initial: Action) -> Self {
        Self(Arc::new(Mutex::new(initial)))
    }

    /// Overwrites the slot unconditionally.
    pub fn post(&self, action: Action) {
        *self.0.lock().expect("action slot poisoned") = action;
    }

    /// Fresh read of the slot.
    #[must_use]
    pub fn current(&self) -> Action {
        self.0.lock().expect("action slot poisoned").clone()
    }

    /// Replaces `serviced` with `next` only if no producer wrote in the
    /// meantime; a fresh external write always wins over the reversion.
    pub fn revert(&self, serviced: &Action, next: Action) {
        let mut slot = self.0.lock().expect("action slot poisoned");
        if *slot == *serviced {
            *slot = next;
        }
    }

    /// Post-only capability for external producers.
    #[must_use]
    pub fn handle(&self) -> ActionHandle {
        ActionHandle(self.clone())
    }
}

/// What input sources get: the ability to post an action, nothing else.
///
/// Buttons, gestures and the authorization callback all reduce to the same
/// contract. How the call is triggered is the producer's business.
#[derive(Clone, Debug)]
pub struct ActionHandle(ActionSlot);

impl ActionHandle {
    pub fn post(&self, action: Action) {
        self.0.post(action);
    }
}

/// Consumer of playback updates.
///
/// A track-id change means the display must refresh art and titles; an
/// unchanged id only advances the progress bar.
pub trait Presenter: Send + Sync {
    fn track_changed(&self, snapshot: &PlaybackSnapshot);
    fn progress(&self, snapshot: &PlaybackSnapshot);
}

/// Presenter that logs updates; stands in for a real display.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogPresenter;

impl Presenter for LogPresenter {
    fn track_changed(&self, snapshot: &PlaybackSnapshot) {
        info!(
            "now playing: {} by {}",
            snapshot.track_name,
            snapshot.artist_names.join(", ")
        );
    }

    fn progress(&self, snapshot: &PlaybackSnapshot) {
        debug!("progress: {}/{} ms", snapshot.progress_ms, snapshot.duration_ms);
    }
}

/// Spacing of scheduler ticks. Frequent relative to the polling delay; a
/// tick with nothing due costs one slot read.
pub const TICK_INTERVAL: Duration = Duration::from_millis(50);

/// Slack added when aligning a poll with track end, and the delay before
/// re-polling after a successful control command.
pub const REPOLL_SLACK: Duration = Duration::from_millis(200);

/// Drives the control loop: owns the pending action, the poll schedule,
/// the credential manager and the last playback snapshot.
pub struct Scheduler {
    slot: ActionSlot,
    tokens: TokenManager,
    player: PlayerClient,
    presenter: Arc<dyn Presenter>,
    snapshot: Option<PlaybackSnapshot>,
    is_playing: bool,
    polling_delay: Duration,
    last_poll_at: Option<Instant>,
    next_poll_override: Option<Instant>,
}

impl Scheduler {
    #[must_use]
    pub fn new(
        tokens: TokenManager,
        player: PlayerClient,
        presenter: Arc<dyn Presenter>,
        polling_delay: Duration,
    ) -> Self {
        // With a stored refresh token the device can go straight to
        // polling; otherwise it waits for the authorization callback.
        let initial = if tokens.has_refresh_token() {
            Action::Poll
        } else {
            Action::Idle
        };

        Self {
            slot: ActionSlot::new(initial),
            tokens,
            player,
            presenter,
            snapshot: None,
            is_playing: true,
            polling_delay,
            last_poll_at: None,
            next_poll_override: None,
        }
    }

    /// Capability for external producers to post actions.
    #[must_use]
    pub fn handle(&self) -> ActionHandle {
        self.slot.handle()
    }

    /// The action currently pending, as a producer would observe it.
    #[must_use]
    pub fn pending(&self) -> Action {
        self.slot.current()
    }

    /// Last confirmed play/pause state.
    #[must_use]
    pub fn is_playing(&self) -> bool {
        self.is_playing
    }

    /// Last successful playback snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Option<&PlaybackSnapshot> {
        self.snapshot.as_ref()
    }

    /// Clears credentials, wipes the token store and goes idle.
    pub fn reset(&mut self) -> io::Result<()> {
        self.tokens.reset()?;
        self.snapshot = None;
        self.slot.post(Action::Idle);
        Ok(())
    }

    /// Runs the tick loop forever. Failures degrade state, never the loop.
    pub async fn run(&mut self) {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    /// One scheduler tick.
    pub async fn tick(&mut self) {
        let now = Instant::now();

        // Proactive renewal preempts the tick, but only when an attempt is
        // actually possible; while rate-limited, normal dispatch continues.
        if self.tokens.has_refresh_token()
            && self.tokens.should_renew(now)
            && self.tokens.renewal_permitted()
        {
            if self.tokens.refresh().await.is_ok() {
                self.slot.post(Action::Poll);
            }
            return;
        }

        let action = self.slot.current();
        match action {
            Action::Idle => {}
            Action::AcquireToken(ref code) => {
                // The code is one-shot either way: a failed exchange goes
                // back to idle instead of retrying.
                let next = match self.tokens.exchange_authorization_code(code).await {
                    Ok(()) => Action::Poll,
                    Err(e) => {
                        warn!("authorization code exchange failed: {e}");
                        Action::Idle
                    }
                };
                self.slot.revert(&action, next);
            }
            Action::Poll => {
                if self.poll_due(now) {
                    self.poll(now).await;
                }
            }
            Action::Next | Action::Previous | Action::TogglePlayback => {
                self.command(&action).await;
                self.slot.revert(&action, Action::Poll);
            }
        }
    }

    fn poll_due(&self, now: Instant) -> bool {
        if self.next_poll_override.is_some_and(|at| now >= at) {
            return true;
        }
        self.last_poll_at
            .is_none_or(|at| now.saturating_duration_since(at) >= self.polling_delay)
    }

    async fn poll(&mut self, now: Instant) {
        let Some(access_token) = self.tokens.access_token().map(ToOwned::to_owned) else {
            return;
        };

        self.last_poll_at = Some(now);
        // The override is one-shot; consumed whether or not it triggered.
        self.next_poll_override = None;

        match self.player.currently_playing(&access_token).await {
            Ok(Some(snapshot)) => {
                self.is_playing = snapshot.is_playing;

                // A track about to end inside the base interval gets its
                // own poll right after it finishes.
                if snapshot.is_playing && snapshot.remaining() < self.polling_delay {
                    self.next_poll_override = Some(now + snapshot.remaining() + REPOLL_SLACK);
                }

                let track_changed = self
                    .snapshot
                    .as_ref()
                    .is_none_or(|previous| previous.track_id != snapshot.track_id);
                if track_changed {
                    self.presenter.track_changed(&snapshot);
                } else {
                    self.presenter.progress(&snapshot);
                }

                self.snapshot = Some(snapshot);
            }
            Ok(None) => {
                // No active session; keep the last known state.
            }
            Err(e) => {
                debug!("playback poll failed: {e}");
            }
        }
    }

    async fn command(&mut self, action: &Action) {
        let Some(access_token) = self.tokens.access_token().map(ToOwned::to_owned) else {
            return;
        };

        let result = match action {
            Action::Next => self.player.next(&access_token).await,
            Action::Previous => self.player.previous(&access_token).await,
            Action::TogglePlayback => self.player.toggle(&access_token, self.is_playing).await,
            _ => return,
        };

        match result {
            Ok(()) => {
                if *action == Action::TogglePlayback {
                    // Confirmed by the service; never flipped optimistically.
                    self.is_playing = !self.is_playing;
                }
                // Commands are fire-and-forget: re-fetch the authoritative
                // state shortly instead of predicting it.
                self.next_poll_override = Some(Instant::now() + REPOLL_SLACK);
            }
            Err(e) => {
                debug!("control command failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Config,
        events::LogSink,
        exchange::{testing::Scripted, HttpExchange},
        store::{MemoryTokenStore, TokenStore},
    };
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn config() -> Config {
        Config {
            client_id: "client-id".to_owned(),
            client_secret: "client-secret".to_owned(),
            redirect_uri: "http://spotnik.local/callback/".to_owned(),
            polling_delay: Duration::from_secs(5),
            accounts_host: "accounts.example".to_owned(),
            accounts_port: 443,
            api_host: "api.example".to_owned(),
            api_port: 443,
        }
    }

    #[derive(Default)]
    struct CountingPresenter {
        track_changes: AtomicUsize,
        progress_updates: AtomicUsize,
    }

    impl Presenter for CountingPresenter {
        fn track_changed(&self, _snapshot: &PlaybackSnapshot) {
            self.track_changes.fetch_add(1, Ordering::Relaxed);
        }

        fn progress(&self, _snapshot: &PlaybackSnapshot) {
            self.progress_updates.fetch_add(1, Ordering::Relaxed);
        }
    }

    struct Fixture {
        scheduler: Scheduler,
        exchanger: Arc<Scripted>,
        store: Arc<MemoryTokenStore>,
        presenter: Arc<CountingPresenter>,
    }

    fn fixture(stored_refresh: Option<&str>) -> Fixture {
        let exchanger = Arc::new(Scripted::default());
        let store = Arc::new(MemoryTokenStore::default());
        if let Some(token) = stored_refresh {
            store.save(token).unwrap();
        }
        let sink: Arc<LogSink> = Arc::new(LogSink::new());
        let presenter = Arc::new(CountingPresenter::default());

        let tokens = TokenManager::new(
            config(),
            exchanger.clone(),
            store.clone(),
            sink.clone(),
        );
        let player = PlayerClient::new(config(), exchanger.clone(), sink);
        let scheduler = Scheduler::new(
            tokens,
            player,
            presenter.clone(),
            config().polling_delay,
        );

        Fixture {
            scheduler,
            exchanger,
            store,
            presenter,
        }
    }

    fn token_response() -> HttpExchange {
        HttpExchange::new(
            200,
            serde_json::json!({
                "access_token": "BQDxy-access",
                "token_type": "Bearer",
                "expires_in": 3600,
                "refresh_token": "AQDrefresh",
            })
            .to_string()
            .into_bytes(),
        )
    }

    fn playing_response(track_id: &str, progress_ms: u64, duration_ms: u64) -> HttpExchange {
        HttpExchange::new(
            200,
            serde_json::json!({
                "is_playing": true,
                "progress_ms": progress_ms,
                "item": {
                    "id": track_id,
                    "name": "Track",
                    "duration_ms": duration_ms,
                    "artists": [{ "name": "Artist" }],
                    "album": { "images": [] },
                },
            })
            .to_string()
            .into_bytes(),
        )
    }

    /// Authorizes the scheduler and polls once, consuming two exchanges.
    async fn authorize_and_poll(fx: &mut Fixture, poll: HttpExchange) {
        fx.exchanger.push(token_response());
        fx.exchanger.push(poll);
        fx.scheduler.handle().post(Action::AcquireToken("abc123".to_owned()));
        fx.scheduler.tick().await; // exchange the code
        fx.scheduler.tick().await; // first poll, due immediately
    }

    #[tokio::test(start_paused = true)]
    async fn idle_without_credentials() {
        let mut fx = fixture(None);
        assert_eq!(fx.scheduler.pending(), Action::Idle);

        for _ in 0..10 {
            fx.scheduler.tick().await;
        }
        assert_eq!(fx.exchanger.request_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn authorization_code_exchange_transitions_to_poll() {
        let mut fx = fixture(None);
        fx.exchanger.push(token_response());

        fx.scheduler.handle().post(Action::AcquireToken("abc123".to_owned()));
        fx.scheduler.tick().await;

        assert_eq!(fx.scheduler.pending(), Action::Poll);
        assert_eq!(fx.store.load().as_deref(), Some("AQDrefresh"));
        assert_eq!(fx.exchanger.request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_code_exchange_goes_idle_without_retry() {
        let mut fx = fixture(None);
        fx.exchanger.push(HttpExchange::new(400, b"{\"error\":\"invalid_grant\"}".to_vec()));

        fx.scheduler.handle().post(Action::AcquireToken("stale".to_owned()));
        fx.scheduler.tick().await;
        assert_eq!(fx.scheduler.pending(), Action::Idle);

        // The code is one-shot: no further attempt on later ticks.
        fx.scheduler.tick().await;
        assert_eq!(fx.exchanger.request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn control_action_serviced_at_most_once() {
        let mut fx = fixture(None);
        authorize_and_poll(&mut fx, playing_response("track-1", 0, 180_000)).await;

        fx.exchanger.push(HttpExchange::new(204, Vec::new()));
        fx.scheduler.handle().post(Action::Next);
        fx.scheduler.tick().await;
        assert_eq!(fx.scheduler.pending(), Action::Poll);
        assert_eq!(fx.exchanger.request_count(), 3);

        // Re-poll is scheduled 200 ms out; ticking before then does nothing.
        fx.scheduler.tick().await;
        fx.scheduler.tick().await;
        assert_eq!(fx.exchanger.request_count(), 3);

        tokio::time::advance(REPOLL_SLACK).await;
        fx.exchanger.push(playing_response("track-2", 0, 180_000));
        fx.scheduler.tick().await;
        assert_eq!(fx.exchanger.request_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_external_write_wins_over_reversion() {
        let slot = ActionSlot::new(Action::Poll);
        let serviced = slot.current();
        assert_eq!(serviced, Action::Poll);

        // A producer posts while the scheduler is servicing.
        slot.post(Action::Next);
        slot.revert(&serviced, Action::Poll);
        assert_eq!(slot.current(), Action::Next);

        // Without an interleaved write the reversion applies.
        let serviced = slot.current();
        slot.revert(&serviced, Action::Poll);
        assert_eq!(slot.current(), Action::Poll);
    }

    #[tokio::test(start_paused = true)]
    async fn no_override_when_track_end_is_far() {
        let mut fx = fixture(None);
        // 10 s remaining with a 5 s interval: no early poll.
        authorize_and_poll(&mut fx, playing_response("track-1", 170_000, 180_000)).await;
        assert_eq!(fx.exchanger.request_count(), 2);

        tokio::time::advance(Duration::from_millis(4_999)).await;
        fx.scheduler.tick().await;
        assert_eq!(fx.exchanger.request_count(), 2);

        tokio::time::advance(Duration::from_millis(1)).await;
        fx.exchanger.push(playing_response("track-1", 175_000, 180_000));
        fx.scheduler.tick().await;
        assert_eq!(fx.exchanger.request_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn override_aligns_poll_with_track_end() {
        let mut fx = fixture(None);
        // 2 s remaining with a 5 s interval: poll again at 2.2 s.
        authorize_and_poll(&mut fx, playing_response("track-1", 170_000, 172_000)).await;

        tokio::time::advance(Duration::from_millis(2_199)).await;
        fx.scheduler.tick().await;
        assert_eq!(fx.exchanger.request_count(), 2);

        tokio::time::advance(Duration::from_millis(1)).await;
        fx.exchanger.push(playing_response("track-2", 0, 180_000));
        fx.scheduler.tick().await;
        assert_eq!(fx.exchanger.request_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn toggle_flips_only_on_success() {
        let mut fx = fixture(None);
        authorize_and_poll(&mut fx, playing_response("track-1", 0, 180_000)).await;
        assert!(fx.scheduler.is_playing());

        fx.exchanger.push(HttpExchange::new(204, Vec::new()));
        fx.scheduler.handle().post(Action::TogglePlayback);
        fx.scheduler.tick().await;
        assert!(!fx.scheduler.is_playing());
        let requests = fx.exchanger.requests();
        assert!(requests[2].0.starts_with("PUT /v1/me/player/pause HTTP/1.1\r\n"));

        // A failed toggle leaves the flag alone.
        fx.exchanger.push(HttpExchange::new(500, b"server error".to_vec()));
        fx.scheduler.handle().post(Action::TogglePlayback);
        fx.scheduler.tick().await;
        assert!(!fx.scheduler.is_playing());
        assert_eq!(fx.scheduler.pending(), Action::Poll);
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_track_only_updates_progress() {
        let mut fx = fixture(None);
        authorize_and_poll(&mut fx, playing_response("track-1", 0, 180_000)).await;
        assert_eq!(fx.presenter.track_changes.load(Ordering::Relaxed), 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        fx.exchanger.push(playing_response("track-1", 5_000, 180_000));
        fx.scheduler.tick().await;
        assert_eq!(fx.presenter.track_changes.load(Ordering::Relaxed), 1);
        assert_eq!(fx.presenter.progress_updates.load(Ordering::Relaxed), 1);

        tokio::time::advance(Duration::from_secs(5)).await;
        fx.exchanger.push(playing_response("track-2", 0, 180_000));
        fx.scheduler.tick().await;
        assert_eq!(fx.presenter.track_changes.load(Ordering::Relaxed), 2);
        assert_eq!(fx.presenter.progress_updates.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn renewal_attempted_at_most_once_per_window() {
        // Real clock on purpose: the renewal limiter runs on wall time.
        let mut fx = fixture(Some("AQDstored"));
        fx.exchanger.push(HttpExchange::new(400, b"{\"error\":\"invalid_grant\"}".to_vec()));

        for _ in 0..50 {
            fx.scheduler.tick().await;
        }

        // One failed renewal; the rest of the ticks were rate-limited and
        // fell through to dispatch, where polling had no token to use.
        assert_eq!(fx.exchanger.request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_renewal_posts_poll() {
        let mut fx = fixture(Some("AQDstored"));
        fx.exchanger.push(token_response());

        fx.scheduler.tick().await;
        assert_eq!(fx.scheduler.pending(), Action::Poll);
        let requests = fx.exchanger.requests();
        assert!(requests[0].1.contains("grant_type=refresh_token"));
        assert!(requests[0].1.contains("refresh_token=AQDstored"));
    }

    #[tokio::test(start_paused = true)]
    async fn reset_wipes_store_and_goes_idle() {
        let mut fx = fixture(None);
        authorize_and_poll(&mut fx, playing_response("track-1", 0, 180_000)).await;

        fx.scheduler.reset().unwrap();
        assert_eq!(fx.scheduler.pending(), Action::Idle);
        assert_eq!(fx.store.load(), None);
        assert!(fx.scheduler.snapshot().is_none());
    }
}
