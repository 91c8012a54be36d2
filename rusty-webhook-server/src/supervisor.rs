//! The hot reload loop.
//!
//! ```text
//! Loading ──► Serving ──(change)──► ReloadTriggered ──► Loading
//!    │           └──(server exited)───────────────────► Loading
//!    └──(watch, bad config or bind)──► LoadFailed ──(back-off)──► Loading
//! ```
//!
//! Each pass through `Loading` builds a new [`Generation`] that the supervisor owns
//! outright. The only handle into a running generation is its one-shot stop channel.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use axum::Router;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config;
use crate::routes;
use crate::watcher::{ConfigSignal, ConfigWatcher};

#[derive(Debug, Clone)]
pub struct Settings {
    /// The json endpoint configuration.
    pub config: PathBuf,
    pub host: String,
    pub port: u16,
    /// Wait before loading again after a failure.
    pub reload_backoff: Duration,
    /// How long a stopping generation may finish in-flight requests.
    pub shutdown_grace: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("failed to create the config watcher: {0}")]
    Watcher(#[from] notify::Error),
}

#[derive(Debug)]
pub enum State {
    Loading,
    Serving(Generation),
    ReloadTriggered,
    LoadFailed,
}

/// One config → router → server lifecycle.
#[derive(Debug)]
pub struct Generation {
    number: u64,
    stop: oneshot::Sender<()>,
    server: JoinHandle<io::Result<()>>,
}

impl Generation {
    fn start(number: u64, listener: tokio::net::TcpListener, router: Router) -> Self {
        let (stop, stopped) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            axum::serve(listener, router.into_make_service())
                .with_graceful_shutdown(async move {
                    // A dropped sender also stops the server.
                    let _ = stopped.await;
                })
                .await
        });
        Self {
            number,
            stop,
            server,
        }
    }

    /// Stops accepting and gives in-flight requests `grace` to finish, then aborts.
    ///
    /// Detached command runs are separate tasks and keep going.
    async fn stop(self, grace: Duration) {
        let Generation {
            number,
            stop,
            mut server,
        } = self;
        let _ = stop.send(());
        match tokio::time::timeout(grace, &mut server).await {
            Ok(Ok(Ok(()))) => log::info!(generation = number; "server stopped"),
            Ok(Ok(Err(e))) => log::warn!(generation = number; "server stopped with error: {e}"),
            Ok(Err(e)) => log::error!(generation = number; "server task failed: {e}"),
            Err(_) => {
                log::warn!(generation = number; "in-flight requests did not finish, aborting");
                server.abort();
            }
        }
    }
}

enum Wake {
    Signal(ConfigSignal),
    Exited(Result<io::Result<()>, tokio::task::JoinError>),
}

pub struct Supervisor {
    settings: Settings,
    watcher: ConfigWatcher,
    /// Kept bound across reloads so that connections queue up during a swap.
    listener: Option<std::net::TcpListener>,
    generations: u64,
}

impl Supervisor {
    /// Fails only if the platform file watcher cannot be created.
    pub fn new(settings: Settings) -> Result<Self, SupervisorError> {
        Ok(Self {
            settings,
            watcher: ConfigWatcher::new()?,
            listener: None,
            generations: 0,
        })
    }

    /// Runs the reload loop forever.
    pub async fn run(mut self) {
        let mut state = State::Loading;
        loop {
            state = self.step(state).await;
        }
    }

    /// Performs a single transition.
    pub async fn step(&mut self, state: State) -> State {
        match state {
            State::Loading => self.load().await,
            State::Serving(generation) => self.serve(generation).await,
            State::ReloadTriggered => State::Loading,
            State::LoadFailed => {
                log::info!(backoff:debug = self.settings.reload_backoff; "retrying to load");
                tokio::time::sleep(self.settings.reload_backoff).await;
                State::Loading
            }
        }
    }

    /// The address of the bound socket, if any.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.listener.as_ref()?.local_addr().ok()
    }

    async fn load(&mut self) -> State {
        // Changes up to now are covered by the read below.
        self.watcher.clear();

        // Watched before the read, so a save racing the read triggers another reload.
        let path = self.settings.config.clone();
        if let Err(e) = self.watcher.watch(&path) {
            log::error!(path:debug; "failed to watch config: {e}");
            self.listener = None;
            return State::LoadFailed;
        }

        let snapshot = match config::load(&path).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                log::error!(path:debug; "{e}");
                self.listener = None;
                return State::LoadFailed;
            }
        };
        log::info!(
            path:debug, endpoints:debug = snapshot.endpoints().keys().collect::<Vec<_>>();
            "loaded config"
        );
        let router = routes::routes(snapshot);

        let listener = match self.listener() {
            Ok(listener) => listener,
            Err(e) => {
                log::error!(
                    host = self.settings.host.as_str(), port = self.settings.port;
                    "failed to bind: {e}"
                );
                self.listener = None;
                return State::LoadFailed;
            }
        };

        self.generations += 1;
        log::info!(generation = self.generations, addr:debug = self.local_addr(); "started server");
        State::Serving(Generation::start(self.generations, listener, router))
    }

    /// A handle onto the shared socket for the next generation, binding it first if needed.
    fn listener(&mut self) -> io::Result<tokio::net::TcpListener> {
        let listener = match self.listener.take() {
            Some(listener) => listener,
            None => {
                let listener =
                    std::net::TcpListener::bind((self.settings.host.as_str(), self.settings.port))?;
                listener.set_nonblocking(true)?;
                listener
            }
        };
        let handle = listener.try_clone();
        self.listener = Some(listener);
        let handle = handle?;
        handle.set_nonblocking(true)?;
        tokio::net::TcpListener::from_std(handle)
    }

    async fn serve(&mut self, mut generation: Generation) -> State {
        loop {
            let wake = tokio::select! {
                signal = self.watcher.next() => Wake::Signal(signal),
                result = &mut generation.server => Wake::Exited(result),
            };
            match wake {
                Wake::Signal(ConfigSignal::Changed(event)) => {
                    log::info!(
                        generation = generation.number;
                        "event: {:?} {:?}", event.kind, event.paths
                    );
                    generation.stop(self.settings.shutdown_grace).await;
                    return State::ReloadTriggered;
                }
                Wake::Signal(ConfigSignal::Error(e)) => {
                    log::error!(generation = generation.number; "config watcher error: {e}");
                }
                Wake::Exited(result) => {
                    log::error!(
                        generation = generation.number;
                        "server exited unexpectedly: {result:?}"
                    );
                    self.listener = None;
                    return State::Loading;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;

    const TOKEN: &str = "12345678901234567890";

    fn settings(config: &Path) -> Settings {
        Settings {
            config: config.to_path_buf(),
            host: String::from("127.0.0.1"),
            port: 0,
            reload_backoff: Duration::from_millis(10),
            shutdown_grace: Duration::from_secs(1),
        }
    }

    fn endpoint(path: &str) -> String {
        format!(
            r#"{{"{path}": {{"commands": ["echo %s"], "token": "{TOKEN}", "args": ["name"]}}}}"#
        )
    }

    async fn health(addr: std::net::SocketAddr) -> reqwest::StatusCode {
        reqwest::get(format!("http://{addr}/health"))
            .await
            .expect("health reachable")
            .status()
    }

    #[tokio::test(flavor = "current_thread")]
    async fn invalid_config_backs_off() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"/x": {"commands": [], "token": "short"}}"#).unwrap();
        let mut supervisor = Supervisor::new(settings(&path)).unwrap();

        let state = supervisor.step(State::Loading).await;
        assert!(matches!(state, State::LoadFailed), "{state:?}");
        assert!(supervisor.local_addr().is_none());
        let state = supervisor.step(state).await;
        assert!(matches!(state, State::Loading), "{state:?}");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn missing_config_backs_off() {
        let dir = tempfile::tempdir().unwrap();
        let mut supervisor = Supervisor::new(settings(&dir.path().join("config.json"))).unwrap();
        let state = supervisor.step(State::Loading).await;
        assert!(matches!(state, State::LoadFailed), "{state:?}");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn change_swaps_generation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, endpoint("/one")).unwrap();
        let mut supervisor = Supervisor::new(settings(&path)).unwrap();

        let state = supervisor.step(State::Loading).await;
        let State::Serving(generation) = state else {
            panic!("expected to serve");
        };
        assert_eq!(generation.number, 1);
        let addr = supervisor.local_addr().expect("bound");
        assert_eq!(health(addr).await, reqwest::StatusCode::OK);

        std::fs::write(&path, endpoint("/two")).unwrap();
        let state = tokio::time::timeout(
            Duration::from_secs(10),
            supervisor.step(State::Serving(generation)),
        )
        .await
        .expect("change noticed");
        assert!(matches!(state, State::ReloadTriggered), "{state:?}");

        // The socket outlives the generation, so calls wait instead of failing.
        let pending = tokio::spawn(health(addr));
        let state = supervisor.step(state).await;
        let state = supervisor.step(state).await;
        let State::Serving(generation) = state else {
            panic!("expected to serve again");
        };
        assert_eq!(generation.number, 2);
        assert_eq!(supervisor.local_addr(), Some(addr));
        assert_eq!(pending.await.unwrap(), reqwest::StatusCode::OK);

        let client = reqwest::Client::new();
        let form = [("token", TOKEN), ("name", "new")];
        let old = client
            .post(format!("http://{addr}/one"))
            .form(&form)
            .send()
            .await
            .unwrap();
        assert_eq!(old.status(), reqwest::StatusCode::NOT_FOUND);
        let new = client
            .post(format!("http://{addr}/two"))
            .form(&form)
            .send()
            .await
            .unwrap();
        assert_eq!(new.text().await.unwrap(), "new\n");

        generation.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn invalid_config_is_still_watched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        let mut supervisor = Supervisor::new(settings(&path)).unwrap();
        assert!(matches!(supervisor.step(State::Loading).await, State::LoadFailed));

        std::fs::write(&path, endpoint("/one")).unwrap();
        let signal = tokio::time::timeout(Duration::from_secs(10), supervisor.watcher.next())
            .await
            .expect("fix noticed");
        assert!(matches!(signal, ConfigSignal::Changed(_)), "{signal:?}");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn watcher_error_keeps_serving() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, endpoint("/one")).unwrap();
        let mut supervisor = Supervisor::new(settings(&path)).unwrap();

        let State::Serving(generation) = supervisor.step(State::Loading).await else {
            panic!("expected to serve");
        };
        let addr = supervisor.local_addr().expect("bound");
        supervisor.watcher.inject(Err(notify::Error::generic("watch lost")));

        let serving = supervisor.step(State::Serving(generation));
        tokio::pin!(serving);
        let status = tokio::select! {
            state = &mut serving => panic!("stopped serving: {state:?}"),
            status = async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                health(addr).await
            } => status,
        };
        assert_eq!(status, reqwest::StatusCode::OK);

        // Still the same loop, a change ends it as usual.
        std::fs::write(&path, endpoint("/two")).unwrap();
        let state = tokio::time::timeout(Duration::from_secs(10), serving)
            .await
            .expect("change noticed");
        assert!(matches!(state, State::ReloadTriggered), "{state:?}");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn broken_edit_releases_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, endpoint("/one")).unwrap();
        let mut supervisor = Supervisor::new(settings(&path)).unwrap();

        let State::Serving(generation) = supervisor.step(State::Loading).await else {
            panic!("expected to serve");
        };
        std::fs::write(&path, "{ not json").unwrap();
        let state = supervisor.step(State::Serving(generation)).await;
        let state = supervisor.step(state).await;
        assert!(matches!(supervisor.step(state).await, State::LoadFailed));
        assert!(supervisor.local_addr().is_none());

        // Fixing the file is picked up by the next attempt.
        std::fs::write(&path, endpoint("/one")).unwrap();
        let state = supervisor.step(State::LoadFailed).await;
        let State::Serving(generation) = supervisor.step(state).await else {
            panic!("expected to serve after the fix");
        };
        assert_eq!(generation.number, 2);
        generation.stop(Duration::from_secs(1)).await;
    }
}
