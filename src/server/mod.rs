//! Server lifecycle: coordinated start/stop of the public listener and the
//! internal relay channel.
//!
//! Start applies the stale-channel heuristic (a relay socket older than the
//! process itself is a leftover from an unclean shutdown and is removed),
//! then binds both listeners and spawns their accept loops. Stop aborts the
//! loops without draining in-flight connections and deliberately leaves the
//! relay socket on disk for the next start's heuristic. Configuration is
//! immutable while the listeners are bound.

mod front;
mod terminator;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::SystemTime;

use tokio::net::{TcpListener, UnixListener};
use tokio::task::JoinHandle;

use crate::config::ListenerConfig;
use crate::dispatch::Dispatcher;
use crate::error::ServerError;
use crate::events::{EventBus, ServerEvent};
use crate::registry::DomainRegistry;

/// The front door: one public endpoint, many certificate domains.
pub struct Server {
    config: StdMutex<ListenerConfig>,
    registry: Arc<DomainRegistry>,
    dispatcher: Arc<Dispatcher>,
    events: EventBus,
    /// Reference point for the stale-channel heuristic. The server is
    /// constructed during process startup, so this approximates
    /// (now - process uptime).
    started_at: SystemTime,
    running: StdMutex<Option<Running>>,
}

struct Running {
    local_addr: SocketAddr,
    front_task: JoinHandle<()>,
    relay_task: JoinHandle<()>,
}

impl Server {
    pub fn new(
        config: ListenerConfig,
        registry: Arc<DomainRegistry>,
        dispatcher: Arc<Dispatcher>,
        events: EventBus,
    ) -> Self {
        Self {
            config: StdMutex::new(config),
            registry,
            dispatcher,
            events,
            started_at: SystemTime::now(),
            running: StdMutex::new(None),
        }
    }

    /// Bind both listeners and start accepting.
    ///
    /// A stale relay socket (older than process start) is removed first;
    /// failure to remove it is reported and startup proceeds anyway. A
    /// fresh or un-removable socket is bound best-effort: a genuinely live
    /// conflicting instance fails the bind, which is emitted process-wide
    /// and returned as [`ServerError::Listen`].
    pub async fn start(&self) -> Result<(), ServerError> {
        if self.running_guard().is_some() {
            return Err(ServerError::Configuration(
                "server is already running".to_string(),
            ));
        }
        let config = self
            .config
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        if let Err(err) = clean_stale_channel(&config.relay_path, self.started_at) {
            tracing::warn!(error = %err, "Stale relay channel cleanup failed");
            self.events.emit(ServerEvent::Error(err.to_string()));
        }

        let public = TcpListener::bind(("0.0.0.0", config.port))
            .await
            .map_err(|err| self.listen_error("public listener", err))?;
        let local_addr = public.local_addr().map_err(ServerError::Listen)?;

        let relay = UnixListener::bind(&config.relay_path)
            .map_err(|err| self.listen_error("relay channel", err))?;

        let acceptor = terminator::build_acceptor(self.registry.clone());

        let relay_path: Arc<str> = config.relay_path.clone().into();
        let front_task = tokio::spawn(front::accept_loop(
            public,
            self.registry.clone(),
            relay_path,
            self.events.clone(),
        ));

        let relay_task = tokio::spawn(terminator::accept_loop(
            relay,
            acceptor,
            self.dispatcher.clone(),
            self.events.clone(),
        ));

        tracing::info!(
            addr = %local_addr,
            relay = %config.relay_path,
            "Front door listening"
        );

        *self.running_guard() = Some(Running {
            local_addr,
            front_task,
            relay_task,
        });
        Ok(())
    }

    /// Abort both accept loops and drop the listeners.
    ///
    /// Not graceful: in-flight splices and handshakes are abandoned. The
    /// relay socket path is left on disk; the next start's heuristic
    /// decides its fate.
    pub fn stop(&self) {
        if let Some(running) = self.running_guard().take() {
            running.front_task.abort();
            running.relay_task.abort();
            tracing::info!("Front door stopped");
        }
    }

    /// Whether both listeners are currently bound and accepting.
    pub fn is_running(&self) -> bool {
        self.running_guard().is_some()
    }

    /// Bound public address; `None` while stopped. Reflects the actual
    /// port, so config port 0 is usable in tests.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running_guard().as_ref().map(|r| r.local_addr)
    }

    /// Change the public port. Fails while running.
    pub fn set_port(&self, port: u16) -> Result<(), ServerError> {
        self.mutate_config(|config| config.port = port)
    }

    /// Change the relay channel path. Fails while running.
    pub fn set_relay_path(&self, path: &str) -> Result<(), ServerError> {
        self.mutate_config(|config| config.relay_path = path.to_string())
    }

    fn mutate_config(&self, apply: impl FnOnce(&mut ListenerConfig)) -> Result<(), ServerError> {
        if self.is_running() {
            return Err(ServerError::Configuration(
                "cannot change configuration while running".to_string(),
            ));
        }
        apply(&mut self.config.lock().unwrap_or_else(PoisonError::into_inner));
        Ok(())
    }

    fn listen_error(&self, what: &str, err: std::io::Error) -> ServerError {
        tracing::error!(error = %err, "Failed to bind {what}");
        self.events
            .emit(ServerEvent::Error(format!("{what} bind failed: {err}")));
        ServerError::Listen(err)
    }

    fn running_guard(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Remove the relay socket if it predates `process_start`.
///
/// Returns whether a file was removed. An absent path and a fresh file are
/// both left alone (the fresh case is resolved by the bind attempt); only
/// a removal failure is an error, and callers proceed regardless.
fn clean_stale_channel(path: &str, process_start: SystemTime) -> Result<bool, ServerError> {
    let Ok(metadata) = std::fs::metadata(Path::new(path)) else {
        return Ok(false);
    };
    let modified = metadata
        .modified()
        .map_err(|source| ServerError::RelayChannelStale {
            path: path.to_string(),
            source,
        })?;
    if modified >= process_start {
        return Ok(false);
    }
    tracing::info!(%path, "Removing stale relay channel");
    std::fs::remove_file(path).map_err(|source| ServerError::RelayChannelStale {
        path: path.to_string(),
        source,
    })?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn server_with(config: ListenerConfig) -> Server {
        let events = EventBus::new();
        let registry = DomainRegistry::new(events.clone());
        let dispatcher = Dispatcher::new(registry.clone());
        Server::new(config, registry, dispatcher, events)
    }

    fn temp_config(dir: &tempfile::TempDir) -> ListenerConfig {
        ListenerConfig {
            port: 0,
            relay_path: dir
                .path()
                .join("relay.sock")
                .to_string_lossy()
                .into_owned(),
        }
    }

    #[tokio::test]
    async fn test_config_mutation_blocked_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let server = server_with(temp_config(&dir));

        assert!(server.set_port(0).is_ok());
        server.start().await.unwrap();
        assert!(matches!(
            server.set_port(8443),
            Err(ServerError::Configuration(_))
        ));
        assert!(matches!(
            server.set_relay_path("elsewhere.sock"),
            Err(ServerError::Configuration(_))
        ));

        server.stop();
        assert!(server.set_port(0).is_ok());
    }

    #[tokio::test]
    async fn test_stop_leaves_relay_socket_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let config = temp_config(&dir);
        let relay_path = config.relay_path.clone();
        let server = server_with(config);

        server.start().await.unwrap();
        assert!(std::fs::metadata(&relay_path).is_ok());
        server.stop();
        assert!(std::fs::metadata(&relay_path).is_ok());
    }

    #[tokio::test]
    async fn test_in_process_restart_conflicts_with_leftover_socket() {
        let dir = tempfile::tempdir().unwrap();
        let server = server_with(temp_config(&dir));

        server.start().await.unwrap();
        server.stop();
        // The leftover socket is fresh relative to this process, so the
        // heuristic keeps it and the best-effort rebind surfaces the
        // conflict instead.
        let second = server.start().await;
        assert!(matches!(second, Err(ServerError::Listen(_))));
    }

    #[tokio::test]
    async fn test_fresh_socket_surfaces_listen_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = temp_config(&dir);
        let relay_path = config.relay_path.clone();

        // A live-looking (fresh) socket file occupies the address.
        let _occupant = std::os::unix::net::UnixListener::bind(&relay_path).unwrap();

        let server = server_with(config);
        let mut events = server.events.subscribe();
        let result = server.start().await;
        assert!(matches!(result, Err(ServerError::Listen(_))));
        assert!(matches!(
            events.try_recv().unwrap(),
            ServerEvent::Error(_)
        ));
    }

    #[test]
    fn test_stale_channel_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.sock");
        std::fs::write(&path, b"").unwrap();

        // A cutoff in the future makes the just-created file stale.
        let cutoff = SystemTime::now() + Duration::from_secs(60);
        assert!(clean_stale_channel(path.to_str().unwrap(), cutoff).unwrap());
        assert!(std::fs::metadata(&path).is_err());
    }

    #[test]
    fn test_fresh_channel_kept() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.sock");
        std::fs::write(&path, b"").unwrap();

        let cutoff = SystemTime::now() - Duration::from_secs(60);
        assert!(!clean_stale_channel(path.to_str().unwrap(), cutoff).unwrap());
        assert!(std::fs::metadata(&path).is_ok());
    }

    #[test]
    fn test_absent_channel_is_noop() {
        assert!(!clean_stale_channel("/nonexistent/relay.sock", SystemTime::now()).unwrap());
    }
}
