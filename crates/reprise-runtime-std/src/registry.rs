//! Process-wide table of live sessions, one worker thread each.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use reprise_core::collections::map::HashMap;
use reprise_core::{
    Clock, EventSender, RuntimeConfig, Script, Session, SessionId, Transport, Value, WidgetIdentity,
};

use crate::{StdClock, StdRuntime};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("no session with id {0}")]
    UnknownSession(SessionId),
    #[error("failed to spawn worker for session {id}: {source}")]
    Spawn {
        id: SessionId,
        #[source]
        source: std::io::Error,
    },
    #[error("worker of session {0} panicked")]
    WorkerPanicked(SessionId),
}

enum WorkerMessage {
    Wake,
    Shutdown,
}

struct SessionHandle {
    events: EventSender,
    control: Sender<WorkerMessage>,
    last_active: Arc<AtomicU64>,
    worker: JoinHandle<()>,
}

/// Owns every live session of the process.
///
/// Sessions share the script, transport and configuration but nothing
/// mutable: each one is moved onto its own worker thread, which runs passes
/// as events arrive and sleeps until the next periodic fragment is due.
pub struct SessionRegistry {
    script: Arc<dyn Script>,
    transport: Arc<dyn Transport>,
    config: Arc<RuntimeConfig>,
    clock: Arc<StdClock>,
    sessions: Mutex<HashMap<SessionId, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new(script: Arc<dyn Script>, transport: Arc<dyn Transport>, config: RuntimeConfig) -> Self {
        Self {
            script,
            transport,
            config: Arc::new(config),
            clock: Arc::new(StdClock::new()),
            sessions: Mutex::new(HashMap::default()),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<SessionId, SessionHandle>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Opens a session and schedules its first full pass.
    pub fn create_session(&self) -> Result<SessionId, RegistryError> {
        let (control, inbox) = mpsc::channel();
        let runtime = StdRuntime::with_clock(Arc::clone(&self.clock));
        let wake = Mutex::new(control.clone());
        runtime.set_waker(move || {
            // A closed channel means the worker already stopped.
            let _ = wake
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .send(WorkerMessage::Wake);
        });
        let session = runtime
            .session_builder(Arc::clone(&self.script), Arc::clone(&self.transport))
            .config(Arc::clone(&self.config))
            .build();
        let id = *session.id();
        let events = session.event_sender();

        let worker = thread::Builder::new()
            .name(format!("reprise-session-{id}"))
            .spawn(move || run_worker(session, runtime, inbox))
            .map_err(|source| RegistryError::Spawn { id, source })?;

        events.request_rerun();
        let handle = SessionHandle {
            events,
            control,
            last_active: Arc::new(AtomicU64::new(self.clock.now_millis())),
            worker,
        };
        self.sessions().insert(id, handle);
        log::info!("session {id} created");
        Ok(id)
    }

    /// Stops the session's worker and drops its state.
    pub fn destroy_session(&self, id: &SessionId) -> Result<(), RegistryError> {
        let handle = self
            .sessions()
            .remove(id)
            .ok_or(RegistryError::UnknownSession(*id))?;
        shutdown(*id, handle)?;
        log::info!("session {id} destroyed");
        Ok(())
    }

    /// Delivers a widget change to a session.
    pub fn submit_event(&self, id: &SessionId, identity: WidgetIdentity, value: Value) -> Result<(), RegistryError> {
        let events = self.touch(id)?;
        events.submit_event(identity, value);
        Ok(())
    }

    pub fn request_rerun(&self, id: &SessionId) -> Result<(), RegistryError> {
        self.touch(id)?.request_rerun();
        Ok(())
    }

    fn touch(&self, id: &SessionId) -> Result<EventSender, RegistryError> {
        let sessions = self.sessions();
        let handle = sessions.get(id).ok_or(RegistryError::UnknownSession(*id))?;
        handle
            .last_active
            .store(self.clock.now_millis(), Ordering::SeqCst);
        Ok(handle.events.clone())
    }

    /// Destroys every session idle for longer than `session.idle_timeout_secs`.
    pub fn expire_idle(&self) -> Vec<SessionId> {
        self.expire_idle_after(self.config.session.idle_timeout())
    }

    pub fn expire_idle_after(&self, timeout: Duration) -> Vec<SessionId> {
        let now = self.clock.now_millis();
        let limit = timeout.as_millis() as u64;
        let expired: Vec<(SessionId, SessionHandle)> = {
            let mut sessions = self.sessions();
            let ids: Vec<SessionId> = sessions
                .iter()
                .filter(|(_, handle)| now.saturating_sub(handle.last_active.load(Ordering::SeqCst)) >= limit)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| sessions.remove(&id).map(|handle| (id, handle)))
                .collect()
        };
        expired
            .into_iter()
            .map(|(id, handle)| {
                if let Err(err) = shutdown(id, handle) {
                    log::error!("{err}");
                }
                log::info!("session {id} expired");
                id
            })
            .collect()
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions().is_empty()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.sessions().keys().copied().collect()
    }
}

impl Drop for SessionRegistry {
    fn drop(&mut self) {
        let sessions: Vec<(SessionId, SessionHandle)> = self.sessions().drain().collect();
        for (id, handle) in sessions {
            if let Err(err) = shutdown(id, handle) {
                log::error!("{err}");
            }
        }
    }
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("sessions", &self.len())
            .field("config", &self.config)
            .finish()
    }
}

fn shutdown(id: SessionId, handle: SessionHandle) -> Result<(), RegistryError> {
    let _ = handle.control.send(WorkerMessage::Shutdown);
    handle
        .worker
        .join()
        .map_err(|_| RegistryError::WorkerPanicked(id))
}

fn run_worker(mut session: Session, runtime: StdRuntime, inbox: Receiver<WorkerMessage>) {
    log::debug!("worker for session {} started", session.id());
    let clock = runtime.clock();
    loop {
        session.tick();
        if runtime.take_pass_request() {
            session.run_pending();
        }

        let message = match session.next_deadline_millis() {
            Some(deadline) => {
                let wait = Duration::from_millis(deadline.saturating_sub(clock.now_millis()));
                match inbox.recv_timeout(wait) {
                    Ok(message) => message,
                    Err(RecvTimeoutError::Timeout) => WorkerMessage::Wake,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            None => match inbox.recv() {
                Ok(message) => message,
                Err(_) => break,
            },
        };
        if let WorkerMessage::Shutdown = message {
            break;
        }
    }
    log::debug!("worker for session {} stopped", session.id());
}
