//! Gestor de conectividad con el adaptador de diagnóstico.
//!
//! Es el único dueño de [`ConnectionState`]; el resto del sistema lo observa
//! mediante un `watch::Receiver` de solo lectura o el tópico
//! `vehicle/events/{id}/link`.
//!
//! # Cancelación
//! Toda E/S del enlace se ejecuta en `select!` contra un contador de
//! generación. `disconnect()` incrementa el contador y cualquier operación en
//! curso termina con [`LinkError::Cancelled`], libera el transporte y permite
//! cerrarlo desde cualquier estado.


use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::{watch, Mutex};
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, error, info, instrument, warn};
use crate::bus::domain::{BusMessage, EventKind, Topic, VehicleId};
use crate::bus::logic::BusHandle;
use crate::config::link::REQUEST_TIMEOUT;
use super::domain::{BackoffPolicy, ConnectionState, LinkError, LinkEvent, LinkStatus, Transport};


/// Timeouts consecutivos a partir de los cuales se da el enlace por perdido.
const TIMEOUTS_BEFORE_LOSS: u32 = 3;


#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub policy: BackoffPolicy,
    pub request_timeout: Duration,
    pub init_commands: Vec<String>,
}


impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            policy: BackoffPolicy::default(),
            request_timeout: REQUEST_TIMEOUT,
            init_commands: Vec::new(),
        }
    }
}


struct LinkInner<T: Transport> {
    transport: Mutex<T>,
    state: watch::Sender<ConnectionState>,
    cancel: watch::Sender<u64>,
    monitoring: AtomicBool,
    timeouts: AtomicU32,
    settings: LinkSettings,
    bus: BusHandle,
    topic: Topic,
}


pub struct ConnectivityManager<T: Transport> {
    inner: Arc<LinkInner<T>>,
}


impl<T: Transport> Clone for ConnectivityManager<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}


impl<T: Transport> ConnectivityManager<T> {
    pub fn new(transport: T, settings: LinkSettings, bus: BusHandle, vehicle: &VehicleId) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (cancel, _) = watch::channel(0u64);
        Self {
            inner: Arc::new(LinkInner {
                transport: Mutex::new(transport),
                state,
                cancel,
                monitoring: AtomicBool::new(false),
                timeouts: AtomicU32::new(0),
                settings,
                bus,
                topic: Topic::event(vehicle, EventKind::Link),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Receptor de solo lectura del estado del enlace.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// `true` desde `connect()` hasta `disconnect()` o el agotamiento de reintentos.
    pub fn is_monitoring(&self) -> bool {
        self.inner.monitoring.load(Ordering::SeqCst)
    }

    /// Establece el enlace con reintentos exponenciales acotados.
    ///
    /// Tras el último intento fallido el estado vuelve a `Disconnected` con el
    /// motivo publicado y se devuelve [`LinkError::Exhausted`].
    #[instrument(name = "link_connect", skip(self))]
    pub async fn connect(&self) -> Result<(), LinkError> {
        match self.state() {
            ConnectionState::Connected => return Ok(()),
            ConnectionState::Disconnected => {}
            other => {
                debug!("Debug: connect() ignorado en estado {:?}", other);
                return Ok(());
            }
        }
        self.inner.monitoring.store(true, Ordering::SeqCst);
        self.apply(LinkEvent::ConnectRequested, None);
        self.establish().await
    }

    /// Reconexión silenciosa tras una pérdida inesperada (`Degraded`).
    pub async fn reconnect(&self) -> Result<(), LinkError> {
        if self.state() != ConnectionState::Degraded {
            return Ok(());
        }
        info!("Info: enlace degradado, reconectando");
        self.establish().await
    }

    /// Cancela la E/S en curso y cierra el transporte. Seguro en cualquier estado.
    #[instrument(name = "link_disconnect", skip(self))]
    pub async fn disconnect(&self) {
        self.inner.cancel.send_modify(|generation| *generation += 1);
        self.inner.monitoring.store(false, Ordering::SeqCst);

        let mut transport = self.inner.transport.lock().await;
        transport.close().await;
        drop(transport);

        self.apply(LinkEvent::Disconnect, Some("desconexión solicitada".to_string()));
        info!("Info: enlace desconectado");
    }

    /// Envía un comando y devuelve la trama de respuesta como texto.
    pub async fn request(&self, command: &str) -> Result<String, LinkError> {
        if !self.state().is_usable() {
            return Err(LinkError::NotConnected);
        }
        let generation = *self.inner.cancel.borrow();
        let mut transport = self.inner.transport.lock().await;

        let frame = format!("{command}\r");
        let result = self
            .cancellable(generation, async {
                timeout(self.inner.settings.request_timeout, transport.request(frame.as_bytes()))
                    .await
                    .unwrap_or(Err(LinkError::Timeout))
            })
            .await;
        drop(transport);

        match result {
            Ok(bytes) => {
                self.inner.timeouts.store(0, Ordering::SeqCst);
                Ok(String::from_utf8_lossy(&bytes).into_owned())
            }
            Err(LinkError::Timeout) => {
                let count = self.inner.timeouts.fetch_add(1, Ordering::SeqCst) + 1;
                if count >= TIMEOUTS_BEFORE_LOSS {
                    self.link_lost(format!("{count} timeouts consecutivos"));
                }
                Err(LinkError::Timeout)
            }
            Err(LinkError::Cancelled) => Err(LinkError::Cancelled),
            Err(e) => {
                self.link_lost(e.to_string());
                Err(e)
            }
        }
    }

    fn link_lost(&self, reason: String) {
        if self.state() == ConnectionState::Connected {
            warn!("Warning: pérdida inesperada del enlace: {}", reason);
            self.inner.timeouts.store(0, Ordering::SeqCst);
            self.apply(LinkEvent::LinkLost, Some(reason));
        }
    }

    async fn establish(&self) -> Result<(), LinkError> {
        let generation = *self.inner.cancel.borrow();
        let policy = self.inner.settings.policy;
        let mut last = String::from("sin intentos");

        for attempt in 1..=policy.max_attempts.max(1) {
            match self.cancellable(generation, self.open_and_init()).await {
                Ok(()) => {
                    self.inner.timeouts.store(0, Ordering::SeqCst);
                    self.apply(LinkEvent::Established, None);
                    info!("Info: enlace establecido en el intento {}", attempt);
                    return Ok(());
                }
                Err(LinkError::Cancelled) => return Err(LinkError::Cancelled),
                Err(e) => {
                    warn!("Warning: intento {}/{} fallido: {}", attempt, policy.max_attempts, e);
                    last = e.to_string();
                    self.apply(LinkEvent::AttemptFailed, Some(last.clone()));
                }
            }

            if attempt < policy.max_attempts {
                let delay = policy.delay(attempt);
                debug!("Debug: reintento en {:?}", delay);
                self.cancellable(generation, async {
                    sleep(delay).await;
                    Ok(())
                })
                .await?;
            }
        }

        let err = LinkError::Exhausted { attempts: policy.max_attempts, last };
        error!("Error: {}", err);
        self.inner.monitoring.store(false, Ordering::SeqCst);
        self.apply(LinkEvent::RetriesExhausted, Some(err.to_string()));
        Err(err)
    }

    async fn open_and_init(&self) -> Result<(), LinkError> {
        let mut transport = self.inner.transport.lock().await;
        transport.close().await;
        transport.open().await?;

        for command in &self.inner.settings.init_commands {
            let frame = format!("{command}\r");
            let response = timeout(self.inner.settings.request_timeout, transport.request(frame.as_bytes()))
                .await
                .unwrap_or(Err(LinkError::Timeout))
                .map(|bytes| String::from_utf8_lossy(&bytes).trim().to_string());

            let failure = match response {
                Ok(text) if text.contains('?') => Some(format!("respuesta {text:?}")),
                Ok(_) => None,
                Err(e) => Some(e.to_string()),
            };

            if let Some(detail) = failure {
                // El ELM327 no siempre acepta ATL0; el resto es obligatorio.
                if command.eq_ignore_ascii_case("ATL0") {
                    debug!("Debug: {} no soportado, se continúa", command);
                    continue;
                }
                return Err(LinkError::Init { command: command.clone(), detail });
            }
        }
        Ok(())
    }

    async fn cancellable<F, R>(&self, generation: u64, operation: F) -> Result<R, LinkError>
    where
        F: Future<Output = Result<R, LinkError>>,
    {
        let mut cancel_rx = self.inner.cancel.subscribe();
        if *cancel_rx.borrow_and_update() != generation {
            return Err(LinkError::Cancelled);
        }
        tokio::select! {
            result = operation => result,
            _ = cancel_rx.changed() => Err(LinkError::Cancelled),
        }
    }

    fn apply(&self, event: LinkEvent, reason: Option<String>) {
        let mut next = None;
        self.inner.state.send_if_modified(|state| match state.on(event) {
            Ok(target) => {
                let changed = target != *state;
                *state = target;
                next = Some(target);
                changed
            }
            Err(e) => {
                warn!("Warning: {}", e);
                false
            }
        });

        if let Some(state) = next {
            debug!("Debug: enlace {:?} tras {:?}", state, event);
            self.inner.bus.publish(&self.inner.topic, BusMessage::Link(LinkStatus { state, reason }));
        }
    }
}


/// Supervisa el enlace y lanza la reconexión silenciosa al degradarse.
#[instrument(name = "run_link_supervisor", skip(manager))]
pub async fn run_link_supervisor<T: Transport>(manager: ConnectivityManager<T>) {
    info!("Info: supervisor de enlace creado");
    let mut state_rx = manager.watch_state();

    loop {
        let degraded = *state_rx.borrow_and_update() == ConnectionState::Degraded;
        if degraded && manager.is_monitoring() {
            if let Err(e) = manager.reconnect().await {
                warn!("Warning: reconexión fallida: {}", e);
            }
            continue;
        }
        if state_rx.changed().await.is_err() {
            break;
        }
    }
    info!("Info: supervisor de enlace finalizado");
}


pub fn start_link_supervisor<T: Transport>(manager: ConnectivityManager<T>) {
    info!("Info: iniciando supervisor de enlace");
    tokio::spawn(async move {
        run_link_supervisor(manager).await;
    });
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use crate::bus::logic::MessageBus;

    #[derive(Debug, Clone)]
    enum Step {
        Reply(&'static str),
        Fail,
        Hang,
    }

    /// Transporte guionizado: aperturas y respuestas en orden.
    #[derive(Clone, Default)]
    struct Scripted {
        opens: Arc<StdMutex<VecDeque<bool>>>,
        replies: Arc<StdMutex<VecDeque<Step>>>,
        closes: Arc<AtomicU32>,
    }

    impl Scripted {
        fn with_opens(opens: &[bool]) -> Self {
            let s = Self::default();
            s.opens.lock().unwrap().extend(opens.iter().copied());
            s
        }

        fn reply(&self, step: Step) {
            self.replies.lock().unwrap().push_back(step);
        }
    }

    impl Transport for Scripted {
        async fn open(&mut self) -> Result<(), LinkError> {
            match self.opens.lock().unwrap().pop_front() {
                Some(true) | None => Ok(()),
                Some(false) => Err(LinkError::Open("adaptador fuera de alcance".into())),
            }
        }

        async fn request(&mut self, _frame: &[u8]) -> Result<Vec<u8>, LinkError> {
            let step = self.replies.lock().unwrap().pop_front();
            match step {
                Some(Step::Reply(text)) => Ok(text.as_bytes().to_vec()),
                Some(Step::Fail) => Err(LinkError::Io("BLE desconectado".into())),
                Some(Step::Hang) | None => std::future::pending().await,
            }
        }

        async fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn manager(transport: Scripted, bus: &MessageBus, max_attempts: u32) -> ConnectivityManager<Scripted> {
        let settings = LinkSettings {
            policy: BackoffPolicy { max_attempts, ..BackoffPolicy::default() },
            ..LinkSettings::default()
        };
        ConnectivityManager::new(transport, settings, bus.handle(), &VehicleId::new("v1").unwrap())
    }

    #[tokio::test]
    async fn starts_disconnected_and_idle() {
        let bus = MessageBus::new();
        let link = manager(Scripted::default(), &bus, 3);
        assert_eq!(link.state(), ConnectionState::Disconnected);
        assert!(!link.is_monitoring());
        assert_eq!(link.request("010C").await, Err(LinkError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn connects_after_backoff() {
        let bus = MessageBus::new();
        let mut events = bus.subscribe(&Topic::event(&VehicleId::new("v1").unwrap(), EventKind::Link));
        let link = manager(Scripted::with_opens(&[false, false, true]), &bus, 5);

        let started = tokio::time::Instant::now();
        link.connect().await.unwrap();

        assert_eq!(link.state(), ConnectionState::Connected);
        assert!(link.is_monitoring());
        // 1s + 2s de espera entre los tres intentos.
        assert_eq!(started.elapsed().as_secs(), 3);

        let mut states = Vec::new();
        while let Some(envelope) = events.try_recv() {
            if let BusMessage::Link(status) = envelope.message {
                states.push(status.state);
            }
        }
        assert_eq!(states.first(), Some(&ConnectionState::Connecting));
        assert_eq!(states.last(), Some(&ConnectionState::Connected));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_attempt_cap() {
        let bus = MessageBus::new();
        let link = manager(Scripted::with_opens(&[false; 10]), &bus, 4);

        let err = link.connect().await.unwrap_err();
        assert!(matches!(err, LinkError::Exhausted { attempts: 4, .. }));
        assert_eq!(link.state(), ConnectionState::Disconnected);
        assert!(!link.is_monitoring());
    }

    #[tokio::test(start_paused = true)]
    async fn init_failure_counts_as_attempt_except_atl0() {
        let bus = MessageBus::new();
        let transport = Scripted::default();
        transport.reply(Step::Reply("?"));
        transport.reply(Step::Reply("OK"));
        transport.reply(Step::Reply("?"));
        let settings = LinkSettings {
            init_commands: vec!["ATZ".into(), "ATL0".into()],
            ..LinkSettings::default()
        };
        let link = ConnectivityManager::new(transport, settings, bus.handle(), &VehicleId::new("v1").unwrap());

        // Primer intento: ATZ responde "?"; segundo: ATZ OK y ATL0 "?" tolerado.
        link.connect().await.unwrap();
        assert_eq!(link.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn io_failure_degrades_and_reconnects() {
        let bus = MessageBus::new();
        let transport = Scripted::default();
        let link = manager(transport.clone(), &bus, 3);
        link.connect().await.unwrap();

        transport.reply(Step::Reply("41 0C 1A F8"));
        assert_eq!(link.request("010C").await.unwrap(), "41 0C 1A F8");

        transport.reply(Step::Fail);
        assert!(matches!(link.request("010C").await, Err(LinkError::Io(_))));
        assert_eq!(link.state(), ConnectionState::Degraded);
        assert_eq!(link.request("010C").await, Err(LinkError::NotConnected));

        link.reconnect().await.unwrap();
        assert_eq!(link.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_timeouts_mark_link_lost() {
        let bus = MessageBus::new();
        let transport = Scripted::default();
        let link = manager(transport.clone(), &bus, 3);
        link.connect().await.unwrap();

        for _ in 0..TIMEOUTS_BEFORE_LOSS - 1 {
            transport.reply(Step::Hang);
            assert_eq!(link.request("010C").await, Err(LinkError::Timeout));
            assert_eq!(link.state(), ConnectionState::Connected);
        }
        transport.reply(Step::Hang);
        assert_eq!(link.request("010C").await, Err(LinkError::Timeout));
        assert_eq!(link.state(), ConnectionState::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_in_flight_request() {
        let bus = MessageBus::new();
        let transport = Scripted::default();
        let settings = LinkSettings {
            request_timeout: Duration::from_secs(3600),
            ..LinkSettings::default()
        };
        let link = ConnectivityManager::new(transport.clone(), settings, bus.handle(), &VehicleId::new("v1").unwrap());
        link.connect().await.unwrap();

        transport.reply(Step::Hang);
        let pending = {
            let link = link.clone();
            tokio::spawn(async move { link.request("010C").await })
        };
        tokio::task::yield_now().await;

        link.disconnect().await;
        assert_eq!(pending.await.unwrap(), Err(LinkError::Cancelled));
        assert_eq!(link.state(), ConnectionState::Disconnected);
        assert!(!link.is_monitoring());
        assert!(transport.closes.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_during_backoff_stops_retrying() {
        let bus = MessageBus::new();
        let link = manager(Scripted::with_opens(&[false; 10]), &bus, 10);

        let connecting = {
            let link = link.clone();
            tokio::spawn(async move { link.connect().await })
        };
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(link.state(), ConnectionState::Connecting);

        link.disconnect().await;
        assert_eq!(connecting.await.unwrap(), Err(LinkError::Cancelled));
        assert_eq!(link.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn disconnect_is_safe_when_idle() {
        let bus = MessageBus::new();
        let link = manager(Scripted::default(), &bus, 3);
        link.disconnect().await;
        link.disconnect().await;
        assert_eq!(link.state(), ConnectionState::Disconnected);
    }
}
