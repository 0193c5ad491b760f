//! Gestor del grabador (DVR).
//!
//! Una única tarea posee el gestor, el búfer circular y el almacén de clips.
//! Procesa fotogramas, disparos, órdenes y alertas de forma secuencial, así
//! que una parada durante un guardado siempre espera a que el clip termine.


use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};
use crate::bus::domain::{BusMessage, EventKind, Topic, VehicleId};
use crate::bus::logic::BusHandle;
use crate::config::dvr::HANDLED_ALERTS;
use crate::rules::domain::{Alert, AlertKey};
use super::buffer::RollingBuffer;
use super::domain::{
    transition, ClipEvent, ClipEventType, DvrCommand, DvrConfig, DvrInput, DvrState, InvalidDvrTransition,
    StorageError, TriggerRequest, VideoFrame,
};
use super::storage::{clip_file_name, ClipStore, StorageProbe};


pub struct DvrManager<P: StorageProbe> {
    config: DvrConfig,
    state: DvrState,
    buffer: RollingBuffer,
    store: ClipStore,
    probe: Arc<P>,
    bus: BusHandle,
    clip_topic: Topic,
    state_topic: Topic,
    handled: VecDeque<AlertKey>,
    clips_in_session: usize,
    full_reported: bool,
}


impl<P: StorageProbe> DvrManager<P> {
    pub fn new(config: DvrConfig, probe: P, bus: BusHandle, vehicle: &VehicleId) -> Self {
        let buffer = RollingBuffer::new(config.max_segments, config.segment_duration());
        let store = ClipStore::new(config.clips_dir.clone(), config.max_clips);
        Self {
            config,
            state: DvrState::Idle,
            buffer,
            store,
            probe: Arc::new(probe),
            bus,
            clip_topic: Topic::event(vehicle, EventKind::Clip),
            state_topic: Topic::event(vehicle, EventKind::Dvr),
            handled: VecDeque::with_capacity(HANDLED_ALERTS),
            clips_in_session: 0,
            full_reported: false,
        }
    }

    pub fn state(&self) -> &DvrState {
        &self.state
    }

    pub fn buffer(&self) -> &RollingBuffer {
        &self.buffer
    }

    pub fn config(&self) -> &DvrConfig {
        &self.config
    }

    fn apply(&mut self, input: DvrInput) -> Result<(), InvalidDvrTransition> {
        let next = transition(&self.state, input)?;
        if next != self.state {
            debug!("Debug: grabador {:?} -> {:?}", self.state, next);
            self.state = next;
            self.bus.publish(&self.state_topic, BusMessage::Dvr(self.state.clone()));
        }
        Ok(())
    }

    fn emit(&self, event: ClipEvent) {
        debug!("Debug: evento de grabador {:?}", event.event_type);
        self.bus.publish(&self.clip_topic, BusMessage::Clip(event));
    }

    /// Pasa a `Error(message)` y emite `ERROR`.
    fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        error!("Error: grabador detenido: {}", message);
        if let Err(e) = self.apply(DvrInput::Fail(message)) {
            warn!("Warning: {}", e);
        }
        if let DvrState::Error(reason) = &self.state {
            self.emit(ClipEvent::new(ClipEventType::Error, Utc::now()).with_reason(reason.clone()));
        }
    }

    /// Comprueba el umbral de espacio libre; por debajo emite `STORAGE_LOW`.
    /// El sondeo de disco es bloqueante y se ejecuta fuera del runtime.
    async fn check_space(&self) -> Result<(), StorageError> {
        let probe = Arc::clone(&self.probe);
        let dir = self.store.dir().to_path_buf();
        let available = tokio::task::spawn_blocking(move || probe.available_bytes(&dir))
            .await
            .map_err(|e| StorageError::WriteFailure(format!("sondeo de espacio abortado: {e}")))??;
        let floor = self.config.min_free_bytes;
        if available < floor {
            warn!("Warning: espacio libre {} por debajo del mínimo {}", available, floor);
            self.emit(ClipEvent::new(ClipEventType::StorageLow, Utc::now()));
            return Err(StorageError::LowSpace { available, floor });
        }
        Ok(())
    }

    /// `Idle → Initializing → Recording`. Limpia temporales huérfanos antes
    /// de empezar a grabar.
    #[instrument(name = "dvr_start", skip(self))]
    pub async fn start(&mut self) -> Result<(), StorageError> {
        if let Err(e) = self.apply(DvrInput::Start) {
            warn!("Warning: {}", e);
            return Ok(());
        }

        let prepared = match self.store.prepare().await {
            Ok(_) => self.check_space().await,
            Err(e) => Err(e),
        };
        if let Err(e) = prepared {
            self.fail(e.to_string());
            return Err(e);
        }

        self.buffer.clear();
        self.full_reported = false;
        self.clips_in_session = 0;
        if let Err(e) = self.apply(DvrInput::Initialized) {
            warn!("Warning: {}", e);
            return Ok(());
        }
        info!("Info: grabación iniciada en {}", self.store.dir().display());
        self.emit(ClipEvent::new(ClipEventType::RecordingStarted, Utc::now()));
        Ok(())
    }

    pub fn pause(&mut self) {
        if let Err(e) = self.apply(DvrInput::Pause) {
            warn!("Warning: {}", e);
        }
    }

    /// Reanuda solo si el espacio libre lo permite.
    pub async fn resume(&mut self) {
        if self.state != DvrState::Paused {
            warn!("Warning: reanudación ignorada en {:?}", self.state);
            return;
        }
        if let Err(e) = self.check_space().await {
            self.fail(e.to_string());
            return;
        }
        if let Err(e) = self.apply(DvrInput::Resume) {
            warn!("Warning: {}", e);
        }
    }

    /// Detiene la grabación. Emite `OFFLOAD_READY` si la sesión guardó clips.
    pub fn stop(&mut self) {
        if let Err(e) = self.apply(DvrInput::Stop) {
            warn!("Warning: {}", e);
            return;
        }
        let now = Utc::now();
        info!("Info: grabación detenida, {} clips en la sesión", self.clips_in_session);
        self.emit(ClipEvent::new(ClipEventType::RecordingStopped, now));
        if self.clips_in_session > 0 {
            self.emit(
                ClipEvent::new(ClipEventType::OffloadReady, now)
                    .with_reason(format!("{} clips", self.clips_in_session)),
            );
        }
        self.buffer.clear();
        self.clips_in_session = 0;
    }

    pub fn reset(&mut self) {
        match self.apply(DvrInput::Reset) {
            Ok(()) => info!("Info: grabador restablecido"),
            Err(e) => warn!("Warning: {}", e),
        }
    }

    /// Añade un fotograma al búfer. Fuera de `Recording` se descarta.
    pub async fn on_frame(&mut self, frame: VideoFrame) {
        if self.state != DvrState::Recording {
            return;
        }

        let outcome = self.buffer.push_frame(frame);
        let now = Utc::now();

        if let Some(evicted) = &outcome.evicted {
            debug!("Debug: segmento {} rotado", evicted.index);
            self.emit(ClipEvent::new(ClipEventType::BufferRotated, now).with_reason(format!("segment {}", evicted.index)));
        }
        if outcome.full && !self.full_reported {
            self.full_reported = true;
            self.emit(ClipEvent::new(ClipEventType::BufferFull, now));
        }
        if outcome.closed.is_some() {
            if let Err(e) = self.check_space().await {
                self.fail(e.to_string());
            }
        }
    }

    fn already_handled(&self, key: &AlertKey) -> bool {
        self.handled.contains(key)
    }

    fn remember(&mut self, key: AlertKey) {
        if self.handled.len() == HANDLED_ALERTS {
            self.handled.pop_front();
        }
        self.handled.push_back(key);
    }

    /// Alerta del bus: dispara un clip si alcanza la severidad configurada.
    pub async fn on_alert(&mut self, alert: &Alert) -> Result<Option<PathBuf>, StorageError> {
        if alert.severity < self.config.trigger_severity {
            return Ok(None);
        }
        self.trigger(TriggerRequest::from_alert(alert)).await
    }

    /// Guarda un clip de evento: `Recording → SavingClip → Recording`.
    ///
    /// Devuelve la ruta del clip, o `None` si la petición no aplica (otro
    /// estado, alerta ya atendida o búfer vacío).
    #[instrument(name = "dvr_trigger", skip(self, request), fields(reason = %request.reason))]
    pub async fn trigger(&mut self, request: TriggerRequest) -> Result<Option<PathBuf>, StorageError> {
        if let Some(key) = &request.alert {
            if self.already_handled(key) {
                debug!("Debug: alerta {} #{} ya atendida", key.code, key.seq);
                return Ok(None);
            }
        }
        if self.state != DvrState::Recording {
            info!("Info: disparo {} ignorado en {:?}", request.reason, self.state);
            return Ok(None);
        }

        if let Err(e) = self.check_space().await {
            self.fail(e.to_string());
            return Err(e);
        }

        let segments = self
            .buffer
            .clip_segments(request.timestamp, self.config.clip_margin(), self.config.max_clip_bytes);
        if segments.is_empty() {
            warn!("Warning: búfer vacío, sin clip para {}", request.reason);
            return Ok(None);
        }

        if let Err(e) = self.apply(DvrInput::BeginSave) {
            warn!("Warning: {}", e);
            return Ok(None);
        }

        let name = clip_file_name(request.timestamp, self.config.timezone, &request.reason);
        let path = match self.store.write_clip(&name, &segments).await {
            Ok(path) => path,
            Err(e) => {
                self.fail(e.to_string());
                return Err(e);
            }
        };

        if let Err(e) = self.apply(DvrInput::SaveFinished) {
            warn!("Warning: {}", e);
        }
        if let Some(key) = request.alert {
            self.remember(key);
        }
        self.clips_in_session += 1;

        let clip_id = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.clone());
        info!("Info: clip guardado {} ({} segmentos)", path.display(), segments.len());
        self.emit(
            ClipEvent::new(ClipEventType::EventClipSaved, Utc::now())
                .with_reason(request.reason)
                .with_clip(clip_id, path.clone()),
        );

        if let Err(e) = self.store.enforce_retention().await {
            warn!("Warning: retención de clips fallida: {}", e);
        }
        Ok(Some(path))
    }

    pub async fn command(&mut self, command: DvrCommand) {
        match command {
            DvrCommand::Start => {
                if let Err(e) = self.start().await {
                    error!("Error: no se pudo iniciar la grabación: {}", e);
                }
            }
            DvrCommand::Pause => self.pause(),
            DvrCommand::Resume => self.resume().await,
            DvrCommand::Stop => self.stop(),
            DvrCommand::Reset => self.reset(),
        }
    }
}


/// Entradas de la tarea del grabador.
pub struct DvrInputs {
    pub frames: mpsc::Receiver<VideoFrame>,
    pub triggers: mpsc::Receiver<TriggerRequest>,
    pub commands: mpsc::Receiver<DvrCommand>,
}


#[instrument(name = "run_dvr_task", skip(manager, inputs))]
pub async fn run_dvr<P: StorageProbe>(mut manager: DvrManager<P>, vehicle: VehicleId, mut inputs: DvrInputs) {
    let Some(mut alerts) = manager.bus.subscribe(&Topic::alerts(&vehicle)) else {
        warn!("Warning: bus no disponible, tarea del grabador no iniciada");
        return;
    };
    info!("Info: tarea del grabador creada");

    loop {
        tokio::select! {
            Some(command) = inputs.commands.recv() => {
                manager.command(command).await;
            }

            Some(request) = inputs.triggers.recv() => {
                if let Err(e) = manager.trigger(request).await {
                    error!("Error: disparo manual fallido: {}", e);
                }
            }

            Some(envelope) = alerts.recv() => {
                if let BusMessage::Alert(alert) = envelope.message {
                    if let Err(e) = manager.on_alert(&alert).await {
                        error!("Error: clip de alerta {} fallido: {}", alert.code, e);
                    }
                }
            }

            Some(frame) = inputs.frames.recv() => {
                manager.on_frame(frame).await;
            }

            else => break,
        }
    }

    manager.stop();
    info!("Info: tarea del grabador finalizada");
}


pub fn start_dvr<P: StorageProbe>(manager: DvrManager<P>, vehicle: VehicleId, inputs: DvrInputs) {
    info!("Info: iniciando tarea del grabador");
    tokio::spawn(async move {
        run_dvr(manager, vehicle, inputs).await;
    });
}
