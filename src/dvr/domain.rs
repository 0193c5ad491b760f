//! Dominio del grabador (DVR): estados, eventos de clip, segmentos y
//! configuración.


use std::path::PathBuf;
use chrono::{DateTime, TimeDelta, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use crate::config::dvr::{
    CLIP_MARGIN_SECS, MAX_CLIPS, MAX_CLIP_BYTES, MAX_SEGMENTS, MAX_SEGMENT_SECS, MIN_FREE_BYTES, MIN_SEGMENT_SECS,
    SEGMENT_SECS,
};
use crate::rules::domain::{Alert, AlertKey, Severity};


const DEFAULT_ERROR: &str = "fallo no especificado";


#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DvrState {
    Idle,
    Initializing,
    Recording,
    Paused,
    SavingClip,
    Error(String),
}


/// Entradas de la máquina de estados del grabador.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DvrInput {
    Start,
    Initialized,
    Pause,
    Resume,
    BeginSave,
    SaveFinished,
    Stop,
    Fail(String),
    Reset,
}


#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("transición inválida del grabador: {input:?} en {from:?}")]
pub struct InvalidDvrTransition {
    pub from: DvrState,
    pub input: DvrInput,
}


/// Función de transición del grabador.
///
/// Las transiciones son estrictamente secuenciales: no existe `Idle → Recording`
/// y de `Error` solo se sale con `Reset`. El estado `Error` siempre lleva un
/// mensaje no vacío.
pub fn transition(from: &DvrState, input: DvrInput) -> Result<DvrState, InvalidDvrTransition> {
    use DvrState::*;

    let next = match (from, &input) {
        (_, DvrInput::Fail(message)) => {
            let message = message.trim();
            Error(if message.is_empty() { DEFAULT_ERROR.to_string() } else { message.to_string() })
        }
        (Idle, DvrInput::Start) => Initializing,
        (Initializing, DvrInput::Initialized) => Recording,
        (Recording, DvrInput::Pause) => Paused,
        (Paused, DvrInput::Resume) => Recording,
        (Recording, DvrInput::BeginSave) => SavingClip,
        (SavingClip, DvrInput::SaveFinished) => Recording,
        (Initializing | Recording | Paused, DvrInput::Stop) => Idle,
        (Error(_), DvrInput::Reset) => Idle,
        _ => return Err(InvalidDvrTransition { from: from.clone(), input }),
    };
    Ok(next)
}


#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClipEventType {
    RecordingStarted,
    RecordingStopped,
    EventClipSaved,
    BufferFull,
    BufferRotated,
    OffloadReady,
    StorageLow,
    Error,
}


/// Evento publicado en `vehicle/events/{id}/clip`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipEvent {
    pub event_type: ClipEventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clip_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    pub timestamp: DateTime<Utc>,
}


impl ClipEvent {
    pub fn new(event_type: ClipEventType, timestamp: DateTime<Utc>) -> Self {
        Self { event_type, clip_id: None, reason: None, path: None, timestamp }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_clip(mut self, clip_id: impl Into<String>, path: PathBuf) -> Self {
        self.clip_id = Some(clip_id.into());
        self.path = Some(path);
        self
    }
}


#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    #[error("espacio libre insuficiente: {available} bytes disponibles, mínimo {floor}")]
    LowSpace { available: u64, floor: u64 },
    #[error("fallo de escritura: {0}")]
    WriteFailure(String),
}


impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::WriteFailure(e.to_string())
    }
}


/// Fotograma codificado entregado por la cámara.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    pub timestamp: DateTime<Utc>,
    pub data: Vec<u8>,
}


/// Tramo contiguo de vídeo de duración acotada.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub index: u64,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub frames: Vec<VideoFrame>,
    pub bytes: u64,
}


impl Segment {
    pub fn new(index: u64, start: DateTime<Utc>) -> Self {
        Self { index, start, end: start, frames: Vec::new(), bytes: 0 }
    }

    pub fn push(&mut self, frame: VideoFrame) {
        if frame.timestamp > self.end {
            self.end = frame.timestamp;
        }
        self.bytes += frame.data.len() as u64;
        self.frames.push(frame);
    }

    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    /// Descarta fotogramas desde el inicio hasta que el segmento ocupa como
    /// mucho `max_bytes`. El inicio pasa a ser el primer fotograma conservado.
    pub fn trim_front(&mut self, max_bytes: u64) {
        let excess = self.bytes.saturating_sub(max_bytes);
        if excess == 0 {
            return;
        }
        let mut dropped_bytes = 0u64;
        let mut dropped = 0usize;
        for frame in &self.frames {
            if dropped_bytes >= excess {
                break;
            }
            dropped_bytes += frame.data.len() as u64;
            dropped += 1;
        }
        self.frames.drain(..dropped);
        self.bytes -= dropped_bytes;
        match self.frames.first() {
            Some(first) => self.start = first.timestamp,
            None => self.start = self.end,
        }
    }
}


/// Petición de guardado de un clip de evento.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerRequest {
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    /// Identidad de la alerta de origen; las peticiones manuales no tienen.
    pub alert: Option<AlertKey>,
}


impl TriggerRequest {
    pub fn manual(reason: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self { reason: reason.into(), timestamp, alert: None }
    }

    pub fn from_alert(alert: &Alert) -> Self {
        Self { reason: alert.code.clone(), timestamp: alert.timestamp, alert: Some(alert.key()) }
    }
}


/// Órdenes de control del grabador.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DvrCommand {
    Start,
    Pause,
    Resume,
    Stop,
    Reset,
}


#[derive(Debug, Clone)]
pub struct DvrConfig {
    pub clips_dir: PathBuf,
    pub segment_secs: u64,
    pub max_segments: usize,
    pub min_free_bytes: u64,
    pub max_clip_bytes: u64,
    pub max_clips: usize,
    pub clip_margin_secs: u64,
    pub trigger_severity: Severity,
    pub timezone: Tz,
}


/// Ajusta la duración de segmento al rango admitido.
pub fn clamp_segment_secs(secs: u64) -> u64 {
    secs.clamp(MIN_SEGMENT_SECS, MAX_SEGMENT_SECS)
}


impl DvrConfig {
    pub fn new(clips_dir: impl Into<PathBuf>) -> Self {
        Self {
            clips_dir: clips_dir.into(),
            segment_secs: SEGMENT_SECS,
            max_segments: MAX_SEGMENTS,
            min_free_bytes: MIN_FREE_BYTES,
            max_clip_bytes: MAX_CLIP_BYTES,
            max_clips: MAX_CLIPS,
            clip_margin_secs: CLIP_MARGIN_SECS,
            trigger_severity: Severity::Warning,
            timezone: Tz::UTC,
        }
    }

    pub fn with_segment_secs(mut self, secs: u64) -> Self {
        self.segment_secs = clamp_segment_secs(secs);
        self
    }

    pub fn segment_duration(&self) -> TimeDelta {
        TimeDelta::seconds(clamp_segment_secs(self.segment_secs) as i64)
    }

    pub fn clip_margin(&self) -> TimeDelta {
        TimeDelta::seconds(self.clip_margin_secs.min(i64::MAX as u64) as i64)
    }
}
