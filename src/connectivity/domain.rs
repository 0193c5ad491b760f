//! Dominio del gestor de conectividad: estado del enlace, eventos, errores
//! y política de reintentos.


use std::future::Future;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Duration;
use crate::config::link::{INITIAL_BACKOFF, MAX_ATTEMPTS, MAX_BACKOFF};


#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Degraded,
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    ConnectRequested,
    Established,
    AttemptFailed,
    RetriesExhausted,
    LinkLost,
    Disconnect,
}


#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("transición inválida: {event:?} en {from:?}")]
pub struct InvalidTransition {
    pub from: ConnectionState,
    pub event: LinkEvent,
}


impl ConnectionState {
    /// Función de transición del enlace. `Disconnect` es válido en cualquier estado.
    pub fn on(self, event: LinkEvent) -> Result<ConnectionState, InvalidTransition> {
        use ConnectionState::*;
        use LinkEvent::*;

        match (self, event) {
            (_, Disconnect) => Ok(Disconnected),
            (Disconnected, ConnectRequested) => Ok(Connecting),
            (Connecting, Established) => Ok(Connected),
            (Connecting, AttemptFailed) => Ok(Connecting),
            (Connecting, RetriesExhausted) => Ok(Disconnected),
            (Connected, LinkLost) => Ok(Degraded),
            (Degraded, LinkLost) => Ok(Degraded),
            (Degraded, Established) => Ok(Connected),
            (Degraded, AttemptFailed) => Ok(Degraded),
            (Degraded, RetriesExhausted) => Ok(Disconnected),
            (from, event) => Err(InvalidTransition { from, event }),
        }
    }

    /// Estados en los que el enlace puede transportar solicitudes.
    pub fn is_usable(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}


#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("no se pudo abrir el transporte: {0}")]
    Open(String),
    #[error("fallo de inicialización del adaptador en {command}: {detail}")]
    Init { command: String, detail: String },
    #[error("error de E/S en el enlace: {0}")]
    Io(String),
    #[error("tiempo de espera agotado en el enlace")]
    Timeout,
    #[error("operación cancelada por desconexión")]
    Cancelled,
    #[error("enlace no conectado")]
    NotConnected,
    #[error("enlace no disponible tras {attempts} intentos: {last}")]
    Exhausted { attempts: u32, last: String },
}


/// Estado publicado en `vehicle/events/{id}/link`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStatus {
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}


/// Reintentos con espera exponencial acotada: 1s, 2s, 4s … hasta `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}


impl BackoffPolicy {
    /// Espera tras el intento fallido número `attempt` (base 1).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial
            .checked_mul(1u32 << exponent)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}


impl Default for BackoffPolicy {
    fn default() -> Self {
        Self { initial: INITIAL_BACKOFF, max_delay: MAX_BACKOFF, max_attempts: MAX_ATTEMPTS }
    }
}


/// Bomba de bytes hacia el adaptador (BLE, serie). Es un colaborador externo:
/// este servicio solo escribe tramas de comando y lee la trama de respuesta
/// hasta el prompt.
pub trait Transport: Send + 'static {
    fn open(&mut self) -> impl Future<Output = Result<(), LinkError>> + Send;

    fn request(&mut self, frame: &[u8]) -> impl Future<Output = Result<Vec<u8>, LinkError>> + Send;

    fn close(&mut self) -> impl Future<Output = ()> + Send;
}
