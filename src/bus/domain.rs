//! Dominio del bus de mensajes.
//!
//! Los tópicos se construyen de forma determinista a partir del identificador
//! (anonimizado) del vehículo. Ningún tópico contiene comodines: el bus solo
//! entrega por coincidencia exacta.


use std::fmt;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use crate::connectivity::domain::LinkStatus;
use crate::decoder::domain::{DiagnosticCode, TelemetrySample};
use crate::dvr::domain::{ClipEvent, DvrState};
use crate::rules::domain::Alert;


#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("segmento de tópico inválido: {0:?}")]
    InvalidSegment(String),
}


/// Identificador de vehículo apto para formar parte de un tópico.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VehicleId(String);


impl VehicleId {
    pub fn new(id: impl Into<String>) -> Result<Self, TopicError> {
        let id = id.into();
        if id.is_empty() || id.contains(['/', '+', '#']) || id.chars().any(char::is_whitespace) {
            return Err(TopicError::InvalidSegment(id));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}


impl fmt::Display for VehicleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}


/// Subtipos de `vehicle/events/{id}/{subtype}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Clip,
    Link,
    Dvr,
    Dtc,
}


impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Clip => "clip",
            EventKind::Link => "link",
            EventKind::Dvr => "dvr",
            EventKind::Dtc => "dtc",
        }
    }
}


#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Topic(String);


impl Topic {
    pub fn telemetry(id: &VehicleId) -> Self {
        Self(format!("vehicle/telemetry/{id}/obd"))
    }

    pub fn alerts(id: &VehicleId) -> Self {
        Self(format!("vehicle/alerts/{id}"))
    }

    pub fn event(id: &VehicleId, kind: EventKind) -> Self {
        Self(format!("vehicle/events/{id}/{}", kind.as_str()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}


impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}


/// Carga tipada que circula por el bus. Los errores internos nunca cruzan
/// el bus: solo sus cargas tipadas (`ClipEvent::Error`, `LinkStatus.reason`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum BusMessage {
    Telemetry(TelemetrySample),
    Alert(Alert),
    Clip(ClipEvent),
    Link(LinkStatus),
    Dvr(DvrState),
    Dtc(Vec<DiagnosticCode>),
}


/// Mensaje publicado con sus metadatos de entrega.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub topic: Topic,
    pub seq: u64,
    pub published_at: DateTime<Utc>,
    pub message: BusMessage,
}


impl Envelope {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_are_built_deterministically() {
        let id = VehicleId::new("a1b2c3").unwrap();
        assert_eq!(Topic::telemetry(&id).as_str(), "vehicle/telemetry/a1b2c3/obd");
        assert_eq!(Topic::alerts(&id).as_str(), "vehicle/alerts/a1b2c3");
        assert_eq!(Topic::event(&id, EventKind::Clip).as_str(), "vehicle/events/a1b2c3/clip");
        assert_eq!(Topic::telemetry(&id), Topic::telemetry(&id));
    }

    #[test]
    fn wildcards_and_separators_are_rejected() {
        for bad in ["", "a/b", "car+", "#", "two words"] {
            assert!(VehicleId::new(bad).is_err(), "{bad:?} debería rechazarse");
        }
    }

    #[test]
    fn envelope_serializes_with_kind_tag() {
        let id = VehicleId::new("v1").unwrap();
        let envelope = Envelope {
            topic: Topic::event(&id, EventKind::Dtc),
            seq: 7,
            published_at: Utc::now(),
            message: BusMessage::Dtc(vec![]),
        };
        let json = envelope.to_json().unwrap();
        assert!(json.contains("\"kind\":\"dtc\""));
        assert!(json.contains("vehicle/events/v1/dtc"));
    }
}
