//! Evaluación de reglas y filtrado de alertas.
//!
//! [`RulesEngine::evaluate`] es una función pura: misma muestra, mismas
//! alertas, en el orden de declaración de las reglas. El único estado entre
//! llamadas vive en [`AlertGate`], una ventana de histéresis acotada por el
//! número de reglas que evita el parpadeo de alertas.


use std::collections::HashMap;
use std::pin::pin;
use chrono::{DateTime, Duration, Utc};
use tokio_stream::StreamExt;
use tracing::{debug, info, instrument, warn};
use crate::bus::domain::{BusMessage, EventKind, Topic, VehicleId};
use crate::bus::logic::BusHandle;
use crate::config::rules::{repeat_interval, CLEAR_AFTER_SAMPLES};
use crate::decoder::domain::{DiagnosticCode, TelemetrySample};
use crate::decoder::profile::VehicleProfile;
use super::domain::{Alert, Rule, SampleRef};


#[derive(Debug, Clone)]
pub struct RulesEngine {
    rules: Vec<Rule>,
}


impl RulesEngine {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self { rules }
    }

    pub fn for_profile(profile: &dyn VehicleProfile) -> Self {
        Self::new(profile.rules())
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn evaluate(&self, sample: &TelemetrySample) -> Vec<Alert> {
        self.rules
            .iter()
            .filter_map(|rule| rule.fires(sample).map(|value| Alert::from_rule(rule, sample, value)))
            .collect()
    }

    /// Una alerta por cada DTC recién almacenado.
    pub fn evaluate_codes(&self, codes: &[DiagnosticCode], origin: SampleRef) -> Vec<Alert> {
        codes.iter().map(|code| Alert::from_dtc(code, origin)).collect()
    }

    /// `true` si la muestra permite evaluar la regla con ese código.
    fn evaluates(&self, code: &str, sample: &TelemetrySample) -> bool {
        self.rules
            .iter()
            .any(|rule| rule.code == code && rule.field.read(sample).is_some())
    }
}


#[derive(Debug, Clone, Copy)]
struct GateEntry {
    last_emitted: DateTime<Utc>,
    misses: u32,
}


/// Ventana de histéresis por código de alerta.
///
/// * Un código pasa cuando se activa.
/// * Mientras sigue activo se repite como mucho una vez por `repeat_interval`.
/// * Se desactiva tras `clear_after` muestras consecutivas que evalúan la
///   regla sin dispararla. Las muestras sin el campo no cuentan.
#[derive(Debug)]
pub struct AlertGate {
    active: HashMap<String, GateEntry>,
    repeat_interval: Duration,
    clear_after: u32,
}


impl AlertGate {
    pub fn new(repeat_interval: Duration, clear_after: u32) -> Self {
        Self { active: HashMap::new(), repeat_interval, clear_after: clear_after.max(1) }
    }

    pub fn filter(&mut self, engine: &RulesEngine, sample: &TelemetrySample, alerts: Vec<Alert>) -> Vec<Alert> {
        let clear_after = self.clear_after;
        self.active.retain(|code, entry| {
            if alerts.iter().any(|a| &a.code == code) || !engine.evaluates(code, sample) {
                return true;
            }
            entry.misses += 1;
            entry.misses < clear_after
        });

        alerts
            .into_iter()
            .filter(|alert| match self.active.get_mut(&alert.code) {
                None => {
                    self.active.insert(
                        alert.code.clone(),
                        GateEntry { last_emitted: alert.timestamp, misses: 0 },
                    );
                    true
                }
                Some(entry) => {
                    entry.misses = 0;
                    if alert.timestamp - entry.last_emitted >= self.repeat_interval {
                        entry.last_emitted = alert.timestamp;
                        true
                    } else {
                        false
                    }
                }
            })
            .collect()
    }

    pub fn is_active(&self, code: &str) -> bool {
        self.active.contains_key(code)
    }
}


impl Default for AlertGate {
    fn default() -> Self {
        Self::new(repeat_interval(), CLEAR_AFTER_SAMPLES)
    }
}


fn emit(bus: &BusHandle, topic: &Topic, alert: Alert) {
    info!(target: "audit", code = %alert.code, severity = ?alert.severity, sample = alert.sample.seq, "Info: alerta emitida: {}", alert.message);
    if bus.publish(topic, BusMessage::Alert(alert)) == 0 {
        debug!("Debug: alerta sin suscriptores");
    }
}


/// Tarea del motor de reglas: telemetría y DTCs del bus → alertas al bus.
///
/// Las muestras se procesan en el orden en que se publicaron.
#[instrument(name = "run_rules_task", skip(bus, engine))]
pub async fn run_rules(bus: BusHandle, vehicle: VehicleId, engine: RulesEngine) {
    let (Some(telemetry), Some(dtc)) = (
        bus.subscribe(&Topic::telemetry(&vehicle)),
        bus.subscribe(&Topic::event(&vehicle, EventKind::Dtc)),
    ) else {
        warn!("Warning: bus no disponible, tarea de reglas no iniciada");
        return;
    };

    info!("Info: tarea de reglas creada con {} reglas", engine.rules().len());

    let alerts_topic = Topic::alerts(&vehicle);
    let mut gate = AlertGate::default();
    let mut last_origin: Option<SampleRef> = None;
    let mut inbound = pin!(telemetry.into_stream().merge(dtc.into_stream()));

    while let Some(envelope) = inbound.next().await {
        match envelope.message {
            BusMessage::Telemetry(sample) => {
                last_origin = Some(SampleRef::from(&sample));
                let alerts = engine.evaluate(&sample);
                for alert in gate.filter(&engine, &sample, alerts) {
                    emit(&bus, &alerts_topic, alert);
                }
            }
            BusMessage::Dtc(codes) => {
                let origin = last_origin.unwrap_or(SampleRef { seq: 0, timestamp: envelope.published_at });
                for alert in engine.evaluate_codes(&codes, origin) {
                    emit(&bus, &alerts_topic, alert);
                }
            }
            _ => {}
        }
    }
    info!("Info: tarea de reglas finalizada");
}


pub fn start_rules(bus: BusHandle, vehicle: VehicleId, engine: RulesEngine) {
    info!("Info: iniciando tarea de reglas");
    tokio::spawn(async move {
        run_rules(bus, vehicle, engine).await;
    });
}
