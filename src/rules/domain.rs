//! Dominio del motor de reglas: severidades, umbrales y alertas.


use std::fmt;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use crate::decoder::domain::{DiagnosticCode, TelemetrySample};


#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}


impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INFO" => Ok(Severity::Info),
            "WARNING" | "WARN" => Ok(Severity::Warning),
            "CRITICAL" => Ok(Severity::Critical),
            other => Err(format!("severidad desconocida: {other}")),
        }
    }
}


/// Campo de la muestra sobre el que opera una regla.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    FuelLevel,
    Rpm,
    Speed,
    CoolantTemp,
    EngineLoad,
    BatteryVoltage,
    DpfSootMass,
    EolysLevel,
    OilTemp,
}


impl Field {
    /// `None` si la muestra no contiene el campo: no se evalúa.
    pub fn read(&self, sample: &TelemetrySample) -> Option<f64> {
        match self {
            Field::FuelLevel => sample.fuel_level.map(f64::from),
            Field::Rpm => sample.rpm.map(f64::from),
            Field::Speed => sample.speed.map(f64::from),
            Field::CoolantTemp => sample.coolant_temp.map(f64::from),
            Field::EngineLoad => sample.engine_load.map(f64::from),
            Field::BatteryVoltage => sample.battery_voltage,
            Field::DpfSootMass => sample.dpf_soot_mass_g,
            Field::EolysLevel => sample.eolys_level_l,
            Field::OilTemp => sample.oil_temp.map(f64::from),
        }
    }
}


#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Condition {
    Below(f64),
    Above(f64),
    AtLeast(f64),
}


impl Condition {
    pub fn holds(&self, value: f64) -> bool {
        match *self {
            Condition::Below(limit) => value < limit,
            Condition::Above(limit) => value > limit,
            Condition::AtLeast(limit) => value >= limit,
        }
    }
}


#[derive(Debug, Clone, PartialEq)]
pub struct Rule {
    pub code: &'static str,
    pub severity: Severity,
    pub field: Field,
    pub condition: Condition,
    pub message: &'static str,
}


impl Rule {
    pub fn below(code: &'static str, severity: Severity, field: Field, limit: f64, message: &'static str) -> Self {
        Self { code, severity, field, condition: Condition::Below(limit), message }
    }

    pub fn above(code: &'static str, severity: Severity, field: Field, limit: f64, message: &'static str) -> Self {
        Self { code, severity, field, condition: Condition::Above(limit), message }
    }

    pub fn at_least(code: &'static str, severity: Severity, field: Field, limit: f64, message: &'static str) -> Self {
        Self { code, severity, field, condition: Condition::AtLeast(limit), message }
    }

    /// Valor observado si la regla se dispara.
    pub fn fires(&self, sample: &TelemetrySample) -> Option<f64> {
        self.field.read(sample).filter(|v| self.condition.holds(*v))
    }
}


/// Referencia a la muestra que originó una alerta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SampleRef {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
}


impl From<&TelemetrySample> for SampleRef {
    fn from(sample: &TelemetrySample) -> Self {
        Self { seq: sample.seq, timestamp: sample.timestamp }
    }
}


/// Alerta producida por el motor. Se entrega una vez y no se modifica.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub code: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub sample: SampleRef,
    pub message: String,
}


/// Identidad estable de una alerta: muestra de origen y código.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AlertKey {
    pub seq: u64,
    pub code: String,
}


impl Alert {
    pub fn from_rule(rule: &Rule, sample: &TelemetrySample, value: f64) -> Self {
        Self {
            code: rule.code.to_string(),
            severity: rule.severity,
            timestamp: sample.timestamp,
            sample: SampleRef::from(sample),
            message: format!("{} ({value})", rule.message),
        }
    }

    pub fn from_dtc(code: &DiagnosticCode, origin: SampleRef) -> Self {
        let message = match &code.description {
            Some(desc) => format!("DTC almacenado {code}: {desc}"),
            None => format!("DTC almacenado {code}"),
        };
        Self {
            code: format!("DTC_{code}"),
            severity: Severity::Warning,
            timestamp: origin.timestamp,
            sample: origin,
            message,
        }
    }

    pub fn key(&self) -> AlertKey {
        AlertKey { seq: self.sample.seq, code: self.code.clone() }
    }
}


impl fmt::Display for Alert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {} #{}: {}", self.severity, self.code, self.sample.seq, self.message)
    }
}
