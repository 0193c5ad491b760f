//! Tipos del decodificador de protocolo OBD-II.
//!
//! Define los PIDs consultados, las lecturas tipadas que produce la
//! decodificación, la muestra de telemetría y los códigos de diagnóstico (DTC).


use std::fmt;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;


/// Errores de decodificación. Nunca terminan el bucle del llamador:
/// solo invalidan la lectura del ciclo actual.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("sin datos para la solicitud")]
    NotFound,
    #[error("respuesta malformada: {0}")]
    Malformed(String),
    #[error("tiempo de espera agotado")]
    Timeout,
}


/// Parámetros consultados al adaptador.
///
/// Los PIDs de modo 22 son específicos del fabricante (PSA) y solo los
/// consulta el perfil correspondiente.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Pid {
    EngineLoad,
    CoolantTemp,
    Rpm,
    Speed,
    FuelLevel,
    ControlModuleVoltage,
    DpfSootMass,
    EolysLevel,
    OilTemp,
}


impl Pid {
    /// Comando ASCII que se envía al adaptador (sin terminador).
    pub fn command(&self) -> &'static str {
        match self {
            Pid::EngineLoad => "0104",
            Pid::CoolantTemp => "0105",
            Pid::Rpm => "010C",
            Pid::Speed => "010D",
            Pid::FuelLevel => "012F",
            Pid::ControlModuleVoltage => "0142",
            Pid::DpfSootMass => "22F400",
            Pid::EolysLevel => "22F401",
            Pid::OilTemp => "22F403",
        }
    }

    /// Prefijo que debe encabezar una respuesta positiva.
    pub fn response_prefix(&self) -> &'static str {
        match self {
            Pid::EngineLoad => "4104",
            Pid::CoolantTemp => "4105",
            Pid::Rpm => "410C",
            Pid::Speed => "410D",
            Pid::FuelLevel => "412F",
            Pid::ControlModuleVoltage => "4142",
            Pid::DpfSootMass => "62F400",
            Pid::EolysLevel => "62F401",
            Pid::OilTemp => "62F403",
        }
    }

    /// Bytes de datos esperados tras el prefijo.
    pub fn data_len(&self) -> usize {
        match self {
            Pid::Rpm | Pid::ControlModuleVoltage | Pid::DpfSootMass => 2,
            _ => 1,
        }
    }

    /// PIDs que se siguen consultando en modo `Minimal`.
    pub fn is_safety_critical(&self) -> bool {
        matches!(self, Pid::CoolantTemp | Pid::FuelLevel | Pid::ControlModuleVoltage)
    }
}


/// Valor tipado resultante de decodificar una respuesta.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    EngineLoad(u8),
    CoolantTemp(i16),
    Rpm(u32),
    Speed(u8),
    FuelLevel(u8),
    BatteryVoltage(f64),
    DpfSootMass(f64),
    EolysLevel(f64),
    OilTemp(i16),
}


/// Muestra de telemetría de un ciclo de sondeo.
///
/// Cada campo es opcional: un ciclo solo lee los PIDs que tocan, y las reglas
/// no evalúan los campos ausentes. Inmutable una vez construida.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub fuel_level: Option<u8>,
    pub rpm: Option<u32>,
    pub speed: Option<u8>,
    pub coolant_temp: Option<i16>,
    pub engine_load: Option<u8>,
    pub battery_voltage: Option<f64>,
    pub dpf_soot_mass_g: Option<f64>,
    pub eolys_level_l: Option<f64>,
    pub oil_temp: Option<i16>,
}


impl TelemetrySample {
    pub fn empty(seq: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            seq,
            timestamp,
            fuel_level: None,
            rpm: None,
            speed: None,
            coolant_temp: None,
            engine_load: None,
            battery_voltage: None,
            dpf_soot_mass_g: None,
            eolys_level_l: None,
            oil_temp: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::empty(self.seq, self.timestamp)
    }
}


/// Acumula las lecturas de un ciclo y produce la muestra inmutable.
#[derive(Debug)]
pub struct SampleBuilder {
    sample: TelemetrySample,
}


impl SampleBuilder {
    pub fn new(seq: u64, timestamp: DateTime<Utc>) -> Self {
        Self { sample: TelemetrySample::empty(seq, timestamp) }
    }

    pub fn push(&mut self, reading: Reading) {
        let s = &mut self.sample;
        match reading {
            Reading::EngineLoad(v) => s.engine_load = Some(v),
            Reading::CoolantTemp(v) => s.coolant_temp = Some(v),
            Reading::Rpm(v) => s.rpm = Some(v),
            Reading::Speed(v) => s.speed = Some(v),
            Reading::FuelLevel(v) => s.fuel_level = Some(v),
            Reading::BatteryVoltage(v) => s.battery_voltage = Some(v),
            Reading::DpfSootMass(v) => s.dpf_soot_mass_g = Some(v),
            Reading::EolysLevel(v) => s.eolys_level_l = Some(v),
            Reading::OilTemp(v) => s.oil_temp = Some(v),
        }
    }

    /// Devuelve `None` si el ciclo no produjo ninguna lectura.
    pub fn build(self) -> Option<TelemetrySample> {
        if self.sample.is_empty() {
            None
        } else {
            Some(self.sample)
        }
    }
}


#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DtcCategory {
    Powertrain,
    Chassis,
    Body,
    Network,
}


impl DtcCategory {
    /// Selección por los dos bits altos del primer nibble.
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0b00 => DtcCategory::Powertrain,
            0b01 => DtcCategory::Chassis,
            0b10 => DtcCategory::Body,
            _ => DtcCategory::Network,
        }
    }

    pub fn letter(&self) -> char {
        match self {
            DtcCategory::Powertrain => 'P',
            DtcCategory::Chassis => 'C',
            DtcCategory::Body => 'B',
            DtcCategory::Network => 'U',
        }
    }
}


/// Código de diagnóstico en forma canónica (`P0420`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiagnosticCode {
    pub category: DtcCategory,
    /// Los 14 bits restantes: dígito (0-3) y tres dígitos hexadecimales.
    pub suffix: u16,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}


impl DiagnosticCode {
    /// Construye el código a partir de sus dos bytes. `0000` es relleno.
    pub fn from_bytes(first: u8, second: u8) -> Option<Self> {
        if first == 0 && second == 0 {
            return None;
        }
        let category = DtcCategory::from_bits(first >> 6);
        let suffix = (u16::from(first & 0x3F) << 8) | u16::from(second);
        let code = format!("{}{}{:03X}", category.letter(), suffix >> 12, suffix & 0x0FFF);
        Some(Self { category, suffix, code, description: None })
    }

    pub fn with_description(mut self, description: Option<&str>) -> Self {
        self.description = description.map(str::to_string);
        self
    }
}


impl fmt::Display for DiagnosticCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.code)
    }
}
