//! Modos de muestreo, cadencias por PID y caché de DTCs.


use std::collections::BTreeMap;
use std::str::FromStr;
use serde::{Deserialize, Serialize};
use tokio::time::Duration;
use crate::config::sampling::REDUCED_FACTOR;
use crate::decoder::domain::{DiagnosticCode, Pid};


/// Modo de muestreo. El orden refleja la cadencia: `Normal` es el más rápido.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SamplingMode {
    #[default]
    Normal,
    Reduced,
    Minimal,
}


impl FromStr for SamplingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "normal" => Ok(SamplingMode::Normal),
            "reduced" => Ok(SamplingMode::Reduced),
            "minimal" => Ok(SamplingMode::Minimal),
            other => Err(format!("modo de muestreo desconocido: {other}")),
        }
    }
}


/// Intervalo más rápido seguro de cada PID.
pub fn base_interval(pid: Pid) -> Duration {
    match pid {
        Pid::Rpm | Pid::Speed => Duration::from_millis(250),
        Pid::EngineLoad => Duration::from_secs(1),
        Pid::CoolantTemp => Duration::from_secs(2),
        Pid::ControlModuleVoltage => Duration::from_secs(5),
        Pid::FuelLevel | Pid::OilTemp => Duration::from_secs(10),
        Pid::DpfSootMass | Pid::EolysLevel => Duration::from_secs(30),
    }
}


impl SamplingMode {
    /// Cadencia del PID en este modo, o `None` si el modo no lo consulta.
    pub fn interval(&self, pid: Pid) -> Option<Duration> {
        let base = base_interval(pid);
        match self {
            SamplingMode::Normal => Some(base),
            SamplingMode::Reduced => Some(base * REDUCED_FACTOR),
            SamplingMode::Minimal if pid.is_safety_critical() => Some(base * REDUCED_FACTOR),
            SamplingMode::Minimal => None,
        }
    }
}


/// DTCs almacenados en la ECU según el último sondeo de modo 03.
///
/// Se vacía cuando la ECU deja de informarlos o al reiniciarse el enlace.
#[derive(Debug, Default)]
pub struct DtcCache {
    codes: BTreeMap<String, DiagnosticCode>,
}


impl DtcCache {
    /// Sustituye el contenido por `current` y devuelve los códigos no vistos antes.
    pub fn update(&mut self, current: Vec<DiagnosticCode>) -> Vec<DiagnosticCode> {
        let mut fresh = Vec::new();
        let mut next = BTreeMap::new();
        for code in current {
            if !self.codes.contains_key(&code.code) && !next.contains_key(&code.code) {
                fresh.push(code.clone());
            }
            next.insert(code.code.clone(), code);
        }
        self.codes = next;
        fresh
    }

    pub fn clear(&mut self) {
        self.codes.clear();
    }

    pub fn codes(&self) -> impl Iterator<Item = &DiagnosticCode> {
        self.codes.values()
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn code(first: u8, second: u8) -> DiagnosticCode {
        DiagnosticCode::from_bytes(first, second).unwrap()
    }

    #[test]
    fn reduced_is_four_times_slower() {
        for pid in [Pid::Rpm, Pid::CoolantTemp, Pid::DpfSootMass] {
            let normal = SamplingMode::Normal.interval(pid).unwrap();
            assert_eq!(SamplingMode::Reduced.interval(pid), Some(normal * 4));
        }
    }

    #[test]
    fn minimal_keeps_only_safety_critical_pids() {
        assert!(SamplingMode::Minimal.interval(Pid::Rpm).is_none());
        assert!(SamplingMode::Minimal.interval(Pid::Speed).is_none());
        assert!(SamplingMode::Minimal.interval(Pid::CoolantTemp).is_some());
        assert!(SamplingMode::Minimal.interval(Pid::FuelLevel).is_some());
        assert!(SamplingMode::Minimal.interval(Pid::ControlModuleVoltage).is_some());
    }

    #[test]
    fn parses_modes() {
        assert_eq!("Reduced".parse::<SamplingMode>(), Ok(SamplingMode::Reduced));
        assert_eq!(" minimal ".parse::<SamplingMode>(), Ok(SamplingMode::Minimal));
        assert!("turbo".parse::<SamplingMode>().is_err());
    }

    #[test]
    fn dtc_cache_reports_only_new_codes() {
        let mut cache = DtcCache::default();
        let first = cache.update(vec![code(0x04, 0x20)]);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].code, "P0420");

        let second = cache.update(vec![code(0x04, 0x20), code(0x01, 0x71)]);
        assert_eq!(second.iter().map(|c| c.code.as_str()).collect::<Vec<_>>(), vec!["P0171"]);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn dtc_cache_forgets_cleared_codes() {
        let mut cache = DtcCache::default();
        cache.update(vec![code(0x04, 0x20)]);
        cache.update(Vec::new());
        assert!(cache.is_empty());
        assert_eq!(cache.update(vec![code(0x04, 0x20)]).len(), 1);

        cache.clear();
        assert_eq!(cache.update(vec![code(0x04, 0x20)]).len(), 1);
    }
}
