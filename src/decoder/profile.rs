//! Perfiles de vehículo.
//!
//! Cada modelo aporta sus PIDs, la secuencia de inicialización del adaptador,
//! reglas adicionales y la tabla de descripciones de DTC. El perfil activo se
//! elige por configuración (`CAR_PROFILE`).


use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use crate::rules::domain::{Field, Rule, Severity};
use super::domain::Pid;


pub trait VehicleProfile: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// PIDs consultados en modo `Normal`, en orden de sondeo.
    fn pids(&self) -> &'static [Pid];

    /// Comandos AT enviados tras abrir el transporte.
    fn init_commands(&self) -> Vec<String> {
        vec!["ATZ".into(), "ATE0".into(), "ATL0".into(), "ATSP0".into()]
    }

    /// Reglas evaluadas por el motor, en orden de declaración.
    fn rules(&self) -> Vec<Rule> {
        base_rules()
    }

    fn describe_dtc(&self, code: &str) -> Option<&'static str> {
        generic_dtc_description(code)
    }
}


/// Reglas comunes a todos los perfiles.
pub fn base_rules() -> Vec<Rule> {
    vec![
        Rule::below("FUEL_LOW", Severity::Warning, Field::FuelLevel, 15.0, "Nivel de combustible bajo"),
        Rule::below("FUEL_CRITICAL", Severity::Critical, Field::FuelLevel, 10.0, "Reserva de combustible agotándose"),
        Rule::above("ENGINE_OVERHEAT", Severity::Critical, Field::CoolantTemp, 105.0, "Temperatura de refrigerante excesiva"),
        Rule::above("OVER_REV", Severity::Warning, Field::Rpm, 6000.0, "Régimen de motor por encima del límite"),
        Rule::below("BATTERY_LOW", Severity::Warning, Field::BatteryVoltage, 11.5, "Tensión de batería baja"),
        Rule::below("BATTERY_CRITICAL", Severity::Critical, Field::BatteryVoltage, 10.5, "Tensión de batería crítica"),
    ]
}


fn generic_dtc_description(code: &str) -> Option<&'static str> {
    match code {
        "P0100" => Some("Air Flow Circuit Malfunction"),
        "P0171" => Some("System Too Lean (Bank 1)"),
        "P0200" => Some("Injector Circuit Malfunction"),
        "P0300" => Some("Random/Multiple Cylinder Misfire Detected"),
        "P0400" => Some("Exhaust Gas Recirculation Flow Malfunction"),
        "P0420" => Some("Catalyst System Efficiency Below Threshold (Bank 1)"),
        "P0500" => Some("Vehicle Speed Sensor Malfunction"),
        "P0700" => Some("Transmission Control System Malfunction"),
        _ => None,
    }
}


/// OBD-II estándar (SAE J1979), protocolo automático.
#[derive(Debug, Default)]
pub struct GenericObd;


impl VehicleProfile for GenericObd {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn pids(&self) -> &'static [Pid] {
        &[
            Pid::Rpm,
            Pid::Speed,
            Pid::EngineLoad,
            Pid::CoolantTemp,
            Pid::FuelLevel,
            Pid::ControlModuleVoltage,
        ]
    }
}


/// Citroën C4 HDi (PSA): CAN 11 bits 500 kbps y PIDs de modo 22 del FAP.
#[derive(Debug)]
pub struct PsaDiesel {
    pub ecu_header: String,
}


impl Default for PsaDiesel {
    fn default() -> Self {
        Self { ecu_header: "7E0".to_string() }
    }
}


impl VehicleProfile for PsaDiesel {
    fn name(&self) -> &'static str {
        "psa"
    }

    fn pids(&self) -> &'static [Pid] {
        &[
            Pid::Rpm,
            Pid::Speed,
            Pid::EngineLoad,
            Pid::CoolantTemp,
            Pid::FuelLevel,
            Pid::ControlModuleVoltage,
            Pid::DpfSootMass,
            Pid::EolysLevel,
            Pid::OilTemp,
        ]
    }

    fn init_commands(&self) -> Vec<String> {
        vec![
            "ATZ".into(),
            "ATE0".into(),
            "ATL0".into(),
            "ATSP6".into(),
            format!("ATSH{}", self.ecu_header),
        ]
    }

    fn rules(&self) -> Vec<Rule> {
        let mut rules = base_rules();
        rules.extend([
            Rule::at_least("DPF_SOOT_HIGH", Severity::Warning, Field::DpfSootMass, 45.0, "Masa de hollín del FAP elevada"),
            Rule::at_least("DPF_REGENERATION_REQUIRED", Severity::Critical, Field::DpfSootMass, 60.0, "Regeneración del FAP necesaria"),
            Rule::below("EOLYS_LOW", Severity::Info, Field::EolysLevel, 3.0, "Nivel de aditivo Eolys bajo"),
        ]);
        rules
    }

    fn describe_dtc(&self, code: &str) -> Option<&'static str> {
        match code {
            "P2000" | "P2001" => Some("NOx Trap Efficiency Below Threshold"),
            "P242F" => Some("Diesel Particulate Filter Restriction - Ash Accumulation"),
            "P2452" => Some("Diesel Particulate Filter Pressure Sensor 'A' Circuit"),
            "P2453" => Some("Diesel Particulate Filter Pressure Sensor 'A' Circuit Range/Performance"),
            "U1000" => Some("Invalid or Missing Data for Primary Id"),
            "U1100" => Some("Lost Communication with ECM/PCM"),
            "U1300" => Some("Lost Communication with BSI"),
            other => generic_dtc_description(other),
        }
    }
}


/// Selector de perfil leído de la configuración.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarProfile {
    Generic,
    Psa,
}


impl CarProfile {
    pub fn build(self) -> Arc<dyn VehicleProfile> {
        match self {
            CarProfile::Generic => Arc::new(GenericObd),
            CarProfile::Psa => Arc::new(PsaDiesel::default()),
        }
    }
}


impl FromStr for CarProfile {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "generic" | "obd" => Ok(CarProfile::Generic),
            "psa" | "citroen_c4" | "citroen" => Ok(CarProfile::Psa),
            other => Err(format!("perfil de vehículo desconocido: {other}")),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profiles_are_selected_by_name() {
        assert_eq!("PSA".parse::<CarProfile>(), Ok(CarProfile::Psa));
        assert_eq!("generic".parse::<CarProfile>(), Ok(CarProfile::Generic));
        assert!("tractor".parse::<CarProfile>().is_err());
        assert_eq!(CarProfile::Psa.build().name(), "psa");
    }

    #[test]
    fn psa_extends_generic_rules_in_order() {
        let generic = GenericObd.rules();
        let psa = PsaDiesel::default().rules();
        assert_eq!(&psa[..generic.len()], &generic[..]);
        assert_eq!(psa.last().map(|r| r.code), Some("EOLYS_LOW"));
    }

    #[test]
    fn psa_init_sets_can_protocol_and_header() {
        let cmds = PsaDiesel::default().init_commands();
        assert!(cmds.contains(&"ATSP6".to_string()));
        assert_eq!(cmds.last().map(String::as_str), Some("ATSH7E0"));
    }

    #[test]
    fn dtc_descriptions_fall_back_to_generic() {
        let psa = PsaDiesel::default();
        assert!(psa.describe_dtc("P2452").is_some());
        assert_eq!(psa.describe_dtc("P0420"), GenericObd.describe_dtc("P0420"));
        assert_eq!(GenericObd.describe_dtc("P2452"), None);
    }
}
