//! Módulo de configuración central y gestión del entorno de ejecución.
//!
//! Este módulo actúa como la fuente única de verdad para la configuración de la aplicación.
//! Se encarga de leer las variables de entorno, establecer valores por defecto seguros
//! y proveer las estructuras necesarias para iniciar los subsistemas (Enlace, Muestreo,
//! Grabador, Logging).
//!
//! # Funcionalidades Principales
//! * **Carga de Configuración:** Lee de `.env` en desarrollo y variables de sistema en producción.
//! * **Observabilidad:** Configura `tracing_subscriber` para logs estructurados o legibles.
//!
//! La lectura pasa por una función de búsqueda inyectable, de modo que los
//! tests no necesitan tocar el entorno del proceso.


use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use chrono_tz::Tz;
use thiserror::Error;
use tokio::time::Duration;
use tracing::info;
use tracing_subscriber::{fmt as tracing_fmt, EnvFilter};
use crate::config::{dvr, link};
use crate::connectivity::domain::BackoffPolicy;
use crate::connectivity::logic::LinkSettings;
use crate::decoder::profile::CarProfile;
use crate::dvr::domain::{clamp_segment_secs, DvrConfig};
use crate::rules::domain::Severity;
use crate::sampling::domain::SamplingMode;


const MIB: u64 = 1024 * 1024;


#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} no está configurada")]
    Missing(&'static str),
    #[error("{key} inválida ({value}): {reason}")]
    Invalid { key: &'static str, value: String, reason: String },
}


/// Valor sensible que nunca se muestra en logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);


impl Secret {
    pub fn expose(&self) -> &str {
        &self.0
    }
}


impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}


/// Origen de las tramas del adaptador de diagnóstico.
///
/// El controlador BLE/serie es un colaborador externo; este servicio solo
/// incluye el emulador para desarrollo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    Simulated,
}


impl FromStr for AdapterKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "simulated" | "emulator" => Ok(AdapterKind::Simulated),
            other => Err(format!("adaptador no soportado: {other}")),
        }
    }
}


/// Representa la configuración global del sistema y el estado del entorno.
#[derive(Debug)]
pub struct System {
    /// Entorno de ejecución actual (`development`, `staging`, `production`).
    /// Afecta el formato de logs y la carga de archivos `.env`.
    pub environment: String,

    /// Nivel de detalle de los logs (ej. `info`, `debug`, `warn`).
    /// Se autoconfigura según el `environment` si no se especifica.
    pub rust_log: String,

    /// VIN del vehículo. **Requerido**. Nunca cruza el bus en claro.
    pub vehicle_vin: Secret,

    /// Secreto de la instalación para el HMAC de identificadores. **Requerido**.
    pub plate_hash_secret: Secret,

    pub car_profile: CarProfile,
    pub adapter: AdapterKind,
    pub sampling_mode: SamplingMode,

    pub link_max_attempts: u32,
    pub link_request_timeout_ms: u64,

    /// Directorio de clips. Por defecto: `clips`.
    pub clips_dir: PathBuf,
    pub dvr_segment_secs: u64,
    pub dvr_max_segments: usize,
    pub dvr_min_free_mb: u64,
    pub dvr_max_clip_mb: u64,
    pub dvr_max_clips: usize,
    pub dvr_clip_margin_secs: u64,
    /// Severidad mínima de alerta que dispara un clip. Por defecto: `WARNING`.
    pub dvr_trigger_severity: Severity,

    /// Zona horaria para nombrar los clips. Por defecto: `UTC`.
    pub timezone: Tz,
}


fn required<F>(lookup: &F, key: &'static str) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::Missing(key))
}


fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(value) if value.trim().is_empty() => Ok(default),
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key,
            reason: e.to_string(),
            value,
        }),
    }
}


impl System {
    /// Carga la configuración desde las variables de entorno.
    ///
    /// # Comportamiento
    /// * Si `ENVIRONMENT` es "development", intenta cargar un archivo `.env`.
    /// * `VEHICLE_VIN` y `PLATE_HASH_SECRET` son obligatorias.
    /// * Establece valores por defecto para variables opcionales.
    pub fn new() -> Result<Self, ConfigError> {
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".into());

        if environment == "development" {
            dotenv::dotenv().ok();
        }

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Construye la configuración a partir de una función de búsqueda.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        info!("Info: creando objeto system");

        let environment = lookup("ENVIRONMENT").unwrap_or_else(|| "development".into());
        let rust_log = lookup("RUST_LOG").unwrap_or_else(|| match environment.as_str() {
            "development" => "debug".to_string(),
            "staging" => "info".to_string(),
            _ => "warn".to_string(),
        });

        let timezone = parse_or(&lookup, "TIMEZONE", Tz::UTC)?;

        Ok(System {
            vehicle_vin: Secret(required(&lookup, "VEHICLE_VIN")?),
            plate_hash_secret: Secret(required(&lookup, "PLATE_HASH_SECRET")?),
            car_profile: parse_or(&lookup, "CAR_PROFILE", CarProfile::Generic)?,
            adapter: parse_or(&lookup, "ADAPTER", AdapterKind::Simulated)?,
            sampling_mode: parse_or(&lookup, "SAMPLING_MODE", SamplingMode::Normal)?,
            link_max_attempts: parse_or(&lookup, "LINK_MAX_ATTEMPTS", link::MAX_ATTEMPTS)?.max(1),
            link_request_timeout_ms: parse_or(
                &lookup,
                "LINK_REQUEST_TIMEOUT_MS",
                link::REQUEST_TIMEOUT.as_millis() as u64,
            )?,
            clips_dir: parse_or(&lookup, "CLIPS_DIR", PathBuf::from("clips"))?,
            dvr_segment_secs: clamp_segment_secs(parse_or(&lookup, "DVR_SEGMENT_SECS", dvr::SEGMENT_SECS)?),
            dvr_max_segments: parse_or(&lookup, "DVR_MAX_SEGMENTS", dvr::MAX_SEGMENTS)?.max(1),
            dvr_min_free_mb: parse_or(&lookup, "DVR_MIN_FREE_MB", dvr::MIN_FREE_BYTES / MIB)?,
            dvr_max_clip_mb: parse_or(&lookup, "DVR_MAX_CLIP_MB", dvr::MAX_CLIP_BYTES / MIB)?,
            dvr_max_clips: parse_or(&lookup, "DVR_MAX_CLIPS", dvr::MAX_CLIPS)?.max(1),
            dvr_clip_margin_secs: parse_or(&lookup, "DVR_CLIP_MARGIN_SECS", dvr::CLIP_MARGIN_SECS)?,
            dvr_trigger_severity: parse_or(&lookup, "DVR_TRIGGER_SEVERITY", Severity::Warning)?,
            timezone,
            rust_log,
            environment,
        })
    }

    pub fn dvr_config(&self) -> DvrConfig {
        DvrConfig {
            clips_dir: self.clips_dir.clone(),
            segment_secs: self.dvr_segment_secs,
            max_segments: self.dvr_max_segments,
            min_free_bytes: self.dvr_min_free_mb.saturating_mul(MIB),
            max_clip_bytes: self.dvr_max_clip_mb.saturating_mul(MIB),
            max_clips: self.dvr_max_clips,
            clip_margin_secs: self.dvr_clip_margin_secs,
            trigger_severity: self.dvr_trigger_severity,
            timezone: self.timezone,
        }
    }

    pub fn link_settings(&self, init_commands: Vec<String>) -> LinkSettings {
        LinkSettings {
            policy: BackoffPolicy { max_attempts: self.link_max_attempts, ..BackoffPolicy::default() },
            request_timeout: Duration::from_millis(self.link_request_timeout_ms),
            init_commands,
        }
    }
}


/// Inicializa el sistema de trazabilidad y logs (Tracing).
///
/// Configura el formato de salida basándose en el entorno:
/// * **Production**: Salida JSON (para logs estructurados en la nube).
/// * **Development/Otros**: Salida "Pretty" (colores y formato legible).
pub fn init_tracing(system: &System) {
    let filter = EnvFilter::try_new(&system.rust_log).unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_fmt().with_env_filter(filter).with_target(false);

    if system.environment == "production" {
        builder.json().init();
    } else {
        builder.pretty().init();
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    const REQUIRED: [(&str, &str); 2] = [("VEHICLE_VIN", "VF7NC9HD8DY000001"), ("PLATE_HASH_SECRET", "pepper")];

    #[test]
    fn defaults_apply_when_only_required_vars_are_set() {
        let system = System::from_lookup(lookup(&REQUIRED)).unwrap();
        assert_eq!(system.environment, "development");
        assert_eq!(system.rust_log, "debug");
        assert_eq!(system.car_profile, CarProfile::Generic);
        assert_eq!(system.sampling_mode, SamplingMode::Normal);
        assert_eq!(system.dvr_trigger_severity, Severity::Warning);
        assert_eq!(system.timezone, Tz::UTC);

        let dvr = system.dvr_config();
        assert_eq!(dvr.min_free_bytes, 500 * MIB);
        assert_eq!(dvr.max_clip_bytes, 100 * MIB);
        assert_eq!(dvr.segment_secs, 60);
    }

    #[test]
    fn missing_required_vars_are_reported() {
        let err = System::from_lookup(lookup(&[("PLATE_HASH_SECRET", "pepper")])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("VEHICLE_VIN"));

        let err = System::from_lookup(lookup(&[("VEHICLE_VIN", "X"), ("PLATE_HASH_SECRET", "  ")])).unwrap_err();
        assert_eq!(err, ConfigError::Missing("PLATE_HASH_SECRET"));
    }

    #[test]
    fn overrides_are_parsed_and_clamped() {
        let mut vars = REQUIRED.to_vec();
        vars.extend([
            ("ENVIRONMENT", "production"),
            ("CAR_PROFILE", "psa"),
            ("SAMPLING_MODE", "reduced"),
            ("DVR_SEGMENT_SECS", "1000"),
            ("DVR_TRIGGER_SEVERITY", "critical"),
            ("TIMEZONE", "Europe/Madrid"),
            ("LINK_MAX_ATTEMPTS", "3"),
        ]);
        let system = System::from_lookup(lookup(&vars)).unwrap();
        assert_eq!(system.rust_log, "warn");
        assert_eq!(system.car_profile, CarProfile::Psa);
        assert_eq!(system.sampling_mode, SamplingMode::Reduced);
        assert_eq!(system.dvr_segment_secs, 300);
        assert_eq!(system.dvr_trigger_severity, Severity::Critical);
        assert_eq!(system.timezone, chrono_tz::Europe::Madrid);
        assert_eq!(system.link_settings(Vec::new()).policy.max_attempts, 3);
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let mut vars = REQUIRED.to_vec();
        vars.push(("DVR_MAX_CLIPS", "muchos"));
        match System::from_lookup(lookup(&vars)) {
            Err(ConfigError::Invalid { key, value, .. }) => {
                assert_eq!(key, "DVR_MAX_CLIPS");
                assert_eq!(value, "muchos");
            }
            other => panic!("resultado inesperado {other:?}"),
        }
    }

    #[test]
    fn secrets_are_redacted_in_debug_output() {
        let system = System::from_lookup(lookup(&REQUIRED)).unwrap();
        let debug = format!("{system:?}");
        assert!(!debug.contains("pepper"));
        assert!(!debug.contains("VF7NC9HD8DY000001"));
    }
}
