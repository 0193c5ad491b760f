//! Constantes operativas del servicio.
//!
//! Valores por defecto que no dependen del entorno. Los valores configurables
//! se leen en [`crate::system::domain::System`] y caen en estas constantes.

pub mod link {
    use tokio::time::Duration;

    pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
    pub const MAX_BACKOFF: Duration = Duration::from_secs(30);
    pub const MAX_ATTEMPTS: u32 = 6;
    pub const REQUEST_TIMEOUT: Duration = Duration::from_millis(1500);
}


pub mod sampling {
    use tokio::time::Duration;

    /// Periodo del reloj base del bucle de muestreo.
    pub const TICK: Duration = Duration::from_millis(100);
    /// Factor de ralentización del modo `Reduced` respecto a `Normal`.
    pub const REDUCED_FACTOR: u32 = 4;
    pub const DTC_INTERVAL: Duration = Duration::from_secs(30);
    /// Tensión por debajo de la cual el controlador pasa a `Minimal`.
    pub const LOW_POWER_VOLTAGE: f64 = 11.5;
    /// Tiempo que el muestreo permanece en `Reduced` tras un timeout o una
    /// degradación del enlace.
    pub const UNSTABLE_HOLD: Duration = Duration::from_secs(30);
    /// Muestras ya decodificadas que se retienen mientras el enlace se recupera.
    pub const OUTBOX_CAPACITY: usize = 256;
}


pub mod rules {
    use chrono::Duration;

    pub fn repeat_interval() -> Duration {
        Duration::seconds(60)
    }
    pub const CLEAR_AFTER_SAMPLES: u32 = 3;
}


pub mod dvr {
    use tokio::time::Duration;

    pub const MIN_SEGMENT_SECS: u64 = 10;
    pub const MAX_SEGMENT_SECS: u64 = 300;
    pub const SEGMENT_SECS: u64 = 60;
    pub const MAX_SEGMENTS: usize = 6;
    pub const MIN_FREE_BYTES: u64 = 500 * 1024 * 1024;
    pub const MAX_CLIP_BYTES: u64 = 100 * 1024 * 1024;
    pub const MAX_CLIPS: usize = 50;
    pub const CLIP_MARGIN_SECS: u64 = 30;
    pub const REASON_MAX_LEN: usize = 30;
    pub const TEMP_SUFFIX: &str = "tmp";
    pub const CLIP_EXTENSION: &str = "mp4";
    /// Identidades de alerta recordadas para no guardar dos clips por la misma alerta.
    pub const HANDLED_ALERTS: usize = 128;
    /// Espera máxima a que el grabador cierre la sesión al apagar.
    pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
}


pub mod bus {
    /// Capacidad del canal broadcast por tópico.
    pub const TOPIC_CAPACITY: usize = 256;
}


pub mod channels {
    pub const FRAMES: usize = 512;
    pub const TRIGGERS: usize = 32;
    pub const DVR_COMMANDS: usize = 16;
}


pub mod simulator {
    pub const CAMERA_FPS: u32 = 15;
    pub const FRAME_BYTES: usize = 4096;
}
