//! Servicio de telemetría embarcado: enlace de diagnóstico OBD-II,
//! decodificación, reglas de seguridad, anonimización y grabación de clips
//! por eventos, coordinados por un bus publicar/suscribir.

pub mod bus;
pub mod channels;
pub mod config;
pub mod connectivity;
pub mod context;
pub mod decoder;
pub mod dvr;
pub mod privacy;
pub mod rules;
pub mod sampling;
pub mod simulator;
pub mod system;
