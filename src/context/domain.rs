//! Definición del Contexto de Aplicación (Shared State).
//!
//! Este módulo implementa el patrón de **Estado Compartido** para aplicaciones asíncronas.
//! El `AppContext` actúa como un contenedor de "Inyección de Dependencias" manual,
//! agrupando los recursos que deben ser accesibles por múltiples tareas concurrentes
//! (Configuración, Bus de mensajes, Anonimizador, Perfil del vehículo).
//!
//! Es el único dueño del bus: las tareas reciben un [`BusHandle`] no propietario.


use std::sync::Arc;
use thiserror::Error;
use crate::bus::domain::{TopicError, VehicleId};
use crate::bus::logic::{BusHandle, MessageBus};
use crate::decoder::profile::VehicleProfile;
use crate::privacy::domain::PrivacyError;
use crate::privacy::logic::PrivacyHasher;
use crate::system::domain::System;


#[derive(Debug, Error)]
pub enum ContextError {
    #[error(transparent)]
    Privacy(#[from] PrivacyError),
    #[error(transparent)]
    Topic(#[from] TopicError),
}


#[derive(Clone, Debug)]
pub struct AppContext {
    pub system: Arc<System>,
    pub bus: MessageBus,
    pub hasher: PrivacyHasher,
    pub profile: Arc<dyn VehicleProfile>,
    /// Identificador del vehículo en los tópicos, derivado del VIN.
    pub vehicle: VehicleId,
}


impl AppContext {
    pub fn new(system: System) -> Result<Self, ContextError> {
        let hasher = PrivacyHasher::new(system.plate_hash_secret.expose())?;
        let vehicle = VehicleId::new(hasher.short_id(system.vehicle_vin.expose()))?;
        let profile = system.car_profile.build();
        Ok(Self { system: Arc::new(system), bus: MessageBus::new(), hasher, profile, vehicle })
    }

    pub fn bus_handle(&self) -> BusHandle {
        self.bus.handle()
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn system(secret: &str) -> System {
        System::from_lookup(|key| match key {
            "VEHICLE_VIN" => Some("VF7NC9HD8DY000001".to_string()),
            "PLATE_HASH_SECRET" => Some(secret.to_string()),
            "CAR_PROFILE" => Some("psa".to_string()),
            _ => None,
        })
        .unwrap()
    }

    #[test]
    fn vehicle_id_is_derived_from_vin_without_exposing_it() {
        let ctx = AppContext::new(system("pepper")).unwrap();
        assert_eq!(ctx.vehicle.as_str().len(), 16);
        assert!(!ctx.vehicle.as_str().contains("VF7"));
        assert_eq!(ctx.profile.name(), "psa");

        let again = AppContext::new(system("pepper")).unwrap();
        assert_eq!(ctx.vehicle, again.vehicle);

        let other = AppContext::new(system("otro")).unwrap();
        assert_ne!(ctx.vehicle, other.vehicle);
    }
}
