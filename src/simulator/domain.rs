//! Vehículo simulado para el modo de desarrollo (`ADAPTER=simulated`).
//!
//! La evolución es determinista: ralentí oscilante, calentamiento del motor
//! hasta 90 °C, consumo lento de combustible y acumulación de hollín.


/// Estado físico del vehículo simulado.
#[derive(Debug, Clone, PartialEq)]
pub struct VehicleModel {
    pub rpm: f64,
    pub speed: f64,
    pub coolant_temp: f64,
    pub fuel_level: f64,
    pub engine_load: f64,
    pub battery_voltage: f64,
    pub dpf_soot_mass_g: f64,
    pub eolys_level_l: f64,
    pub oil_temp: f64,
    /// DTCs almacenados, como pares de bytes de modo 03.
    pub stored_dtcs: Vec<(u8, u8)>,
    pub ticks: u64,
}


impl Default for VehicleModel {
    fn default() -> Self {
        Self {
            rpm: 800.0,
            speed: 0.0,
            coolant_temp: 60.0,
            fuel_level: 75.0,
            engine_load: 20.0,
            battery_voltage: 13.8,
            dpf_soot_mass_g: 12.0,
            eolys_level_l: 4.2,
            oil_temp: 55.0,
            stored_dtcs: Vec::new(),
            ticks: 0,
        }
    }
}


impl VehicleModel {
    /// Avanza un paso de simulación (uno por comando recibido).
    pub fn update(&mut self) {
        self.ticks += 1;
        let phase = (self.ticks % 400) as f64 / 400.0 * std::f64::consts::TAU;

        self.rpm = 800.0 + 1400.0 * (phase.sin() + 1.0) / 2.0;
        self.speed = (self.rpm - 800.0) / 14.0;
        self.engine_load = 20.0 + (self.rpm - 800.0) / 35.0;

        if self.coolant_temp < 90.0 {
            self.coolant_temp = (self.coolant_temp + 0.2).min(90.0);
        }
        if self.oil_temp < 95.0 {
            self.oil_temp = (self.oil_temp + 0.1).min(95.0);
        }
        self.fuel_level = (self.fuel_level - 0.01).max(0.0);
        self.dpf_soot_mass_g += 0.001;
        self.eolys_level_l = (self.eolys_level_l - 0.0001).max(0.0);
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_warms_up_and_consumes_fuel() {
        let mut model = VehicleModel::default();
        for _ in 0..1000 {
            model.update();
        }
        assert_eq!(model.coolant_temp, 90.0);
        assert!(model.fuel_level < 75.0);
        assert!((800.0..=2200.0).contains(&model.rpm));
    }
}
