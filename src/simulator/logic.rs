//! Emulador de adaptador ELM327 y cámara sintética.
//!
//! El emulador implementa [`Transport`] y responde a los comandos AT, a los
//! PIDs de modo 01, a los PIDs PSA de modo 22 y al modo 03 con el formato de
//! un adaptador real (eco opcional, espacios y prompt `>`).


use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, instrument};
use crate::connectivity::domain::{LinkError, Transport};
use crate::dvr::domain::VideoFrame;
use super::domain::VehicleModel;


#[derive(Debug)]
pub struct Elm327Emulator {
    vehicle: VehicleModel,
    echo: bool,
    spaces: bool,
    open: bool,
}


impl Default for Elm327Emulator {
    fn default() -> Self {
        Self::with_vehicle(VehicleModel::default())
    }
}


impl Elm327Emulator {
    pub fn with_vehicle(vehicle: VehicleModel) -> Self {
        Self { vehicle, echo: true, spaces: true, open: false }
    }

    pub fn vehicle(&self) -> &VehicleModel {
        &self.vehicle
    }

    fn at_command(&mut self, command: &str) -> String {
        match command {
            "ATZ" => {
                self.echo = true;
                self.spaces = true;
                "ELM327 v1.5".to_string()
            }
            "ATE0" => {
                self.echo = false;
                "OK".to_string()
            }
            "ATE1" => {
                self.echo = true;
                "OK".to_string()
            }
            "ATS0" => {
                self.spaces = false;
                "OK".to_string()
            }
            "ATS1" => {
                self.spaces = true;
                "OK".to_string()
            }
            "ATI" => "ELM327 v1.5".to_string(),
            "ATRV" => format!("{:.1}V", self.vehicle.battery_voltage),
            "ATDPN" => "6".to_string(),
            _ => "OK".to_string(),
        }
    }

    fn mode_01(&self, pid: &str) -> Option<String> {
        let v = &self.vehicle;
        let byte = |value: f64| value.clamp(0.0, 255.0) as u8;
        let percent = |value: f64| byte(value * 255.0 / 100.0);

        let response = match pid {
            "04" => format!("41 04 {:02X}", percent(v.engine_load)),
            "05" => format!("41 05 {:02X}", byte(v.coolant_temp + 40.0)),
            "0C" => {
                let raw = (v.rpm * 4.0).clamp(0.0, 65535.0) as u16;
                format!("41 0C {:02X} {:02X}", raw >> 8, raw & 0xFF)
            }
            "0D" => format!("41 0D {:02X}", byte(v.speed)),
            "2F" => format!("41 2F {:02X}", percent(v.fuel_level)),
            "42" => {
                let raw = (v.battery_voltage * 1000.0).clamp(0.0, 65535.0) as u16;
                format!("41 42 {:02X} {:02X}", raw >> 8, raw & 0xFF)
            }
            _ => return None,
        };
        Some(response)
    }

    fn mode_22(&self, did: &str) -> Option<String> {
        let v = &self.vehicle;
        let response = match did {
            "F400" => {
                let raw = (v.dpf_soot_mass_g * 100.0).clamp(0.0, 65535.0) as u16;
                format!("62 F4 00 {:02X} {:02X}", raw >> 8, raw & 0xFF)
            }
            "F401" => format!("62 F4 01 {:02X}", (v.eolys_level_l / 0.03).clamp(0.0, 255.0) as u8),
            "F403" => format!("62 F4 03 {:02X}", (v.oil_temp + 40.0).clamp(0.0, 255.0) as u8),
            _ => return None,
        };
        Some(response)
    }

    fn mode_03(&self) -> String {
        let mut response = String::from("43");
        for (first, second) in &self.vehicle.stored_dtcs {
            response.push_str(&format!(" {first:02X} {second:02X}"));
        }
        // Relleno hasta tres códigos por trama, como en CAN.
        for _ in self.vehicle.stored_dtcs.len()..3 {
            response.push_str(" 00 00");
        }
        response
    }

    /// Respuesta textual a un comando ya normalizado (sin espacios, mayúsculas).
    pub fn process_command(&mut self, command: &str) -> String {
        self.vehicle.update();

        if command.starts_with("AT") {
            return self.at_command(command);
        }
        if command == "03" {
            return self.mode_03();
        }
        if let Some(pid) = command.strip_prefix("01") {
            return self.mode_01(pid).unwrap_or_else(|| "NO DATA".to_string());
        }
        if let Some(did) = command.strip_prefix("22") {
            return self.mode_22(did).unwrap_or_else(|| "NO DATA".to_string());
        }
        "?".to_string()
    }

    fn format_response(&self, command: &str, response: String) -> String {
        let body = if self.spaces { response } else { response.replace(' ', "") };
        if self.echo && !command.starts_with("AT") {
            format!("{command}\r{body}\r\r>")
        } else {
            format!("{body}\r\r>")
        }
    }
}


impl Transport for Elm327Emulator {
    async fn open(&mut self) -> Result<(), LinkError> {
        self.open = true;
        debug!("Debug: emulador ELM327 abierto");
        Ok(())
    }

    async fn request(&mut self, frame: &[u8]) -> Result<Vec<u8>, LinkError> {
        if !self.open {
            return Err(LinkError::Io("emulador cerrado".to_string()));
        }
        let command: String = String::from_utf8_lossy(frame)
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_ascii_uppercase();

        let response = self.process_command(&command);
        Ok(self.format_response(&command, response).into_bytes())
    }

    async fn close(&mut self) {
        self.open = false;
    }
}


/// Fotograma sintético de tamaño fijo con un contador en cabecera.
fn synthetic_frame(counter: u64, size: usize) -> VideoFrame {
    let mut data = vec![0u8; size.max(8)];
    data[..8].copy_from_slice(&counter.to_be_bytes());
    VideoFrame { timestamp: Utc::now(), data }
}


/// Cámara sintética: emite fotogramas a cadencia fija hacia el grabador.
#[instrument(name = "run_camera_feed_task", skip(tx_frames))]
pub async fn run_camera_feed(tx_frames: mpsc::Sender<VideoFrame>, fps: u32, frame_bytes: usize) {
    info!("Info: cámara sintética creada a {} fps", fps);

    let period = Duration::from_secs(1) / fps.max(1);
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut counter = 0u64;

    loop {
        ticker.tick().await;
        counter += 1;
        if tx_frames.send(synthetic_frame(counter, frame_bytes)).await.is_err() {
            error!("Error: no se pudo enviar el fotograma al grabador");
            break;
        }
    }
    info!("Info: cámara sintética finalizada");
}


pub fn start_camera_feed(tx_frames: mpsc::Sender<VideoFrame>, fps: u32, frame_bytes: usize) {
    info!("Info: iniciando cámara sintética");
    tokio::spawn(async move {
        run_camera_feed(tx_frames, fps, frame_bytes).await;
    });
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::domain::{Pid, Reading};
    use crate::decoder::logic::{decode_dtc_response, decode_pid};

    async fn ask(emulator: &mut Elm327Emulator, command: &str) -> String {
        let bytes = emulator.request(format!("{command}\r").as_bytes()).await.unwrap();
        String::from_utf8(bytes).unwrap()
    }

    #[tokio::test]
    async fn responds_like_an_adapter() {
        let mut emulator = Elm327Emulator::default();
        assert!(emulator.request(b"ATZ\r").await.is_err());

        emulator.open().await.unwrap();
        assert!(ask(&mut emulator, "ATZ").await.starts_with("ELM327"));
        assert!(ask(&mut emulator, "ATE0").await.starts_with("OK"));
        assert_eq!(ask(&mut emulator, "0151").await, "NO DATA\r\r>");
        assert_eq!(ask(&mut emulator, "XYZ").await, "?\r\r>");
    }

    #[tokio::test]
    async fn responses_decode_to_vehicle_values() {
        let vehicle = VehicleModel { fuel_level: 12.0, coolant_temp: 90.0, ..VehicleModel::default() };
        let mut emulator = Elm327Emulator::with_vehicle(vehicle);
        emulator.open().await.unwrap();

        let fuel = ask(&mut emulator, "012F").await;
        assert!(matches!(decode_pid(Pid::FuelLevel, &fuel), Ok(Reading::FuelLevel(11))));

        let coolant = ask(&mut emulator, "0105").await;
        assert_eq!(decode_pid(Pid::CoolantTemp, &coolant), Ok(Reading::CoolantTemp(90)));

        let rpm = ask(&mut emulator, "010C").await;
        assert!(matches!(decode_pid(Pid::Rpm, &rpm), Ok(Reading::Rpm(800..=2200))));

        let volts = ask(&mut emulator, "0142").await;
        assert!(matches!(decode_pid(Pid::ControlModuleVoltage, &volts), Ok(Reading::BatteryVoltage(v)) if (v - 13.8).abs() < 0.01));
    }

    #[tokio::test]
    async fn reports_stored_dtcs() {
        let vehicle = VehicleModel { stored_dtcs: vec![(0x04, 0x20)], ..VehicleModel::default() };
        let mut emulator = Elm327Emulator::with_vehicle(vehicle);
        emulator.open().await.unwrap();

        let codes = decode_dtc_response(&ask(&mut emulator, "03").await).unwrap();
        assert_eq!(codes.len(), 1);
        assert_eq!(codes[0].code, "P0420");
    }

    #[tokio::test]
    async fn serves_psa_manufacturer_pids() {
        let vehicle = VehicleModel { dpf_soot_mass_g: 47.5, ..VehicleModel::default() };
        let mut emulator = Elm327Emulator::with_vehicle(vehicle);
        emulator.open().await.unwrap();

        let soot = ask(&mut emulator, "22F400").await;
        match decode_pid(Pid::DpfSootMass, &soot) {
            Ok(Reading::DpfSootMass(g)) => assert!((g - 47.5).abs() < 0.02),
            other => panic!("lectura inesperada {other:?}"),
        }
    }
}
