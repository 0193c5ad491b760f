//! Controlador de muestreo y tarea de sondeo.
//!
//! El controlador decide qué PIDs tocan en cada ciclo según el modo activo.
//! La tarea de sondeo pide cada PID al gestor de conectividad, decodifica y
//! publica una muestra por ciclo en `vehicle/telemetry/{id}/obd`.


use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use chrono::Utc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};
use crate::bus::domain::{BusMessage, EventKind, Topic, VehicleId};
use crate::bus::logic::BusHandle;
use crate::config::sampling::{DTC_INTERVAL, LOW_POWER_VOLTAGE, OUTBOX_CAPACITY, TICK, UNSTABLE_HOLD};
use crate::connectivity::domain::{ConnectionState, LinkError, Transport};
use crate::connectivity::logic::ConnectivityManager;
use crate::decoder::domain::{DecodeError, Pid, Reading, SampleBuilder, TelemetrySample};
use crate::decoder::logic::{decode_dtc_response, decode_pid};
use crate::decoder::profile::VehicleProfile;
use super::domain::{DtcCache, SamplingMode};


/// Planificador de PIDs por ciclo.
///
/// Un cambio de modo queda pendiente y se aplica al comenzar el siguiente
/// ciclo, nunca a mitad de uno.
#[derive(Debug)]
pub struct SamplingController {
    pids: &'static [Pid],
    mode: SamplingMode,
    pending: Option<SamplingMode>,
    next_due: HashMap<Pid, Instant>,
}


impl SamplingController {
    pub fn new(pids: &'static [Pid], mode: SamplingMode) -> Self {
        Self { pids, mode, pending: None, next_due: HashMap::new() }
    }

    pub fn mode(&self) -> SamplingMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: SamplingMode) {
        if mode == self.mode {
            self.pending = None;
        } else {
            self.pending = Some(mode);
        }
    }

    /// Modo efectivo: el preferido salvo que el enlace o la batería obliguen
    /// a una cadencia más lenta.
    ///
    /// `link_unstable` indica timeouts o una degradación recientes.
    pub fn select_mode(preferred: SamplingMode, link_unstable: bool, battery: Option<f64>) -> SamplingMode {
        let automatic = match (link_unstable, battery) {
            (_, Some(volts)) if volts < LOW_POWER_VOLTAGE => SamplingMode::Minimal,
            (true, _) => SamplingMode::Reduced,
            _ => SamplingMode::Normal,
        };
        preferred.max(automatic)
    }

    /// Abre un ciclo: aplica el modo pendiente y devuelve los PIDs vencidos
    /// en el orden del perfil.
    pub fn begin_cycle(&mut self, now: Instant) -> Vec<Pid> {
        if let Some(mode) = self.pending.take() {
            info!("Info: modo de muestreo {:?} -> {:?}", self.mode, mode);
            self.mode = mode;
            self.next_due.clear();
        }

        let mut due = Vec::new();
        for &pid in self.pids {
            let Some(every) = self.mode.interval(pid) else {
                continue;
            };
            let ready = self.next_due.get(&pid).is_none_or(|at| *at <= now);
            if ready {
                self.next_due.insert(pid, now + every);
                due.push(pid);
            }
        }
        due
    }
}


/// Resultado de consultar un PID dentro del ciclo.
enum Poll {
    Read(Reading),
    Skip(DecodeError),
    LinkDown(LinkError),
}


async fn poll_pid<T: Transport>(link: &ConnectivityManager<T>, pid: Pid) -> Poll {
    match link.request(pid.command()).await {
        Ok(raw) => match decode_pid(pid, &raw) {
            Ok(reading) => Poll::Read(reading),
            Err(e) => Poll::Skip(e),
        },
        Err(LinkError::Timeout) => Poll::Skip(DecodeError::Timeout),
        Err(e) => Poll::LinkDown(e),
    }
}


/// Cola de muestras decodificadas pendientes de publicar.
///
/// Retiene las muestras mientras no hay suscriptores de telemetría y las
/// entrega en orden cuando aparecen. Acotada: descarta las más antiguas.
#[derive(Debug, Default)]
pub struct Outbox {
    pending: VecDeque<TelemetrySample>,
}


impl Outbox {
    pub fn push(&mut self, sample: TelemetrySample) {
        if self.pending.len() == OUTBOX_CAPACITY {
            if let Some(dropped) = self.pending.pop_front() {
                warn!("Warning: cola de muestras llena, se descarta la muestra {}", dropped.seq);
            }
        }
        self.pending.push_back(sample);
    }

    /// Publica en orden mientras haya suscriptores. Devuelve las publicadas.
    pub fn flush(&mut self, bus: &BusHandle, topic: &Topic) -> usize {
        let mut sent = 0;
        while let Some(sample) = self.pending.pop_front() {
            if bus.publish(topic, BusMessage::Telemetry(sample.clone())) == 0 {
                self.pending.push_front(sample);
                break;
            }
            sent += 1;
        }
        sent
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}


struct DtcPoller {
    cache: DtcCache,
    last_poll: Option<Instant>,
}


impl DtcPoller {
    async fn poll<T: Transport>(
        &mut self,
        link: &ConnectivityManager<T>,
        profile: &dyn VehicleProfile,
        bus: &BusHandle,
        topic: &Topic,
        now: Instant,
    ) {
        if self.last_poll.is_some_and(|at| now.duration_since(at) < DTC_INTERVAL) {
            return;
        }
        self.last_poll = Some(now);

        let raw = match link.request("03").await {
            Ok(raw) => raw,
            Err(e) => {
                debug!("Debug: sondeo de DTCs omitido: {}", e);
                return;
            }
        };

        let codes = match decode_dtc_response(&raw) {
            Ok(codes) => codes,
            Err(DecodeError::NotFound) => Vec::new(),
            Err(e) => {
                warn!("Warning: respuesta de DTCs inválida: {}", e);
                return;
            }
        };

        let described = codes
            .into_iter()
            .map(|code| {
                let description = profile.describe_dtc(&code.code);
                code.with_description(description)
            })
            .collect();

        let fresh = self.cache.update(described);
        if !fresh.is_empty() {
            info!("Info: {} DTC nuevos: {:?}", fresh.len(), fresh.iter().map(|c| c.code.as_str()).collect::<Vec<_>>());
            bus.publish(topic, BusMessage::Dtc(fresh));
        }
    }
}


/// Tarea de sondeo del vehículo.
///
/// Un `DecodeError` solo omite ese PID en el ciclo. Si el enlace cae a mitad
/// de ciclo, las lecturas ya decodificadas forman una muestra parcial que no
/// se descarta. Tras un timeout o una degradación el muestreo baja a
/// `Reduced` durante `UNSTABLE_HOLD`.
#[instrument(name = "run_sampling_task", skip(link, bus, profile))]
pub async fn run_sampling<T: Transport>(
    link: ConnectivityManager<T>,
    bus: BusHandle,
    vehicle: VehicleId,
    profile: Arc<dyn VehicleProfile>,
    preferred: SamplingMode,
) {
    info!("Info: tarea de muestreo creada para el perfil {}", profile.name());

    let telemetry_topic = Topic::telemetry(&vehicle);
    let dtc_topic = Topic::event(&vehicle, EventKind::Dtc);
    let mut controller = SamplingController::new(profile.pids(), preferred);
    let mut outbox = Outbox::default();
    let mut dtc = DtcPoller { cache: DtcCache::default(), last_poll: None };
    let mut battery: Option<f64> = None;
    let mut last_trouble: Option<Instant> = None;
    let mut seq: u64 = 0;

    let mut ticker = interval(TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while bus.is_alive() {
        ticker.tick().await;
        outbox.flush(&bus, &telemetry_topic);

        let state = link.state();
        if state == ConnectionState::Disconnected && !dtc.cache.is_empty() {
            debug!("Debug: enlace reiniciado, se vacía la caché de DTCs");
            dtc.cache.clear();
        }
        if state == ConnectionState::Degraded {
            last_trouble = Some(Instant::now());
        }
        if !state.is_usable() {
            continue;
        }

        let now = Instant::now();
        let unstable = last_trouble.is_some_and(|at| now.duration_since(at) < UNSTABLE_HOLD);
        controller.set_mode(SamplingController::select_mode(preferred, unstable, battery));
        let due = controller.begin_cycle(now);

        if !due.is_empty() {
            let mut builder = SampleBuilder::new(seq, Utc::now());
            for pid in due {
                match poll_pid(&link, pid).await {
                    Poll::Read(reading) => builder.push(reading),
                    Poll::Skip(DecodeError::Timeout) => {
                        debug!("Debug: timeout consultando {:?}", pid);
                        last_trouble = Some(Instant::now());
                    }
                    Poll::Skip(e) => debug!("Debug: {:?} omitido en este ciclo: {}", pid, e),
                    Poll::LinkDown(e) => {
                        warn!("Warning: ciclo interrumpido por el enlace: {}", e);
                        last_trouble = Some(Instant::now());
                        break;
                    }
                }
            }

            if let Some(sample) = builder.build() {
                if sample.battery_voltage.is_some() {
                    battery = sample.battery_voltage;
                }
                seq += 1;
                outbox.push(sample);
                outbox.flush(&bus, &telemetry_topic);
            }
        }

        if link.state().is_usable() {
            dtc.poll(&link, profile.as_ref(), &bus, &dtc_topic, now).await;
        }
    }
    info!("Info: tarea de muestreo finalizada");
}


pub fn start_sampling<T: Transport>(
    link: ConnectivityManager<T>,
    bus: BusHandle,
    vehicle: VehicleId,
    profile: Arc<dyn VehicleProfile>,
    preferred: SamplingMode,
) {
    info!("Info: iniciando tarea de muestreo");
    tokio::spawn(async move {
        run_sampling(link, bus, vehicle, profile, preferred).await;
    });
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::time::Duration;
    use crate::bus::logic::MessageBus;
    use crate::connectivity::logic::LinkSettings;
    use crate::decoder::profile::GenericObd;
    use crate::simulator::logic::Elm327Emulator;

    const PIDS: &[Pid] = &[Pid::Rpm, Pid::Speed, Pid::CoolantTemp, Pid::FuelLevel, Pid::ControlModuleVoltage];

    #[tokio::test(start_paused = true)]
    async fn first_cycle_polls_everything_then_follows_cadence() {
        let mut controller = SamplingController::new(PIDS, SamplingMode::Normal);
        let t0 = Instant::now();
        assert_eq!(controller.begin_cycle(t0), PIDS.to_vec());
        assert!(controller.begin_cycle(t0 + Duration::from_millis(100)).is_empty());
        assert_eq!(controller.begin_cycle(t0 + Duration::from_millis(250)), vec![Pid::Rpm, Pid::Speed]);
        assert_eq!(
            controller.begin_cycle(t0 + Duration::from_secs(2)),
            vec![Pid::Rpm, Pid::Speed, Pid::CoolantTemp]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn mode_change_applies_on_next_cycle() {
        let mut controller = SamplingController::new(PIDS, SamplingMode::Normal);
        let t0 = Instant::now();
        controller.begin_cycle(t0);

        controller.set_mode(SamplingMode::Minimal);
        assert_eq!(controller.mode(), SamplingMode::Normal);

        let due = controller.begin_cycle(t0 + Duration::from_millis(250));
        assert_eq!(controller.mode(), SamplingMode::Minimal);
        assert_eq!(due, vec![Pid::CoolantTemp, Pid::FuelLevel, Pid::ControlModuleVoltage]);
    }

    #[tokio::test(start_paused = true)]
    async fn reduced_mode_slows_polling() {
        let mut controller = SamplingController::new(PIDS, SamplingMode::Reduced);
        let t0 = Instant::now();
        controller.begin_cycle(t0);
        assert!(controller.begin_cycle(t0 + Duration::from_millis(250)).is_empty());
        assert_eq!(controller.begin_cycle(t0 + Duration::from_secs(1)), vec![Pid::Rpm, Pid::Speed]);
    }

    #[test]
    fn automatic_mode_only_slows_down() {
        assert_eq!(SamplingController::select_mode(SamplingMode::Normal, false, Some(12.6)), SamplingMode::Normal);
        assert_eq!(SamplingController::select_mode(SamplingMode::Normal, true, None), SamplingMode::Reduced);
        assert_eq!(SamplingController::select_mode(SamplingMode::Normal, true, Some(11.2)), SamplingMode::Minimal);
        assert_eq!(SamplingController::select_mode(SamplingMode::Reduced, false, None), SamplingMode::Reduced);
        assert_eq!(SamplingController::select_mode(SamplingMode::Minimal, false, Some(13.0)), SamplingMode::Minimal);
    }

    /// Emulador cuyas primeras peticiones de velocidad no responden.
    struct StallingSpeed {
        emulator: Elm327Emulator,
        stalls: u32,
        rpm_polls: Arc<StdMutex<Vec<Instant>>>,
    }

    impl Transport for StallingSpeed {
        async fn open(&mut self) -> Result<(), LinkError> {
            self.emulator.open().await
        }

        async fn request(&mut self, frame: &[u8]) -> Result<Vec<u8>, LinkError> {
            let command = String::from_utf8_lossy(frame).trim().to_string();
            if command == Pid::Rpm.command() {
                self.rpm_polls.lock().unwrap().push(Instant::now());
            }
            if command == Pid::Speed.command() && self.stalls > 0 {
                self.stalls -= 1;
                std::future::pending::<()>().await;
            }
            self.emulator.request(frame).await
        }

        async fn close(&mut self) {
            self.emulator.close().await
        }
    }

    fn polls_between(polls: &[Instant], from: Instant, to: Instant) -> usize {
        polls.iter().filter(|at| **at >= from && **at < to).count()
    }

    #[tokio::test(start_paused = true)]
    async fn request_timeout_slows_sampling_until_the_link_settles() {
        let bus = MessageBus::new();
        let vehicle = VehicleId::new("v1").unwrap();
        let rpm_polls = Arc::new(StdMutex::new(Vec::new()));
        let transport = StallingSpeed {
            emulator: Elm327Emulator::default(),
            stalls: 1,
            rpm_polls: rpm_polls.clone(),
        };
        let link = ConnectivityManager::new(transport, LinkSettings::default(), bus.handle(), &vehicle);
        link.connect().await.unwrap();

        let t0 = Instant::now();
        start_sampling(link.clone(), bus.handle(), vehicle, Arc::new(GenericObd), SamplingMode::Normal);
        tokio::time::sleep(Duration::from_secs(60)).await;

        assert_eq!(link.state(), ConnectionState::Connected);
        let polls = rpm_polls.lock().unwrap().clone();
        // Reducido: un sondeo de RPM por segundo.
        let reduced = polls_between(&polls, t0 + Duration::from_secs(5), t0 + Duration::from_secs(15));
        assert!(reduced <= 12, "{reduced} sondeos en modo reducido");
        // Pasada la ventana de inestabilidad vuelve a la cadencia normal.
        let normal = polls_between(&polls, t0 + Duration::from_secs(45), t0 + Duration::from_secs(55));
        assert!(normal >= 25, "{normal} sondeos en modo normal");
    }

    #[tokio::test]
    async fn outbox_holds_samples_until_someone_listens() {
        let bus = MessageBus::new();
        let vehicle = VehicleId::new("v1").unwrap();
        let topic = Topic::telemetry(&vehicle);
        let mut outbox = Outbox::default();

        outbox.push(TelemetrySample::empty(1, Utc::now()));
        outbox.push(TelemetrySample::empty(2, Utc::now()));
        assert_eq!(outbox.flush(&bus.handle(), &topic), 0);
        assert_eq!(outbox.len(), 2);

        let mut sub = bus.subscribe(&topic);
        assert_eq!(outbox.flush(&bus.handle(), &topic), 2);
        assert!(outbox.is_empty());

        let seqs: Vec<u64> = [sub.try_recv(), sub.try_recv()]
            .into_iter()
            .flatten()
            .filter_map(|e| match e.message {
                BusMessage::Telemetry(s) => Some(s.seq),
                _ => None,
            })
            .collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn outbox_is_bounded() {
        let mut outbox = Outbox::default();
        for seq in 0..(OUTBOX_CAPACITY as u64 + 5) {
            outbox.push(TelemetrySample::empty(seq, Utc::now()));
        }
        assert_eq!(outbox.len(), OUTBOX_CAPACITY);
        assert_eq!(outbox.pending.front().map(|s| s.seq), Some(5));
    }
}
