use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{error, info, warn};
use chrono::Utc;
use vehicle_edge_service::bus::domain::{BusMessage, EventKind, Topic};
use vehicle_edge_service::channels::domain::Channels;
use vehicle_edge_service::config::dvr::SHUTDOWN_GRACE;
use vehicle_edge_service::config::simulator::{CAMERA_FPS, FRAME_BYTES};
use vehicle_edge_service::connectivity::logic::{start_link_supervisor, ConnectivityManager};
use vehicle_edge_service::context::domain::AppContext;
use vehicle_edge_service::dvr::domain::{DvrCommand, DvrState, TriggerRequest};
use vehicle_edge_service::dvr::logic::{start_dvr, DvrInputs, DvrManager};
use vehicle_edge_service::dvr::storage::DiskProbe;
use vehicle_edge_service::rules::logic::{start_rules, RulesEngine};
use vehicle_edge_service::sampling::logic::start_sampling;
use vehicle_edge_service::simulator::logic::{start_camera_feed, Elm327Emulator};
use vehicle_edge_service::system::domain::{init_tracing, AdapterKind, System};


/// Disparo manual de clip con `SIGUSR1`.
#[cfg(unix)]
fn start_manual_trigger(tx_trigger: mpsc::Sender<TriggerRequest>) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut usr1 = match signal(SignalKind::user_defined1()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Warning: disparo manual no disponible: {}", e);
                return;
            }
        };
        while usr1.recv().await.is_some() {
            if tx_trigger.send(TriggerRequest::manual("manual", Utc::now())).await.is_err() {
                error!("Error: no se pudo enviar el disparo manual al grabador");
                break;
            }
        }
    });
}


#[cfg(not(unix))]
fn start_manual_trigger(_tx_trigger: mpsc::Sender<TriggerRequest>) {}


#[tokio::main]
async fn main() {

    let system = match System::new() {
        Ok(system) => system,
        Err(e) => {
            eprintln!("Error: configuración inválida: {e}");
            std::process::exit(1);
        }
    };

    init_tracing(&system);

    let channels = Channels::new();
    let app_context = match AppContext::new(system) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!("Error: no se pudo crear el contexto: {}", e);
            std::process::exit(1);
        }
    };

    let system = app_context.system.clone();
    let bus = app_context.bus_handle();
    let vehicle = app_context.vehicle.clone();
    let profile = app_context.profile.clone();
    info!("Info: servicio iniciado para el vehículo {} con perfil {}", vehicle, profile.name());

    start_rules(bus.clone(),
                vehicle.clone(),
                RulesEngine::for_profile(profile.as_ref()));

    let dvr = DvrManager::new(system.dvr_config(), DiskProbe, bus.clone(), &vehicle);
    start_dvr(dvr,
              vehicle.clone(),
              DvrInputs::from((channels.dvr_from_camera,
                               channels.dvr_from_trigger,
                               channels.dvr_from_command)));

    start_camera_feed(channels.camera_to_dvr, CAMERA_FPS, FRAME_BYTES);

    start_manual_trigger(channels.trigger_to_dvr);

    let transport = match system.adapter {
        AdapterKind::Simulated => Elm327Emulator::default(),
    };
    let link = ConnectivityManager::new(transport,
                                        system.link_settings(profile.init_commands()),
                                        bus.clone(),
                                        &vehicle);

    start_link_supervisor(link.clone());

    start_sampling(link.clone(),
                   bus.clone(),
                   vehicle.clone(),
                   profile.clone(),
                   system.sampling_mode);

    if channels.command_to_dvr.send(DvrCommand::Start).await.is_err() {
        error!("Error: no se pudo iniciar el grabador");
    }

    if let Err(e) = link.connect().await {
        error!("Error: enlace no disponible: {}", e);
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Error: no se pudo escuchar la señal de apagado: {}", e);
    }
    info!("Info: apagado solicitado");

    link.disconnect().await;

    let mut dvr_state = app_context.bus.subscribe(&Topic::event(&vehicle, EventKind::Dvr));
    if channels.command_to_dvr.send(DvrCommand::Stop).await.is_err() {
        error!("Error: no se pudo detener el grabador");
    }
    let stopped = timeout(SHUTDOWN_GRACE, async {
        while let Some(envelope) = dvr_state.recv().await {
            if matches!(envelope.message, BusMessage::Dvr(DvrState::Idle)) {
                break;
            }
        }
    })
    .await;
    if stopped.is_err() {
        warn!("Warning: el grabador no confirmó la parada a tiempo");
    }

    info!("Info: servicio finalizado");
}
