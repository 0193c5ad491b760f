use tokio::sync::mpsc;
use crate::config::channels::{DVR_COMMANDS, FRAMES, TRIGGERS};
use crate::dvr::domain::{DvrCommand, TriggerRequest, VideoFrame};
use crate::dvr::logic::DvrInputs;


/// Canales punto a punto entre las tareas de larga duración.
///
/// El resto de la comunicación pasa por el bus de mensajes.
pub struct Channels {
    pub camera_to_dvr: mpsc::Sender<VideoFrame>,
    pub dvr_from_camera: mpsc::Receiver<VideoFrame>,

    pub trigger_to_dvr: mpsc::Sender<TriggerRequest>,
    pub dvr_from_trigger: mpsc::Receiver<TriggerRequest>,

    pub command_to_dvr: mpsc::Sender<DvrCommand>,
    pub dvr_from_command: mpsc::Receiver<DvrCommand>,
}


impl Channels {
    pub fn new() -> Channels {
        let (c_to_d, d_from_c) = mpsc::channel::<VideoFrame>(FRAMES);
        let (t_to_d, d_from_t) = mpsc::channel::<TriggerRequest>(TRIGGERS);
        let (cmd_to_d, d_from_cmd) = mpsc::channel::<DvrCommand>(DVR_COMMANDS);

        Self {
            camera_to_dvr: c_to_d,
            dvr_from_camera: d_from_c,
            trigger_to_dvr: t_to_d,
            dvr_from_trigger: d_from_t,
            command_to_dvr: cmd_to_d,
            dvr_from_command: d_from_cmd,
        }
    }
}


impl Default for Channels {
    fn default() -> Self {
        Self::new()
    }
}


/// Extremos de entrada de la tarea del grabador.
impl From<(mpsc::Receiver<VideoFrame>, mpsc::Receiver<TriggerRequest>, mpsc::Receiver<DvrCommand>)> for DvrInputs {
    fn from(
        (frames, triggers, commands): (
            mpsc::Receiver<VideoFrame>,
            mpsc::Receiver<TriggerRequest>,
            mpsc::Receiver<DvrCommand>,
        ),
    ) -> Self {
        DvrInputs { frames, triggers, commands }
    }
}
