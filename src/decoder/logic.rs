//! Traducción sin estado de respuestas del adaptador a valores tipados.
//!
//! Las fórmulas son las de SAE J1979 y deben reproducirse bit a bit. Ninguna
//! función de este módulo entra en pánico con entradas arbitrarias: cualquier
//! respuesta inesperada se convierte en un [`DecodeError`] o en cero códigos.


use super::domain::{DecodeError, DiagnosticCode, Pid, Reading};


/// Nivel de combustible / carga de motor: `floor(A·100/255)`.
pub fn percent(a: u8) -> u8 {
    (u32::from(a) * 100 / 255) as u8
}

/// `floor(((A·256)+B)/4)`.
pub fn rpm(a: u8, b: u8) -> u32 {
    (u32::from(a) * 256 + u32::from(b)) / 4
}

/// Velocidad directa en km/h; un byte ya queda dentro de [0,255].
pub fn speed(a: u8) -> u8 {
    a
}

/// `A-40` °C.
pub fn coolant(a: u8) -> i16 {
    i16::from(a) - 40
}

/// Tensión del módulo de control: `((A·256)+B)/1000` V.
pub fn voltage(a: u8, b: u8) -> f64 {
    f64::from(u32::from(a) * 256 + u32::from(b)) / 1000.0
}

/// Masa de hollín del FAP (PSA): `((A·256)+B)/100` g.
pub fn soot_mass(a: u8, b: u8) -> f64 {
    f64::from(u32::from(a) * 256 + u32::from(b)) / 100.0
}

/// Nivel de aditivo Eolys (PSA): `A·0.03` L.
pub fn eolys_level(a: u8) -> f64 {
    f64::from(a) * 0.03
}


/// Normaliza la respuesta cruda del adaptador en líneas compactas.
///
/// Elimina espacios, el prompt `>` y los mensajes de estado del ELM327.
/// Las respuestas negativas del adaptador se reportan como `NotFound`.
pub fn response_lines(raw: &str) -> Result<Vec<String>, DecodeError> {
    let upper = raw.to_ascii_uppercase();
    let mut lines = Vec::new();

    for line in upper.split(['\r', '\n']) {
        let line = line.trim().trim_start_matches('>').trim();
        if line.is_empty() || line.starts_with("SEARCHING") || line.starts_with("BUS INIT") {
            continue;
        }
        if line.contains("NO DATA")
            || line.contains("UNABLE TO CONNECT")
            || line.contains("STOPPED")
            || line == "?"
        {
            return Err(DecodeError::NotFound);
        }
        let compact: String = line.chars().filter(|c| !c.is_whitespace() && *c != '>').collect();
        if !compact.is_empty() {
            lines.push(compact);
        }
    }

    if lines.is_empty() {
        return Err(DecodeError::NotFound);
    }
    Ok(lines)
}


/// Convierte una cadena hexadecimal compacta en bytes.
pub fn parse_hex_bytes(hex: &str) -> Result<Vec<u8>, DecodeError> {
    if hex.len() % 2 != 0 || !hex.is_ascii() {
        return Err(DecodeError::Malformed(format!("longitud hexadecimal impar: {}", hex.len())));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| DecodeError::Malformed(format!("byte no hexadecimal en posición {i}")))
        })
        .collect()
}


/// Decodifica la respuesta a un PID de lectura.
///
/// Busca la primera línea con el prefijo esperado (tolera el eco del comando).
/// Sin prefijo devuelve `NotFound`; con datos insuficientes, `Malformed`.
pub fn decode_pid(pid: Pid, raw: &str) -> Result<Reading, DecodeError> {
    let lines = response_lines(raw)?;
    let prefix = pid.response_prefix();

    let payload = lines
        .iter()
        .find_map(|line| line.strip_prefix(prefix))
        .ok_or(DecodeError::NotFound)?;

    let data = parse_hex_bytes(payload)?;
    if data.len() < pid.data_len() {
        return Err(DecodeError::Malformed(format!(
            "{} espera {} bytes, recibidos {}",
            pid.command(),
            pid.data_len(),
            data.len()
        )));
    }

    let a = data[0];
    let b = data.get(1).copied().unwrap_or_default();

    Ok(match pid {
        Pid::EngineLoad => Reading::EngineLoad(percent(a)),
        Pid::CoolantTemp => Reading::CoolantTemp(coolant(a)),
        Pid::Rpm => Reading::Rpm(rpm(a, b)),
        Pid::Speed => Reading::Speed(speed(a)),
        Pid::FuelLevel => Reading::FuelLevel(percent(a)),
        Pid::ControlModuleVoltage => Reading::BatteryVoltage(voltage(a, b)),
        Pid::DpfSootMass => Reading::DpfSootMass(soot_mass(a, b)),
        Pid::EolysLevel => Reading::EolysLevel(eolys_level(a)),
        Pid::OilTemp => Reading::OilTemp(coolant(a)),
    })
}


/// Decodifica una carga útil de DTCs ya sin el prefijo de modo.
///
/// Se recorre en bloques de 4 caracteres hexadecimales; los bloques `0000`
/// son relleno y los bloques cortos o no hexadecimales se descartan.
pub fn decode_dtc_payload(hex: &str) -> Vec<DiagnosticCode> {
    let compact: Vec<char> = hex.chars().filter(|c| !c.is_whitespace()).collect();

    compact
        .chunks(4)
        .filter(|chunk| chunk.len() == 4)
        .filter_map(|chunk| {
            let chunk: String = chunk.iter().collect();
            let value = u16::from_str_radix(&chunk, 16).ok()?;
            let [first, second] = value.to_be_bytes();
            DiagnosticCode::from_bytes(first, second)
        })
        .collect()
}


/// Decodifica una respuesta completa de modo 03 (prefijo `43`).
///
/// Admite una línea por ECU; los códigos repetidos se informan una vez.
pub fn decode_dtc_response(raw: &str) -> Result<Vec<DiagnosticCode>, DecodeError> {
    let lines = response_lines(raw)?;
    let mut found = false;
    let mut codes: Vec<DiagnosticCode> = Vec::new();

    for payload in lines.iter().filter_map(|line| line.strip_prefix("43")) {
        found = true;
        for code in decode_dtc_payload(payload) {
            if !codes.contains(&code) {
                codes.push(code);
            }
        }
    }

    if !found {
        return Err(DecodeError::NotFound);
    }
    Ok(codes)
}
