//! Almacenamiento de clips: nombres, escritura atómica, retención y sondeo
//! de espacio libre.


use std::path::{Path, PathBuf};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use sysinfo::Disks;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use crate::config::dvr::{CLIP_EXTENSION, REASON_MAX_LEN, TEMP_SUFFIX};
use super::domain::{Segment, StorageError};


/// Sustituye todo carácter no alfanumérico por `_` y trunca a 30 caracteres.
pub fn sanitize_reason(reason: &str) -> String {
    let sanitized: String = reason
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .take(REASON_MAX_LEN)
        .collect();
    if sanitized.is_empty() { "event".to_string() } else { sanitized }
}


/// `{yyyyMMdd_HHmmss}_{motivo}.mp4` en la zona horaria configurada.
pub fn clip_file_name(timestamp: DateTime<Utc>, timezone: Tz, reason: &str) -> String {
    format!(
        "{}_{}.{}",
        timestamp.with_timezone(&timezone).format("%Y%m%d_%H%M%S"),
        sanitize_reason(reason),
        CLIP_EXTENSION
    )
}


fn is_clip(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == CLIP_EXTENSION)
}


fn is_temp(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == TEMP_SUFFIX)
}


/// Fuente de espacio libre del volumen de clips.
pub trait StorageProbe: Send + Sync + 'static {
    fn available_bytes(&self, dir: &Path) -> Result<u64, StorageError>;
}


/// Sondeo real mediante `sysinfo`: el disco cuyo punto de montaje es el
/// prefijo más largo del directorio de clips.
#[derive(Debug, Default)]
pub struct DiskProbe;


/// Consulta bloqueante: `DvrManager` la ejecuta con `spawn_blocking`.
impl StorageProbe for DiskProbe {
    fn available_bytes(&self, dir: &Path) -> Result<u64, StorageError> {
        let dir = std::fs::canonicalize(dir)?;
        let disks = Disks::new_with_refreshed_list();

        disks
            .list()
            .iter()
            .filter(|disk| dir.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
            .ok_or_else(|| StorageError::WriteFailure(format!("sin disco para {}", dir.display())))
    }
}


/// Directorio de clips con escritura temporal y renombrado atómico.
#[derive(Debug, Clone)]
pub struct ClipStore {
    dir: PathBuf,
    max_clips: usize,
}


impl ClipStore {
    pub fn new(dir: impl Into<PathBuf>, max_clips: usize) -> Self {
        Self { dir: dir.into(), max_clips: max_clips.max(1) }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Crea el directorio y elimina los `*.tmp` huérfanos de escrituras
    /// interrumpidas. Devuelve cuántos se eliminaron.
    pub async fn prepare(&self) -> Result<usize, StorageError> {
        fs::create_dir_all(&self.dir).await?;

        let mut removed = 0;
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if is_temp(&path) {
                match fs::remove_file(&path).await {
                    Ok(()) => {
                        debug!("Debug: temporal huérfano eliminado {}", path.display());
                        removed += 1;
                    }
                    Err(e) => warn!("Warning: no se pudo eliminar {}: {}", path.display(), e),
                }
            }
        }
        if removed > 0 {
            info!("Info: {} temporales huérfanos eliminados", removed);
        }
        Ok(removed)
    }

    /// Ruta libre para `name`; si ya existe, añade `_1`, `_2`… antes de la extensión.
    async fn unique_path(&self, name: &str) -> Result<PathBuf, StorageError> {
        let candidate = self.dir.join(name);
        if !fs::try_exists(&candidate).await? {
            return Ok(candidate);
        }

        let stem = name.strip_suffix(&format!(".{CLIP_EXTENSION}")).unwrap_or(name);
        let mut n = 1u32;
        loop {
            let candidate = self.dir.join(format!("{stem}_{n}.{CLIP_EXTENSION}"));
            if !fs::try_exists(&candidate).await? {
                return Ok(candidate);
            }
            n += 1;
        }
    }

    /// Escribe el clip en `{nombre}.tmp`, sincroniza y renombra al nombre final.
    pub async fn write_clip(&self, name: &str, segments: &[Segment]) -> Result<PathBuf, StorageError> {
        let target = self.unique_path(name).await?;
        let mut temp = target.clone().into_os_string();
        temp.push(".");
        temp.push(TEMP_SUFFIX);
        let temp = PathBuf::from(temp);

        let written = async {
            let mut file = fs::File::create(&temp).await?;
            for frame in segments.iter().flat_map(|s| s.frames.iter()) {
                file.write_all(&frame.data).await?;
            }
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp, &target).await
        }
        .await;

        if let Err(e) = written {
            if let Err(cleanup) = fs::remove_file(&temp).await {
                debug!("Debug: temporal no eliminado tras fallo: {}", cleanup);
            }
            return Err(StorageError::WriteFailure(e.to_string()));
        }
        Ok(target)
    }

    /// Clips existentes ordenados del más antiguo al más reciente.
    ///
    /// Se ordena por fecha de modificación: el nombre usa la hora local y se
    /// repite al retrasar el reloj por el cambio de horario.
    pub async fn list_clips(&self) -> Result<Vec<PathBuf>, StorageError> {
        let mut clips = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if is_clip(&path) {
                let modified = entry.metadata().await?.modified()?;
                clips.push((modified, path));
            }
        }
        clips.sort();
        Ok(clips.into_iter().map(|(_, path)| path).collect())
    }

    /// Elimina los clips más antiguos por encima de `max_clips`.
    pub async fn enforce_retention(&self) -> Result<Vec<PathBuf>, StorageError> {
        let clips = self.list_clips().await?;
        let excess = clips.len().saturating_sub(self.max_clips);

        let mut removed = Vec::with_capacity(excess);
        for path in clips.into_iter().take(excess) {
            fs::remove_file(&path).await?;
            info!("Info: clip retirado por retención {}", path.display());
            removed.push(path);
        }
        Ok(removed)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};
    use chrono::TimeZone;
    use crate::dvr::domain::VideoFrame;

    fn segment(bytes: &[u8]) -> Segment {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap();
        let mut segment = Segment::new(1, start);
        segment.push(VideoFrame { timestamp: start, data: bytes.to_vec() });
        segment
    }

    #[test]
    fn reason_is_sanitized_and_truncated() {
        assert_eq!(sanitize_reason("FUEL LOW!"), "FUEL_LOW_");
        assert_eq!(sanitize_reason("alert/P0420:engine"), "alert_P0420_engine");
        assert_eq!(sanitize_reason(&"x".repeat(50)).len(), 30);
        assert_eq!(sanitize_reason("ñandú"), "_and_");
        assert_eq!(sanitize_reason(""), "event");
    }

    #[test]
    fn file_name_uses_configured_timezone() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 23, 30, 5).unwrap();
        assert_eq!(clip_file_name(ts, Tz::UTC, "ENGINE_OVERHEAT"), "20240301_233005_ENGINE_OVERHEAT.mp4");
        assert_eq!(
            clip_file_name(ts, chrono_tz::Europe::Madrid, "manual trigger"),
            "20240302_003005_manual_trigger.mp4"
        );
    }

    #[tokio::test]
    async fn writes_atomically_and_suffixes_collisions() {
        let dir = tempfile::tempdir().unwrap();
        let store = ClipStore::new(dir.path(), 10);
        store.prepare().await.unwrap();

        let first = store.write_clip("20240301_080000_X.mp4", &[segment(b"abc")]).await.unwrap();
        let second = store.write_clip("20240301_080000_X.mp4", &[segment(b"def")]).await.unwrap();

        assert_eq!(first.file_name().unwrap(), "20240301_080000_X.mp4");
        assert_eq!(second.file_name().unwrap(), "20240301_080000_X_1.mp4");
        assert_eq!(std::fs::read(&first).unwrap(), b"abc");
        assert_eq!(std::fs::read(&second).unwrap(), b"def");

        let leftovers = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| is_temp(&e.path()))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn prepare_removes_orphaned_temporaries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("20240301_080000_X.mp4.tmp"), b"partial").unwrap();
        std::fs::write(dir.path().join("20240301_070000_Y.mp4"), b"done").unwrap();

        let store = ClipStore::new(dir.path(), 10);
        assert_eq!(store.prepare().await.unwrap(), 1);
        assert_eq!(store.list_clips().await.unwrap().len(), 1);
    }

    fn set_modified(path: &Path, secs: u64) {
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::UNIX_EPOCH + Duration::from_secs(secs)).unwrap();
    }

    #[tokio::test]
    async fn retention_drops_oldest_clips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ClipStore::new(dir.path(), 2);
        store.prepare().await.unwrap();
        let names = ["20240301_070000_A.mp4", "20240301_080000_B.mp4", "20240301_090000_C.mp4"];
        for (i, name) in names.iter().enumerate() {
            let path = store.write_clip(name, &[segment(b"x")]).await.unwrap();
            set_modified(&path, 1_709_276_400 + i as u64 * 3600);
        }

        let removed = store.enforce_retention().await.unwrap();
        assert_eq!(removed.len(), 1);
        assert!(removed[0].ends_with("20240301_070000_A.mp4"));

        let kept: Vec<_> = store.list_clips().await.unwrap();
        assert_eq!(kept.len(), 2);
    }

    #[tokio::test]
    async fn retention_follows_write_order_when_local_clock_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = ClipStore::new(dir.path(), 2);
        store.prepare().await.unwrap();

        // 00:30 UTC (02:30 CEST) y 01:15 UTC (02:15 CET) el 27/10/2024 en Madrid.
        let madrid = chrono_tz::Europe::Madrid;
        let summer = Utc.with_ymd_and_hms(2024, 10, 27, 0, 30, 0).unwrap();
        let winter = Utc.with_ymd_and_hms(2024, 10, 27, 1, 15, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2024, 10, 27, 2, 0, 0).unwrap();

        for (ts, reason) in [(summer, "A"), (winter, "B"), (later, "C")] {
            let name = clip_file_name(ts, madrid, reason);
            let path = store.write_clip(&name, &[segment(b"x")]).await.unwrap();
            set_modified(&path, ts.timestamp() as u64);
        }
        assert_eq!(clip_file_name(winter, madrid, "B"), "20241027_021500_B.mp4");

        let removed = store.enforce_retention().await.unwrap();
        assert_eq!(removed.len(), 1);
        assert!(removed[0].ends_with("20241027_023000_A.mp4"));
    }

    #[test]
    fn disk_probe_reports_space_for_existing_dir() {
        let dir = tempfile::tempdir().unwrap();
        // Algunos entornos aislados no exponen discos; solo se comprueba que no falle en silencio.
        match DiskProbe.available_bytes(dir.path()) {
            Ok(_) | Err(StorageError::WriteFailure(_)) => {}
            Err(other) => panic!("error inesperado {other:?}"),
        }
    }
}
