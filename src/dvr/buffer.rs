//! Búfer circular de segmentos de vídeo.
//!
//! Lo posee en exclusiva la tarea del grabador. Los segmentos cerrados se
//! descartan en orden FIFO estricto al superar `max_segments`.


use std::collections::VecDeque;
use chrono::{DateTime, TimeDelta, Utc};
use super::domain::{Segment, VideoFrame};


/// Efecto de añadir un fotograma o un segmento al búfer.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct PushOutcome {
    /// Segmento que se acaba de cerrar.
    pub closed: Option<u64>,
    /// Segmento expulsado por rotación.
    pub evicted: Option<Segment>,
    /// El búfer está a plena capacidad tras la operación.
    pub full: bool,
}


#[derive(Debug)]
pub struct RollingBuffer {
    segments: VecDeque<Segment>,
    current: Option<Segment>,
    max_segments: usize,
    segment_duration: TimeDelta,
    next_index: u64,
}


impl RollingBuffer {
    pub fn new(max_segments: usize, segment_duration: TimeDelta) -> Self {
        Self {
            segments: VecDeque::with_capacity(max_segments.max(1)),
            current: None,
            max_segments: max_segments.max(1),
            segment_duration,
            next_index: 1,
        }
    }

    /// Añade un segmento cerrado, expulsando el más antiguo si no cabe.
    pub fn push_segment(&mut self, segment: Segment) -> PushOutcome {
        let closed = Some(segment.index);
        self.next_index = self.next_index.max(segment.index + 1);
        self.segments.push_back(segment);

        let evicted = if self.segments.len() > self.max_segments {
            self.segments.pop_front()
        } else {
            None
        };
        PushOutcome { closed, evicted, full: self.is_full() }
    }

    /// Añade un fotograma al segmento abierto y lo cierra al cumplir su duración.
    pub fn push_frame(&mut self, frame: VideoFrame) -> PushOutcome {
        let rollover = self
            .current
            .as_ref()
            .is_some_and(|segment| frame.timestamp - segment.start >= self.segment_duration);

        let mut outcome = PushOutcome::default();
        if rollover {
            if let Some(done) = self.current.take() {
                outcome = self.push_segment(done);
            }
        }

        let segment = self.current.get_or_insert_with(|| {
            let index = self.next_index;
            self.next_index += 1;
            Segment::new(index, frame.timestamp)
        });
        segment.push(frame);
        outcome
    }

    /// Segmentos contiguos que cubren desde `trigger - margin` hasta el
    /// fotograma más reciente, incluido el segmento abierto.
    ///
    /// Si el total supera `max_bytes` se descartan los segmentos más antiguos
    /// del clip; si el más reciente sigue excediendo el límite se recortan sus
    /// primeros fotogramas. Un clip sin fotogramas se devuelve vacío.
    pub fn clip_segments(&self, trigger: DateTime<Utc>, margin: TimeDelta, max_bytes: u64) -> Vec<Segment> {
        let from = trigger - margin;
        let mut clip: VecDeque<Segment> = self
            .segments
            .iter()
            .chain(self.current.iter())
            .filter(|segment| segment.end >= from && !segment.frames.is_empty())
            .cloned()
            .collect();

        let mut total: u64 = clip.iter().map(|s| s.bytes).sum();
        while total > max_bytes && clip.len() > 1 {
            if let Some(dropped) = clip.pop_front() {
                total -= dropped.bytes;
            }
        }
        if total > max_bytes {
            if let Some(last) = clip.back_mut() {
                last.trim_front(max_bytes);
            }
            clip.retain(|segment| !segment.frames.is_empty());
        }
        clip.into()
    }

    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.segments.iter()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty() && self.current.is_none()
    }

    pub fn is_full(&self) -> bool {
        self.segments.len() >= self.max_segments
    }

    pub fn clear(&mut self) {
        self.segments.clear();
        self.current = None;
    }
}
