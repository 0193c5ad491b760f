//! Bus de publicación/suscripción en memoria.
//!
//! Cada tópico es un canal `broadcast` registrado en un `DashMap`. La entrega
//! es como mucho una vez por suscriptor y publicación: un suscriptor lento
//! pierde los mensajes más antiguos y nunca bloquea al publicador. El orden por
//! tópico se conserva para un mismo publicador.
//!
//! Solo [`MessageBus`] posee el registro. Las tareas reciben un [`BusHandle`]
//! (referencia débil), de modo que el bus nunca queda retenido por sus
//! suscriptores.


use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, warn};
use crate::config::bus::TOPIC_CAPACITY;
use super::domain::{BusMessage, Envelope, Topic};


#[derive(Debug)]
struct BusInner {
    topics: DashMap<Topic, broadcast::Sender<Envelope>>,
    seq: AtomicU64,
}


impl BusInner {
    fn publish(&self, topic: &Topic, message: BusMessage) -> usize {
        let envelope = Envelope {
            topic: topic.clone(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            published_at: Utc::now(),
            message,
        };

        match self.topics.get(topic) {
            Some(tx) => tx.send(envelope).unwrap_or(0),
            None => {
                debug!("Debug: publicación sin suscriptores en {}", topic);
                0
            }
        }
    }

    fn subscribe(&self, topic: &Topic) -> Subscription {
        let rx = self
            .topics
            .entry(topic.clone())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .subscribe();
        Subscription { topic: topic.clone(), rx }
    }
}


#[derive(Clone, Debug)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}


impl MessageBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                topics: DashMap::new(),
                seq: AtomicU64::new(0),
            }),
        }
    }

    /// Publica y devuelve cuántos suscriptores recibirán el mensaje.
    pub fn publish(&self, topic: &Topic, message: BusMessage) -> usize {
        self.inner.publish(topic, message)
    }

    pub fn subscribe(&self, topic: &Topic) -> Subscription {
        self.inner.subscribe(topic)
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.inner.topics.get(topic).map(|tx| tx.receiver_count()).unwrap_or(0)
    }

    pub fn handle(&self) -> BusHandle {
        BusHandle { inner: Arc::downgrade(&self.inner) }
    }
}


impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}


/// Referencia no propietaria al bus.
#[derive(Clone, Debug)]
pub struct BusHandle {
    inner: Weak<BusInner>,
}


impl BusHandle {
    /// Publica si el bus sigue vivo; devuelve 0 si ya fue liberado.
    pub fn publish(&self, topic: &Topic, message: BusMessage) -> usize {
        match self.inner.upgrade() {
            Some(bus) => bus.publish(topic, message),
            None => 0,
        }
    }

    pub fn subscribe(&self, topic: &Topic) -> Option<Subscription> {
        self.inner.upgrade().map(|bus| bus.subscribe(topic))
    }

    pub fn is_alive(&self) -> bool {
        self.inner.strong_count() > 0
    }
}


#[derive(Debug)]
pub struct Subscription {
    topic: Topic,
    rx: broadcast::Receiver<Envelope>,
}


impl Subscription {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Siguiente mensaje, o `None` cuando el bus se ha cerrado.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            match self.rx.recv().await {
                Ok(envelope) => return Some(envelope),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Warning: suscriptor de {} perdió {} mensajes", self.topic, skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Variante no bloqueante; descarta silenciosamente los mensajes perdidos.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        loop {
            match self.rx.try_recv() {
                Ok(envelope) => return Some(envelope),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = Envelope> + Send {
        let topic = self.topic;
        BroadcastStream::new(self.rx).filter_map(move |item| match item {
            Ok(envelope) => Some(envelope),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!("Warning: suscriptor de {} perdió {} mensajes", topic, skipped);
                None
            }
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::domain::{EventKind, VehicleId};

    fn dtc_message(n: usize) -> BusMessage {
        let codes = crate::decoder::logic::decode_dtc_payload(&"0420".repeat(n));
        BusMessage::Dtc(codes)
    }

    #[tokio::test]
    async fn delivers_in_publish_order() {
        let bus = MessageBus::new();
        let id = VehicleId::new("v1").unwrap();
        let topic = Topic::event(&id, EventKind::Dtc);
        let mut sub = bus.subscribe(&topic);

        for n in 1..=3 {
            assert_eq!(bus.publish(&topic, dtc_message(n)), 1);
        }
        for n in 1..=3 {
            let envelope = sub.recv().await.unwrap();
            assert_eq!(envelope.message, dtc_message(n));
            assert_eq!(envelope.topic, topic);
        }
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = MessageBus::new();
        let id = VehicleId::new("v1").unwrap();
        let mut alerts = bus.subscribe(&Topic::alerts(&id));

        assert_eq!(bus.publish(&Topic::event(&id, EventKind::Dtc), dtc_message(1)), 0);
        assert!(alerts.try_recv().is_none());
    }

    #[tokio::test]
    async fn each_subscriber_gets_one_copy() {
        let bus = MessageBus::new();
        let topic = Topic::alerts(&VehicleId::new("v1").unwrap());
        let mut a = bus.subscribe(&topic);
        let mut b = bus.subscribe(&topic);

        assert_eq!(bus.publish(&topic, dtc_message(1)), 2);
        assert!(a.try_recv().is_some());
        assert!(a.try_recv().is_none());
        assert!(b.try_recv().is_some());
        assert!(b.try_recv().is_none());
    }

    #[tokio::test]
    async fn handle_does_not_keep_bus_alive() {
        let bus = MessageBus::new();
        let handle = bus.handle();
        let topic = Topic::alerts(&VehicleId::new("v1").unwrap());
        let mut sub = handle.subscribe(&topic).unwrap();

        assert!(handle.is_alive());
        drop(bus);
        assert!(!handle.is_alive());
        assert_eq!(handle.publish(&topic, dtc_message(1)), 0);
        assert!(handle.subscribe(&topic).is_none());
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn lagging_subscriber_drops_oldest() {
        let bus = MessageBus::new();
        let topic = Topic::alerts(&VehicleId::new("v1").unwrap());
        let mut sub = bus.subscribe(&topic);

        for n in 0..(TOPIC_CAPACITY + 5) {
            bus.publish(&topic, dtc_message(n % 3));
        }
        let first = sub.recv().await.unwrap();
        assert!(first.seq >= 5);
    }
}
