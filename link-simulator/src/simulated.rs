//! In-memory connection, transport link and sending peer.

use futures::stream::BoxStream;
use link::condition::ErrorCondition;
use link::model::{AnnotationValue, Delivery};
use link::transport::{
    AmqpConnection, LocalState, ShutdownNotifier, ShutdownSignal, TransportLink,
};
use link::ReceiveLinkHandler;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

pub struct SimulatedConnection {
    id: String,
    host: String,
    notifier: ShutdownNotifier,
}

impl SimulatedConnection {
    pub fn new(id: &str, host: &str) -> Self {
        Self {
            id: id.to_string(),
            host: host.to_string(),
            notifier: ShutdownNotifier::new(),
        }
    }

    pub fn shutdown(&self, description: &str) {
        self.notifier
            .notify(ShutdownSignal::new(false, description));
    }
}

impl AmqpConnection for SimulatedConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn shutdown_signals(&self) -> BoxStream<'static, ShutdownSignal> {
        self.notifier.subscribe()
    }
}

/// Transport link whose credit is consumed by the simulated peer
pub struct SimulatedLink {
    name: String,
    credit: AtomicU32,
    flowed: AtomicU32,
    local_state: Mutex<LocalState>,
    condition: Mutex<Option<ErrorCondition>>,
    wake: Notify,
}

impl SimulatedLink {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            credit: AtomicU32::new(0),
            flowed: AtomicU32::new(0),
            local_state: Mutex::new(LocalState::Active),
            condition: Mutex::new(None),
            wake: Notify::new(),
        }
    }

    /// Total credits granted over the link's lifetime
    pub fn flowed(&self) -> u32 {
        self.flowed.load(Ordering::SeqCst)
    }

    fn take_credit(&self) -> bool {
        self.credit
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |credit| {
                credit.checked_sub(1)
            })
            .is_ok()
    }
}

impl TransportLink for SimulatedLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn credit(&self) -> u32 {
        self.credit.load(Ordering::SeqCst)
    }

    fn flow(&self, credits: u32) {
        log::trace!("flow({credits}) on {}", self.name);
        self.credit.fetch_add(credits, Ordering::SeqCst);
        self.flowed.fetch_add(credits, Ordering::SeqCst);
        self.wake.notify_one();
    }

    fn local_state(&self) -> LocalState {
        *self
            .local_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn condition(&self) -> Option<ErrorCondition> {
        self.condition
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_condition(&self, condition: ErrorCondition) {
        *self
            .condition
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(condition);
    }

    fn close(&self) {
        *self
            .local_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = LocalState::Closed;
        self.wake.notify_one();
    }
}

#[derive(Debug, Clone)]
pub struct PeerOptions {
    /// Messages available on the entity
    pub messages: u32,
    /// Answer a local close with a remote close
    pub acknowledge_close: bool,
    /// Close the link with this condition once `fail_after` messages went out
    pub fail_with: Option<ErrorCondition>,
    pub fail_after: u32,
}

/// Spawn the sending side: opens the link, sends while credit lasts and
/// reacts to the local close.
pub fn spawn_peer(
    link: Arc<SimulatedLink>,
    handler: Arc<ReceiveLinkHandler>,
    options: PeerOptions,
) -> JoinHandle<u32> {
    tokio::spawn(async move {
        handler.on_link_remote_open();
        let mut sent = 0;

        loop {
            if link.local_state() == LocalState::Closed {
                if options.acknowledge_close {
                    handler.on_link_remote_close(None);
                } else {
                    log::info!("Peer ignoring close for {}", link.name());
                }
                return sent;
            }

            if let Some(condition) = &options.fail_with {
                if sent >= options.fail_after {
                    handler.on_link_remote_close(Some(condition.clone()));
                    return sent;
                }
            }

            if sent < options.messages && link.take_credit() {
                handler.on_delivery(delivery(sent));
                sent += 1;
                tokio::task::yield_now().await;
                continue;
            }

            link.wake.notified().await;
        }
    })
}

fn delivery(index: u32) -> Delivery {
    let sequence_number = i64::from(index) + 1;
    let body = json!({ "order": sequence_number, "status": "created" });

    Delivery::new(index.to_be_bytes().to_vec(), body.to_string().into_bytes())
        .with_annotation(
            link::model::SEQUENCE_NUMBER_ANNOTATION,
            AnnotationValue::Long(sequence_number),
        )
        .with_annotation(
            link::model::ENQUEUED_TIME_ANNOTATION,
            AnnotationValue::Timestamp(chrono::Utc::now().timestamp_millis()),
        )
        .with_annotation(
            link::model::OFFSET_ANNOTATION,
            AnnotationValue::String((sequence_number * 512).to_string()),
        )
}
