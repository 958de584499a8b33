// Inbound channels from the helper subsystems to the behavior loop
//
// Continuous signals (vision, pose, heading) go through single-slot watch
// channels where the newest value overwrites the old one. Button presses are
// discrete and go through a bounded FIFO; producers wait when it is full so
// no press is lost.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::behavior::ButtonAction;
use crate::lifecycle::SubsystemId;
use crate::messages::{
    ButtonMessage, ButtonPress, ExternalEvent, HeadingReading, LocalizationFix, VisionFrame,
};

/// Producer side, cloned into every forwarding task
#[derive(Clone)]
pub struct InputChannels {
    vision: Arc<watch::Sender<Option<VisionFrame>>>,
    localization: Arc<watch::Sender<Option<LocalizationFix>>>,
    heading: Arc<watch::Sender<Option<f32>>>,
    buttons: mpsc::Sender<ButtonPress>,
}

/// Consumer side, owned by the behavior loop
pub struct InputDrain {
    vision: watch::Receiver<Option<VisionFrame>>,
    localization: watch::Receiver<Option<LocalizationFix>>,
    heading: watch::Receiver<Option<f32>>,
    buttons: mpsc::Receiver<ButtonPress>,
}

/// What the behavior loop sees on one tick
#[derive(Debug, Default, Clone)]
pub struct InputFrame {
    pub vision: Option<VisionFrame>,
    pub localization: Option<LocalizationFix>,
    pub heading: Option<f32>,
    /// Presses in arrival order
    pub buttons: Vec<ButtonPress>,
}

pub fn channel(button_depth: usize) -> (InputChannels, InputDrain) {
    let (vision_tx, vision_rx) = watch::channel(None);
    let (loc_tx, loc_rx) = watch::channel(None);
    let (heading_tx, heading_rx) = watch::channel(None);
    let (button_tx, button_rx) = mpsc::channel(button_depth.max(1));

    (
        InputChannels {
            vision: Arc::new(vision_tx),
            localization: Arc::new(loc_tx),
            heading: Arc::new(heading_tx),
            buttons: button_tx,
        },
        InputDrain {
            vision: vision_rx,
            localization: loc_rx,
            heading: heading_rx,
            buttons: button_rx,
        },
    )
}

impl InputChannels {
    /// Deliver an event. Only button presses can wait (queue full).
    pub async fn publish(&self, event: ExternalEvent) {
        match event {
            ExternalEvent::VisionFrame(frame) => {
                self.vision.send_replace(Some(frame));
            }
            ExternalEvent::LocalizationFix(fix) => {
                self.localization.send_replace(Some(fix));
            }
            ExternalEvent::Heading(deg) => {
                self.heading.send_replace(Some(deg));
            }
            ExternalEvent::ButtonPress(press) => {
                if self.buttons.send(press).await.is_err() {
                    warn!("Button press dropped: behavior loop is gone");
                }
            }
        }
    }

    /// Mark a subsystem's data as absent once it has been stopped
    pub fn clear(&self, subsystem: SubsystemId) {
        match subsystem {
            SubsystemId::Vision => {
                self.vision.send_replace(None);
            }
            SubsystemId::Localization => {
                self.localization.send_replace(None);
            }
        }
    }
}

impl InputDrain {
    /// Non-blocking: take whatever is available right now
    pub fn drain(&mut self, frame: &mut InputFrame) {
        frame.vision = *self.vision.borrow_and_update();
        frame.localization = *self.localization.borrow_and_update();
        frame.heading = *self.heading.borrow_and_update();

        frame.buttons.clear();
        while let Ok(press) = self.buttons.try_recv() {
            frame.buttons.push(press);
        }
    }
}

/// Maps the collaborator's action strings to runtime actions at ingress, so
/// the behavior loop only ever sees enum values
#[derive(Debug, Clone)]
pub struct ButtonMapper {
    actions: HashMap<String, ButtonAction>,
}

impl ButtonMapper {
    pub fn new(actions: HashMap<String, ButtonAction>) -> Self {
        Self { actions }
    }

    pub fn map(&self, message: &ButtonMessage) -> Option<ButtonPress> {
        match self.actions.get(&message.action) {
            Some(&action) => Some(ButtonPress {
                action,
                timestamp: message.timestamp,
            }),
            None => {
                warn!("Ignoring unmapped button action '{}'", message.action);
                None
            }
        }
    }
}

/// Decode a payload from `subsystem`'s topic
pub fn decode_subsystem(subsystem: SubsystemId, payload: &[u8]) -> Option<ExternalEvent> {
    let decoded = match subsystem {
        SubsystemId::Vision => {
            serde_json::from_slice::<VisionFrame>(payload).map(ExternalEvent::VisionFrame)
        }
        SubsystemId::Localization => {
            serde_json::from_slice::<LocalizationFix>(payload).map(ExternalEvent::LocalizationFix)
        }
    };
    decoded
        .map_err(|e| warn!(?subsystem, "Failed to parse payload: {}", e))
        .ok()
}

/// Forward heading readings from `topic` until the session closes
pub async fn forward_heading(session: zenoh::Session, topic: String, inputs: InputChannels) {
    let subscriber = match session.declare_subscriber(topic.as_str()).await {
        Ok(s) => s,
        Err(e) => {
            warn!("Cannot subscribe to {}: {}", topic, e);
            return;
        }
    };
    debug!("Subscribed to {}", topic);

    while let Ok(sample) = subscriber.recv_async().await {
        let payload = sample.payload().to_bytes();
        match serde_json::from_slice::<HeadingReading>(&payload) {
            Ok(reading) => inputs.publish(ExternalEvent::Heading(reading.heading_deg)).await,
            Err(e) => warn!("Failed to parse heading: {}", e),
        }
    }
}

/// Forward button presses from `topic` until the session closes
pub async fn forward_buttons(
    session: zenoh::Session,
    topic: String,
    mapper: ButtonMapper,
    inputs: InputChannels,
) {
    let subscriber = match session.declare_subscriber(topic.as_str()).await {
        Ok(s) => s,
        Err(e) => {
            warn!("Cannot subscribe to {}: {}", topic, e);
            return;
        }
    };
    debug!("Subscribed to {}", topic);

    while let Ok(sample) = subscriber.recv_async().await {
        let payload = sample.payload().to_bytes();
        let message = match serde_json::from_slice::<ButtonMessage>(&payload) {
            Ok(m) => m,
            Err(e) => {
                warn!("Failed to parse button press: {}", e);
                continue;
            }
        };
        if let Some(press) = mapper.map(&message) {
            inputs.publish(ExternalEvent::ButtonPress(press)).await;
        }
    }
}
